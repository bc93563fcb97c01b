//! MemePerp backend library.
//!
//! The matching and settlement core for a multi-token perpetual-futures
//! venue: per-token order books and matching workers, the paired position
//! model, balance ledger, risk and funding loops, k-line aggregation,
//! subscriber broadcast, and the settlement bridge.

pub mod api;
pub mod auth;
pub mod broadcast;
pub mod config;
pub mod engine;
pub mod error;
pub mod fixed;
pub mod klines;
pub mod ledger;
pub mod marks;
pub mod middleware;
pub mod models;
pub mod repo;
pub mod settlement;

pub use config::Config;
pub use engine::MatchingEngine;
pub use error::{EngineError, EngineResult};
