//! Order authentication: EIP-712 signature verification and per-trader
//! nonce sequencing.
//!
//! An order enters the engine only after this module proves it was signed
//! by the claimed trader and carries the trader's next nonce. The nonce is
//! reserved tentatively at validation time and committed only once the
//! submission is accepted into the book or produced at least one trade, so
//! a downstream rejection never burns a nonce.

pub mod eip712;
pub mod nonce;

pub use eip712::{OrderMessage, OrderValidator};
pub use nonce::NonceRegistry;
