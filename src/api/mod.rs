//! HTTP and WebSocket surface.
//!
//! Thin transport over the engine facade: handlers parse the wire shapes,
//! call into the engine, and map `EngineError` codes onto HTTP statuses.
//! Live data flows through the WebSocket endpoint, which relays broadcast
//! envelopes per subscribed topic; polling endpoints exist as a degraded
//! compatibility surface only.

pub mod routes;
pub mod ws;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::engine::MatchingEngine;

/// Shared application state for handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MatchingEngine>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/order", post(routes::submit_order))
        .route("/api/order/cancel", post(routes::cancel_order))
        .route("/api/orders/:trader", get(routes::get_orders))
        .route("/api/orderbook/:token", get(routes::get_orderbook))
        .route("/api/trades/:token", get(routes::get_trades))
        .route("/api/klines/:token", get(routes::get_klines))
        .route("/api/positions/:trader", get(routes::get_positions))
        .route("/api/balance/:trader", get(routes::get_balance))
        .route("/api/settlements/:trader", get(routes::get_settlements))
        .route("/api/tokens", get(routes::get_tokens))
        .route("/admin/token/:action", post(routes::admin_token))
        .route("/admin/params", post(routes::admin_params))
        .route("/admin/deposit", post(routes::admin_deposit))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
