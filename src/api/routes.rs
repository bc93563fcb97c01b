//! HTTP handlers.

use alloy_primitives::Address;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::auth::eip712::parse_signature_hex;
use crate::auth::OrderMessage;
use crate::engine::worker::FillSummary;
use crate::error::EngineError;
use crate::fixed::parse_wire_amount;
use crate::klines::Resolution;
use crate::models::{OrderStatus, OrderType, Side};

use super::AppState;

/// The canonical order submission message: decimal-string amounts,
/// lowercase hex addresses.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSubmission {
    pub trader: String,
    pub token: String,
    pub is_long: bool,
    pub size: String,
    pub leverage: String,
    pub price: String,
    pub deadline: String,
    pub nonce: String,
    pub order_type: u8,
    pub signature: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matches: Option<Vec<FillSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl From<&EngineError> for ApiError {
    fn from(e: &EngineError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

fn status_for(e: &EngineError) -> StatusCode {
    match e {
        EngineError::OrderNotFound | EngineError::PairNotFound(_) | EngineError::UnknownToken(_) => {
            StatusCode::NOT_FOUND
        }
        e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        e if e.is_invariant_violation() => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn parse_address(raw: &str) -> Result<Address, EngineError> {
    raw.parse::<Address>()
        .map_err(|_| EngineError::InvalidOrderParameters(format!("bad address: {raw}")))
}

fn decode_submission(req: &OrderSubmission) -> Result<OrderMessage, EngineError> {
    let order_type = OrderType::from_wire(req.order_type).ok_or_else(|| {
        EngineError::InvalidOrderParameters(format!("bad orderType: {}", req.order_type))
    })?;
    Ok(OrderMessage {
        trader: parse_address(&req.trader)?,
        token: parse_address(&req.token)?,
        side: if req.is_long { Side::Long } else { Side::Short },
        size: parse_wire_amount(&req.size)?,
        leverage: parse_wire_amount(&req.leverage)?,
        price: parse_wire_amount(&req.price)?,
        deadline: req
            .deadline
            .parse::<u64>()
            .map_err(|_| EngineError::InvalidOrderParameters("bad deadline".into()))?,
        nonce: req
            .nonce
            .parse::<u64>()
            .map_err(|_| EngineError::InvalidOrderParameters("bad nonce".into()))?,
        order_type,
        signature: parse_signature_hex(&req.signature)?,
    })
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn submit_order(
    State(state): State<AppState>,
    Json(req): Json<OrderSubmission>,
) -> (StatusCode, Json<SubmitResponse>) {
    let msg = match decode_submission(&req) {
        Ok(msg) => msg,
        Err(e) => {
            return (
                status_for(&e),
                Json(SubmitResponse {
                    success: false,
                    order_id: None,
                    status: None,
                    matches: None,
                    error: Some(ApiError::from(&e)),
                }),
            )
        }
    };

    match state.engine.submit_order(msg).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(SubmitResponse {
                success: true,
                order_id: Some(outcome.order_id.to_string()),
                status: Some(outcome.status),
                matches: Some(outcome.fills),
                error: None,
            }),
        ),
        Err(e) => (
            status_for(&e),
            Json(SubmitResponse {
                success: false,
                order_id: None,
                status: None,
                matches: None,
                error: Some(ApiError::from(&e)),
            }),
        ),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub token: String,
    pub trader: String,
    pub order_id: String,
}

pub async fn cancel_order(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let parsed = (|| -> Result<(Address, Address, u64), EngineError> {
        Ok((
            parse_address(&req.token)?,
            parse_address(&req.trader)?,
            req.order_id
                .parse::<u64>()
                .map_err(|_| EngineError::OrderNotFound)?,
        ))
    })();
    match parsed {
        Ok((token, trader, order_id)) => {
            match state.engine.cancel_order(token, order_id, trader).await {
                Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))),
                Err(e) => (
                    status_for(&e),
                    Json(json!({ "success": false, "error": ApiError::from(&e) })),
                ),
            }
        }
        Err(e) => (
            status_for(&e),
            Json(json!({ "success": false, "error": ApiError::from(&e) })),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub struct DepthQuery {
    #[serde(default = "default_levels")]
    pub levels: usize,
}

fn default_levels() -> usize {
    10
}

pub async fn get_orderbook(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(q): Query<DepthQuery>,
) -> (StatusCode, Json<serde_json::Value>) {
    let token = match parse_address(&token) {
        Ok(t) => t,
        Err(e) => return (status_for(&e), Json(json!({ "error": ApiError::from(&e) }))),
    };
    match state.engine.depth(token, q.levels.clamp(1, 100)).await {
        Ok(depth) => (StatusCode::OK, Json(json!(depth))),
        Err(e) => (status_for(&e), Json(json!({ "error": ApiError::from(&e) }))),
    }
}

#[derive(Debug, Deserialize)]
pub struct TradesQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub before: Option<u64>,
}

fn default_limit() -> usize {
    100
}

pub async fn get_trades(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(q): Query<TradesQuery>,
) -> (StatusCode, Json<serde_json::Value>) {
    let token = match parse_address(&token) {
        Ok(t) => t,
        Err(e) => return (status_for(&e), Json(json!({ "error": ApiError::from(&e) }))),
    };
    match state
        .engine
        .shared()
        .repo
        .trades_by_token(token, q.limit.clamp(1, 1_000), q.before)
        .await
    {
        Ok(trades) => (StatusCode::OK, Json(json!({ "trades": trades }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": { "code": "RepositoryUnavailable", "message": e.to_string() } })),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub struct KlineQuery {
    pub resolution: String,
    pub from: i64,
    pub to: i64,
}

pub async fn get_klines(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(q): Query<KlineQuery>,
) -> (StatusCode, Json<serde_json::Value>) {
    let token = match parse_address(&token) {
        Ok(t) => t,
        Err(e) => return (status_for(&e), Json(json!({ "error": ApiError::from(&e) }))),
    };
    let Some(resolution) = Resolution::parse(&q.resolution) else {
        let e = EngineError::InvalidOrderParameters(format!("bad resolution: {}", q.resolution));
        return (status_for(&e), Json(json!({ "error": ApiError::from(&e) })));
    };
    match state
        .engine
        .shared()
        .repo
        .klines_range(token, resolution, q.from, q.to)
        .await
    {
        Ok(mut buckets) => {
            // Merge the open in-memory bucket so the latest window is live.
            if let Some(current) = state.engine.shared().aggregator.current_bucket(token, resolution)
            {
                if current.bucket_start >= q.from
                    && current.bucket_start <= q.to
                    && !buckets.iter().any(|b| b.bucket_start == current.bucket_start)
                {
                    buckets.push(current);
                }
            }
            (StatusCode::OK, Json(json!({ "klines": buckets })))
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": { "code": "RepositoryUnavailable", "message": e.to_string() } })),
        ),
    }
}

pub async fn get_positions(
    State(state): State<AppState>,
    Path(trader): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    let trader = match parse_address(&trader) {
        Ok(t) => t,
        Err(e) => return (status_for(&e), Json(json!({ "error": ApiError::from(&e) }))),
    };
    let shared = state.engine.shared();
    let views = shared.pairs.position_views(trader);
    let pairs = shared.pairs.active_by_trader(trader);
    (
        StatusCode::OK,
        Json(json!({ "positions": views, "pairs": pairs })),
    )
}

pub async fn get_balance(
    State(state): State<AppState>,
    Path(trader): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    let trader = match parse_address(&trader) {
        Ok(t) => t,
        Err(e) => return (status_for(&e), Json(json!({ "error": ApiError::from(&e) }))),
    };
    let balances = state.engine.shared().ledger.balances(trader);
    (
        StatusCode::OK,
        Json(json!({
            "trader": format!("{trader:#x}"),
            "available": balances.available.to_string(),
            "locked": balances.locked.to_string(),
        })),
    )
}

#[derive(Debug, Deserialize)]
pub struct OrdersQuery {
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

pub async fn get_orders(
    State(state): State<AppState>,
    Path(trader): Path<String>,
    Query(q): Query<OrdersQuery>,
) -> (StatusCode, Json<serde_json::Value>) {
    let trader = match parse_address(&trader) {
        Ok(t) => t,
        Err(e) => return (status_for(&e), Json(json!({ "error": ApiError::from(&e) }))),
    };
    let status = match q.status.as_deref() {
        Some(raw) => match OrderStatus::parse(raw) {
            Some(s) => Some(s),
            None => {
                let e = EngineError::InvalidOrderParameters(format!("bad status: {raw}"));
                return (status_for(&e), Json(json!({ "error": ApiError::from(&e) })));
            }
        },
        None => None,
    };
    match state
        .engine
        .shared()
        .repo
        .orders_by_trader(trader, status, q.limit.clamp(1, 1_000))
        .await
    {
        Ok(orders) => (StatusCode::OK, Json(json!({ "orders": orders }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": { "code": "RepositoryUnavailable", "message": e.to_string() } })),
        ),
    }
}

pub async fn get_settlements(
    State(state): State<AppState>,
    Path(trader): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    let trader = match parse_address(&trader) {
        Ok(t) => t,
        Err(e) => return (status_for(&e), Json(json!({ "error": ApiError::from(&e) }))),
    };
    match state
        .engine
        .shared()
        .repo
        .settlement_by_trader(trader, 200)
        .await
    {
        Ok(entries) => (StatusCode::OK, Json(json!({ "settlements": entries }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": { "code": "RepositoryUnavailable", "message": e.to_string() } })),
        ),
    }
}

pub async fn get_tokens(State(state): State<AppState>) -> Json<serde_json::Value> {
    let shared = state.engine.shared();
    let tokens: Vec<serde_json::Value> = shared
        .registry
        .all_tokens()
        .into_iter()
        .map(|(token, token_state)| {
            let stats = shared.registry.stats(token).ok();
            json!({
                "token": format!("{token:#x}"),
                "state": token_state.as_str(),
                "stats": stats,
                "fundingIndex": shared.funding.index(token).to_string(),
                "fundingRateBps": shared.funding.last_rate_bps(token).to_string(),
            })
        })
        .collect();
    Json(json!({ "tokens": tokens }))
}

// --- admin -----------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AdminTokenRequest {
    pub token: String,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn admin_token(
    State(state): State<AppState>,
    Path(action): Path<String>,
    Json(req): Json<AdminTokenRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let token = match parse_address(&req.token) {
        Ok(t) => t,
        Err(e) => return (status_for(&e), Json(json!({ "error": ApiError::from(&e) }))),
    };
    let result = match action.as_str() {
        "activate" => state.engine.admin_activate(token),
        "pause" => state
            .engine
            .admin_pause(token, req.reason.as_deref().unwrap_or("admin pause")),
        "resume" => state.engine.admin_resume(token),
        "delist" => state.engine.admin_delist(token),
        other => Err(EngineError::InvalidOrderParameters(format!(
            "unknown action: {other}"
        ))),
    };
    match result {
        Ok(()) => {
            info!(%token, action, "admin token action");
            (StatusCode::OK, Json(json!({ "success": true })))
        }
        Err(e) => (
            status_for(&e),
            Json(json!({ "success": false, "error": ApiError::from(&e) })),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub struct AdminParamsRequest {
    pub token: String,
    pub key: String,
    pub value: String,
}

pub async fn admin_params(
    State(state): State<AppState>,
    Json(req): Json<AdminParamsRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let token = match parse_address(&req.token) {
        Ok(t) => t,
        Err(e) => return (status_for(&e), Json(json!({ "error": ApiError::from(&e) }))),
    };
    match state.engine.admin_set_param(token, &req.key, &req.value) {
        Ok(()) => {
            info!(%token, key = req.key, value = req.value, "admin parameter set");
            (StatusCode::OK, Json(json!({ "success": true })))
        }
        Err(e) => (
            status_for(&e),
            Json(json!({ "success": false, "error": ApiError::from(&e) })),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub struct AdminDepositRequest {
    pub trader: String,
    pub amount: String,
}

/// Operator credit path for chainless deployments; real deposits arrive
/// through the gateway's deposit stream.
pub async fn admin_deposit(
    State(state): State<AppState>,
    Json(req): Json<AdminDepositRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let parsed = (|| -> Result<(Address, u128), EngineError> {
        Ok((parse_address(&req.trader)?, parse_wire_amount(&req.amount)?))
    })();
    match parsed {
        Ok((trader, amount)) => {
            state.engine.shared().ledger.deposit(trader, amount);
            let balances = state.engine.shared().ledger.balances(trader);
            let _ = state
                .engine
                .shared()
                .repo
                .balances_persist(trader, balances)
                .await;
            info!(%trader, amount = %amount, "admin deposit credited");
            (StatusCode::OK, Json(json!({ "success": true })))
        }
        Err(e) => (
            status_for(&e),
            Json(json!({ "success": false, "error": ApiError::from(&e) })),
        ),
    }
}
