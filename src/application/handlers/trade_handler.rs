use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::application::services::queue_bridge::QueueSynchronizerBridge;
use crate::application::services::trade_queue::{
    BatchAddResult, IdempotentAddResult, QueueStats, QueueStatus, SafeAddResult,
};
use crate::domain::entities::bot::{BotState, BotStatus};
use crate::domain::entities::trade_record::{ActiveTradeRecord, CollisionRecord};
use crate::domain::entities::trade_request::{TradeRequest, TradeRequestData};
use crate::domain::services::lock_registry::LockSnapshot;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub bridge: QueueSynchronizerBridge,
}

impl AppState {
    pub fn new(bridge: QueueSynchronizerBridge) -> Self {
        Self { bridge }
    }
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecentTradesQuery {
    /// Number of trades to return (default 50, max 1000)
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterBotRequest {
    pub bot_id: String,
    pub bot_type: String,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BotStatusRequest {
    pub status: BotStatus,
    #[serde(default)]
    pub details: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub queue_running: bool,
    pub queue_size: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/queue/status", get(get_queue_status))
        .route("/queue/stats", get(get_queue_stats))
        .route("/trades", get(get_recent_trades).post(submit_trade))
        .route("/trades/batch", post(submit_batched_trade))
        .route(
            "/trades/:trade_id",
            get(get_trade).put(submit_idempotent_trade).delete(cancel_trade),
        )
        .route("/bots", get(list_bots).post(register_bot))
        .route("/bots/:bot_id", get(get_bot))
        .route("/bots/:bot_id/status", put(update_bot_status))
        .route("/bots/:bot_id/pairs", get(get_bot_pairs))
        .route("/symbols/:symbol/bots", get(get_symbol_bots))
        .route("/symbols/:symbol/trades", get(get_symbol_trades))
        .route("/collisions", get(get_collisions).delete(clear_collisions))
        .route("/locks", get(get_locks))
        .with_state(state)
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = state.bridge.queue().get_queue_status().await;
    Json(HealthResponse {
        status: "running".to_string(),
        queue_running: status.is_running,
        queue_size: status.queue_size,
    })
}

pub async fn get_queue_status(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.bridge.queue().get_queue_status().await)
}

pub async fn get_queue_stats(State(state): State<AppState>) -> Json<QueueStats> {
    Json(state.bridge.queue().get_queue_stats().await)
}

pub async fn get_recent_trades(
    State(state): State<AppState>,
    Query(params): Query<RecentTradesQuery>,
) -> Json<Vec<TradeRequest>> {
    let limit = params.limit.unwrap_or(50).clamp(1, 1000);
    Json(state.bridge.queue().get_recent_trades(limit).await)
}

/// Submit a trade through the duplicate and bot-conflict checks
pub async fn submit_trade(
    State(state): State<AppState>,
    Json(data): Json<TradeRequestData>,
) -> (StatusCode, Json<SafeAddResult>) {
    let result = state.bridge.add_trade_safe(data).await;
    let status = if result.success {
        StatusCode::ACCEPTED
    } else if result.duplicate_detected || result.concurrent_detected || result.sync_conflict {
        StatusCode::CONFLICT
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(result))
}

pub async fn submit_batched_trade(
    State(state): State<AppState>,
    Json(data): Json<TradeRequestData>,
) -> (StatusCode, Json<BatchAddResult>) {
    let result = state.bridge.add_trade_with_batching(data).await;
    let status = if result.success {
        StatusCode::ACCEPTED
    } else if result.sync_conflict {
        StatusCode::CONFLICT
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(result))
}

/// Idempotent submit keyed by the path id
pub async fn submit_idempotent_trade(
    State(state): State<AppState>,
    Path(trade_id): Path<String>,
    Json(mut data): Json<TradeRequestData>,
) -> (StatusCode, Json<IdempotentAddResult>) {
    data.trade_id = Some(trade_id);
    let result = state.bridge.add_trade_idempotent(data).await;
    let status = match (result.success, result.idempotent_match) {
        (true, true) => StatusCode::OK,
        (true, false) => StatusCode::ACCEPTED,
        _ if result.sync_conflict => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, Json(result))
}

pub async fn get_trade(
    State(state): State<AppState>,
    Path(trade_id): Path<String>,
) -> Result<Json<TradeRequest>, ApiError> {
    state
        .bridge
        .queue()
        .get_trade_by_id(&trade_id)
        .await
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Trade not found: {}", trade_id)))
}

pub async fn cancel_trade(
    State(state): State<AppState>,
    Path(trade_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let queue = state.bridge.queue();
    if queue.cancel_trade(&trade_id).await {
        return Ok(Json(serde_json::json!({
            "success": true,
            "trade_id": trade_id,
        })));
    }

    match queue.get_trade_status(&trade_id).await {
        Some(status) => Err(api_error(
            StatusCode::CONFLICT,
            format!("Trade {} is {} and can no longer be canceled", trade_id, status),
        )),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("Trade not found: {}", trade_id),
        )),
    }
}

pub async fn list_bots(State(state): State<AppState>) -> Json<Vec<BotState>> {
    Json(state.bridge.synchronizer().list_bots().await)
}

pub async fn register_bot(
    State(state): State<AppState>,
    Json(body): Json<RegisterBotRequest>,
) -> Result<(StatusCode, Json<BotState>), ApiError> {
    if body.bot_id.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "bot_id must not be empty"));
    }
    let bot = state
        .bridge
        .synchronizer()
        .register_bot(&body.bot_id, &body.bot_type, body.config)
        .await;
    Ok((StatusCode::CREATED, Json(bot)))
}

pub async fn get_bot(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> Result<Json<BotState>, ApiError> {
    state
        .bridge
        .synchronizer()
        .get_bot_state(&bot_id)
        .await
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Unknown bot: {}", bot_id)))
}

pub async fn update_bot_status(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
    Json(body): Json<BotStatusRequest>,
) -> Result<Json<BotState>, ApiError> {
    let sync = state.bridge.synchronizer();
    if !sync.update_bot_status(&bot_id, body.status, body.details).await {
        return Err(api_error(StatusCode::NOT_FOUND, format!("Unknown bot: {}", bot_id)));
    }
    sync.get_bot_state(&bot_id)
        .await
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Unknown bot: {}", bot_id)))
}

pub async fn get_bot_pairs(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> Json<Vec<String>> {
    let pairs = state.bridge.synchronizer().get_bot_trading_pairs(&bot_id).await;
    Json(pairs.into_iter().collect())
}

pub async fn get_symbol_bots(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Json<Vec<String>> {
    Json(state.bridge.synchronizer().get_active_bots_for_symbol(&symbol).await)
}

pub async fn get_symbol_trades(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Json<Vec<ActiveTradeRecord>> {
    Json(state.bridge.synchronizer().get_active_trades(&symbol).await)
}

pub async fn get_collisions(State(state): State<AppState>) -> Json<Vec<CollisionRecord>> {
    Json(state.bridge.synchronizer().get_collision_history().await)
}

pub async fn clear_collisions(State(state): State<AppState>) -> StatusCode {
    state.bridge.synchronizer().clear_collision_history().await;
    StatusCode::NO_CONTENT
}

pub async fn get_locks(State(state): State<AppState>) -> Json<Vec<LockSnapshot>> {
    Json(state.bridge.synchronizer().get_lock_snapshots().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueConfig, SyncConfig};
    use crate::domain::services::bot_synchronizer::BotSynchronizer;
    use crate::infrastructure::paper_executor::PaperExecutor;
    use std::sync::Arc;

    fn state() -> AppState {
        AppState::new(QueueSynchronizerBridge::new(
            QueueConfig::default(),
            Arc::new(PaperExecutor::new()),
            Arc::new(BotSynchronizer::new(SyncConfig::default())),
        ))
    }

    #[tokio::test]
    async fn test_get_unknown_trade_is_not_found() {
        let result = get_trade(State(state()), Path("missing".to_string())).await;
        assert_eq!(result.err().unwrap().0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_submit_invalid_trade_is_bad_request() {
        let data = TradeRequestData {
            symbol: "BTCUSDT".to_string(),
            side: "HOLD".to_string(),
            quantity: 1.0,
            ..Default::default()
        };
        let (status, Json(result)) = submit_trade(State(state()), Json(data)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_register_bot_requires_id() {
        let body = RegisterBotRequest {
            bot_id: " ".to_string(),
            bot_type: "grid".to_string(),
            config: Default::default(),
        };
        let result = register_bot(State(state()), Json(body)).await;
        assert_eq!(result.err().unwrap().0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_update_unknown_bot_status() {
        let body = BotStatusRequest {
            status: BotStatus::Running,
            details: None,
        };
        let result = update_bot_status(State(state()), Path("ghost".to_string()), Json(body)).await;
        assert_eq!(result.err().unwrap().0, StatusCode::NOT_FOUND);
    }
}
