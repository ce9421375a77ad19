//! HTTP API through the full router

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use tradesync::application::handlers::trade_handler::{router, AppState};
use tradesync::application::services::queue_bridge::QueueSynchronizerBridge;
use tradesync::config::{QueueConfig, SyncConfig};
use tradesync::domain::services::bot_synchronizer::BotSynchronizer;
use tradesync::infrastructure::paper_executor::PaperExecutor;

fn app() -> (Router, QueueSynchronizerBridge) {
    let bridge = QueueSynchronizerBridge::new(
        QueueConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        },
        Arc::new(PaperExecutor::new()),
        Arc::new(BotSynchronizer::new(SyncConfig::default())),
    );
    (router(AppState::new(bridge.clone())), bridge)
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn wait_for_status(app: &Router, trade_id: &str, expected: &str) -> Value {
    for _ in 0..500 {
        let (status, body) = call(app, Method::GET, &format!("/trades/{}", trade_id), None).await;
        if status == StatusCode::OK && body["status"] == expected {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("trade {} never became {}", trade_id, expected);
}

#[tokio::test]
async fn test_submit_and_poll_trade() {
    let (app, bridge) = app();

    let (status, body) = call(
        &app,
        Method::POST,
        "/trades",
        Some(json!({"symbol": "btcusdt", "side": "buy", "quantity": 0.25, "user_id": "9"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["success"], true);
    let trade_id = body["trade_id"].as_str().unwrap().to_string();

    let trade = wait_for_status(&app, &trade_id, "EXECUTED").await;
    assert_eq!(trade["symbol"], "BTCUSDT");
    assert_eq!(trade["side"], "BUY");
    assert_eq!(trade["result"]["is_paper_trade"], true);

    let (status, queue) = call(&app, Method::GET, "/queue/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(queue["history_size"], 1);
    assert_eq!(queue["recent_trades"][0]["id"], trade_id.as_str());

    let (_, stats) = call(&app, Method::GET, "/queue/stats", None).await;
    assert_eq!(stats["executed"], 1);

    let (_, recent) = call(&app, Method::GET, "/trades?limit=5", None).await;
    assert_eq!(recent.as_array().unwrap().len(), 1);
    bridge.stop().await;
}

#[tokio::test]
async fn test_validation_and_lookup_errors() {
    let (app, _bridge) = app();

    let (status, body) = call(
        &app,
        Method::POST,
        "/trades",
        Some(json!({"symbol": "ETHUSDT", "side": "buy", "quantity": 1.0, "order_type": "LIMIT"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "LIMIT orders must have a price");

    let (status, _) = call(&app, Method::GET, "/trades/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, Method::DELETE, "/trades/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, health) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "running");
    assert_eq!(health["queue_running"], false);
}

#[tokio::test]
async fn test_bot_endpoints_and_conflicts() {
    let (app, bridge) = app();

    let (status, bot) = call(
        &app,
        Method::POST,
        "/bots",
        Some(json!({"bot_id": "grid-1", "bot_type": "grid", "config": {"symbols": ["SOLUSDT", "ethusdt"]}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(bot["status"], "registered");

    let (status, bot) = call(
        &app,
        Method::PUT,
        "/bots/grid-1/status",
        Some(json!({"status": "running", "details": {"grids": 12}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bot["status"], "running");

    let (_, pairs) = call(&app, Method::GET, "/bots/grid-1/pairs", None).await;
    assert_eq!(pairs, json!(["ETHUSDT", "SOLUSDT"]));

    let (_, bots) = call(&app, Method::GET, "/symbols/solusdt/bots", None).await;
    assert_eq!(bots, json!(["grid-1"]));

    let (status, _) = call(
        &app,
        Method::POST,
        "/trades",
        Some(json!({"symbol": "SOLUSDT", "side": "BUY", "quantity": 3.0, "user_id": "grid-1"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = call(
        &app,
        Method::POST,
        "/trades",
        Some(json!({"symbol": "SOLUSDT", "side": "SELL", "quantity": 3.0, "user_id": "dca-7"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["sync_conflict"], true);

    let (_, ledger) = call(&app, Method::GET, "/symbols/SOLUSDT/trades", None).await;
    assert_eq!(ledger.as_array().unwrap().len(), 1);

    let (_, collisions) = call(&app, Method::GET, "/collisions", None).await;
    assert_eq!(collisions.as_array().unwrap().len(), 1);
    assert_eq!(collisions[0]["incoming"]["bot_id"], "dca-7");

    let (status, _) = call(&app, Method::DELETE, "/collisions", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, collisions) = call(&app, Method::GET, "/collisions", None).await;
    assert!(collisions.as_array().unwrap().is_empty());

    let (status, _) = call(&app, Method::GET, "/bots/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, locks) = call(&app, Method::GET, "/locks", None).await;
    assert!(locks.is_array());
    bridge.stop().await;
}

#[tokio::test]
async fn test_idempotent_put() {
    let (app, bridge) = app();
    let order = json!({"symbol": "XRPUSDT", "side": "SELL", "quantity": 40.0});

    let (status, first) = call(&app, Method::PUT, "/trades/client-001", Some(order.clone())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["idempotent_match"], false);

    let (status, replay) = call(&app, Method::PUT, "/trades/client-001", Some(order)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay["idempotent_match"], true);
    assert_eq!(replay["trade_id"], "client-001");
    bridge.stop().await;
}

#[tokio::test]
async fn test_batch_and_idempotent_routes_respect_bot_conflicts() {
    let (app, bridge) = app();

    let (status, _) = call(
        &app,
        Method::POST,
        "/trades/batch",
        Some(json!({"symbol": "BNBUSDT", "side": "BUY", "quantity": 2.0, "user_id": "grid-1"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = call(
        &app,
        Method::POST,
        "/trades/batch",
        Some(json!({"symbol": "BNBUSDT", "side": "SELL", "quantity": 2.0, "user_id": "dca-7"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["sync_conflict"], true);

    let (status, body) = call(
        &app,
        Method::PUT,
        "/trades/client-bnb-sell",
        Some(json!({"symbol": "BNBUSDT", "side": "SELL", "quantity": 1.0, "user_id": "dca-8"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], "CANCELED");

    let (_, collisions) = call(&app, Method::GET, "/collisions", None).await;
    assert_eq!(collisions.as_array().unwrap().len(), 2);
    bridge.stop().await;
}
