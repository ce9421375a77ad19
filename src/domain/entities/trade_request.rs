//! Trade request entity
//!
//! A `TradeRequest` is one proposed order plus its lifecycle state. It is owned
//! by the execution queue until it reaches a terminal status, after which it
//! lives on in the bounded queue history as a read-only snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::errors::{QueueError, ValidationError};

pub type TradeId = String;

static TRADE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Generate a process-unique trade id
pub fn next_trade_id() -> TradeId {
    let seq = TRADE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("trade_{}_{}", Utc::now().timestamp_millis(), seq)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn opposite(&self) -> TradeSide {
        match self {
            TradeSide::Buy => TradeSide::Sell,
            TradeSide::Sell => TradeSide::Buy,
        }
    }

    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        match value.trim().to_uppercase().as_str() {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            other => Err(ValidationError::InvalidSide(other.to_string())),
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "BUY"),
            TradeSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    #[default]
    Market,
    Limit,
    StopLimit,
    TakeProfitLimit,
}

impl OrderType {
    /// Orders in the LIMIT family carry a price and are matched on it
    pub fn is_limit_family(&self) -> bool {
        !matches!(self, OrderType::Market)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopLimit => "STOP_LIMIT",
            OrderType::TakeProfitLimit => "TAKE_PROFIT_LIMIT",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        match value.trim().to_uppercase().as_str() {
            "MARKET" => Ok(OrderType::Market),
            "LIMIT" => Ok(OrderType::Limit),
            "STOP_LIMIT" => Ok(OrderType::StopLimit),
            "TAKE_PROFIT_LIMIT" => Ok(OrderType::TakeProfitLimit),
            other => Err(ValidationError::InvalidOrderType(other.to_string())),
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a trade request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Pending,
    RateLimited,
    Processing,
    Executed,
    Failed,
    RiskRejected,
    Canceled,
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeStatus::Executed
                | TradeStatus::Failed
                | TradeStatus::RiskRejected
                | TradeStatus::Canceled
        )
    }

    /// Pending or processing; what the in-flight checks look at
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TradeStatus::Pending | TradeStatus::Processing)
    }

    pub fn can_transition_to(&self, next: TradeStatus) -> bool {
        use TradeStatus::*;
        match (self, next) {
            (Pending, Processing) | (Pending, RateLimited) | (Pending, Canceled) => true,
            (RateLimited, Pending) | (RateLimited, Canceled) => true,
            // Processing -> Pending is the retry / deferral cycle
            (Processing, Executed)
            | (Processing, Failed)
            | (Processing, RiskRejected)
            | (Processing, Pending) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TradeStatus::Pending => "PENDING",
            TradeStatus::RateLimited => "RATE_LIMITED",
            TradeStatus::Processing => "PROCESSING",
            TradeStatus::Executed => "EXECUTED",
            TradeStatus::Failed => "FAILED",
            TradeStatus::RiskRejected => "RISK_REJECTED",
            TradeStatus::Canceled => "CANCELED",
        };
        write!(f, "{}", s)
    }
}

/// Prediction attached by the signal generator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MlSignal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Request metadata: bookkeeping written by the queue plus an opaque slot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeMeta {
    /// Ids of requests folded into this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batched_trades: Vec<TradeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_quantity: Option<f64>,
    /// Request this one was batched alongside
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combined_with: Option<TradeId>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// What the executor reports back for one order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub is_paper_trade: bool,
}

impl ExecutionOutcome {
    pub fn filled(order_id: impl Into<String>, price: Option<f64>, quantity: f64) -> Self {
        Self {
            success: true,
            message: None,
            price,
            quantity: Some(quantity),
            order_id: Some(order_id.into()),
            is_paper_trade: false,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Whether the exchange reported that we are being throttled
    pub fn is_rate_limited(&self) -> bool {
        self.message
            .as_deref()
            .map(is_rate_limit_message)
            .unwrap_or(false)
    }
}

pub fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
        || lower.contains("429")
}

/// Caller-supplied description of a desired order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeRequestData {
    /// Only honoured by idempotent admission
    #[serde(default)]
    pub trade_id: Option<TradeId>,
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub position_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub strategy_id: Option<String>,
    #[serde(default)]
    pub ml_signal: Option<MlSignal>,
    #[serde(default)]
    pub meta: TradeMeta,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl TradeRequestData {
    pub fn market(symbol: &str, side: TradeSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: side.to_string(),
            quantity,
            ..Default::default()
        }
    }

    pub fn limit(symbol: &str, side: TradeSide, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: side.to_string(),
            quantity,
            order_type: Some(OrderType::Limit.as_str().to_string()),
            price: Some(price),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_strategy(mut self, strategy_id: &str) -> Self {
        self.strategy_id = Some(strategy_id.to_string());
        self
    }

    pub fn with_trade_id(mut self, trade_id: &str) -> Self {
        self.trade_id = Some(trade_id.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRequest {
    pub id: TradeId,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub position_id: Option<String>,
    pub user_id: Option<String>,
    pub strategy_id: Option<String>,
    pub ml_signal: Option<MlSignal>,
    pub meta: TradeMeta,
    status: TradeStatus,
    pub error_message: Option<String>,
    pub result: Option<ExecutionOutcome>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub max_retries: u32,
}

impl TradeRequest {
    /// Validate the caller data and build a PENDING request.
    ///
    /// A caller-supplied `trade_id` is ignored here; idempotent admission
    /// uses [`TradeRequest::with_id`] instead.
    pub fn new(data: TradeRequestData, default_max_retries: u32) -> Result<Self, ValidationError> {
        Self::build(next_trade_id(), data, default_max_retries)
    }

    pub fn with_id(
        id: TradeId,
        data: TradeRequestData,
        default_max_retries: u32,
    ) -> Result<Self, ValidationError> {
        if id.trim().is_empty() {
            return Err(ValidationError::MissingTradeId);
        }
        Self::build(id, data, default_max_retries)
    }

    fn build(
        id: TradeId,
        data: TradeRequestData,
        default_max_retries: u32,
    ) -> Result<Self, ValidationError> {
        let symbol = data.symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(ValidationError::InvalidSymbol(data.symbol));
        }

        let side = TradeSide::parse(&data.side)?;

        if !data.quantity.is_finite() || data.quantity <= 0.0 {
            return Err(ValidationError::InvalidQuantity(format!(
                "quantity must be positive, got {}",
                data.quantity
            )));
        }

        let order_type = match data.order_type.as_deref() {
            Some(raw) => OrderType::parse(raw)?,
            None => OrderType::Market,
        };

        if let Some(price) = data.price {
            if !price.is_finite() || price <= 0.0 {
                return Err(ValidationError::InvalidPrice(format!(
                    "price must be positive, got {}",
                    price
                )));
            }
        }

        if order_type.is_limit_family() && data.price.is_none() {
            return Err(ValidationError::MissingPrice(order_type.to_string()));
        }

        Ok(Self {
            id,
            symbol,
            side,
            quantity: data.quantity,
            order_type,
            price: data.price,
            position_id: data.position_id,
            user_id: data.user_id,
            strategy_id: data.strategy_id,
            ml_signal: data.ml_signal,
            meta: data.meta,
            status: TradeStatus::Pending,
            error_message: None,
            result: None,
            created_at: Utc::now(),
            processed_at: None,
            retries: 0,
            max_retries: data.max_retries.unwrap_or(default_max_retries),
        })
    }

    pub fn status(&self) -> TradeStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, refusing anything outside the lifecycle table
    pub fn transition_to(&mut self, next: TradeStatus) -> Result<(), QueueError> {
        if !self.status.can_transition_to(next) {
            return Err(QueueError::InvalidTransition {
                trade_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Terminal transition carrying a display-ready reason
    pub fn fail_with(&mut self, next: TradeStatus, message: impl Into<String>) -> Result<(), QueueError> {
        self.transition_to(next)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Identity the bot synchronizer knows this request by
    pub fn bot_id(&self) -> Option<String> {
        self.user_id.clone().or_else(|| self.strategy_id.clone())
    }
}
