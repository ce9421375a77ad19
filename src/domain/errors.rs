use thiserror::Error;

use crate::domain::entities::trade_request::{TradeId, TradeStatus};

/// Rejections raised while building a trade request
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid symbol: '{0}'")]
    InvalidSymbol(String),

    #[error("Invalid side: '{0}' (expected BUY or SELL)")]
    InvalidSide(String),

    #[error("Invalid order type: '{0}'")]
    InvalidOrderType(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("{0} orders must have a price")]
    MissingPrice(String),

    #[error("Idempotent admission requires a trade_id")]
    MissingTradeId,
}

/// Failures reported by a trade executor
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    /// The exchange call itself failed
    #[error("{0}")]
    Exchange(String),

    /// Execution could not start yet; the request goes back to the queue
    #[error("Execution deferred: {0}")]
    Deferred(String),

    #[error("Executor panicked: {0}")]
    Panicked(String),
}

impl ExecutionError {
    pub fn is_deferral(&self) -> bool {
        matches!(self, ExecutionError::Deferred(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueueError {
    #[error("Invalid transition for {trade_id}: {from} -> {to}")]
    InvalidTransition {
        trade_id: TradeId,
        from: TradeStatus,
        to: TradeStatus,
    },
}
