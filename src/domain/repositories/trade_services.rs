//! Collaborator traits
//!
//! The execution core never talks to an exchange, a risk engine or a log
//! store directly. It is handed implementations of these traits at
//! construction time, which keeps it protocol-agnostic and easy to mock.

use async_trait::async_trait;

use crate::domain::entities::trade_request::{ExecutionOutcome, TradeRequest, TradeStatus};
use crate::domain::errors::ExecutionError;

/// Places one order on the exchange (paper or live)
#[async_trait]
pub trait TradeExecutor: Send + Sync {
    /// `Ok` with `success == false` is a rejection reported by the exchange;
    /// `Err` is a failure of the call itself.
    async fn execute(&self, request: &TradeRequest) -> Result<ExecutionOutcome, ExecutionError>;
}

/// Pre-trade risk gate
#[async_trait]
pub trait RiskChecker: Send + Sync {
    async fn approve(&self, request: &TradeRequest) -> bool;
}

/// Receives lifecycle events for persistence or notification.
///
/// Errors are logged and dropped by the queue; they never change a trade's
/// outcome.
#[async_trait]
pub trait TradeLogSink: Send + Sync {
    async fn order_created(&self, request: &TradeRequest) -> Result<(), String>;

    async fn execution(
        &self,
        request: &TradeRequest,
        outcome: &ExecutionOutcome,
    ) -> Result<(), String>;

    async fn error(&self, request: &TradeRequest, message: &str) -> Result<(), String>;

    async fn status_update(
        &self,
        request: &TradeRequest,
        previous: TradeStatus,
    ) -> Result<(), String>;
}
