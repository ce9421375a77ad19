//! Paper trading executor
//!
//! Fills every order immediately without touching an exchange. The binary
//! wires it in when no live exchange adapter is configured.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::domain::entities::trade_request::{ExecutionOutcome, TradeRequest};
use crate::domain::errors::ExecutionError;
use crate::domain::repositories::trade_services::TradeExecutor;

#[derive(Debug, Default)]
pub struct PaperExecutor {
    fills: AtomicU64,
}

impl PaperExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fill_count(&self) -> u64 {
        self.fills.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TradeExecutor for PaperExecutor {
    async fn execute(&self, request: &TradeRequest) -> Result<ExecutionOutcome, ExecutionError> {
        let n = self.fills.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            trade_id = %request.id,
            symbol = %request.symbol,
            "Paper fill #{}: {} {} @ {}",
            n,
            request.side,
            request.quantity,
            request
                .price
                .map(|p| p.to_string())
                .unwrap_or_else(|| "market".to_string())
        );

        Ok(ExecutionOutcome {
            is_paper_trade: true,
            ..ExecutionOutcome::filled(format!("paper-{}", n), request.price, request.quantity)
        })
    }
}
