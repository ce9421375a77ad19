use async_trait::async_trait;
use tracing::{error, info};

use crate::domain::entities::trade_request::{ExecutionOutcome, TradeRequest, TradeStatus};
use crate::domain::repositories::trade_services::TradeLogSink;

/// Trade log sink that writes structured `tracing` events
#[derive(Debug, Default, Clone)]
pub struct TracingTradeLog;

#[async_trait]
impl TradeLogSink for TracingTradeLog {
    async fn order_created(&self, request: &TradeRequest) -> Result<(), String> {
        info!(
            target: "tradesync::trade_log",
            trade_id = %request.id,
            symbol = %request.symbol,
            side = %request.side,
            quantity = request.quantity,
            order_type = %request.order_type,
            "order created"
        );
        Ok(())
    }

    async fn execution(
        &self,
        request: &TradeRequest,
        outcome: &ExecutionOutcome,
    ) -> Result<(), String> {
        info!(
            target: "tradesync::trade_log",
            trade_id = %request.id,
            symbol = %request.symbol,
            order_id = outcome.order_id.as_deref().unwrap_or("-"),
            price = outcome.price.unwrap_or_default(),
            quantity = outcome.quantity.unwrap_or(request.quantity),
            paper = outcome.is_paper_trade,
            "order executed"
        );
        Ok(())
    }

    async fn error(&self, request: &TradeRequest, message: &str) -> Result<(), String> {
        error!(
            target: "tradesync::trade_log",
            trade_id = %request.id,
            symbol = %request.symbol,
            status = %request.status(),
            "order error: {}",
            message
        );
        Ok(())
    }

    async fn status_update(
        &self,
        request: &TradeRequest,
        previous: TradeStatus,
    ) -> Result<(), String> {
        info!(
            target: "tradesync::trade_log",
            trade_id = %request.id,
            from = %previous,
            to = %request.status(),
            retries = request.retries,
            "status change"
        );
        Ok(())
    }
}
