//! Glue between the execution queue and the bot synchronizer.
//!
//! Neither side knows about the other. The bridge owns a queue whose executor
//! is a [`SynchronizedExecutor`], and puts its own admission entry points in
//! front of the queue's.

use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::application::services::trade_queue::{
    panic_message, BatchAddResult, IdempotentAddResult, SafeAddResult, TradeExecutionQueue,
    TradeExecutionQueueBuilder,
};
use crate::config::QueueConfig;
use crate::domain::entities::trade_record::ActiveTradeRecord;
use crate::domain::entities::trade_request::{
    ExecutionOutcome, TradeId, TradeRequest, TradeRequestData, TradeStatus,
};
use crate::domain::errors::ExecutionError;
use crate::domain::repositories::trade_services::TradeExecutor;
use crate::domain::services::bot_synchronizer::BotSynchronizer;
use crate::domain::services::lock_registry::LockKind;

pub const SYNC_CONFLICT_MESSAGE: &str = "rejected by bot synchronizer - conflict with another bot";

/// Runs the inner executor while holding the request's symbol lock
pub struct SynchronizedExecutor {
    inner: Arc<dyn TradeExecutor>,
    synchronizer: Arc<BotSynchronizer>,
    lock_timeout: Duration,
}

impl SynchronizedExecutor {
    pub fn new(inner: Arc<dyn TradeExecutor>, synchronizer: Arc<BotSynchronizer>) -> Self {
        let lock_timeout = synchronizer.default_lock_timeout();
        Self {
            inner,
            synchronizer,
            lock_timeout,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

#[async_trait]
impl TradeExecutor for SynchronizedExecutor {
    async fn execute(&self, request: &TradeRequest) -> Result<ExecutionOutcome, ExecutionError> {
        // Without a bot identity there is nobody to hold the lock
        let Some(bot_id) = request.bot_id() else {
            return self.inner.execute(request).await;
        };
        let symbol = request.symbol.as_str();

        if !self
            .synchronizer
            .acquire_lock(LockKind::Symbol, Some(symbol), &bot_id, self.lock_timeout)
            .await
        {
            return Err(ExecutionError::Deferred(format!(
                "{} is locked by another bot",
                symbol
            )));
        }
        debug!(trade_id = %request.id, "Bot {} holds {} for execution", bot_id, symbol);

        let result = AssertUnwindSafe(self.inner.execute(request))
            .catch_unwind()
            .await;

        if !self
            .synchronizer
            .release_lock(LockKind::Symbol, Some(symbol), &bot_id)
            .await
        {
            warn!("Symbol lock {} was not held by {} after execution", symbol, bot_id);
        }

        match result {
            Ok(result) => result,
            Err(panic) => Err(ExecutionError::Panicked(panic_message(panic))),
        }
    }
}

/// Queue front-end that consults the bot synchronizer before admitting
#[derive(Clone)]
pub struct QueueSynchronizerBridge {
    queue: TradeExecutionQueue,
    synchronizer: Arc<BotSynchronizer>,
}

impl QueueSynchronizerBridge {
    pub fn new(
        config: QueueConfig,
        executor: Arc<dyn TradeExecutor>,
        synchronizer: Arc<BotSynchronizer>,
    ) -> Self {
        Self::with_builder(config, executor, synchronizer, |builder| builder)
    }

    /// `customize` can attach a risk checker or log sink to the owned queue
    pub fn with_builder<F>(
        config: QueueConfig,
        executor: Arc<dyn TradeExecutor>,
        synchronizer: Arc<BotSynchronizer>,
        customize: F,
    ) -> Self
    where
        F: FnOnce(TradeExecutionQueueBuilder) -> TradeExecutionQueueBuilder,
    {
        let executor: Arc<dyn TradeExecutor> =
            Arc::new(SynchronizedExecutor::new(executor, synchronizer.clone()));
        let queue = customize(TradeExecutionQueue::builder(config, executor)).build();
        Self {
            queue,
            synchronizer,
        }
    }

    pub fn queue(&self) -> &TradeExecutionQueue {
        &self.queue
    }

    pub fn synchronizer(&self) -> &Arc<BotSynchronizer> {
        &self.synchronizer
    }

    /// Admit an already-built request through the synchronizer checks
    pub async fn add_trade(&self, request: TradeRequest) -> SafeAddResult {
        if self.queue.is_duplicate_trade(&request).await {
            let message = format!(
                "Duplicate trade detected: identical {} {} {} order already seen",
                request.side, request.quantity, request.symbol
            );
            let trade_id = self.queue.record_rejected(request, &message).await;
            return SafeAddResult {
                trade_id: Some(trade_id),
                duplicate_detected: true,
                error: Some(message),
                ..Default::default()
            };
        }

        if let Some(existing) = self.queue.find_same_order_in_progress(&request).await {
            let message = format!(
                "Same order already in progress for {} ({})",
                request.symbol, existing
            );
            let trade_id = self.queue.record_rejected(request, &message).await;
            return SafeAddResult {
                trade_id: Some(trade_id),
                concurrent_detected: true,
                existing_trade_id: Some(existing),
                error: Some(message),
                ..Default::default()
            };
        }

        let request = match self.register_with_synchronizer(request).await {
            Ok(request) => request,
            Err(trade_id) => {
                return SafeAddResult {
                    trade_id: Some(trade_id),
                    sync_conflict: true,
                    error: Some(SYNC_CONFLICT_MESSAGE.to_string()),
                    ..Default::default()
                }
            }
        };

        SafeAddResult::accepted(self.queue.add_trade(request).await)
    }

    /// Batching admission behind the directional-conflict check. The check
    /// runs before the order can fold into a pending one.
    pub async fn add_trade_with_batching(&self, data: TradeRequestData) -> BatchAddResult {
        let request = match TradeRequest::new(data, self.queue.config().max_retries) {
            Ok(request) => request,
            Err(e) => {
                return BatchAddResult {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        match self.register_with_synchronizer(request).await {
            Ok(request) => self.queue.add_request_with_batching(request).await,
            Err(trade_id) => BatchAddResult {
                trade_id: Some(trade_id),
                sync_conflict: true,
                error: Some(SYNC_CONFLICT_MESSAGE.to_string()),
                ..Default::default()
            },
        }
    }

    /// Idempotent admission behind the directional-conflict check. A replay
    /// of a known id is answered without consulting the synchronizer.
    pub async fn add_trade_idempotent(&self, data: TradeRequestData) -> IdempotentAddResult {
        let Some(trade_id) = data.trade_id.clone() else {
            return self.queue.add_trade_idempotent(data).await;
        };
        if self.queue.get_trade_status(&trade_id).await.is_some() {
            return self.queue.add_trade_idempotent(data).await;
        }

        let request =
            match TradeRequest::with_id(trade_id.clone(), data, self.queue.config().max_retries) {
                Ok(request) => request,
                Err(e) => {
                    return IdempotentAddResult {
                        trade_id: Some(trade_id),
                        error: Some(e.to_string()),
                        ..Default::default()
                    }
                }
            };

        match self.register_with_synchronizer(request).await {
            Ok(request) => self.queue.add_request_idempotent(request).await,
            Err(trade_id) => IdempotentAddResult {
                trade_id: Some(trade_id),
                status: Some(TradeStatus::Canceled),
                sync_conflict: true,
                error: Some(SYNC_CONFLICT_MESSAGE.to_string()),
                ..Default::default()
            },
        }
    }

    /// Put the request in the synchronizer's ledger. On a conflict the request
    /// is filed as CANCELED and its id returned as the error.
    async fn register_with_synchronizer(&self, request: TradeRequest) -> Result<TradeRequest, TradeId> {
        let Some(record) = ActiveTradeRecord::from_request(&request) else {
            return Ok(request);
        };
        if self.synchronizer.register_trade(record).await {
            return Ok(request);
        }
        Err(self
            .queue
            .record_rejected(request, SYNC_CONFLICT_MESSAGE)
            .await)
    }

    /// Validate caller data, then admit as [`Self::add_trade`]
    pub async fn add_trade_safe(&self, data: TradeRequestData) -> SafeAddResult {
        match TradeRequest::new(data, self.queue.config().max_retries) {
            Ok(request) => self.add_trade(request).await,
            Err(e) => SafeAddResult::invalid(e),
        }
    }

    pub async fn start(&self) {
        self.queue.start().await
    }

    pub async fn stop(&self) {
        self.queue.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::domain::entities::trade_request::TradeSide;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TradeExecutor for CountingExecutor {
        async fn execute(&self, request: &TradeRequest) -> Result<ExecutionOutcome, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutionOutcome::filled("ok", request.price, request.quantity))
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl TradeExecutor for PanickingExecutor {
        async fn execute(&self, _request: &TradeRequest) -> Result<ExecutionOutcome, ExecutionError> {
            panic!("exchange adapter blew up");
        }
    }

    fn sync() -> Arc<BotSynchronizer> {
        Arc::new(BotSynchronizer::new(SyncConfig::default()))
    }

    fn request(bot: &str, side: TradeSide) -> TradeRequest {
        TradeRequest::new(TradeRequestData::market("BTCUSDT", side, 1.0).with_user(bot), 3).unwrap()
    }

    #[tokio::test]
    async fn test_synchronized_executor_defers_when_symbol_locked() {
        let sync = sync();
        let inner = Arc::new(CountingExecutor {
            calls: AtomicUsize::new(0),
        });
        let executor = SynchronizedExecutor::new(inner.clone(), sync.clone())
            .with_lock_timeout(Duration::from_millis(20));

        assert!(
            sync.lock_symbol_for_trading("BTCUSDT", "bot-a", Duration::from_millis(20))
                .await
        );

        let err = executor.execute(&request("bot-b", TradeSide::Buy)).await.unwrap_err();
        assert!(err.is_deferral());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);

        // the holder itself re-enters and the lock survives its own execution
        assert!(executor.execute(&request("bot-a", TradeSide::Buy)).await.is_ok());
        let lock = sync.get_lock(LockKind::Symbol, Some("BTCUSDT")).await;
        assert_eq!(lock.holder().await.as_deref(), Some("bot-a"));
    }

    #[tokio::test]
    async fn test_synchronized_executor_releases_after_panic() {
        let sync = sync();
        let executor = SynchronizedExecutor::new(Arc::new(PanickingExecutor), sync.clone());

        let err = executor.execute(&request("bot-a", TradeSide::Buy)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Panicked(ref m) if m.contains("blew up")));

        let lock = sync.get_lock(LockKind::Symbol, Some("BTCUSDT")).await;
        assert!(!lock.is_locked().await);
    }

    #[tokio::test]
    async fn test_bridge_rejects_opposite_direction_from_other_bot() {
        let bridge = QueueSynchronizerBridge::new(
            QueueConfig::default(),
            Arc::new(CountingExecutor {
                calls: AtomicUsize::new(0),
            }),
            sync(),
        );

        let first = bridge.add_trade(request("bot-a", TradeSide::Buy)).await;
        assert!(first.success);

        let second = bridge.add_trade(request("bot-b", TradeSide::Sell)).await;
        assert!(!second.success);
        assert!(second.sync_conflict);

        let rejected = bridge
            .queue()
            .get_trade_by_id(second.trade_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(rejected.status(), TradeStatus::Canceled);
        assert_eq!(rejected.error_message.as_deref(), Some(SYNC_CONFLICT_MESSAGE));
        assert_eq!(bridge.synchronizer().get_collision_history().await.len(), 1);
        bridge.stop().await;
    }

    fn counting_bridge() -> QueueSynchronizerBridge {
        QueueSynchronizerBridge::new(
            QueueConfig::default(),
            Arc::new(CountingExecutor {
                calls: AtomicUsize::new(0),
            }),
            sync(),
        )
    }

    #[tokio::test]
    async fn test_batched_opposite_direction_is_rejected() {
        let bridge = counting_bridge();
        assert!(bridge.add_trade(request("bot-a", TradeSide::Buy)).await.success);

        let sell = TradeRequestData::market("BTCUSDT", TradeSide::Sell, 1.0).with_user("bot-b");
        let result = bridge.add_trade_with_batching(sell).await;
        assert!(!result.success);
        assert!(result.sync_conflict);
        assert!(!result.batched);
        assert_eq!(result.error.as_deref(), Some(SYNC_CONFLICT_MESSAGE));

        let rejected = bridge
            .queue()
            .get_trade_by_id(result.trade_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(rejected.status(), TradeStatus::Canceled);
        assert_eq!(bridge.synchronizer().get_collision_history().await.len(), 1);
        assert_eq!(bridge.synchronizer().get_active_trades("BTCUSDT").await.len(), 1);

        // the same bot still batches into its own direction
        let buy = TradeRequestData::market("BTCUSDT", TradeSide::Buy, 0.5).with_user("bot-a");
        assert!(bridge.add_trade_with_batching(buy).await.success);
        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_idempotent_opposite_direction_is_rejected_and_replays() {
        let bridge = counting_bridge();
        assert!(bridge.add_trade(request("bot-a", TradeSide::Buy)).await.success);

        let sell = TradeRequestData::market("BTCUSDT", TradeSide::Sell, 1.0)
            .with_user("bot-c")
            .with_trade_id("client-sell-1");
        let result = bridge.add_trade_idempotent(sell.clone()).await;
        assert!(!result.success);
        assert!(result.sync_conflict);
        assert_eq!(result.trade_id.as_deref(), Some("client-sell-1"));
        assert_eq!(result.error.as_deref(), Some(SYNC_CONFLICT_MESSAGE));
        assert_eq!(bridge.synchronizer().get_collision_history().await.len(), 1);

        // resending the id answers from history without a second collision
        let replay = bridge.add_trade_idempotent(sell).await;
        assert!(replay.idempotent_match);
        assert_eq!(replay.status, Some(TradeStatus::Canceled));
        assert_eq!(bridge.synchronizer().get_collision_history().await.len(), 1);
        bridge.stop().await;
    }
}
