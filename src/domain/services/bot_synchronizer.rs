//! Bot synchronizer
//!
//! The single process-wide authority that hands out trading locks, tracks
//! which bots are alive, and vetoes directionally conflicting trades. It is
//! built once by the composition root and shared as `Arc<BotSynchronizer>`.
//!
//! Registry, ledger and collision history each sit behind their own lock,
//! separate from the trading locks, so introspection never waits on a bot
//! that is holding a symbol.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::domain::entities::bot::{BotState, BotStatus};
use crate::domain::entities::trade_record::{ActiveTradeRecord, CollisionRecord};
use crate::domain::entities::trade_request::TradeSide;
use crate::domain::services::bot_registry::BotRegistry;
use crate::domain::services::collision_detector::{CollisionDetector, CollisionDetectorConfig};
use crate::domain::services::lock_registry::{LockKind, LockRegistry, LockSnapshot, TradingLock};

pub struct BotSynchronizer {
    config: SyncConfig,
    locks: LockRegistry,
    detector: CollisionDetector,
    bots: BotRegistry,
}

impl BotSynchronizer {
    pub fn new(config: SyncConfig) -> Self {
        let detector = CollisionDetector::new(CollisionDetectorConfig {
            conflict_window: chrono::Duration::seconds(config.conflict_window.as_secs() as i64),
            retention: chrono::Duration::seconds(config.ledger_retention.as_secs() as i64),
            history_capacity: config.collision_history_capacity,
        });

        Self {
            config,
            locks: LockRegistry::new(),
            detector,
            bots: BotRegistry::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn default_lock_timeout(&self) -> Duration {
        self.config.lock_timeout
    }

    // ------------------------------------------------------------------
    // Bots
    // ------------------------------------------------------------------

    pub async fn register_bot(
        &self,
        bot_id: &str,
        bot_type: &str,
        config: serde_json::Map<String, serde_json::Value>,
    ) -> BotState {
        self.bots.register(bot_id, bot_type, config).await
    }

    pub async fn update_bot_status(
        &self,
        bot_id: &str,
        status: BotStatus,
        details: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> bool {
        self.bots.update_status(bot_id, status, details).await
    }

    pub async fn get_bot_state(&self, bot_id: &str) -> Option<BotState> {
        self.bots.get(bot_id).await
    }

    pub async fn list_bots(&self) -> Vec<BotState> {
        self.bots.all().await
    }

    pub async fn get_bot_trading_pairs(&self, bot_id: &str) -> BTreeSet<String> {
        self.bots.trading_pairs(bot_id).await
    }

    pub async fn get_active_bots_for_symbol(&self, symbol: &str) -> Vec<String> {
        self.bots.bots_for_symbol(symbol).await
    }

    // ------------------------------------------------------------------
    // Trades
    // ------------------------------------------------------------------

    /// Record a trade in the ledger, or refuse it as a directional conflict
    pub async fn register_trade(&self, record: ActiveTradeRecord) -> bool {
        self.detector.register_trade(record).await
    }

    pub async fn check_trading_allowed(
        &self,
        symbol: &str,
        bot_id: &str,
        side: Option<TradeSide>,
    ) -> bool {
        self.detector.check_trading_allowed(symbol, bot_id, side).await
    }

    pub async fn get_active_trades(&self, symbol: &str) -> Vec<ActiveTradeRecord> {
        self.detector.active_trades(symbol).await
    }

    pub async fn get_collision_history(&self) -> Vec<CollisionRecord> {
        self.detector.collision_history().await
    }

    pub async fn clear_collision_history(&self) {
        self.detector.clear_collision_history().await
    }

    pub async fn prune_ledger(&self) -> usize {
        let removed = self.detector.prune().await;
        if removed > 0 {
            debug!("Pruned {} expired ledger entries", removed);
        }
        removed
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    pub async fn get_lock(&self, kind: LockKind, resource: Option<&str>) -> Arc<TradingLock> {
        self.locks.get_lock(kind, resource).await
    }

    pub async fn acquire_lock(
        &self,
        kind: LockKind,
        resource: Option<&str>,
        holder: &str,
        timeout: Duration,
    ) -> bool {
        self.locks.acquire(kind, resource, holder, timeout).await
    }

    pub async fn release_lock(&self, kind: LockKind, resource: Option<&str>, holder: &str) -> bool {
        self.locks.release(kind, resource, holder).await
    }

    pub async fn get_lock_snapshots(&self) -> Vec<LockSnapshot> {
        self.locks.snapshots().await
    }

    /// Claim a symbol for `bot_id` and note it in the bot's bookkeeping
    pub async fn lock_symbol_for_trading(&self, symbol: &str, bot_id: &str, timeout: Duration) -> bool {
        let symbol = symbol.trim().to_uppercase();

        if !self.check_trading_allowed(&symbol, bot_id, None).await {
            return false;
        }

        if !self
            .acquire_lock(LockKind::Symbol, Some(&symbol), bot_id, timeout)
            .await
        {
            debug!("Bot {} could not lock {} within {:?}", bot_id, symbol, timeout);
            return false;
        }

        self.bots.mark_symbol_locked(bot_id, &symbol).await;
        info!("Bot {} locked {} for trading", bot_id, symbol);
        true
    }

    /// Release one level of the symbol lock. The bot's bookkeeping is only
    /// cleared once it no longer holds the lock. Safe when not held.
    pub async fn unlock_symbol(&self, symbol: &str, bot_id: &str) {
        let symbol = symbol.trim().to_uppercase();
        let released = self
            .release_lock(LockKind::Symbol, Some(&symbol), bot_id)
            .await;

        let holder = self.locks.holder_of(LockKind::Symbol, Some(&symbol)).await;
        if holder.as_deref() == Some(bot_id) {
            debug!("Bot {} still holds {} after a nested unlock", bot_id, symbol);
            return;
        }

        self.bots.mark_symbol_unlocked(bot_id, &symbol).await;
        if released {
            info!("Bot {} unlocked {}", bot_id, symbol);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SHORT: Duration = Duration::from_millis(50);

    fn synchronizer() -> BotSynchronizer {
        BotSynchronizer::new(SyncConfig::default())
    }

    fn config(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_lock_symbol_blocks_other_bot_until_unlocked() {
        let sync = synchronizer();
        sync.register_bot("bot-a", "grid", config(json!({"symbol": "BTCUSDT"}))).await;

        assert!(sync.lock_symbol_for_trading("BTCUSDT", "bot-a", SHORT).await);
        assert!(
            !sync
                .acquire_lock(LockKind::Symbol, Some("BTCUSDT"), "bot-b", SHORT)
                .await
        );

        sync.unlock_symbol("BTCUSDT", "bot-a").await;
        assert!(
            sync.acquire_lock(LockKind::Symbol, Some("BTCUSDT"), "bot-b", SHORT)
                .await
        );
    }

    #[tokio::test]
    async fn test_lock_symbol_tracks_locked_symbols() {
        let sync = synchronizer();
        sync.register_bot("bot-a", "grid", config(json!({"symbol": "ETHUSDT"}))).await;

        assert!(sync.lock_symbol_for_trading("ethusdt", "bot-a", SHORT).await);
        let state = sync.get_bot_state("bot-a").await.unwrap();
        assert!(state.locked_symbols.contains("ETHUSDT"));

        sync.unlock_symbol("ETHUSDT", "bot-a").await;
        let state = sync.get_bot_state("bot-a").await.unwrap();
        assert!(state.locked_symbols.is_empty());
    }

    #[tokio::test]
    async fn test_nested_lock_stays_marked_until_last_unlock() {
        let sync = synchronizer();
        sync.register_bot("bot-a", "grid", config(json!({"symbol": "ADAUSDT"}))).await;

        assert!(sync.lock_symbol_for_trading("ADAUSDT", "bot-a", SHORT).await);
        assert!(sync.lock_symbol_for_trading("ADAUSDT", "bot-a", SHORT).await);

        sync.unlock_symbol("ADAUSDT", "bot-a").await;
        let state = sync.get_bot_state("bot-a").await.unwrap();
        assert!(state.locked_symbols.contains("ADAUSDT"));
        assert!(
            !sync
                .acquire_lock(LockKind::Symbol, Some("ADAUSDT"), "bot-b", SHORT)
                .await
        );

        sync.unlock_symbol("ADAUSDT", "bot-a").await;
        let state = sync.get_bot_state("bot-a").await.unwrap();
        assert!(state.locked_symbols.is_empty());
        assert!(
            sync.acquire_lock(LockKind::Symbol, Some("ADAUSDT"), "bot-b", SHORT)
                .await
        );
    }

    #[tokio::test]
    async fn test_unlock_not_held_does_not_panic() {
        let sync = synchronizer();
        sync.unlock_symbol("SOLUSDT", "nobody").await;
        assert!(sync.lock_symbol_for_trading("SOLUSDT", "bot-a", SHORT).await);
        sync.unlock_symbol("SOLUSDT", "bot-b").await;
        let lock = sync.get_lock(LockKind::Symbol, Some("SOLUSDT")).await;
        assert_eq!(lock.holder().await.as_deref(), Some("bot-a"));
    }

    #[tokio::test]
    async fn test_register_trade_conflict_adds_one_collision() {
        let sync = synchronizer();
        assert!(
            sync.register_trade(ActiveTradeRecord::new("BTCUSDT", TradeSide::Buy, 1.0, "bot-a"))
                .await
        );
        let before = sync.get_collision_history().await.len();
        assert!(
            !sync
                .register_trade(ActiveTradeRecord::new("BTCUSDT", TradeSide::Sell, 1.0, "bot-b"))
                .await
        );
        assert_eq!(sync.get_collision_history().await.len(), before + 1);

        let ledger = sync.get_active_trades("BTCUSDT").await;
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].bot_id, "bot-a");
    }

    #[tokio::test]
    async fn test_global_lock_shared_across_resources() {
        let sync = synchronizer();
        assert!(sync.acquire_lock(LockKind::Global, None, "admin", SHORT).await);
        assert!(
            !sync
                .acquire_lock(LockKind::Global, Some("anything"), "bot-a", SHORT)
                .await
        );
        assert!(sync.release_lock(LockKind::Global, Some("ignored"), "admin").await);
    }

    #[tokio::test]
    async fn test_introspection() {
        let sync = synchronizer();
        sync.register_bot("bot-a", "grid", config(json!({"symbols": ["BTCUSDT", "ETHUSDT"]})))
            .await;
        sync.register_bot("bot-b", "dca", config(json!({"symbol": "BTCUSDT"}))).await;

        assert_eq!(sync.get_bot_trading_pairs("bot-a").await.len(), 2);
        assert!(sync.get_bot_trading_pairs("ghost").await.is_empty());
        assert_eq!(
            sync.get_active_bots_for_symbol("BTCUSDT").await,
            vec!["bot-a", "bot-b"]
        );
        assert_eq!(sync.list_bots().await.len(), 2);
    }
}
