//! Directional conflict detection between bots
//!
//! Keeps a per-symbol ledger of recent trades. Two trades on one symbol
//! conflict when they come from different (bot, strategy) pairs, both fall
//! inside the freshness window, and point in opposite directions. A conflicting
//! insert is refused and recorded in a bounded collision history.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::domain::entities::trade_record::{
    ActiveTradeRecord, CollisionRecord, CollisionResolution,
};
use crate::domain::entities::trade_request::TradeSide;

#[derive(Debug, Clone)]
pub struct CollisionDetectorConfig {
    /// Ledger entries older than this are ignored by conflict checks
    pub conflict_window: Duration,
    /// Ledger entries older than this are dropped on the next insert
    pub retention: Duration,
    pub history_capacity: usize,
}

impl Default for CollisionDetectorConfig {
    fn default() -> Self {
        Self {
            conflict_window: Duration::minutes(5),
            retention: Duration::hours(1),
            history_capacity: 100,
        }
    }
}

pub struct CollisionDetector {
    config: CollisionDetectorConfig,
    ledger: RwLock<HashMap<String, Vec<ActiveTradeRecord>>>,
    collisions: Mutex<VecDeque<CollisionRecord>>,
}

impl CollisionDetector {
    pub fn new(config: CollisionDetectorConfig) -> Self {
        let capacity = config.history_capacity;
        Self {
            config,
            ledger: RwLock::new(HashMap::new()),
            collisions: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn is_fresh(&self, record: &ActiveTradeRecord, now: DateTime<Utc>) -> bool {
        now - record.timestamp < self.config.conflict_window
    }

    /// Add `record` to the ledger unless it conflicts with a fresh entry.
    ///
    /// On conflict the ledger is left untouched and a collision is recorded.
    pub async fn register_trade(&self, record: ActiveTradeRecord) -> bool {
        let now = Utc::now();
        let mut ledger = self.ledger.write().await;
        let entries = ledger.entry(record.symbol.clone()).or_default();

        let conflict = if self.is_fresh(&record, now) {
            entries
                .iter()
                .find(|existing| {
                    !existing.same_actor(&record)
                        && existing.side != record.side
                        && self.is_fresh(existing, now)
                })
                .cloned()
        } else {
            None
        };

        if let Some(existing) = conflict {
            drop(ledger);
            warn!(
                "Trade collision on {}: {} wants {} but {} holds {} (rejected)",
                record.symbol, record.bot_id, record.side, existing.bot_id, existing.side
            );
            self.record_collision(existing, record, now).await;
            return false;
        }

        let retention = self.config.retention;
        entries.retain(|e| now - e.timestamp <= retention);
        debug!(
            "Registered {} {} {} for bot {}",
            record.side, record.quantity, record.symbol, record.bot_id
        );
        entries.push(record);
        true
    }

    async fn record_collision(
        &self,
        existing: ActiveTradeRecord,
        incoming: ActiveTradeRecord,
        now: DateTime<Utc>,
    ) {
        let mut collisions = self.collisions.lock().await;
        if collisions.len() >= self.config.history_capacity {
            collisions.pop_front();
        }
        collisions.push_back(CollisionRecord {
            timestamp: now,
            symbol: incoming.symbol.clone(),
            existing,
            incoming,
            resolution: CollisionResolution::Rejected,
        });
    }

    /// Read-only version of the conflict rule.
    ///
    /// `side == None` expresses lock-only intent and is always allowed.
    /// Entries from `bot_id` itself never conflict.
    pub async fn check_trading_allowed(
        &self,
        symbol: &str,
        bot_id: &str,
        side: Option<TradeSide>,
    ) -> bool {
        let Some(side) = side else {
            return true;
        };

        let symbol = symbol.trim().to_uppercase();
        let now = Utc::now();
        let ledger = self.ledger.read().await;

        match ledger.get(&symbol) {
            Some(entries) => !entries.iter().any(|existing| {
                existing.bot_id != bot_id && existing.side != side && self.is_fresh(existing, now)
            }),
            None => true,
        }
    }

    /// Fresh ledger entries for a symbol
    pub async fn active_trades(&self, symbol: &str) -> Vec<ActiveTradeRecord> {
        let symbol = symbol.trim().to_uppercase();
        let now = Utc::now();
        self.ledger
            .read()
            .await
            .get(&symbol)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| self.is_fresh(e, now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop entries past retention across all symbols, returns how many went
    pub async fn prune(&self) -> usize {
        let now = Utc::now();
        let retention = self.config.retention;
        let mut ledger = self.ledger.write().await;
        let mut removed = 0;
        for entries in ledger.values_mut() {
            let before = entries.len();
            entries.retain(|e| now - e.timestamp <= retention);
            removed += before - entries.len();
        }
        ledger.retain(|_, entries| !entries.is_empty());
        removed
    }

    pub async fn collision_history(&self) -> Vec<CollisionRecord> {
        self.collisions.lock().await.iter().cloned().collect()
    }

    pub async fn clear_collision_history(&self) {
        self.collisions.lock().await.clear();
    }
}
