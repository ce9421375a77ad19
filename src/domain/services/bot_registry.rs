use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::domain::entities::bot::{trading_pairs_from_config, BotState, BotStatus};

/// Process-lifetime registry of bots and the symbols they trade
#[derive(Debug, Default)]
pub struct BotRegistry {
    bots: RwLock<HashMap<String, BotState>>,
}

impl BotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a bot. Re-registering keeps status and locked symbols.
    pub async fn register(
        &self,
        bot_id: &str,
        bot_type: &str,
        config: serde_json::Map<String, serde_json::Value>,
    ) -> BotState {
        let mut bots = self.bots.write().await;
        let state = match bots.get_mut(bot_id) {
            Some(existing) => {
                existing.bot_type = bot_type.to_string();
                existing.trading_pairs = trading_pairs_from_config(&config);
                existing.config = config;
                existing.last_action = Utc::now();
                existing.clone()
            }
            None => {
                let state = BotState::new(bot_id, bot_type, config);
                bots.insert(bot_id.to_string(), state.clone());
                state
            }
        };
        info!(
            "Registered bot {} ({}) trading {:?}",
            bot_id, bot_type, state.trading_pairs
        );
        state
    }

    /// Returns false (and warns) for an unknown bot
    pub async fn update_status(
        &self,
        bot_id: &str,
        status: BotStatus,
        details: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> bool {
        let mut bots = self.bots.write().await;
        let Some(state) = bots.get_mut(bot_id) else {
            warn!("Status update for unknown bot {}", bot_id);
            return false;
        };

        state.status = status;
        if let Some(details) = details {
            state.details.extend(details);
        }
        state.last_action = Utc::now();
        true
    }

    pub async fn mark_symbol_locked(&self, bot_id: &str, symbol: &str) {
        if let Some(state) = self.bots.write().await.get_mut(bot_id) {
            state.locked_symbols.insert(symbol.to_string());
            state.last_action = Utc::now();
        }
    }

    pub async fn mark_symbol_unlocked(&self, bot_id: &str, symbol: &str) {
        if let Some(state) = self.bots.write().await.get_mut(bot_id) {
            state.locked_symbols.remove(symbol);
            state.last_action = Utc::now();
        }
    }

    pub async fn get(&self, bot_id: &str) -> Option<BotState> {
        self.bots.read().await.get(bot_id).cloned()
    }

    pub async fn trading_pairs(&self, bot_id: &str) -> BTreeSet<String> {
        self.bots
            .read()
            .await
            .get(bot_id)
            .map(|s| s.trading_pairs.clone())
            .unwrap_or_default()
    }

    /// Bots that declare `symbol` or currently hold its lock
    pub async fn bots_for_symbol(&self, symbol: &str) -> Vec<String> {
        let symbol = symbol.trim().to_uppercase();
        let mut ids: Vec<String> = self
            .bots
            .read()
            .await
            .values()
            .filter(|s| s.trades_symbol(&symbol) || s.locked_symbols.contains(&symbol))
            .map(|s| s.bot_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn all(&self) -> Vec<BotState> {
        let mut bots: Vec<BotState> = self.bots.read().await.values().cloned().collect();
        bots.sort_by(|a, b| a.bot_id.cmp(&b.bot_id));
        bots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_register_is_idempotent_upsert() {
        let registry = BotRegistry::new();
        registry
            .register("bot-1", "grid", config(json!({"symbol": "BTCUSDT"})))
            .await;
        assert!(registry.update_status("bot-1", BotStatus::Running, None).await);
        registry.mark_symbol_locked("bot-1", "BTCUSDT").await;

        let state = registry
            .register("bot-1", "grid", config(json!({"symbols": ["ETHUSDT", "BTCUSDT"]})))
            .await;
        assert_eq!(state.status, BotStatus::Running);
        assert_eq!(state.trading_pairs.len(), 2);
        assert!(state.locked_symbols.contains("BTCUSDT"));
        assert_eq!(registry.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_bot_is_noop() {
        let registry = BotRegistry::new();
        assert!(!registry.update_status("ghost", BotStatus::Running, None).await);
        assert!(registry.get("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_update_merges_details() {
        let registry = BotRegistry::new();
        registry.register("bot-1", "dca", config(json!({}))).await;
        registry
            .update_status("bot-1", BotStatus::Running, Some(config(json!({"pnl": 1.5}))))
            .await;
        registry
            .update_status("bot-1", BotStatus::Paused, Some(config(json!({"reason": "manual"}))))
            .await;

        let state = registry.get("bot-1").await.unwrap();
        assert_eq!(state.status, BotStatus::Paused);
        assert_eq!(state.details.get("pnl").unwrap(), 1.5);
        assert_eq!(state.details.get("reason").and_then(|v| v.as_str()), Some("manual"));
    }

    #[tokio::test]
    async fn test_bots_for_symbol() {
        let registry = BotRegistry::new();
        registry
            .register("bot-b", "grid", config(json!({"symbol": "BTCUSDT"})))
            .await;
        registry
            .register("bot-a", "grid", config(json!({"symbols": ["btcusdt", "ETHUSDT"]})))
            .await;
        registry
            .register("bot-c", "grid", config(json!({"symbol": "SOLUSDT"})))
            .await;

        assert_eq!(registry.bots_for_symbol("btcusdt").await, vec!["bot-a", "bot-b"]);
        assert_eq!(registry.bots_for_symbol("ETHUSDT").await, vec!["bot-a"]);
        assert!(registry.bots_for_symbol("XRPUSDT").await.is_empty());
    }
}
