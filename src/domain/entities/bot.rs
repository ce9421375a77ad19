use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    Registered,
    Running,
    Paused,
    Stopped,
    Error,
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BotStatus::Registered => "registered",
            BotStatus::Running => "running",
            BotStatus::Paused => "paused",
            BotStatus::Stopped => "stopped",
            BotStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Snapshot of one registered bot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotState {
    pub bot_id: String,
    pub bot_type: String,
    pub status: BotStatus,
    pub config: serde_json::Map<String, serde_json::Value>,
    pub trading_pairs: BTreeSet<String>,
    pub locked_symbols: BTreeSet<String>,
    pub details: serde_json::Map<String, serde_json::Value>,
    pub last_action: DateTime<Utc>,
}

impl BotState {
    pub fn new(
        bot_id: &str,
        bot_type: &str,
        config: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let trading_pairs = trading_pairs_from_config(&config);
        Self {
            bot_id: bot_id.to_string(),
            bot_type: bot_type.to_string(),
            status: BotStatus::Registered,
            config,
            trading_pairs,
            locked_symbols: BTreeSet::new(),
            details: serde_json::Map::new(),
            last_action: Utc::now(),
        }
    }

    pub fn trades_symbol(&self, symbol: &str) -> bool {
        self.trading_pairs.contains(symbol)
    }
}

/// Symbols a bot declares through `symbol` and/or `symbols`
pub fn trading_pairs_from_config(
    config: &serde_json::Map<String, serde_json::Value>,
) -> BTreeSet<String> {
    let mut pairs = BTreeSet::new();

    if let Some(symbol) = config.get("symbol").and_then(|v| v.as_str()) {
        let symbol = symbol.trim().to_uppercase();
        if !symbol.is_empty() {
            pairs.insert(symbol);
        }
    }

    if let Some(symbols) = config.get("symbols").and_then(|v| v.as_array()) {
        pairs.extend(
            symbols
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty()),
        );
    }

    pairs
}
