use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entities::trade_request::{TradeRequest, TradeSide};

/// One entry in the per-symbol ledger of recent trades
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTradeRecord {
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub price: Option<f64>,
    pub bot_id: String,
    pub strategy_id: Option<String>,
    pub trade_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ActiveTradeRecord {
    pub fn new(symbol: &str, side: TradeSide, quantity: f64, bot_id: &str) -> Self {
        Self {
            symbol: symbol.trim().to_uppercase(),
            side,
            quantity,
            price: None,
            bot_id: bot_id.to_string(),
            strategy_id: None,
            trade_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_strategy(mut self, strategy_id: &str) -> Self {
        self.strategy_id = Some(strategy_id.to_string());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Ledger entry for a queued request, if it has a bot identity
    pub fn from_request(request: &TradeRequest) -> Option<Self> {
        let bot_id = request.bot_id()?;
        Some(Self {
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            price: request.price,
            bot_id,
            strategy_id: request.strategy_id.clone(),
            trade_id: Some(request.id.clone()),
            timestamp: Utc::now(),
        })
    }

    /// Two records belong to the same actor when bot and strategy both match
    pub fn same_actor(&self, other: &ActiveTradeRecord) -> bool {
        self.bot_id == other.bot_id && self.strategy_id == other.strategy_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionResolution {
    Rejected,
}

/// A directional conflict that was refused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollisionRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub existing: ActiveTradeRecord,
    pub incoming: ActiveTradeRecord,
    pub resolution: CollisionResolution,
}
