//! Duplicate and in-flight order detection

use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};

use crate::domain::entities::trade_request::TradeRequest;

/// Tolerances used when matching requests against each other
#[derive(Debug, Clone)]
pub struct DuplicateGuardConfig {
    /// How many of the newest history entries are scanned
    pub history_lookback: usize,
    /// History entries older than this never count as duplicates
    pub max_age: Duration,
    /// Relative quantity difference still treated as the same order
    pub quantity_tolerance: f64,
    /// Relative price difference still treated as the same LIMIT order
    pub price_tolerance: f64,
}

impl Default for DuplicateGuardConfig {
    fn default() -> Self {
        Self {
            history_lookback: 50,
            max_age: Duration::hours(1),
            quantity_tolerance: 0.05,
            price_tolerance: 0.01,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DuplicateGuard {
    config: DuplicateGuardConfig,
}

impl DuplicateGuard {
    pub fn new(config: DuplicateGuardConfig) -> Self {
        Self { config }
    }

    /// SHA-256 over the fields that make two orders functionally identical
    pub fn fingerprint(request: &TradeRequest) -> String {
        let price = request
            .price
            .map(|p| p.to_string())
            .unwrap_or_else(|| "MARKET".to_string());
        let identity = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            request.symbol,
            request.side,
            request.quantity,
            request.order_type,
            price,
            request.user_id.as_deref().unwrap_or("NONE"),
            request.strategy_id.as_deref().unwrap_or("NONE"),
        );
        hex::encode(Sha256::digest(identity.as_bytes()))
    }

    /// True when an identical request is active, or was seen recently.
    ///
    /// `history` is ordered oldest first; only the newest
    /// `history_lookback` entries younger than `max_age` are considered.
    pub fn is_duplicate<'a, A, H>(&self, request: &TradeRequest, active: A, history: H) -> bool
    where
        A: IntoIterator<Item = &'a TradeRequest>,
        H: DoubleEndedIterator<Item = &'a TradeRequest>,
    {
        let fingerprint = Self::fingerprint(request);

        let active_hit = active
            .into_iter()
            .filter(|other| other.id != request.id)
            .any(|other| Self::fingerprint(other) == fingerprint);
        if active_hit {
            return true;
        }

        let cutoff = Utc::now() - self.config.max_age;
        history
            .rev()
            .take(self.config.history_lookback)
            .filter(|other| other.id != request.id && other.created_at >= cutoff)
            .any(|other| Self::fingerprint(other) == fingerprint)
    }

    /// A PENDING/PROCESSING request that is effectively the same order
    pub fn find_in_progress<'a, A>(&self, request: &TradeRequest, active: A) -> Option<&'a TradeRequest>
    where
        A: IntoIterator<Item = &'a TradeRequest>,
    {
        active.into_iter().find(|other| {
            other.id != request.id
                && other.status().is_in_flight()
                && other.symbol == request.symbol
                && other.side == request.side
                && other.order_type == request.order_type
                && self.same_size(request, other)
        })
    }

    fn same_size(&self, request: &TradeRequest, other: &TradeRequest) -> bool {
        if !within(request.quantity, other.quantity, self.config.quantity_tolerance) {
            return false;
        }
        if !request.order_type.is_limit_family() {
            return true;
        }
        match (request.price, other.price) {
            (Some(a), Some(b)) => within(a, b, self.config.price_tolerance),
            _ => false,
        }
    }
}

/// `candidate` within `tolerance` (relative) of `reference`
fn within(candidate: f64, reference: f64, tolerance: f64) -> bool {
    if reference == 0.0 {
        return candidate == 0.0;
    }
    ((candidate - reference) / reference).abs() <= tolerance
}
