//! Trade execution core
//!
//! A rate-limited, single-consumer execution queue for bot-generated orders,
//! and a bot synchronizer that hands out per-symbol locks and vetoes
//! opposite-direction trades from different bots.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod rate_limit;
