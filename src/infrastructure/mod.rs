pub mod paper_executor;
pub mod trade_log;
