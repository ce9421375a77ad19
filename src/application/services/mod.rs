pub mod queue_bridge;
pub mod trade_queue;
