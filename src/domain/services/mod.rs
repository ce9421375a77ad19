pub mod bot_registry;
pub mod bot_synchronizer;
pub mod collision_detector;
pub mod duplicate_guard;
pub mod lock_registry;
pub mod rate_limiter;
