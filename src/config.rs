use std::str::FromStr;
use std::time::Duration;

/// Execution queue settings
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_requests_per_window: usize, // Orders admitted per rate window
    pub rate_window: Duration,
    pub max_retries: u32, // Retries after an exchange-reported rate limit
    pub history_capacity: usize,
    pub poll_interval: Duration,        // Worker pop timeout
    pub stop_timeout: Duration,         // Join timeout on shutdown
    pub rate_limited_backoff: Duration, // Sleep after an internal limiter denial
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_requests_per_window: 10,
            rate_window: Duration::from_millis(1000),
            max_retries: 3,
            history_capacity: 1000,
            poll_interval: Duration::from_millis(100),
            stop_timeout: Duration::from_millis(5000),
            rate_limited_backoff: Duration::from_millis(100),
        }
    }
}

impl QueueConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> QueueConfig {
        let defaults = QueueConfig::default();
        QueueConfig {
            max_requests_per_window: env_positive(
                "QUEUE_MAX_REQUESTS_PER_WINDOW",
                defaults.max_requests_per_window,
            ),
            rate_window: env_millis("QUEUE_RATE_WINDOW_MS", defaults.rate_window),
            max_retries: env_or("QUEUE_MAX_RETRIES", defaults.max_retries),
            history_capacity: env_positive("QUEUE_HISTORY_CAPACITY", defaults.history_capacity),
            poll_interval: env_millis("QUEUE_POLL_INTERVAL_MS", defaults.poll_interval),
            stop_timeout: env_millis("QUEUE_STOP_TIMEOUT_MS", defaults.stop_timeout),
            rate_limited_backoff: env_millis(
                "QUEUE_RATE_LIMITED_BACKOFF_MS",
                defaults.rate_limited_backoff,
            ),
        }
    }
}

/// Bot synchronizer settings
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub conflict_window: Duration, // Ledger freshness for conflict checks
    pub ledger_retention: Duration,
    pub collision_history_capacity: usize,
    pub lock_timeout: Duration, // Default wait for a symbol lock
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conflict_window: Duration::from_secs(300),
            ledger_retention: Duration::from_secs(3600),
            collision_history_capacity: 100,
            lock_timeout: Duration::from_millis(5000),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> SyncConfig {
        let defaults = SyncConfig::default();
        let config = SyncConfig {
            conflict_window: env_secs("SYNC_CONFLICT_WINDOW_SECS", defaults.conflict_window),
            ledger_retention: env_secs("SYNC_LEDGER_RETENTION_SECS", defaults.ledger_retention),
            collision_history_capacity: env_positive(
                "SYNC_COLLISION_HISTORY_CAPACITY",
                defaults.collision_history_capacity,
            ),
            lock_timeout: env_millis("SYNC_LOCK_TIMEOUT_MS", defaults.lock_timeout),
        };

        if config.ledger_retention < config.conflict_window {
            tracing::warn!(
                "SYNC_LEDGER_RETENTION_SECS ({:?}) is shorter than the conflict window ({:?}), using the window",
                config.ledger_retention,
                config.conflict_window
            );
            return SyncConfig {
                ledger_retention: config.conflict_window,
                ..config
            };
        }

        config
    }
}

/// HTTP introspection server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub requests_per_minute: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            requests_per_minute: 100,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            port: env_or("SERVER_PORT", defaults.port),
            requests_per_minute: env_positive("API_REQUESTS_PER_MINUTE", defaults.requests_per_minute),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    "Failed to parse {} '{}': {}, using default: {:?}",
                    key,
                    raw,
                    e,
                    default
                );
                default
            }
        },
        Err(_) => default,
    }
}

fn env_positive<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug + PartialOrd + Default + Copy,
    T::Err: std::fmt::Display,
{
    let value = env_or(key, default);
    if value <= T::default() {
        tracing::warn!(
            "Invalid {} value: {:?} (must be positive), using default: {:?}",
            key,
            value,
            default
        );
        return default;
    }
    value
}

fn env_millis(key: &str, default: Duration) -> Duration {
    let millis = env_or(key, default.as_millis() as u64);
    if millis == 0 {
        tracing::warn!("Invalid {} value: 0 (must be positive), using default: {:?}", key, default);
        return default;
    }
    Duration::from_millis(millis)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    let secs = env_or(key, default.as_secs());
    if secs == 0 {
        tracing::warn!("Invalid {} value: 0 (must be positive), using default: {:?}", key, default);
        return default;
    }
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_requests_per_window, 10);
        assert_eq!(config.rate_window, Duration::from_secs(1));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.history_capacity, 1000);
    }

    #[test]
    fn test_sync_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.conflict_window, Duration::from_secs(300));
        assert_eq!(config.ledger_retention, Duration::from_secs(3600));
        assert_eq!(config.collision_history_capacity, 100);
    }

    #[test]
    fn test_env_parsing_falls_back_on_garbage() {
        std::env::set_var("TRADESYNC_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_or("TRADESYNC_TEST_GARBAGE", 7u32), 7);
        std::env::remove_var("TRADESYNC_TEST_GARBAGE");
    }

    #[test]
    fn test_env_positive_rejects_zero() {
        std::env::set_var("TRADESYNC_TEST_ZERO", "0");
        assert_eq!(env_positive("TRADESYNC_TEST_ZERO", 5usize), 5);
        assert_eq!(env_millis("TRADESYNC_TEST_ZERO", Duration::from_millis(9)), Duration::from_millis(9));
        std::env::remove_var("TRADESYNC_TEST_ZERO");
    }

    #[test]
    fn test_env_values_applied() {
        std::env::set_var("TRADESYNC_TEST_VALUE", "250");
        assert_eq!(
            env_millis("TRADESYNC_TEST_VALUE", Duration::from_millis(1)),
            Duration::from_millis(250)
        );
        std::env::remove_var("TRADESYNC_TEST_VALUE");
    }
}
