//! Named trading locks
//!
//! One reentrant lock per (kind, resource). Locks are created lazily on first
//! use and live for the rest of the process. Reentrancy is keyed by an explicit
//! holder id (a bot id, or the queue worker) rather than by thread, since the
//! holders here are async tasks that may hop between threads.
//!
//! Acquisition waits up to a caller-supplied timeout and reports `false` on
//! expiry. Callers treat that as a normal, retryable outcome.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LockKind {
    Symbol,
    Bot,
    Global,
}

impl std::fmt::Display for LockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockKind::Symbol => write!(f, "symbol"),
            LockKind::Bot => write!(f, "bot"),
            LockKind::Global => write!(f, "global"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LockKey {
    kind: LockKind,
    resource: String,
}

impl LockKey {
    fn new(kind: LockKind, resource: Option<&str>) -> Self {
        let resource = match kind {
            LockKind::Global => "global".to_string(),
            LockKind::Symbol => resource.unwrap_or_default().trim().to_uppercase(),
            LockKind::Bot => resource.unwrap_or_default().trim().to_string(),
        };
        Self { kind, resource }
    }

    fn name(&self) -> String {
        format!("{}:{}", self.kind, self.resource)
    }
}

#[derive(Debug, Default)]
struct LockState {
    holder: Option<String>,
    depth: u32,
    acquired_at: Option<Instant>,
    total_acquisitions: u64,
    contention_count: u64,
    timeouts: u64,
    max_hold_ms: u64,
}

/// Point-in-time view of one lock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub kind: LockKind,
    pub resource: String,
    pub holder: Option<String>,
    pub depth: u32,
    pub total_acquisitions: u64,
    pub contention_count: u64,
    pub timeouts: u64,
    pub max_hold_ms: u64,
}

/// Reentrant lock owned by a named holder
#[derive(Debug)]
pub struct TradingLock {
    name: String,
    state: Mutex<LockState>,
    released: Notify,
}

impl TradingLock {
    fn new(name: String) -> Self {
        Self {
            name,
            state: Mutex::new(LockState::default()),
            released: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the lock if it is free or already ours
    pub async fn try_acquire(&self, holder: &str) -> bool {
        let mut state = self.state.lock().await;
        let current = state.holder.clone();
        match current.as_deref() {
            None => {
                state.holder = Some(holder.to_string());
                state.depth = 1;
                state.acquired_at = Some(Instant::now());
                state.total_acquisitions += 1;
                true
            }
            Some(current) if current == holder => {
                state.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Wait up to `timeout` for the lock
    pub async fn acquire(&self, holder: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut contended = false;

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register interest before checking so a release in between is not lost
            notified.as_mut().enable();

            if self.try_acquire(holder).await {
                return true;
            }

            if !contended {
                contended = true;
                self.state.lock().await.contention_count += 1;
                debug!("{} waiting for lock {}", holder, self.name);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                if self.try_acquire(holder).await {
                    return true;
                }
                self.state.lock().await.timeouts += 1;
                debug!("{} timed out waiting for lock {}", holder, self.name);
                return false;
            }
        }
    }

    /// Drop one level of ownership. Releasing a lock we do not hold is
    /// reported as `false`, never as an error.
    pub async fn release(&self, holder: &str) -> bool {
        let mut state = self.state.lock().await;
        let current = state.holder.clone();
        match current.as_deref() {
            Some(current) if current == holder => {
                state.depth = state.depth.saturating_sub(1);
                if state.depth == 0 {
                    if let Some(acquired_at) = state.acquired_at.take() {
                        let held_ms = acquired_at.elapsed().as_millis() as u64;
                        state.max_hold_ms = state.max_hold_ms.max(held_ms);
                    }
                    state.holder = None;
                    drop(state);
                    self.released.notify_waiters();
                }
                true
            }
            Some(current) => {
                warn!(
                    "{} tried to release lock {} held by {}",
                    holder, self.name, current
                );
                false
            }
            None => {
                debug!("{} released lock {} which was not held", holder, self.name);
                false
            }
        }
    }

    pub async fn holder(&self) -> Option<String> {
        self.state.lock().await.holder.clone()
    }

    pub async fn is_locked(&self) -> bool {
        self.state.lock().await.holder.is_some()
    }
}

/// Lazily populated map of trading locks
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: RwLock<HashMap<LockKey, Arc<TradingLock>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a lock, creating it on first use. `Global` ignores `resource`.
    pub async fn get_lock(&self, kind: LockKind, resource: Option<&str>) -> Arc<TradingLock> {
        let key = LockKey::new(kind, resource);

        if let Some(lock) = self.locks.read().await.get(&key) {
            return lock.clone();
        }

        let mut locks = self.locks.write().await;
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(TradingLock::new(key.name())))
            .clone()
    }

    pub async fn acquire(
        &self,
        kind: LockKind,
        resource: Option<&str>,
        holder: &str,
        timeout: Duration,
    ) -> bool {
        self.get_lock(kind, resource).await.acquire(holder, timeout).await
    }

    /// Release without creating a lock that was never used
    pub async fn release(&self, kind: LockKind, resource: Option<&str>, holder: &str) -> bool {
        let key = LockKey::new(kind, resource);
        let lock = self.locks.read().await.get(&key).cloned();
        match lock {
            Some(lock) => lock.release(holder).await,
            None => {
                debug!("release of unknown lock {}", key.name());
                false
            }
        }
    }

    pub async fn holder_of(&self, kind: LockKind, resource: Option<&str>) -> Option<String> {
        let key = LockKey::new(kind, resource);
        let lock = self.locks.read().await.get(&key).cloned();
        match lock {
            Some(lock) => lock.holder().await,
            None => None,
        }
    }

    pub async fn snapshots(&self) -> Vec<LockSnapshot> {
        let locks: Vec<(LockKey, Arc<TradingLock>)> = self
            .locks
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut result = Vec::with_capacity(locks.len());
        for (key, lock) in locks {
            let state = lock.state.lock().await;
            result.push(LockSnapshot {
                kind: key.kind,
                resource: key.resource.clone(),
                holder: state.holder.clone(),
                depth: state.depth,
                total_acquisitions: state.total_acquisitions,
                contention_count: state.contention_count,
                timeouts: state.timeouts,
                max_hold_ms: state.max_hold_ms,
            });
        }
        result.sort_by(|a, b| a.resource.cmp(&b.resource));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_lock_created_lazily_and_shared() {
        let registry = LockRegistry::new();
        assert_eq!(registry.snapshots().await.len(), 0);

        let a = registry.get_lock(LockKind::Symbol, Some("btcusdt")).await;
        let b = registry.get_lock(LockKind::Symbol, Some("BTCUSDT")).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.snapshots().await.len(), 1);
        assert_eq!(a.name(), "symbol:BTCUSDT");
    }

    #[tokio::test]
    async fn test_global_ignores_resource() {
        let registry = LockRegistry::new();
        let a = registry.get_lock(LockKind::Global, Some("x")).await;
        let b = registry.get_lock(LockKind::Global, None).await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_reentrant_for_same_holder() {
        let registry = LockRegistry::new();
        assert!(registry.acquire(LockKind::Bot, Some("b1"), "alice", SHORT).await);
        assert!(registry.acquire(LockKind::Bot, Some("b1"), "alice", SHORT).await);

        assert!(registry.release(LockKind::Bot, Some("b1"), "alice").await);
        assert_eq!(
            registry.holder_of(LockKind::Bot, Some("b1")).await.as_deref(),
            Some("alice")
        );
        assert!(registry.release(LockKind::Bot, Some("b1"), "alice").await);
        assert_eq!(registry.holder_of(LockKind::Bot, Some("b1")).await, None);
    }

    #[tokio::test]
    async fn test_other_holder_times_out() {
        let registry = LockRegistry::new();
        assert!(registry.acquire(LockKind::Symbol, Some("ETHUSDT"), "alice", SHORT).await);
        assert!(!registry.acquire(LockKind::Symbol, Some("ETHUSDT"), "bob", SHORT).await);

        let snapshots = registry.snapshots().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].timeouts, 1);
        assert_eq!(snapshots[0].contention_count, 1);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let registry = Arc::new(LockRegistry::new());
        assert!(registry.acquire(LockKind::Symbol, Some("SOLUSDT"), "alice", SHORT).await);

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .acquire(LockKind::Symbol, Some("SOLUSDT"), "bob", Duration::from_secs(2))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.release(LockKind::Symbol, Some("SOLUSDT"), "alice").await);
        assert!(waiter.await.unwrap());
        assert_eq!(
            registry.holder_of(LockKind::Symbol, Some("SOLUSDT")).await.as_deref(),
            Some("bob")
        );
    }

    #[tokio::test]
    async fn test_release_not_held_is_harmless() {
        let registry = LockRegistry::new();
        assert!(!registry.release(LockKind::Symbol, Some("ADAUSDT"), "alice").await);
        assert_eq!(registry.snapshots().await.len(), 0);

        assert!(registry.acquire(LockKind::Symbol, Some("ADAUSDT"), "alice", SHORT).await);
        assert!(!registry.release(LockKind::Symbol, Some("ADAUSDT"), "bob").await);
        assert!(registry.release(LockKind::Symbol, Some("ADAUSDT"), "alice").await);
        assert!(!registry.release(LockKind::Symbol, Some("ADAUSDT"), "alice").await);
    }
}
