//! Sliding-window admission limiter for the execution worker.
//!
//! Distinct from the governor-based HTTP limiter in `crate::rate_limit`: this
//! one bounds how many orders reach the exchange per window.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    admissions: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        let max_per_window = max_per_window.max(1);
        Self {
            max_per_window,
            window,
            admissions: VecDeque::with_capacity(max_per_window),
        }
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(&oldest) = self.admissions.front() {
            if now.duration_since(oldest) >= self.window {
                self.admissions.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether one more admission fits in the current window
    pub fn check(&mut self) -> bool {
        self.evict_expired(Instant::now());
        self.admissions.len() < self.max_per_window
    }

    pub fn record(&mut self) {
        self.admissions.push_back(Instant::now());
    }

    /// Check and record in one step
    pub fn try_acquire(&mut self) -> bool {
        if self.check() {
            self.record();
            true
        } else {
            false
        }
    }

    /// Admissions still inside the window
    pub fn current_load(&mut self) -> usize {
        self.evict_expired(Instant::now());
        self.admissions.len()
    }

    /// How long until the oldest admission leaves the window
    pub fn time_until_available(&mut self) -> Duration {
        let now = Instant::now();
        self.evict_expired(now);
        if self.admissions.len() < self.max_per_window {
            return Duration::ZERO;
        }
        self.admissions
            .front()
            .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(Duration::ZERO)
    }

    pub fn max_per_window(&self) -> usize {
        self.max_per_window
    }
}
