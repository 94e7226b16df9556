//! Rate limiter - per-credential minute and hour windows
//!
//! Counters are process-local and lost on restart. Each window is fixed: it
//! opens on first use and, once expired, reopens from the next request's
//! instant rather than catching up.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    ends_at: Instant,
}

impl Window {
    fn open(now: Instant, length: Duration) -> Self {
        Self {
            count: 0,
            ends_at: now + length,
        }
    }

    fn refresh(&mut self, now: Instant, length: Duration) {
        if now >= self.ends_at {
            *self = Self::open(now, length);
        }
    }

    fn is_full(&self, limit: u32) -> bool {
        limit > 0 && self.count >= limit
    }

    fn remaining(&self, limit: u32, now: Instant) -> Option<u32> {
        if limit == 0 {
            return None;
        }
        if now >= self.ends_at {
            return Some(limit);
        }
        Some(limit.saturating_sub(self.count))
    }
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    minute: Window,
    hour: Window,
}

impl Counter {
    fn new(now: Instant) -> Self {
        Self {
            minute: Window::open(now, MINUTE),
            hour: Window::open(now, HOUR),
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now >= self.minute.ends_at && now >= self.hour.ends_at
    }
}

/// Quota left in each window; `None` means the window is unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemainingQuota {
    pub per_minute: Option<u32>,
    pub per_hour: Option<u32>,
}

/// Rate limiter keyed by credential id
#[derive(Debug, Default)]
pub struct RateLimiter {
    counters: Mutex<HashMap<String, Counter>>,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one request for `key` unless a non-zero limit is already met.
    ///
    /// A limit of zero disables that window. Rejected requests are not counted.
    pub fn allow(&self, key: &str, per_minute: u32, per_hour: u32) -> bool {
        self.allow_at(key, per_minute, per_hour, Instant::now())
    }

    fn allow_at(&self, key: &str, per_minute: u32, per_hour: u32, now: Instant) -> bool {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let counter = counters
            .entry(key.to_string())
            .or_insert_with(|| Counter::new(now));

        counter.minute.refresh(now, MINUTE);
        counter.hour.refresh(now, HOUR);

        if counter.minute.is_full(per_minute) || counter.hour.is_full(per_hour) {
            debug!(key = %key, "Rate limit reached");
            return false;
        }

        counter.minute.count += 1;
        counter.hour.count += 1;
        true
    }

    /// Quota left for `key` without consuming any
    pub fn remaining(&self, key: &str, per_minute: u32, per_hour: u32) -> RemainingQuota {
        let now = Instant::now();
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let counter = counters
            .get(key)
            .copied()
            .unwrap_or_else(|| Counter::new(now));

        RemainingQuota {
            per_minute: counter.minute.remaining(per_minute, now),
            per_hour: counter.hour.remaining(per_hour, now),
        }
    }

    /// Drop counters whose windows have both expired; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let before = counters.len();
        counters.retain(|_, counter| !counter.expired(now));
        before - counters.len()
    }

    /// Number of live counters
    pub fn len(&self) -> usize {
        self.counters.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep on a fixed interval until `cancel` fires
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = limiter.sweep();
                        if removed > 0 {
                            debug!("Swept {} expired rate limit counters", removed);
                        }
                    }
                }
            }
        })
    }
}
