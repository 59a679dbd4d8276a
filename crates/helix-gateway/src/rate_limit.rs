//! Per-principal reconnect rate limiting (`spec.md` §4.4: 16/s "to curb
//! abusive reconnection"). No crate in the retrieval corpus covers this
//! (`governor` does not appear anywhere in the pack), so it is a small
//! hand-rolled sliding-window counter keyed by principal in a `DashMap`,
//! consistent with the corpus's existing concurrent-map idiom for hot
//! per-key state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Window {
    started_at: Instant,
    count: u32,
}

/// Fixed-window limiter: each principal gets `limit_per_sec` admissions per
/// rolling one-second window.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<DashMap<String, Window>>,
    limit_per_sec: u32,
}

impl RateLimiter {
    #[must_use]
    pub fn new(limit_per_sec: u32) -> Self {
        Self { windows: Arc::new(DashMap::new()), limit_per_sec }
    }

    /// Returns `true` if `principal` may proceed, incrementing its window
    /// counter as a side effect.
    pub fn check(&self, principal: &str) -> bool {
        let now = Instant::now();
        let mut entry = self.windows.entry(principal.to_string()).or_insert_with(|| Window {
            started_at: now,
            count: 0,
        });

        if now.duration_since(entry.started_at) >= Duration::from_secs(1) {
            entry.started_at = now;
            entry.count = 0;
        }

        if entry.count >= self.limit_per_sec {
            return false;
        }
        entry.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_limit_then_refuses() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.check("agent-1"));
        assert!(limiter.check("agent-1"));
        assert!(!limiter.check("agent-1"));
    }

    #[test]
    fn principals_are_tracked_independently() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check("agent-1"));
        assert!(limiter.check("agent-2"));
    }
}
