//! Per-client request rate limiting

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

/// Sliding-window limiter keyed by client id (or api-key hash for
/// not-yet-provisioned callers). Expired timestamps are pruned on every
/// check.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<DashMap<String, VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            max_requests,
            window,
        }
    }

    /// Allow and record, or reject. Rejected requests are not recorded.
    pub fn check_and_record(&self, key: &str) -> bool {
        let now = Instant::now();
        let cutoff = now - self.window;

        let mut entry = self.windows.entry(key.to_string()).or_default();
        let window = entry.value_mut();

        while window.front().is_some_and(|&t| t < cutoff) {
            window.pop_front();
        }

        if window.len() >= self.max_requests {
            warn!(
                "Rate limit exceeded for '{}': {} requests in {:?}",
                key,
                window.len(),
                self.window,
            );
            return false;
        }

        window.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_within_limit() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        for _ in 0..5 {
            assert!(limiter.check_and_record("client-1"));
        }
        assert!(!limiter.check_and_record("client-1"));
    }

    #[test]
    fn test_independent_per_client() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check_and_record("a"));
        assert!(limiter.check_and_record("a"));
        assert!(!limiter.check_and_record("a"));

        assert!(limiter.check_and_record("b"));
        assert!(limiter.check_and_record("b"));
        assert!(!limiter.check_and_record("b"));
    }

    #[test]
    fn test_window_expiry() {
        let limiter = RateLimiter::new(1, Duration::from_millis(40));
        assert!(limiter.check_and_record("a"));
        assert!(!limiter.check_and_record("a"));

        std::thread::sleep(Duration::from_millis(50));
        assert!(limiter.check_and_record("a"));
    }
}
