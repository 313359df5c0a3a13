//! Per-account sliding-window rate limiting.
//!
//! Gates side-effecting actions (email delivery) that are cheap to request
//! but expensive to spam. The policy is record-on-allow: an admitted attempt
//! consumes quota immediately, even if the downstream work later fails.
//!
//! State is in-memory only; it is lost on restart and that is acceptable for
//! a best-effort abuse gate.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Rate limit configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum allowed attempts inside the window
    pub limit: usize,
    /// Trailing window duration
    pub window: Duration,
}

impl RateLimitConfig {
    /// Limit for outgoing report emails: 2 per 5 minutes per account.
    pub fn emails() -> Self {
        Self {
            limit: 2,
            window: Duration::from_secs(300),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::emails()
    }
}

/// Sliding-window rate limiter keyed by actor (account id).
///
/// Each key holds the timestamps of its recent admitted attempts. The
/// prune-count-append sequence runs under one write lock, so two concurrent
/// calls for the same key cannot both be admitted into a single remaining
/// slot.
pub struct SlidingWindow {
    windows: RwLock<HashMap<String, Vec<Instant>>>,
    config: RateLimitConfig,
}

impl SlidingWindow {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Try to admit an attempt for `key`. Admitted attempts are recorded
    /// immediately; denied attempts are not.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    /// How long until the oldest in-window attempt for `key` expires.
    /// `None` when the key is currently under its limit.
    pub fn retry_after(&self, key: &str) -> Option<Duration> {
        self.retry_after_at(key, Instant::now())
    }

    /// Drop keys with no attempts left inside the window. Called
    /// opportunistically so idle actors do not accumulate forever.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now())
    }

    /// Number of actor keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.windows.read().unwrap().len()
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut windows = self.windows.write().unwrap();
        let attempts = windows.entry(key.to_string()).or_default();

        attempts.retain(|t| now.duration_since(*t) < self.config.window);
        if attempts.len() >= self.config.limit {
            return false;
        }
        attempts.push(now);
        true
    }

    fn retry_after_at(&self, key: &str, now: Instant) -> Option<Duration> {
        let windows = self.windows.read().unwrap();
        let attempts = windows.get(key)?;

        let in_window: Vec<&Instant> = attempts
            .iter()
            .filter(|t| now.duration_since(**t) < self.config.window)
            .collect();
        if in_window.len() < self.config.limit {
            return None;
        }
        let oldest = in_window.first()?;
        Some(self.config.window - now.duration_since(**oldest))
    }

    fn sweep_at(&self, now: Instant) {
        let mut windows = self.windows.write().unwrap();
        windows.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < self.config.window);
            !attempts.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_window_admits_up_to_limit() {
        let limiter = SlidingWindow::new(RateLimitConfig {
            limit: 2,
            window: secs(300),
        });
        let t0 = Instant::now();

        assert!(limiter.allow_at("acct-1", t0));
        assert!(limiter.allow_at("acct-1", t0 + secs(1)));
        assert!(!limiter.allow_at("acct-1", t0 + secs(2)));
    }

    #[test]
    fn test_window_rolls_over() {
        let limiter = SlidingWindow::new(RateLimitConfig {
            limit: 2,
            window: secs(300),
        });
        let t0 = Instant::now();

        assert!(limiter.allow_at("acct-1", t0));
        assert!(limiter.allow_at("acct-1", t0 + secs(1)));
        assert!(!limiter.allow_at("acct-1", t0 + secs(2)));
        // Both earlier attempts are outside the window by t0+301
        assert!(limiter.allow_at("acct-1", t0 + secs(301)));
    }

    #[test]
    fn test_denied_attempts_are_not_recorded() {
        let limiter = SlidingWindow::new(RateLimitConfig {
            limit: 1,
            window: secs(300),
        });
        let t0 = Instant::now();

        assert!(limiter.allow_at("acct-1", t0));
        // Hammering while denied must not extend the lockout
        for i in 1..10 {
            assert!(!limiter.allow_at("acct-1", t0 + secs(i)));
        }
        assert!(limiter.allow_at("acct-1", t0 + secs(300)));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = SlidingWindow::new(RateLimitConfig {
            limit: 1,
            window: secs(300),
        });
        let t0 = Instant::now();

        assert!(limiter.allow_at("acct-1", t0));
        assert!(!limiter.allow_at("acct-1", t0));
        assert!(limiter.allow_at("acct-2", t0));
    }

    #[test]
    fn test_retry_after() {
        let limiter = SlidingWindow::new(RateLimitConfig {
            limit: 2,
            window: secs(300),
        });
        let t0 = Instant::now();

        assert_eq!(limiter.retry_after_at("acct-1", t0), None);
        limiter.allow_at("acct-1", t0);
        limiter.allow_at("acct-1", t0 + secs(10));

        // Oldest attempt (t0) expires at t0+300
        let wait = limiter.retry_after_at("acct-1", t0 + secs(100)).unwrap();
        assert_eq!(wait, secs(200));

        assert_eq!(limiter.retry_after_at("acct-1", t0 + secs(301)), None);
    }

    #[test]
    fn test_sweep_drops_idle_keys() {
        let limiter = SlidingWindow::new(RateLimitConfig {
            limit: 2,
            window: secs(300),
        });
        let t0 = Instant::now();

        limiter.allow_at("acct-1", t0);
        limiter.allow_at("acct-2", t0 + secs(299));
        assert_eq!(limiter.tracked_keys(), 2);

        limiter.sweep_at(t0 + secs(300));
        // acct-1's only attempt has expired; acct-2 is still in-window
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
