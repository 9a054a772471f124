//! Fixed-window rate limiting for push-channel connect attempts.
//!
//! Bounds how often one identity may open a new channel, independently of
//! the registry's concurrent-connection caps. A window opens at an
//! identity's first attempt and lasts `window`; attempts beyond
//! `max_attempts` inside it are rejected as policy violations. A burst
//! straddling a window boundary can therefore admit up to twice the limit
//! in a short interval; the observable contract is reject-after-N-within-
//! the-window, reset-after-a-window-of-quiet.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::errors::RateLimitExceeded;

struct AttemptWindow {
    count: u32,
    window_start: Instant,
}

pub struct ConnectAdmissionLimiter {
    window: Duration,
    max_attempts: u32,
    windows: Mutex<HashMap<String, AttemptWindow>>,
}

impl ConnectAdmissionLimiter {
    pub fn new(window: Duration, max_attempts: u32) -> Self {
        Self {
            window,
            max_attempts,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record a connect attempt for `identity` and decide admission.
    pub fn check(&self, identity: &str) -> Result<(), RateLimitExceeded> {
        self.check_at(identity, Instant::now())
    }

    fn check_at(&self, identity: &str, now: Instant) -> Result<(), RateLimitExceeded> {
        let mut windows = self.windows.lock().expect("limiter lock poisoned");
        let entry = windows
            .entry(identity.to_string())
            .or_insert(AttemptWindow {
                count: 0,
                window_start: now,
            });

        if now.duration_since(entry.window_start) > self.window {
            entry.count = 1;
            entry.window_start = now;
            return Ok(());
        }

        entry.count += 1;
        if entry.count > self.max_attempts {
            // The window start is deliberately left alone: rejected
            // attempts must not extend the window.
            return Err(RateLimitExceeded {
                retry_after_secs: self.window.as_secs(),
            });
        }
        Ok(())
    }

    /// Drop windows whose last reset is older than the window length.
    /// Identities that stopped connecting would otherwise accumulate
    /// forever; the server runs this on a timer.
    pub fn evict_stale(&self) {
        self.evict_stale_at(Instant::now());
    }

    fn evict_stale_at(&self, now: Instant) {
        let mut windows = self.windows.lock().expect("limiter lock poisoned");
        let window = self.window;
        windows.retain(|_, w| now.duration_since(w.window_start) <= window);
    }

    pub fn tracked_identities(&self) -> usize {
        self.windows.lock().expect("limiter lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    fn limiter() -> ConnectAdmissionLimiter {
        ConnectAdmissionLimiter::new(WINDOW, 5)
    }

    #[test]
    fn test_attempts_within_limit_allowed() {
        let limiter = limiter();
        let start = Instant::now();
        for _ in 0..5 {
            assert!(limiter.check_at("1", start).is_ok());
        }
    }

    #[test]
    fn test_sixth_attempt_rejected() {
        let limiter = limiter();
        let start = Instant::now();
        for _ in 0..5 {
            limiter.check_at("1", start).unwrap();
        }
        let err = limiter.check_at("1", start).unwrap_err();
        assert_eq!(err, RateLimitExceeded { retry_after_secs: 60 });
    }

    #[test]
    fn test_window_expiry_resets_counter() {
        let limiter = limiter();
        let start = Instant::now();
        for _ in 0..6 {
            let _ = limiter.check_at("1", start);
        }
        assert!(limiter.check_at("1", start).is_err());

        let later = start + WINDOW + Duration::from_secs(1);
        assert!(limiter.check_at("1", later).is_ok());
        // The reset counter is 1, so four more attempts still fit
        for _ in 0..4 {
            assert!(limiter.check_at("1", later).is_ok());
        }
        assert!(limiter.check_at("1", later).is_err());
    }

    #[test]
    fn test_rejection_does_not_extend_window() {
        let limiter = limiter();
        let start = Instant::now();
        for _ in 0..5 {
            limiter.check_at("1", start).unwrap();
        }
        // Hammering while rejected keeps failing...
        let mid = start + Duration::from_secs(30);
        assert!(limiter.check_at("1", mid).is_err());
        // ...but the window still expires relative to its start
        let later = start + WINDOW + Duration::from_secs(1);
        assert!(limiter.check_at("1", later).is_ok());
    }

    #[test]
    fn test_identities_are_independent() {
        let limiter = limiter();
        let start = Instant::now();
        for _ in 0..6 {
            let _ = limiter.check_at("1", start);
        }
        assert!(limiter.check_at("1", start).is_err());
        assert!(limiter.check_at("2", start).is_ok());
    }

    #[test]
    fn test_evict_stale_drops_idle_windows() {
        let limiter = limiter();
        let start = Instant::now();
        limiter.check_at("1", start).unwrap();
        limiter.check_at("2", start).unwrap();
        assert_eq!(limiter.tracked_identities(), 2);

        let later = start + WINDOW + Duration::from_secs(1);
        limiter.check_at("2", later).unwrap();
        limiter.evict_stale_at(later);
        // "1" has been idle past the window; "2" just reset its window
        assert_eq!(limiter.tracked_identities(), 1);
        assert!(limiter.check_at("1", later).is_ok());
    }
}
