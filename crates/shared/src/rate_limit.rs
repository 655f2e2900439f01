//! In-memory sliding-window rate limiter
//!
//! Each key keeps the timestamps of its recent admitted attempts. Before every
//! check the list is pruned to the lookback window, so the counted interval
//! moves continuously with the clock and no burst can straddle a fixed
//! boundary.
//!
//! Check-and-record on a given key is serialized by that key's own mutex:
//! two concurrent callers can never both observe `count < max` for the last
//! free slot. Different keys never contend beyond the brief map lookup.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

type Window = Arc<Mutex<VecDeque<Instant>>>;

/// Request rejected because the key's window is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Too many requests, retry after {retry_after_secs}s")]
pub struct RateLimited {
    /// Whole seconds until the oldest attempt leaves the window
    pub retry_after_secs: u64,
}

/// Sliding-window limiter keyed by arbitrary strings such as
/// `"login:alice:203.0.113.7"`.
///
/// Cloning is cheap and clones share state.
#[derive(Clone, Default)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, Window>>>,
}

impl RateLimiter {
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    /// Admit or reject one attempt for `key` at the current instant.
    pub fn check(
        &self,
        key: &str,
        max_requests: usize,
        window_seconds: u64,
    ) -> Result<(), RateLimited> {
        self.check_at(key, max_requests, window_seconds, Instant::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock reading.
    pub fn check_at(
        &self,
        key: &str,
        max_requests: usize,
        window_seconds: u64,
        now: Instant,
    ) -> Result<(), RateLimited> {
        let window = Duration::from_secs(window_seconds);
        let entry = self.window_for(key);
        let mut attempts = entry.lock().unwrap_or_else(PoisonError::into_inner);

        while let Some(oldest) = attempts.front() {
            if now.saturating_duration_since(*oldest) >= window {
                attempts.pop_front();
            } else {
                break;
            }
        }
        while attempts.len() > max_requests {
            attempts.pop_front();
        }

        if attempts.len() >= max_requests {
            let retry_after_secs = match attempts.front() {
                Some(oldest) => {
                    let remaining = window.saturating_sub(now.saturating_duration_since(*oldest));
                    remaining.as_secs() + 1
                }
                None => window_seconds.max(1),
            };
            tracing::debug!(key = %key, retry_after_secs, "Rate limit exceeded");
            return Err(RateLimited { retry_after_secs });
        }

        attempts.push_back(now);
        Ok(())
    }

    /// Drop keys whose attempts are all older than `horizon_seconds`.
    ///
    /// Keys currently held by an in-flight check are left alone so that the
    /// check never records into a window that has been detached from the map.
    pub fn prune_idle(&self, horizon_seconds: u64) -> usize {
        self.prune_idle_at(horizon_seconds, Instant::now())
    }

    pub fn prune_idle_at(&self, horizon_seconds: u64, now: Instant) -> usize {
        let horizon = Duration::from_secs(horizon_seconds);
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = windows.len();

        windows.retain(|_, entry| {
            if Arc::strong_count(entry) > 1 {
                return true;
            }
            let attempts = entry.lock().unwrap_or_else(PoisonError::into_inner);
            attempts
                .back()
                .is_some_and(|newest| now.saturating_duration_since(*newest) < horizon)
        });

        before - windows.len()
    }

    /// Number of keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn window_for(&self, key: &str) -> Window {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_admits_up_to_max_then_rejects() {
        let limiter = RateLimiter::new_in_memory();
        let start = Instant::now();

        for i in 0..3 {
            let now = start + Duration::from_secs(i);
            assert!(limiter.check_at("login:alice", 3, 60, now).is_ok());
        }

        let err = limiter
            .check_at("login:alice", 3, 60, start + Duration::from_secs(10))
            .unwrap_err();
        assert!(err.retry_after_secs >= 1);
        // Oldest attempt at t=0 leaves the window at t=60; at t=10 that is 50s away
        assert_eq!(err.retry_after_secs, 51);
    }

    #[test]
    fn test_window_slides_past_oldest_attempt() {
        let limiter = RateLimiter::new_in_memory();
        let start = Instant::now();

        for _ in 0..3 {
            limiter.check_at("pin:7", 3, 60, start).unwrap();
        }
        assert!(limiter
            .check_at("pin:7", 3, 60, start + Duration::from_secs(30))
            .is_err());

        let later = start + Duration::from_secs(61);
        assert!(limiter.check_at("pin:7", 3, 60, later).is_ok());
    }

    #[test]
    fn test_rejected_attempts_are_not_recorded() {
        let limiter = RateLimiter::new_in_memory();
        let start = Instant::now();

        limiter.check_at("k", 1, 10, start).unwrap();
        for s in 1..9 {
            assert!(limiter
                .check_at("k", 1, 10, start + Duration::from_secs(s))
                .is_err());
        }
        // Only the first admission counts, so the key frees up at t=10
        assert!(limiter
            .check_at("k", 1, 10, start + Duration::from_secs(10))
            .is_ok());
    }

    #[test]
    fn test_no_boundary_doubling() {
        let limiter = RateLimiter::new_in_memory();
        let start = Instant::now();

        // Three attempts just before what a fixed window would treat as a boundary
        for _ in 0..3 {
            limiter
                .check_at("register:ip", 3, 60, start + Duration::from_secs(59))
                .unwrap();
        }
        // Just after the "boundary" the sliding window still counts them
        assert!(limiter
            .check_at("register:ip", 3, 60, start + Duration::from_secs(61))
            .is_err());
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new_in_memory();
        let now = Instant::now();

        limiter.check_at("login:alice", 1, 60, now).unwrap();
        assert!(limiter.check_at("login:alice", 1, 60, now).is_err());
        assert!(limiter.check_at("login:bob", 1, 60, now).is_ok());
    }

    #[test]
    fn test_zero_max_always_rejects() {
        let limiter = RateLimiter::new_in_memory();
        let err = limiter.check("disabled", 0, 30).unwrap_err();
        assert_eq!(err.retry_after_secs, 30);
    }

    #[test]
    fn test_concurrent_checks_never_over_admit() {
        let limiter = RateLimiter::new_in_memory();
        let admitted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = limiter.clone();
                let admitted = admitted.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        if limiter.check("pin:shared", 5, 60).is_ok() {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_prune_idle_drops_only_stale_keys() {
        let limiter = RateLimiter::new_in_memory();
        let start = Instant::now();

        limiter.check_at("old", 5, 60, start).unwrap();
        limiter
            .check_at("fresh", 5, 60, start + Duration::from_secs(100))
            .unwrap();
        assert_eq!(limiter.tracked_keys(), 2);

        let removed = limiter.prune_idle_at(60, start + Duration::from_secs(120));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
