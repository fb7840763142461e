//! Nonce-based replay protection with timestamp skew bounds.

use std::collections::HashMap;
use std::sync::Mutex;

use wopr_core::now_ms;

/// Bounds for the replay window.
#[derive(Clone, Copy, Debug)]
pub struct ReplayConfig {
    /// Oldest acceptable frame age.
    pub max_age_ms: i64,
    /// Tolerated clock skew into the future.
    pub max_skew_ms: i64,
    /// Entry count above which stale nonces are swept.
    pub cleanup_threshold: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 5 * 60 * 1000,
            max_skew_ms: 30 * 1000,
            cleanup_threshold: 10_000,
        }
    }
}

/// Records seen nonces and refuses duplicates or out-of-window timestamps.
pub struct ReplayProtector {
    config: ReplayConfig,
    seen: Mutex<HashMap<String, i64>>,
}

impl ReplayProtector {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            config,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Accept a frame's `(nonce, ts)` pair at most once, within the window.
    pub fn check(&self, nonce: &str, ts: i64) -> bool {
        self.check_at(nonce, ts, now_ms())
    }

    pub fn check_at(&self, nonce: &str, ts: i64, now: i64) -> bool {
        if ts < now - self.config.max_age_ms {
            return false;
        }
        if ts > now + self.config.max_skew_ms {
            return false;
        }

        let mut seen = self.lock();
        if seen.len() > self.config.cleanup_threshold {
            let horizon = now - self.config.max_age_ms;
            seen.retain(|_, recorded| *recorded >= horizon);
        }

        if seen.contains_key(nonce) {
            return false;
        }
        seen.insert(nonce.to_string(), ts);
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, i64>> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ReplayProtector {
    fn default() -> Self {
        Self::new(ReplayConfig::default())
    }
}
