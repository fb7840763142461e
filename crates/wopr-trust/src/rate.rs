//! Per-peer sliding-window rate limiting with post-block cooldown.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use wopr_core::{now_ms, PublicKey};

/// Request classes with independent budgets per peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateClass {
    Connections,
    Claims,
    Injects,
    InvalidMessages,
}

/// Budget for one class: `max_requests` per `window_ms`, then blocked for
/// `block_ms`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LimitRule {
    pub window_ms: i64,
    pub max_requests: usize,
    pub block_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub connections: LimitRule,
    pub claims: LimitRule,
    pub injects: LimitRule,
    pub invalid_messages: LimitRule,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            connections: LimitRule {
                window_ms: 60_000,
                max_requests: 10,
                block_ms: 300_000,
            },
            claims: LimitRule {
                window_ms: 60_000,
                max_requests: 5,
                block_ms: 300_000,
            },
            injects: LimitRule {
                window_ms: 1_000,
                max_requests: 10,
                block_ms: 60_000,
            },
            invalid_messages: LimitRule {
                window_ms: 60_000,
                max_requests: 3,
                block_ms: 600_000,
            },
        }
    }
}

impl RateLimitConfig {
    fn rule(&self, class: RateClass) -> LimitRule {
        match class {
            RateClass::Connections => self.connections,
            RateClass::Claims => self.claims,
            RateClass::Injects => self.injects,
            RateClass::InvalidMessages => self.invalid_messages,
        }
    }
}

#[derive(Default)]
struct Window {
    timestamps: Vec<i64>,
    blocked_until: Option<i64>,
}

/// Keyed sliding-window limiter shared by all connections of a process.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<(PublicKey, RateClass), Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or refuse a request.
    ///
    /// While blocked, refusals do not touch the counters and do not extend
    /// the block. Otherwise stale timestamps are dropped; a full window
    /// starts the block and refuses, and an admitted request is counted.
    pub fn check(&self, peer: &PublicKey, class: RateClass) -> bool {
        self.check_at(peer, class, now_ms())
    }

    pub fn check_at(&self, peer: &PublicKey, class: RateClass, now: i64) -> bool {
        let rule = self.config.rule(class);
        let mut windows = self.lock();
        let window = windows.entry((*peer, class)).or_default();

        if window.is_blocked(now) {
            return false;
        }
        window.prune(now, rule.window_ms);

        if window.timestamps.len() >= rule.max_requests {
            window.blocked_until = Some(now + rule.block_ms);
            return false;
        }
        window.timestamps.push(now);
        true
    }

    /// Count an offense against the class, starting the block as soon as the
    /// window fills. Used for `invalid_messages`, which has no admission
    /// decision to make.
    pub fn charge(&self, peer: &PublicKey, class: RateClass) {
        self.charge_at(peer, class, now_ms());
    }

    pub fn charge_at(&self, peer: &PublicKey, class: RateClass, now: i64) {
        let rule = self.config.rule(class);
        let mut windows = self.lock();
        let window = windows.entry((*peer, class)).or_default();

        if window.is_blocked(now) {
            return;
        }
        window.prune(now, rule.window_ms);
        window.timestamps.push(now);

        if window.timestamps.len() >= rule.max_requests {
            window.blocked_until = Some(now + rule.block_ms);
        }
    }

    /// Non-mutating block probe.
    pub fn is_blocked(&self, peer: &PublicKey, class: RateClass) -> bool {
        self.is_blocked_at(peer, class, now_ms())
    }

    pub fn is_blocked_at(&self, peer: &PublicKey, class: RateClass, now: i64) -> bool {
        let windows = self.lock();
        windows
            .get(&(*peer, class))
            .map(|w| matches!(w.blocked_until, Some(until) if now < until))
            .unwrap_or(false)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(PublicKey, RateClass), Window>> {
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl Window {
    fn is_blocked(&mut self, now: i64) -> bool {
        match self.blocked_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.blocked_until = None;
                false
            }
            None => false,
        }
    }

    fn prune(&mut self, now: i64, window_ms: i64) {
        self.timestamps.retain(|ts| *ts > now - window_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wopr_core::Keypair;

    fn peer() -> PublicKey {
        Keypair::generate().public_key()
    }

    #[test]
    fn admits_up_to_max_then_blocks() {
        let limiter = RateLimiter::default();
        let p = peer();
        let t0 = 1_000_000;

        for i in 0..10 {
            assert!(limiter.check_at(&p, RateClass::Connections, t0 + i));
        }
        assert!(!limiter.check_at(&p, RateClass::Connections, t0 + 10));
        assert!(limiter.is_blocked_at(&p, RateClass::Connections, t0 + 11));
    }

    #[test]
    fn block_is_monotonic_until_expiry() {
        let limiter = RateLimiter::default();
        let p = peer();
        let t0 = 1_000_000;

        for i in 0..10 {
            limiter.check_at(&p, RateClass::Injects, t0 + i);
        }
        // 11th starts the block at t0 + 10; cooldown is 60 s.
        assert!(!limiter.check_at(&p, RateClass::Injects, t0 + 10));
        let blocked_until = t0 + 10 + 60_000;

        // Hammering during the block neither admits nor extends it.
        for offset in [100, 30_000, 59_999] {
            assert!(!limiter.check_at(&p, RateClass::Injects, t0 + 10 + offset));
        }
        assert!(limiter.check_at(&p, RateClass::Injects, blocked_until));
    }

    #[test]
    fn window_slides() {
        let limiter = RateLimiter::default();
        let p = peer();
        let t0 = 1_000_000;

        for i in 0..10 {
            assert!(limiter.check_at(&p, RateClass::Injects, t0 + i));
        }
        // Past the 1 s inject window the old entries expire.
        assert!(limiter.check_at(&p, RateClass::Injects, t0 + 1_500));
    }

    #[test]
    fn classes_are_independent() {
        let limiter = RateLimiter::default();
        let p = peer();
        let t0 = 1_000_000;

        for i in 0..5 {
            assert!(limiter.check_at(&p, RateClass::Claims, t0 + i));
        }
        assert!(!limiter.check_at(&p, RateClass::Claims, t0 + 5));
        assert!(limiter.check_at(&p, RateClass::Connections, t0 + 6));
    }

    #[test]
    fn peers_are_independent() {
        let limiter = RateLimiter::default();
        let a = peer();
        let b = peer();
        let t0 = 1_000_000;

        for i in 0..5 {
            limiter.check_at(&a, RateClass::Claims, t0 + i);
        }
        assert!(!limiter.check_at(&a, RateClass::Claims, t0 + 5));
        assert!(limiter.check_at(&b, RateClass::Claims, t0 + 5));
    }

    #[test]
    fn third_offense_blocks_invalid_messages() {
        let limiter = RateLimiter::default();
        let p = peer();
        let t0 = 1_000_000;

        limiter.charge_at(&p, RateClass::InvalidMessages, t0);
        limiter.charge_at(&p, RateClass::InvalidMessages, t0 + 1);
        assert!(!limiter.is_blocked_at(&p, RateClass::InvalidMessages, t0 + 2));

        limiter.charge_at(&p, RateClass::InvalidMessages, t0 + 2);
        assert!(limiter.is_blocked_at(&p, RateClass::InvalidMessages, t0 + 3));
        // 10 minute cooldown.
        assert!(limiter.is_blocked_at(&p, RateClass::InvalidMessages, t0 + 2 + 599_999));
        assert!(!limiter.is_blocked_at(&p, RateClass::InvalidMessages, t0 + 2 + 600_000));
    }
}
