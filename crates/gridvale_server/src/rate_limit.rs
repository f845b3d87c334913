//! Per-player, per-operation rate limiting.
//!
//! Distinct from in-game cooldowns: the rate limiter throttles protocol
//! abuse, while movement and combat cooldowns enforce mechanics. An operation
//! is allowed when its cooldown has elapsed since the last allowed call, and
//! the timestamp is recorded on success.

use std::time::{Duration, Instant};

use gridvale_protocol::PlayerId;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

#[derive(Default)]
pub struct RateLimiter {
    last_op: Mutex<FxHashMap<PlayerId, FxHashMap<&'static str, Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` and records the call if allowed. Zero cooldowns always
    /// allow.
    pub fn check(&self, player: PlayerId, operation: &'static str, cooldown: Duration) -> bool {
        let now = Instant::now();
        let mut map = self.last_op.lock();
        let ops = map.entry(player).or_default();

        if cooldown.is_zero() {
            ops.insert(operation, now);
            return true;
        }

        match ops.get(operation) {
            Some(&last) if now.duration_since(last) < cooldown => false,
            _ => {
                ops.insert(operation, now);
                true
            }
        }
    }

    /// Drops a player's row. Called on disconnect.
    pub fn cleanup_player(&self, player: PlayerId) {
        self.last_op.lock().remove(&player);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_blocks_until_elapsed() {
        let limiter = RateLimiter::new();
        let player = PlayerId(1);

        assert!(limiter.check(player, "move", Duration::from_secs(3600)));
        assert!(!limiter.check(player, "move", Duration::from_secs(3600)));
        // Other operations and other players are independent.
        assert!(limiter.check(player, "chat", Duration::from_secs(3600)));
        assert!(limiter.check(PlayerId(2), "move", Duration::from_secs(3600)));
    }

    #[test]
    fn zero_cooldown_always_allows() {
        let limiter = RateLimiter::new();
        for _ in 0..10 {
            assert!(limiter.check(PlayerId(1), "query", Duration::ZERO));
        }
    }

    #[test]
    fn cleanup_resets_player() {
        let limiter = RateLimiter::new();
        let player = PlayerId(1);
        assert!(limiter.check(player, "move", Duration::from_secs(3600)));
        limiter.cleanup_player(player);
        assert!(limiter.check(player, "move", Duration::from_secs(3600)));
    }
}
