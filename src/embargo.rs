//! The pool-wide connection-failure backoff. New functionality grounded
//! directly in the described algorithm — a plain connection pool has no such
//! cooldown, only a fixed `connection_timeout` per attempt.

use std::time::Duration;

use rand::Rng;

/// Tracks the single pool-wide embargo duration and the monotonicity rule that lets
/// concurrently-failing slots avoid racing each other into runaway backoff.
#[derive(Debug)]
pub struct EmbargoController {
    base: Duration,
    /// `max_connection_backoff`; the base/doubling component is clamped to half of this,
    /// with jitter making up the rest.
    max: Duration,
    current: Duration,
}

impl EmbargoController {
    pub fn new(base: Duration, max: Duration) -> Self {
        EmbargoController {
            base,
            max,
            current: Duration::ZERO,
        }
    }

    /// The current embargo level, to hand to a slot about to attempt a connection.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Half of `max_connection_backoff`: the ceiling for the base/doubling component,
    /// leaving room for jitter of the same magnitude.
    fn ceiling(&self) -> Duration {
        self.max / 2
    }

    /// A connection attempt failed. `attempt_started_at_level` is the embargo value the
    /// slot observed when it began attempting to connect.
    /// Returns `Some(new_level)` if the embargo changed (every slot should then be
    /// notified via `NewConnectionEmbargo`).
    pub fn on_connect_failed(&mut self, attempt_started_at_level: Duration) -> Option<Duration> {
        let next = if self.current.is_zero() {
            self.base
        } else if self.current == attempt_started_at_level {
            std::cmp::min(self.current * 2, self.ceiling())
        } else {
            // Another slot already escalated since this attempt began; leave unchanged.
            return None;
        };
        if next == self.current {
            return None;
        }
        self.current = next;
        Some(next)
    }

    /// A connection attempt succeeded. Resets the embargo to zero if it was nonzero.
    pub fn on_connect_succeeded(&mut self) -> Option<Duration> {
        if self.current.is_zero() {
            None
        } else {
            self.current = Duration::ZERO;
            Some(Duration::ZERO)
        }
    }

    /// The jittered wait a slot entering `OutOfEmbargo` should actually sleep for:
    /// `embargo + random(0, embargo)`, so the effective wait is in `[level, 2*level)`.
    pub fn jittered_wait(level: Duration) -> Duration {
        if level.is_zero() {
            return Duration::ZERO;
        }
        let extra_nanos: u64 = rand::thread_rng().gen_range(0..=level.as_nanos() as u64);
        level + Duration::from_nanos(extra_nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalates_then_caps_at_half_max() {
        let mut ctrl = EmbargoController::new(Duration::from_millis(100), Duration::from_secs(2));
        assert_eq!(ctrl.current(), Duration::ZERO);

        let lvl0 = ctrl.current();
        let lvl1 = ctrl.on_connect_failed(lvl0).unwrap();
        assert_eq!(lvl1, Duration::from_millis(100));

        let lvl2 = ctrl.on_connect_failed(lvl1).unwrap();
        assert_eq!(lvl2, Duration::from_millis(200));

        let lvl3 = ctrl.on_connect_failed(lvl2).unwrap();
        assert_eq!(lvl3, Duration::from_millis(400));

        // Keep doubling until it hits the ceiling (max/2 == 1s) and then stays there.
        let mut level = lvl3;
        loop {
            match ctrl.on_connect_failed(level) {
                Some(next) => {
                    assert!(next <= Duration::from_secs(1));
                    level = next;
                }
                None => break,
            }
        }
        assert_eq!(level, Duration::from_secs(1));
    }

    #[test]
    fn stale_attempt_does_not_escalate() {
        let mut ctrl = EmbargoController::new(Duration::from_millis(100), Duration::from_secs(2));
        let lvl0 = ctrl.current();
        // Slot A begins its attempt at lvl0 and fails, escalating to 100ms.
        let lvl1 = ctrl.on_connect_failed(lvl0).unwrap();
        assert_eq!(lvl1, Duration::from_millis(100));
        // Slot B had also begun at lvl0 but reports its failure after A already
        // escalated; it must not escalate again.
        assert_eq!(ctrl.on_connect_failed(lvl0), None);
        assert_eq!(ctrl.current(), lvl1);
    }

    #[test]
    fn success_resets_to_zero() {
        let mut ctrl = EmbargoController::new(Duration::from_millis(100), Duration::from_secs(2));
        ctrl.on_connect_failed(Duration::ZERO);
        assert!(!ctrl.current().is_zero());
        assert_eq!(ctrl.on_connect_succeeded(), Some(Duration::ZERO));
        assert_eq!(ctrl.current(), Duration::ZERO);
    }

    #[test]
    fn jitter_bound() {
        let level = Duration::from_millis(50);
        for _ in 0..100 {
            let wait = EmbargoController::jittered_wait(level);
            assert!(wait >= level);
            assert!(wait < level * 2);
        }
    }
}
