//! Restart Policy (spec.md §4.2, component C2): turns the delay
//! sequence in a `RestartStrategy` into a live, per-daemon cursor that
//! advances on unplanned exits and resets on operator action or
//! sustained stability.
//!
//! Grounded on `supervisor/restart.rs::RestartPolicy`/`Backoff` in the
//! codebase this crate is grounded on, but simplified: that policy picks
//! among Fixed/Linear/Exponential backoff curves and an exit-code
//! allowlist, where spec.md §4.2 only ever wants a literal, operator
//! authored delay sequence and restarts unconditionally on any
//! unplanned exit.

use std::time::{Duration, Instant};

use crate::config::RestartStrategy;

/// Tracks one daemon's progress through its `RestartStrategy`.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    strategy: RestartStrategy,
    cursor: usize,
    running_since: Option<Instant>,
}

impl RestartPolicy {
    pub fn new(strategy: RestartStrategy) -> Self {
        RestartPolicy {
            strategy,
            cursor: 0,
            running_since: None,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Delay to apply before the next restart attempt, given the current
    /// cursor position.
    pub fn next_delay(&self) -> Duration {
        self.strategy.delay_for(self.cursor)
    }

    /// Called when the daemon transitions into `running`. Starts the
    /// stability-window clock; does not itself reset the cursor (the
    /// reset only happens once the window elapses, via `tick`).
    pub fn record_started(&mut self) {
        self.running_since = Some(Instant::now());
    }

    /// Called once per reactor tick while the daemon is `running`.
    /// Resets the cursor to zero once the daemon has stayed up for at
    /// least the strategy's stability window (spec.md §4.2).
    pub fn tick(&mut self, now: Instant) {
        if let Some(since) = self.running_since {
            if now.duration_since(since) >= self.strategy.stability_window() {
                self.cursor = 0;
                self.running_since = None;
            }
        }
    }

    /// Called on an unplanned exit: advances the cursor toward (but not
    /// past) the last configured delay.
    pub fn record_unplanned_exit(&mut self) {
        self.running_since = None;
        self.cursor = (self.cursor + 1).min(self.strategy.max_index());
    }

    /// Called when the operator issues `start`/`restart`, or a `reload`
    /// replaces this daemon's spec: always starts the sequence over
    /// (spec.md §4.2, §4.4).
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.running_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(delays: &[u64]) -> RestartPolicy {
        RestartPolicy::new(
            serde_yaml::from_str::<RestartStrategy>(&format!("{delays:?}")).unwrap(),
        )
    }

    #[test]
    fn cursor_advances_and_clamps_to_tail() {
        let mut policy = policy(&[0, 0, 5]);
        assert_eq!(policy.next_delay(), Duration::from_secs(0));

        policy.record_unplanned_exit();
        assert_eq!(policy.cursor(), 1);
        policy.record_unplanned_exit();
        assert_eq!(policy.cursor(), 2);
        assert_eq!(policy.next_delay(), Duration::from_secs(5));

        policy.record_unplanned_exit();
        assert_eq!(policy.cursor(), 2, "cursor clamps at the last index");
    }

    #[test]
    fn reset_returns_cursor_to_zero() {
        let mut policy = policy(&[0, 0, 5]);
        policy.record_unplanned_exit();
        policy.record_unplanned_exit();
        policy.reset();
        assert_eq!(policy.cursor(), 0);
    }

    #[test]
    fn stability_window_resets_cursor_after_sustained_uptime() {
        let mut policy = policy(&[0, 0, 1]);
        policy.record_unplanned_exit();
        policy.record_unplanned_exit();
        assert_eq!(policy.cursor(), 2);

        let started = Instant::now();
        policy.record_started();

        policy.tick(started + Duration::from_millis(500));
        assert_eq!(policy.cursor(), 2, "window has not elapsed yet");

        policy.tick(started + Duration::from_secs(2));
        assert_eq!(policy.cursor(), 0, "window elapsed, cursor resets");
    }
}
