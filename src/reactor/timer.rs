//! Timer heap backing the reactor's explicit event loop (spec.md §9
//! REDESIGN: "an explicit event loop with a timer heap and a readiness
//! multiplexer", replacing the callback/thread mixture the codebase
//! this crate is grounded on uses for scheduling backoff delays).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerKind {
    /// A daemon's cooldown delay has elapsed; the reactor should
    /// attempt to start it again.
    DaemonWake { daemon: String },
    /// A `stopping` daemon's SIGTERM grace period has elapsed; the
    /// reactor should escalate to SIGKILL.
    KillDeadline { daemon: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    at: Instant,
    kind: TimerKind,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap by wake time; `Reverse` turns `BinaryHeap`'s default max-heap
/// into the earliest-first ordering the reactor needs.
#[derive(Default)]
pub struct TimerHeap {
    heap: BinaryHeap<Reverse<Entry>>,
}

impl TimerHeap {
    pub fn new() -> Self {
        TimerHeap {
            heap: BinaryHeap::new(),
        }
    }

    pub fn schedule(&mut self, at: Instant, kind: TimerKind) {
        self.heap.push(Reverse(Entry { at, kind }));
    }

    /// Time until the next due timer, for the `poll` timeout — `None`
    /// means no timers are pending (the reactor should block
    /// indefinitely on readiness alone).
    pub fn next_timeout(&self, now: Instant) -> Option<std::time::Duration> {
        self.heap
            .peek()
            .map(|Reverse(entry)| entry.at.saturating_duration_since(now))
    }

    /// Pops every timer whose deadline has passed.
    pub fn drain_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.at > now {
                break;
            }
            due.push(self.heap.pop().unwrap().0.kind);
        }
        due
    }

    /// Drops every pending `DaemonWake` timer for `daemon`. Called
    /// whenever the reactor moves a daemon past its cooldown by some
    /// other path — an operator `start`/`restart`, a `cancel_restart`,
    /// or a `reload` that replaced/removed its spec — so the cooldown
    /// timer scheduled under the old circumstances can't reach back in
    /// and spawn (or respawn) the daemon later (spec.md §4.2, §8
    /// "Cancel-then-start").
    pub fn cancel_daemon_wake(&mut self, daemon: &str) {
        let kept: Vec<Reverse<Entry>> = self
            .heap
            .drain()
            .filter(|Reverse(entry)| {
                !matches!(&entry.kind, TimerKind::DaemonWake { daemon: d } if d == daemon)
            })
            .collect();
        self.heap = kept.into_iter().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn drains_in_earliest_first_order() {
        let base = Instant::now();
        let mut heap = TimerHeap::new();
        heap.schedule(base + Duration::from_secs(5), TimerKind::DaemonWake { daemon: "b".to_string() });
        heap.schedule(base + Duration::from_secs(1), TimerKind::DaemonWake { daemon: "a".to_string() });

        let due = heap.drain_due(base + Duration::from_secs(2));
        assert_eq!(due, vec![TimerKind::DaemonWake { daemon: "a".to_string() }]);

        let due = heap.drain_due(base + Duration::from_secs(10));
        assert_eq!(due, vec![TimerKind::DaemonWake { daemon: "b".to_string() }]);
    }

    #[test]
    fn next_timeout_reflects_the_earliest_entry() {
        let base = Instant::now();
        let mut heap = TimerHeap::new();
        assert_eq!(heap.next_timeout(base), None);

        heap.schedule(base + Duration::from_secs(3), TimerKind::KillDeadline { daemon: "a".to_string() });
        assert_eq!(heap.next_timeout(base), Some(Duration::from_secs(3)));
    }

    #[test]
    fn cancel_daemon_wake_drops_only_the_matching_entry() {
        let base = Instant::now();
        let mut heap = TimerHeap::new();
        heap.schedule(base + Duration::from_secs(5), TimerKind::DaemonWake { daemon: "a".to_string() });
        heap.schedule(base + Duration::from_secs(5), TimerKind::DaemonWake { daemon: "b".to_string() });
        heap.schedule(base + Duration::from_secs(5), TimerKind::KillDeadline { daemon: "a".to_string() });

        heap.cancel_daemon_wake("a");

        let due = heap.drain_due(base + Duration::from_secs(10));
        assert_eq!(due.len(), 2, "only the `a` DaemonWake entry should be cancelled");
        assert!(due.contains(&TimerKind::DaemonWake { daemon: "b".to_string() }));
        assert!(due.contains(&TimerKind::KillDeadline { daemon: "a".to_string() }));
    }

    #[test]
    fn cancel_daemon_wake_on_an_unscheduled_daemon_is_a_no_op() {
        let base = Instant::now();
        let mut heap = TimerHeap::new();
        heap.schedule(base + Duration::from_secs(5), TimerKind::DaemonWake { daemon: "a".to_string() });

        heap.cancel_daemon_wake("nobody");

        assert_eq!(heap.drain_due(base + Duration::from_secs(10)).len(), 1);
    }
}
