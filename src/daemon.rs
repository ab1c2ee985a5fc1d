//! Daemon Record & State Machine (spec.md §3, §4.3, component C3).
//!
//! Grounded on `supervisor/runner.rs::SupervisorRunner<State>` in the
//! codebase this crate is grounded on for the overall shape of a
//! per-process record with a typed lifecycle, generalized from that
//! runner's two-state `Stopped`/`Running` typestate to the six explicit
//! states spec.md §4.3 names, since this design also needs to represent
//! `cooling_down` and `dead` as durable, inspectable states rather than
//! transient control flow.

use std::time::Instant;

use crate::child::{ChildExit, ChildHandle, SignalKind};
use crate::config::{CommandSpec, DaemonSpec};
use crate::restart::RestartPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    CoolingDown,
    Stopping,
    Dead,
}

impl DaemonState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonState::Stopped => "stopped",
            DaemonState::Starting => "starting",
            DaemonState::Running => "running",
            DaemonState::CoolingDown => "cooling_down",
            DaemonState::Stopping => "stopping",
            DaemonState::Dead => "dead",
        }
    }
}

/// Whether an in-flight exit was requested by the operator (`stop`,
/// `restart`, roster removal, shutdown) or happened on its own. Only the
/// latter advances the restart cursor (spec.md §4.2, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitIntent {
    Planned,
    Unplanned,
}

/// One daemon's live record: its spec, current state, child handle if
/// any, and restart bookkeeping (spec.md §3).
pub struct DaemonRecord {
    pub name: String,
    pub spec: DaemonSpec,
    pub state: DaemonState,
    pub child: Option<ChildHandle>,
    pub restart_policy: RestartPolicy,
    pub last_exit: Option<ChildExit>,
    pub next_wake: Option<Instant>,
    /// Set while a `stop_command` or SIGTERM/SIGKILL deadline is in
    /// flight, so the next reap is attributed as `Planned`.
    pending_intent: ExitIntent,
    /// Set by an operator `restart`: once the current child exits, start
    /// a fresh one with the cursor reset instead of settling in
    /// `stopped` (spec.md §4.3).
    restart_intent: bool,
    /// Set by a `reload` that changed this daemon's spec: the new spec
    /// to adopt once the currently running child (under the old spec)
    /// exits (spec.md §4.4).
    pending_spec: Option<DaemonSpec>,
    /// Set by a `reload` that dropped this daemon from the roster: once
    /// the child exits, the record becomes `dead` for the reactor to
    /// evict (spec.md §4.3, §4.4).
    marked_for_removal: bool,
}

impl DaemonRecord {
    pub fn new(name: String, spec: DaemonSpec) -> Self {
        let restart_policy = RestartPolicy::new(spec.restart_strategy.clone());
        DaemonRecord {
            name,
            spec,
            state: DaemonState::Stopped,
            child: None,
            restart_policy,
            last_exit: None,
            next_wake: None,
            pending_intent: ExitIntent::Unplanned,
            restart_intent: false,
            pending_spec: None,
            marked_for_removal: false,
        }
    }

    /// Starts the child process. Valid from `stopped`, `dead`, or
    /// `cooling_down` (skipping the remaining backoff delay) — spec.md
    /// §4.3. A no-op if a child is already alive: spec.md §4.3's
    /// transition table only allows `start` `From: stopped`, and a
    /// second spawn here would orphan the existing `ChildHandle`
    /// (§8 invariant 1, "at most one live Child Handle per daemon").
    pub fn start(&mut self) -> Result<(), crate::child::SpawnError> {
        if self.is_alive() {
            return Ok(());
        }
        match ChildHandle::spawn(&self.name, &self.spec, &self.spec.start_command) {
            Ok(child) => {
                self.child = Some(child);
                self.state = DaemonState::Running;
                self.restart_policy.record_started();
                self.next_wake = None;
                tracing::info!(daemon = %self.name, "daemon running");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(daemon = %self.name, error = %e, "spawn failed");
                self.last_exit = Some(ChildExit::spawn_failed());
                self.enter_cooldown(ExitIntent::Unplanned);
                Err(e)
            }
        }
    }

    /// Operator-initiated start/restart: always resets the restart
    /// cursor before starting (spec.md §4.2, §4.3). A no-op if the
    /// daemon is already alive, for the same reason `start` itself
    /// guards against it — this also keeps a `start` on a `running`
    /// daemon from resetting its cursor out from under it.
    pub fn operator_start(&mut self) {
        if self.is_alive() {
            return;
        }
        self.restart_policy.reset();
        self.pending_intent = ExitIntent::Unplanned;
        let _ = self.start();
    }

    /// Begins a graceful stop (spec.md §4.1, §4.3): if the spec
    /// declares a `stop_command`, the caller is handed it back to run
    /// as an auxiliary process and no signal is sent here; otherwise
    /// the child is sent SIGTERM directly. Either way the eventual exit
    /// is marked planned, and `restart_intent` decides whether the
    /// daemon respawns once that exit is reaped.
    pub fn begin_stop(&mut self, restart_intent: bool) -> Option<CommandSpec> {
        self.pending_intent = ExitIntent::Planned;
        self.restart_intent = restart_intent;
        self.state = DaemonState::Stopping;
        match &self.spec.stop_command {
            Some(command) => Some(command.clone()),
            None => {
                if let Some(child) = &self.child {
                    child.signal(SignalKind::Term);
                }
                None
            }
        }
    }

    /// Begins stopping the current child so a new spec can be adopted
    /// once it exits (spec.md §4.4 "Changed"). If the daemon isn't
    /// currently alive, the new spec is adopted immediately.
    pub fn begin_replace(&mut self, spec: DaemonSpec) -> Option<CommandSpec> {
        if !self.is_alive() {
            self.apply_new_spec(spec);
            return None;
        }
        self.pending_spec = Some(spec);
        self.begin_stop(false)
    }

    /// Begins stopping the current child because this daemon was
    /// dropped from the roster (spec.md §4.3 "reload removes spec"). If
    /// the daemon isn't currently alive, it is marked `dead` immediately
    /// so the roster can evict it on the next tick.
    pub fn begin_removal(&mut self) -> Option<CommandSpec> {
        self.marked_for_removal = true;
        if !self.is_alive() {
            self.state = DaemonState::Dead;
            self.next_wake = None;
            return None;
        }
        self.begin_stop(false)
    }

    pub fn force_kill(&mut self) {
        if let Some(child) = &self.child {
            child.signal(SignalKind::Kill);
        }
    }

    /// Called once per reactor tick to reap an exited child, if any.
    /// Returns the exit disposition so the reactor can log/notify and
    /// settle any pending control reply.
    pub fn try_reap(&mut self) -> std::io::Result<Option<ChildExit>> {
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        let Some(exit) = child.try_reap()? else {
            return Ok(None);
        };
        self.child = None;
        self.last_exit = Some(exit);

        match self.pending_intent {
            ExitIntent::Planned => {
                self.pending_intent = ExitIntent::Unplanned;
                self.next_wake = None;
                if self.marked_for_removal {
                    self.state = DaemonState::Dead;
                } else if let Some(new_spec) = self.pending_spec.take() {
                    self.apply_new_spec(new_spec);
                    let _ = self.start();
                } else if self.restart_intent {
                    self.restart_intent = false;
                    self.restart_policy.reset();
                    let _ = self.start();
                } else {
                    self.state = DaemonState::Stopped;
                }
            }
            ExitIntent::Unplanned => {
                self.enter_cooldown(ExitIntent::Unplanned);
            }
        }
        Ok(Some(exit))
    }

    fn enter_cooldown(&mut self, _intent: ExitIntent) {
        self.restart_policy.record_unplanned_exit();
        self.state = DaemonState::CoolingDown;
        self.next_wake = Some(Instant::now() + self.restart_policy.next_delay());
    }

    /// Called once per reactor tick while `running`, to let the restart
    /// cursor reset after the stability window (spec.md §4.2).
    pub fn tick_stability(&mut self, now: Instant) {
        if self.state == DaemonState::Running {
            self.restart_policy.tick(now);
        }
    }

    /// Whether the cooldown's backoff delay has elapsed and the daemon
    /// is due to be (re)started by the reactor.
    pub fn is_due(&self, now: Instant) -> bool {
        self.state == DaemonState::CoolingDown && self.next_wake.is_some_and(|w| now >= w)
    }

    /// Clears a pending restart timer without touching the cursor
    /// (spec.md §4.2 `cancel_restart`). Moves the daemon to `stopped`,
    /// where it stays until an operator `start` (spec.md §4.3).
    pub fn cancel_restart(&mut self) {
        if self.state == DaemonState::CoolingDown {
            self.next_wake = None;
            self.state = DaemonState::Stopped;
        }
    }

    /// Adopts a new spec in place and always resets the cursor (a fresh
    /// `RestartPolicy` starts at 0), landing in `stopped` regardless of
    /// which state this daemon was previously in — callers that were
    /// already `running` immediately call `start()` afterward, turning
    /// this into a momentary waypoint rather than an observable state
    /// (spec.md §4.4).
    fn apply_new_spec(&mut self, spec: DaemonSpec) {
        self.spec = spec;
        self.restart_policy = RestartPolicy::new(self.spec.restart_strategy.clone());
        self.next_wake = None;
        self.pending_intent = ExitIntent::Unplanned;
        self.state = DaemonState::Stopped;
    }

    pub fn is_alive(&self) -> bool {
        self.child.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandSpec, RestartStrategy, StdoutMode};
    use indexmap::IndexMap;
    use std::collections::HashMap;

    fn spec(command: &str) -> DaemonSpec {
        DaemonSpec {
            start_command: CommandSpec::shell(command),
            stop_command: None,
            start_priority: 10,
            cwd: None,
            environment: HashMap::new(),
            user: None,
            group: None,
            stdout_mode: StdoutMode::Devnull,
            restart_strategy: RestartStrategy::default_immediate(),
            admin_commands: IndexMap::new(),
        }
    }

    #[test]
    fn unplanned_exit_enters_cooldown_and_schedules_wake() {
        let mut record = DaemonRecord::new("d".to_string(), spec("true"));
        record.start().unwrap();
        assert_eq!(record.state, DaemonState::Running);

        loop {
            if record.try_reap().unwrap().is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(record.state, DaemonState::CoolingDown);
        assert!(record.next_wake.is_some());
    }

    #[test]
    fn planned_stop_lands_in_stopped_without_rescheduling() {
        let mut record = DaemonRecord::new("d".to_string(), spec("sleep 5"));
        record.start().unwrap();
        record.begin_stop(false);

        loop {
            if record.try_reap().unwrap().is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(record.state, DaemonState::Stopped);
        assert!(record.next_wake.is_none());
    }

    #[test]
    fn cancel_restart_clears_wake_without_touching_cursor() {
        let mut record = DaemonRecord::new("d".to_string(), spec("false"));
        record.start().unwrap();
        loop {
            if record.try_reap().unwrap().is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let cursor_before = record.restart_policy.cursor();
        record.cancel_restart();
        assert_eq!(record.state, DaemonState::Stopped);
        assert!(record.next_wake.is_none());
        assert_eq!(record.restart_policy.cursor(), cursor_before);
    }

    #[test]
    fn operator_restart_respawns_once_old_child_exits() {
        let mut record = DaemonRecord::new("d".to_string(), spec("sleep 5"));
        record.start().unwrap();
        let first_pid = record.child.as_ref().unwrap().pid();
        record.begin_stop(true);
        record.force_kill();

        loop {
            if record.try_reap().unwrap().is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(record.state, DaemonState::Running);
        assert_ne!(record.child.as_ref().unwrap().pid(), first_pid);
    }

    #[test]
    fn stop_command_is_handed_back_instead_of_signalling_directly() {
        let mut record = DaemonRecord::new("d".to_string(), spec("sleep 5"));
        record.spec.stop_command = Some(CommandSpec::shell("true"));
        record.start().unwrap();
        let command = record.begin_stop(false);
        assert!(matches!(command, Some(CommandSpec::Shell(ref s)) if s == "true"));
    }

    #[test]
    fn start_on_an_already_running_daemon_does_not_orphan_the_old_child() {
        let mut record = DaemonRecord::new("d".to_string(), spec("sleep 5"));
        record.start().unwrap();
        let first_pid = record.child.as_ref().unwrap().pid();

        record.start().unwrap();
        assert_eq!(
            record.child.as_ref().unwrap().pid(),
            first_pid,
            "a second start() while already running must not replace the live child handle"
        );

        record.force_kill();
        while record.try_reap().unwrap().is_none() {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    #[test]
    fn operator_start_on_a_running_daemon_does_not_reset_the_cursor() {
        let mut record = DaemonRecord::new("d".to_string(), spec("sleep 5"));
        record.start().unwrap();
        record.restart_policy.record_unplanned_exit();
        let cursor_before = record.restart_policy.cursor();

        record.operator_start();
        assert_eq!(
            record.restart_policy.cursor(),
            cursor_before,
            "operator_start on an already-running daemon must be a no-op"
        );

        record.force_kill();
        while record.try_reap().unwrap().is_none() {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }
}
