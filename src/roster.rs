//! Roster & Reload (spec.md §3, §4.4, component C4): the ordered set of
//! daemon records, and the diff applied when an operator reloads the
//! config file.
//!
//! Grounded on `agent/supervisor_group.rs::SupervisorGroup` in the
//! codebase this crate is grounded on for the idea of a name-keyed
//! collection of supervised records, generalized from that group's
//! `HashMap<AgentID, _>` (order doesn't matter there) to an
//! `IndexMap<String, DaemonRecord>` so that insertion order — and
//! therefore priority-tied iteration order — is preserved across reloads
//! (spec.md §3 roster ordering invariant).

use indexmap::IndexMap;
use thiserror::Error;

use crate::config::{CommandSpec, DaemonSpec};
use crate::daemon::{DaemonRecord, DaemonState};

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("no such daemon: `{0}`")]
    UnknownDaemon(String),
    #[error("daemon `{daemon}` has no command named `{command}`")]
    UnknownCommand { daemon: String, command: String },
}

/// The result of diffing a freshly loaded config against the live
/// roster (spec.md §4.4).
#[derive(Debug, Default)]
pub struct ReloadDiff {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    /// `(daemon, stop_command)` pairs for changed/removed daemons whose
    /// spec declares a `stop_command`, for the reactor to run as a
    /// fire-and-forget auxiliary process (spec.md §4.3, §4.7).
    pub stop_commands: Vec<(String, CommandSpec)>,
}

pub struct Roster {
    records: IndexMap<String, DaemonRecord>,
}

impl Roster {
    pub fn new(specs: IndexMap<String, DaemonSpec>) -> Self {
        let records = specs
            .into_iter()
            .map(|(name, spec)| (name.clone(), DaemonRecord::new(name, spec)))
            .collect();
        Roster { records }
    }

    /// Daemon names in roster order, the order `ps` and startup both use
    /// (spec.md §3, §4.8).
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Result<&DaemonRecord, RosterError> {
        self.records
            .get(name)
            .ok_or_else(|| RosterError::UnknownDaemon(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut DaemonRecord, RosterError> {
        self.records
            .get_mut(name)
            .ok_or_else(|| RosterError::UnknownDaemon(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &DaemonRecord> {
        self.records.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DaemonRecord> {
        self.records.values_mut()
    }

    /// Names sorted by `start_priority` ascending, roster order breaking
    /// ties (spec.md §4.8). Reverse this to get shutdown order.
    pub fn by_start_priority(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.keys().cloned().collect();
        names.sort_by_key(|name| self.records[name].spec.start_priority);
        names
    }

    pub fn resolve_admin_command(
        &self,
        daemon: &str,
        command: &str,
    ) -> Result<crate::config::CommandSpec, RosterError> {
        let record = self.get(daemon)?;
        record
            .spec
            .admin_commands
            .get(command)
            .cloned()
            .ok_or_else(|| RosterError::UnknownCommand {
                daemon: daemon.to_string(),
                command: command.to_string(),
            })
    }

    /// Applies a newly loaded config to the live roster (spec.md §4.4):
    /// daemons whose spec is unchanged keep running untouched; daemons
    /// with a changed spec have their running child stopped and adopt
    /// the new spec (with a reset restart cursor) only once that exit is
    /// reaped; daemons no longer present are stopped and stay in the
    /// roster as `dead` until that happens, at which point
    /// `evict_dead` drops them; new daemons are added in `stopped`
    /// state, ready for the reactor to start per C8 priority order. A
    /// daemon that isn't currently running settles (or is adopted/
    /// evicted) immediately, since there is no exit to wait for.
    pub fn reload(&mut self, new_specs: IndexMap<String, DaemonSpec>) -> ReloadDiff {
        let mut diff = ReloadDiff::default();
        let mut next = IndexMap::new();

        for (name, spec) in new_specs {
            match self.records.shift_remove(&name) {
                Some(mut existing) => {
                    if existing.spec == spec {
                        diff.unchanged.push(name.clone());
                    } else {
                        diff.changed.push(name.clone());
                        if let Some(command) = existing.begin_replace(spec) {
                            diff.stop_commands.push((name.clone(), command));
                        }
                    }
                    next.insert(name, existing);
                }
                None => {
                    diff.added.push(name.clone());
                    next.insert(name.clone(), DaemonRecord::new(name, spec));
                }
            }
        }

        for (name, mut removed) in self.records.drain(..) {
            diff.removed.push(name.clone());
            if let Some(command) = removed.begin_removal() {
                diff.stop_commands.push((name.clone(), command));
            }
            next.insert(name, removed);
        }

        self.records = next;
        diff
    }

    /// Drops every record that has settled into `dead` after a reload
    /// removed it and its child exited (spec.md §4.3). Called once per
    /// reactor tick after reaping.
    pub fn evict_dead(&mut self) {
        self.records
            .retain(|_, record| record.state != DaemonState::Dead);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandSpec, RestartStrategy, StdoutMode};
    use std::collections::HashMap;

    fn spec(command: &str, priority: i64) -> DaemonSpec {
        DaemonSpec {
            start_command: CommandSpec::shell(command),
            stop_command: None,
            start_priority: priority,
            cwd: None,
            environment: HashMap::new(),
            user: None,
            group: None,
            stdout_mode: StdoutMode::Devnull,
            restart_strategy: RestartStrategy::default_immediate(),
            admin_commands: IndexMap::new(),
        }
    }

    fn specs(pairs: &[(&str, &str, i64)]) -> IndexMap<String, DaemonSpec> {
        pairs
            .iter()
            .map(|(name, command, prio)| (name.to_string(), spec(command, *prio)))
            .collect()
    }

    #[test]
    fn reload_preserves_unchanged_daemons() {
        let mut roster = Roster::new(specs(&[("a", "true", 10)]));
        let diff = roster.reload(specs(&[("a", "true", 10)]));
        assert_eq!(diff.unchanged, vec!["a"]);
        assert!(diff.changed.is_empty());
    }

    #[test]
    fn reload_detects_changed_spec() {
        let mut roster = Roster::new(specs(&[("a", "true", 10)]));
        let diff = roster.reload(specs(&[("a", "false", 10)]));
        assert_eq!(diff.changed, vec!["a"]);
    }

    #[test]
    fn reload_tracks_added_and_removed() {
        let mut roster = Roster::new(specs(&[("a", "true", 10)]));
        let diff = roster.reload(specs(&[("b", "true", 10)]));
        assert_eq!(diff.added, vec!["b"]);
        assert_eq!(diff.removed, vec!["a"]);
    }

    #[test]
    fn start_priority_orders_ascending_with_roster_order_tiebreak() {
        let roster = Roster::new(specs(&[("a", "true", 10), ("b", "true", 5), ("c", "true", 5)]));
        assert_eq!(roster.by_start_priority(), vec!["b", "c", "a"]);
    }

    #[test]
    fn unknown_daemon_is_an_error() {
        let roster = Roster::new(specs(&[]));
        assert!(matches!(
            roster.get("missing"),
            Err(RosterError::UnknownDaemon(_))
        ));
    }
}
