//! Child Handle (spec.md §4.1, component C1): spawn, observe, signal and
//! reap one child process, and optionally capture its stdout/stderr a
//! line at a time.
//!
//! Grounded on `command/processrunner.rs` (the `CommandExecutor` /
//! `CommandHandle` / `EventStreamer` split) and `command/shutdown.rs`
//! (`ProcessTerminator`, signalling via `nix::sys::signal::kill`) in the
//! codebase this crate is grounded on. Unlike that codebase, a Child
//! Handle here owns no thread of its own: exit is observed by the
//! reactor calling `try_reap` once per tick, and captured output is read
//! non-blockingly from the reactor's poll loop (spec.md §4.5, §5) rather
//! than from a dedicated reader thread.

use std::fs::File;
use std::io::Read;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, Stdio};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{self, Signal};
use nix::unistd::{Group, Pid, User};
use thiserror::Error;

use crate::config::{CommandSpec, DaemonSpec, StdoutMode};

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("unknown user `{0}`")]
    UnknownUser(String),
    #[error("unknown group `{0}`")]
    UnknownGroup(String),
    #[error("fork/exec failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Term,
    Kill,
}

impl From<SignalKind> for Signal {
    fn from(value: SignalKind) -> Self {
        match value {
            SignalKind::Term => Signal::SIGTERM,
            SignalKind::Kill => Signal::SIGKILL,
        }
    }
}

/// The disposition a child exited with — either a normal exit code or a
/// terminating signal number, never both (spec.md §3 `last_exit`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ChildExit {
    /// Synthetic disposition used when `spawn` itself fails, so the
    /// restart policy still applies (spec.md §4.1, §7 `SpawnError`).
    pub fn spawn_failed() -> Self {
        ChildExit {
            code: Some(-1),
            signal: None,
        }
    }
}

fn resolve_command(spec: &DaemonSpec, command: &CommandSpec) -> Command {
    let (program, args) = command.program_and_args();
    let mut cmd = Command::new(program);
    cmd.args(&args);

    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &spec.environment {
        cmd.env(key, value);
    }
    cmd
}

fn apply_identity(cmd: &mut Command, spec: &DaemonSpec) -> Result<(), SpawnError> {
    if let Some(name) = &spec.group {
        let group = Group::from_name(name)
            .ok()
            .flatten()
            .ok_or_else(|| SpawnError::UnknownGroup(name.clone()))?;
        cmd.gid(group.gid.as_raw());
    }
    if let Some(name) = &spec.user {
        let user = User::from_name(name)
            .ok()
            .flatten()
            .ok_or_else(|| SpawnError::UnknownUser(name.clone()))?;
        cmd.uid(user.uid.as_raw());
    }
    Ok(())
}

fn apply_stdout_mode(cmd: &mut Command, mode: StdoutMode) {
    match mode {
        StdoutMode::Console => {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
        StdoutMode::Devnull => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        StdoutMode::Log => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
    }
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Reads one child's piped stdout/stderr non-blockingly, forwarding
/// complete lines. Closure of the pipe implies nothing about the
/// child's liveness (spec.md §4.1) — `poll_lines` just stops being
/// called once `closed` is true.
pub struct CaptureReader {
    file: File,
    buf: Vec<u8>,
    pub closed: bool,
}

impl CaptureReader {
    fn new(fd: RawFd) -> nix::Result<Self> {
        set_nonblocking(fd)?;
        // Safety: `fd` is owned by the `Child` we took it from and not
        // used anywhere else once moved into this reader.
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(Self {
            file,
            buf: Vec::new(),
            closed: false,
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Drains whatever is currently available and returns complete
    /// lines; any trailing partial line stays buffered.
    pub fn poll_lines(&mut self) -> Vec<String> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.file.read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    break;
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.closed = true;
                    break;
                }
            }
        }

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        lines
    }
}

/// One spawned child process (spec.md §4.1).
pub struct ChildHandle {
    child: Child,
    pid: i32,
    pub started_at: Instant,
    /// Wall-clock start time as Unix seconds, for `ps`'s `since_ts`
    /// field (spec.md §4.6) — `started_at` above is the monotonic clock
    /// used for stability-window/backoff arithmetic and isn't suitable
    /// for display.
    pub started_at_unix: i64,
    pub stdout_capture: Option<CaptureReader>,
    pub stderr_capture: Option<CaptureReader>,
}

impl ChildHandle {
    pub fn spawn(
        name: &str,
        spec: &DaemonSpec,
        command: &CommandSpec,
    ) -> Result<ChildHandle, SpawnError> {
        let mut cmd = resolve_command(spec, command);
        apply_identity(&mut cmd, spec)?;
        apply_stdout_mode(&mut cmd, spec.stdout_mode);

        let mut child = cmd.spawn()?;
        let pid = child.id() as i32;

        let stdout_capture = if spec.stdout_mode == StdoutMode::Log {
            child
                .stdout
                .take()
                .map(|s| CaptureReader::new(s.as_raw_fd()).map(|r| (s, r)))
                .transpose()
                .map_err(|e: nix::Error| SpawnError::Io(e.into()))?
                .map(|(owned, reader)| {
                    std::mem::forget(owned);
                    reader
                })
        } else {
            None
        };
        let stderr_capture = if spec.stdout_mode == StdoutMode::Log {
            child
                .stderr
                .take()
                .map(|s| CaptureReader::new(s.as_raw_fd()).map(|r| (s, r)))
                .transpose()
                .map_err(|e: nix::Error| SpawnError::Io(e.into()))?
                .map(|(owned, reader)| {
                    std::mem::forget(owned);
                    reader
                })
        } else {
            None
        };

        tracing::info!(daemon = name, pid, "spawned child process");

        let started_at_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        Ok(ChildHandle {
            child,
            pid,
            started_at: Instant::now(),
            started_at_unix,
            stdout_capture,
            stderr_capture,
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Idempotent: sending a signal to an already-exited child is not an
    /// error (spec.md §4.1).
    pub fn signal(&self, kind: SignalKind) {
        match signal::kill(Pid::from_raw(self.pid), Signal::from(kind)) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => tracing::warn!(pid = self.pid, error = %e, "failed to signal child"),
        }
    }

    /// Non-blocking reap. Returns `Some` exactly once, the first time
    /// it's called after the child has actually exited.
    pub fn try_reap(&mut self) -> std::io::Result<Option<ChildExit>> {
        match self.child.try_wait()? {
            None => Ok(None),
            Some(status) => Ok(Some(ChildExit {
                code: status.code(),
                signal: status.signal(),
            })),
        }
    }
}

/// Resolves `(uid, gid)` for a daemon's configured identity, used by the
/// Admin Command Runner to spawn under the same identity the daemon
/// itself would use (spec.md §4.7).
pub fn resolve_identity(
    user: Option<&str>,
    group: Option<&str>,
) -> Result<(Option<u32>, Option<u32>), SpawnError> {
    let uid = user
        .map(|name| {
            User::from_name(name)
                .ok()
                .flatten()
                .map(|u| u.uid.as_raw())
                .ok_or_else(|| SpawnError::UnknownUser(name.to_string()))
        })
        .transpose()?;
    let gid = group
        .map(|name| {
            Group::from_name(name)
                .ok()
                .flatten()
                .map(|g| g.gid.as_raw())
                .ok_or_else(|| SpawnError::UnknownGroup(name.to_string()))
        })
        .transpose()?;
    Ok((uid, gid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandSpec, RestartStrategy};
    use indexmap::IndexMap;
    use std::collections::HashMap;

    fn spec_with(command: &str, mode: StdoutMode) -> (DaemonSpec, CommandSpec) {
        let command_spec = CommandSpec::shell(command);
        (
            DaemonSpec {
                start_command: command_spec.clone(),
                stop_command: None,
                start_priority: 10,
                cwd: None,
                environment: HashMap::new(),
                user: None,
                group: None,
                stdout_mode: mode,
                restart_strategy: RestartStrategy::default_immediate(),
                admin_commands: IndexMap::new(),
            },
            command_spec,
        )
    }

    #[test]
    fn spawn_and_reap_success() {
        let (spec, command) = spec_with("true", StdoutMode::Devnull);
        let mut handle = ChildHandle::spawn("d", &spec, &command).unwrap();

        let exit = loop {
            if let Some(exit) = handle.try_reap().unwrap() {
                break exit;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        };
        assert_eq!(exit.code, Some(0));
        assert_eq!(exit.signal, None);
    }

    #[test]
    fn signal_is_idempotent_after_exit() {
        let (spec, command) = spec_with("true", StdoutMode::Devnull);
        let mut handle = ChildHandle::spawn("d", &spec, &command).unwrap();
        while handle.try_reap().unwrap().is_none() {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        // must not panic even though the process is long gone
        handle.signal(SignalKind::Term);
    }

    #[test]
    fn log_mode_captures_stdout_lines() {
        let (spec, command) = spec_with("echo hello; echo world", StdoutMode::Log);
        let mut handle = ChildHandle::spawn("d", &spec, &command).unwrap();

        let mut lines = Vec::new();
        for _ in 0..100 {
            if let Some(reader) = handle.stdout_capture.as_mut() {
                lines.extend(reader.poll_lines());
            }
            if handle.try_reap().unwrap().is_some() {
                if let Some(reader) = handle.stdout_capture.as_mut() {
                    lines.extend(reader.poll_lines());
                }
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(lines, vec!["hello".to_string(), "world".to_string()]);
    }
}
