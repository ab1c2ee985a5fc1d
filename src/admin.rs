//! Admin Command Runner (spec.md §4.7, component C7): runs one
//! operator-invoked auxiliary command to completion under a daemon's
//! resolved identity, capturing its stdout into a bounded buffer.
//!
//! Grounded on `command/processrunner.rs::ProcessRunner` /
//! `command/stream.rs::OutputEvent` in the codebase this crate is
//! grounded on for one-shot command execution with captured output,
//! generalized to run detached from its requesting connection: spec.md
//! §4.7 requires the command to keep running (and its output to keep
//! accumulating) even if the client that asked for it disconnects
//! mid-run, so the runner is driven by the reactor rather than owned by
//! the connection that started it.

use std::os::unix::io::AsRawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, Stdio};

use nix::fcntl::{fcntl, FcntlArg, OFlag};

use crate::child::resolve_identity;
use crate::config::{CommandSpec, DaemonSpec};

/// An admin run's final disposition — an exit code or a terminating
/// signal number, never both (spec.md §4.6 `admin_command` result).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Output beyond this many bytes is dropped and `truncated` is reported
/// to the caller (spec.md §4.7).
pub const MAX_CAPTURE_BYTES: usize = 64 * 1024;

fn set_nonblocking(fd: std::os::unix::io::RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Identifies which client connection (if any) is waiting on a run's
/// result. The reactor clears this if the connection closes first,
/// without affecting the run itself.
pub type ConnectionToken = u64;

pub struct AdminRun {
    pub daemon: String,
    pub command_name: String,
    pub waiting_connection: Option<ConnectionToken>,
    child: Child,
    buf: Vec<u8>,
    truncated: bool,
    finished: bool,
    exit: RunExit,
}

impl AdminRun {
    pub fn spawn(
        daemon_spec: &DaemonSpec,
        daemon_name: &str,
        command_name: &str,
        command: &CommandSpec,
        waiting_connection: Option<ConnectionToken>,
    ) -> std::io::Result<Self> {
        let (program, args) = command.program_and_args();
        let mut cmd = Command::new(program);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        if let Some(cwd) = &daemon_spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &daemon_spec.environment {
            cmd.env(key, value);
        }
        if let Ok((uid, gid)) = resolve_identity(daemon_spec.user.as_deref(), daemon_spec.group.as_deref()) {
            if let Some(gid) = gid {
                cmd.gid(gid);
            }
            if let Some(uid) = uid {
                cmd.uid(uid);
            }
        }

        let mut child = cmd.spawn()?;
        if let Some(stdout) = &child.stdout {
            let _ = set_nonblocking(stdout.as_raw_fd());
        }
        if let Some(stderr) = &child.stderr {
            let _ = set_nonblocking(stderr.as_raw_fd());
        }

        Ok(AdminRun {
            daemon: daemon_name.to_string(),
            command_name: command_name.to_string(),
            waiting_connection,
            child,
            buf: Vec::new(),
            truncated: false,
            finished: false,
            exit: RunExit::default(),
        })
    }

    /// Drains whatever output is currently available into the bounded
    /// buffer, dropping anything past `MAX_CAPTURE_BYTES`.
    pub fn pump_output(&mut self) {
        use std::io::Read;
        let mut chunk = [0u8; 4096];

        for stream in [
            self.child.stdout.as_mut().map(|s| s as &mut dyn Read),
            self.child.stderr.as_mut().map(|s| s as &mut dyn Read),
        ]
        .into_iter()
        .flatten()
        {
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        let remaining = MAX_CAPTURE_BYTES.saturating_sub(self.buf.len());
                        if n > remaining {
                            self.buf.extend_from_slice(&chunk[..remaining]);
                            self.truncated = true;
                        } else {
                            self.buf.extend_from_slice(&chunk[..n]);
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        }
    }

    /// Non-blocking reap; once the child has exited, a final
    /// `pump_output` drains anything left and the run is marked done.
    pub fn try_finish(&mut self) -> std::io::Result<bool> {
        if self.finished {
            return Ok(true);
        }
        if let Some(status) = self.child.try_wait()? {
            self.pump_output();
            self.exit = RunExit {
                code: status.code(),
                signal: status.signal(),
            };
            self.finished = true;
        }
        Ok(self.finished)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn output(&self) -> (String, bool) {
        (String::from_utf8_lossy(&self.buf).into_owned(), self.truncated)
    }

    pub fn exit(&self) -> RunExit {
        self.exit
    }
}
