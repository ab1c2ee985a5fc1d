//! Reactor (spec.md §4.5, component C5): the single-threaded event loop
//! that owns the roster, the control socket, and every in-flight admin
//! command run.
//!
//! spec.md §9 flags the REDESIGN this module carries out: the codebase
//! this crate is grounded on drives each supervised process from its own
//! thread (`supervisor/runner.rs::run_process_thread`) and mixes that
//! with callback-style notification (`command/ipc.rs`). Here there is
//! exactly one thread: every tick non-blockingly reaps exited children,
//! services whatever the readiness multiplexer
//! (`reactor::signals`/`nix::poll`) reports ready, and fires any timer
//! (`reactor::timer::TimerHeap`) whose deadline has passed.

pub mod signals;
pub mod timer;

use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags};

use crate::admin::{AdminRun, ConnectionToken};
use crate::config::loader::ConfigLoader;
use crate::control::{
    decode, encode, AdminCommandResult, CommandsResult, DaemonStatus, PsResult, Request, Response,
    StopResult,
};
use crate::daemon::DaemonState;
use crate::roster::Roster;

use self::signals::SignalPipe;
use self::timer::{TimerHeap, TimerKind};

/// Grace period between a graceful SIGTERM and an escalated SIGKILL
/// (spec.md §4.1, §4.3).
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Ceiling on shepherd's own shutdown (spec.md §4.8, §5, §6): past this,
/// the reactor exits regardless of outstanding children rather than wait
/// on a daemon that refuses to die.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Ceiling on the `poll` timeout so that log-mode output and admin-run
/// output still get drained promptly even with no timer pending.
const MAX_POLL_WAIT: Duration = Duration::from_millis(200);

struct Connection {
    token: ConnectionToken,
    stream: UnixStream,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    write_pos: usize,
    /// Set while an admin command run or a blocking `stop`/`restart`
    /// holds this connection open past its own immediate response
    /// (spec.md §4.6, §4.7).
    awaiting_async_reply: bool,
    /// Set once the connection's one reply has been queued: once
    /// `write_buf` fully drains, the server closes its end rather than
    /// waiting on the peer (spec.md §3 "...writes one reply → closes",
    /// §5 "each accepted connection is serviced then closed").
    close_after_write: bool,
    closed: bool,
}

impl Connection {
    fn queue(&mut self, line: String) {
        self.write_buf.extend_from_slice(line.as_bytes());
    }

    fn has_pending_write(&self) -> bool {
        self.write_pos < self.write_buf.len()
    }
}

pub struct Reactor {
    roster: Roster,
    listener: UnixListener,
    socket_path: PathBuf,
    config_path: Option<PathBuf>,
    connections: Vec<Connection>,
    next_token: ConnectionToken,
    admin_runs: Vec<AdminRun>,
    /// Connections blocked on a `stop`/`restart` reply, keyed by the
    /// daemon name whose next planned exit completes the request
    /// (spec.md §4.6).
    pending_stop_replies: Vec<(String, ConnectionToken)>,
    signals: SignalPipe,
    timers: TimerHeap,
    shutting_down: bool,
    shutdown_deadline: Option<Instant>,
}

impl Reactor {
    pub fn new(
        roster: Roster,
        socket_path: PathBuf,
        config_path: Option<PathBuf>,
    ) -> std::io::Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;

        let signals = SignalPipe::install()
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e.to_string()))?;

        Ok(Reactor {
            roster,
            listener,
            socket_path,
            config_path,
            connections: Vec::new(),
            next_token: 0,
            admin_runs: Vec::new(),
            pending_stop_replies: Vec::new(),
            signals,
            timers: TimerHeap::new(),
            shutting_down: false,
            shutdown_deadline: None,
        })
    }

    /// Runs until shutdown completes. Returns the process exit code
    /// (spec.md §6: 0 on an orderly shutdown, 1 if startup failed).
    pub fn run(mut self) -> i32 {
        self.start_all();

        while self.tick() {}

        let _ = std::fs::remove_file(&self.socket_path);
        0
    }

    /// Priority-ordered startup (spec.md §4.8, component C8): daemons
    /// with the lowest `start_priority` start first.
    fn start_all(&mut self) {
        for name in self.roster.by_start_priority() {
            if let Ok(record) = self.roster.get_mut(&name) {
                let _ = record.start();
            }
        }
    }

    /// Priority-ordered shutdown, reverse of startup order (spec.md
    /// §4.8): highest `start_priority` stops first.
    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.shutdown_deadline = Some(Instant::now() + SHUTDOWN_DEADLINE);
        let mut names = self.roster.by_start_priority();
        names.reverse();
        let now = Instant::now();
        let mut stop_commands = Vec::new();
        for name in names {
            if let Ok(record) = self.roster.get_mut(&name) {
                if record.is_alive() {
                    if let Some(command) = record.begin_stop(false) {
                        stop_commands.push((name.clone(), record.spec.clone(), command));
                    }
                    self.timers.schedule(
                        now + KILL_GRACE,
                        TimerKind::KillDeadline { daemon: name },
                    );
                }
            }
        }
        for (name, spec, command) in &stop_commands {
            if let Ok(run) = AdminRun::spawn(spec, name, "stop_command", command, None) {
                self.admin_runs.push(run);
            }
        }
    }

    fn all_daemons_settled(&self) -> bool {
        self.roster
            .iter()
            .all(|r| matches!(r.state, DaemonState::Stopped | DaemonState::Dead))
    }

    /// One pass of the reactor loop. Returns `false` once shutdown has
    /// fully drained and the process should exit.
    fn tick(&mut self) -> bool {
        let now = Instant::now();

        self.reap_children(now);
        self.roster.evict_dead();
        for record in self.roster.iter_mut() {
            record.tick_stability(now);
        }
        self.pump_log_output();
        self.pump_admin_runs();

        if self.shutting_down && self.all_daemons_settled() && self.connections.is_empty() {
            return false;
        }

        if let Some(deadline) = self.shutdown_deadline {
            if now >= deadline {
                tracing::warn!("shutdown deadline reached, forcing outstanding daemons to exit");
                for record in self.roster.iter_mut() {
                    if record.is_alive() {
                        record.force_kill();
                    }
                }
                return false;
            }
        }

        self.poll_once(now);
        self.fire_due_timers(now);

        true
    }

    fn reap_children(&mut self, _now: Instant) {
        let names: Vec<String> = self.roster.names().map(str::to_string).collect();
        for name in names {
            let Ok(record) = self.roster.get_mut(&name) else {
                continue;
            };
            match record.try_reap() {
                Ok(Some(exit)) => {
                    tracing::info!(daemon = %name, ?exit, "child exited");
                    if record.state == DaemonState::CoolingDown {
                        let delay = record.restart_policy.next_delay();
                        self.timers.schedule(
                            Instant::now() + delay,
                            TimerKind::DaemonWake { daemon: name.clone() },
                        );
                    }
                    self.settle_stop_reply(&name, exit);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(daemon = %name, error = %e, "reap failed"),
            }
        }
    }

    /// If a `stop`/`restart` request is blocked on this daemon's child
    /// exiting, replies now with the exit disposition (spec.md §4.6).
    fn settle_stop_reply(&mut self, daemon: &str, exit: crate::child::ChildExit) {
        let Some(pos) = self
            .pending_stop_replies
            .iter()
            .position(|(name, _)| name == daemon)
        else {
            return;
        };
        let (_, token) = self.pending_stop_replies.remove(pos);
        let response = Response::ok_with(StopResult {
            output: String::new(),
            exit: exit.code,
            signal: exit.signal,
        });
        if let Some(conn) = self.connections.iter_mut().find(|c| c.token == token) {
            if let Ok(line) = encode(&response) {
                conn.queue(line);
            }
            conn.awaiting_async_reply = false;
            conn.close_after_write = true;
        }
    }

    fn pump_log_output(&mut self) {
        for record in self.roster.iter_mut() {
            let name = record.name.clone();
            if let Some(child) = record.child.as_mut() {
                if let Some(reader) = child.stdout_capture.as_mut() {
                    for line in reader.poll_lines() {
                        tracing::info!(daemon = %name, stream = "stdout", "{line}");
                    }
                }
                if let Some(reader) = child.stderr_capture.as_mut() {
                    for line in reader.poll_lines() {
                        tracing::info!(daemon = %name, stream = "stderr", "{line}");
                    }
                }
            }
        }
    }

    fn pump_admin_runs(&mut self) {
        let mut finished_indices = Vec::new();
        for (idx, run) in self.admin_runs.iter_mut().enumerate() {
            run.pump_output();
            match run.try_finish() {
                Ok(true) => finished_indices.push(idx),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(daemon = %run.daemon, error = %e, "admin run wait failed");
                    finished_indices.push(idx);
                }
            }
        }

        for idx in finished_indices.into_iter().rev() {
            let run = self.admin_runs.remove(idx);
            let (output, truncated) = run.output();
            let exit = run.exit();
            let response = Response::ok_with(AdminCommandResult {
                output,
                truncated,
                exit: exit.code,
                signal: exit.signal,
            });
            if let Some(token) = run.waiting_connection {
                if let Some(conn) = self.connections.iter_mut().find(|c| c.token == token) {
                    if let Ok(line) = encode(&response) {
                        conn.queue(line);
                    }
                    conn.awaiting_async_reply = false;
                    conn.close_after_write = true;
                }
            }
        }
    }

    fn poll_once(&mut self, now: Instant) {
        // Safety: every borrowed fd below is owned by `self` (the signal
        // pipe, the listener, or a connection's stream) and stays open
        // for the duration of this call.
        let signal_fd = unsafe { BorrowedFd::borrow_raw(self.signals.read_fd) };
        let listener_fd = unsafe { BorrowedFd::borrow_raw(self.listener.as_raw_fd()) };

        let mut fds: Vec<PollFd> = Vec::with_capacity(2 + self.connections.len());
        fds.push(PollFd::new(signal_fd, PollFlags::POLLIN));
        fds.push(PollFd::new(listener_fd, PollFlags::POLLIN));

        let conn_fd_offset = fds.len();
        let conn_fds: Vec<BorrowedFd> = self
            .connections
            .iter()
            .map(|c| unsafe { BorrowedFd::borrow_raw(c.stream.as_raw_fd()) })
            .collect();
        for (conn, fd) in self.connections.iter().zip(conn_fds.iter()) {
            let mut flags = PollFlags::POLLIN;
            if conn.has_pending_write() {
                flags |= PollFlags::POLLOUT;
            }
            fds.push(PollFd::new(*fd, flags));
        }

        let timeout_ms = self
            .timers
            .next_timeout(now)
            .map(|d| d.min(MAX_POLL_WAIT))
            .unwrap_or(MAX_POLL_WAIT)
            .as_millis()
            .min(i32::MAX as u128) as i32;

        if poll(&mut fds, timeout_ms).is_err() {
            return;
        }

        if fds[0]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN))
        {
            self.service_signals();
        }
        if fds[1]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN))
        {
            self.accept_connections();
        }

        for (i, conn) in self.connections.iter_mut().enumerate() {
            let Some(revents) = fds[conn_fd_offset + i].revents() else {
                continue;
            };
            if revents.contains(PollFlags::POLLOUT) {
                service_write(conn);
            }
            if revents.contains(PollFlags::POLLIN) {
                service_read(conn);
            }
        }

        let mut requests = Vec::new();
        for conn in &mut self.connections {
            while let Some(pos) = conn.read_buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = conn.read_buf.drain(..=pos).collect();
                if let Ok(text) = std::str::from_utf8(&line) {
                    requests.push((conn.token, text.to_string()));
                }
            }
        }
        for (token, line) in requests {
            self.handle_line(token, &line);
        }

        self.connections
            .retain(|c| !(c.closed && !c.awaiting_async_reply));
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    let _ = stream.set_nonblocking(true);
                    let token = self.next_token;
                    self.next_token += 1;
                    self.connections.push(Connection {
                        token,
                        stream,
                        read_buf: Vec::new(),
                        write_buf: Vec::new(),
                        write_pos: 0,
                        awaiting_async_reply: false,
                        close_after_write: false,
                        closed: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    fn service_signals(&mut self) {
        for sig in self.signals.drain() {
            match sig {
                libc::SIGCHLD => {}
                libc::SIGHUP => self.reload(),
                libc::SIGINT | libc::SIGTERM => self.begin_shutdown(),
                _ => {}
            }
        }
    }

    fn reload(&mut self) {
        let Some(path) = self.config_path.clone() else {
            tracing::warn!("reload requested but shepherd was started with --exec only");
            return;
        };
        match ConfigLoader::new(&path).load() {
            Ok(new_specs) => {
                let diff = self.roster.reload(new_specs);
                tracing::info!(
                    added = diff.added.len(),
                    changed = diff.changed.len(),
                    removed = diff.removed.len(),
                    unchanged = diff.unchanged.len(),
                    "reload applied"
                );
                // A changed or removed daemon may have been
                // `cooling_down` with a wake timer already scheduled
                // under its old spec; that timer must not outlive the
                // reload and fire into whatever the daemon becomes next
                // (spec.md §4.2, §4.4).
                for name in diff.changed.iter().chain(diff.removed.iter()) {
                    self.timers.cancel_daemon_wake(name);
                }
                let now = Instant::now();
                // A daemon whose running child is being stopped for
                // replacement/removal starts (or evicts) itself once
                // that exit is reaped (daemon.rs::try_reap) — only a
                // daemon that was already `stopped` when its spec
                // changed needs a push here.
                for name in diff.added.iter().chain(diff.changed.iter()) {
                    if let Ok(record) = self.roster.get_mut(name) {
                        if record.state == DaemonState::Stopped {
                            let _ = record.start();
                        } else {
                            self.timers.schedule(
                                now + KILL_GRACE,
                                TimerKind::KillDeadline {
                                    daemon: name.clone(),
                                },
                            );
                        }
                    }
                }
                for (name, command) in &diff.stop_commands {
                    if let Ok(record) = self.roster.get(name) {
                        if let Ok(run) =
                            AdminRun::spawn(&record.spec, name, "stop_command", command, None)
                        {
                            self.admin_runs.push(run);
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "reload failed, roster unchanged"),
        }
    }

    fn fire_due_timers(&mut self, now: Instant) {
        for kind in self.timers.drain_due(now) {
            match kind {
                TimerKind::DaemonWake { daemon } => {
                    if self.shutting_down {
                        continue;
                    }
                    if let Ok(record) = self.roster.get_mut(&daemon) {
                        let _ = record.start();
                    }
                }
                TimerKind::KillDeadline { daemon } => {
                    if let Ok(record) = self.roster.get_mut(&daemon) {
                        if record.is_alive() {
                            tracing::warn!(daemon = %daemon, "kill deadline reached, sending SIGKILL");
                            record.force_kill();
                        }
                    }
                }
            }
        }
    }

    fn handle_line(&mut self, token: ConnectionToken, line: &str) {
        let request = match decode(line) {
            Ok(r) => r,
            Err(e) => {
                self.respond(token, Response::error(e));
                return;
            }
        };
        self.dispatch(token, request);
    }

    fn dispatch(&mut self, token: ConnectionToken, request: Request) {
        if self.shutting_down && !matches!(request, Request::Ps) {
            self.respond(
                token,
                Response::error("shepherd is shutting down, only ps is accepted"),
            );
            return;
        }
        match request {
            Request::Reload => {
                self.reload();
                self.respond(token, Response::ok());
            }
            Request::Ps => {
                let now = Instant::now();
                let daemons: Vec<DaemonStatus> = self
                    .roster
                    .iter()
                    .map(|r| DaemonStatus {
                        name: r.name.clone(),
                        state: r.state.as_str().to_string(),
                        pid: r.child.as_ref().map(|c| c.pid()),
                        since_ts: r.child.as_ref().map(|c| c.started_at_unix),
                        restart_cursor: r.restart_policy.cursor(),
                        next_wake: r
                            .next_wake
                            .map(|w| w.saturating_duration_since(now).as_secs()),
                        last_exit_code: r.last_exit.and_then(|e| e.code),
                        last_exit_signal: r.last_exit.and_then(|e| e.signal),
                    })
                    .collect();
                self.respond(token, Response::ok_with(PsResult { daemons }));
            }
            Request::Start { daemon } => {
                // A stale cooldown timer scheduled before this start must
                // not reach back in and respawn on top of it later
                // (spec.md §4.2, §8 "Cancel-then-start").
                self.timers.cancel_daemon_wake(&daemon);
                match self.roster.get_mut(&daemon) {
                    Ok(record) => {
                        record.operator_start();
                        self.respond(token, Response::ok());
                    }
                    Err(e) => self.respond(token, Response::error(e)),
                }
            }
            Request::Stop { daemon } => self.handle_stop_request(token, daemon, false),
            Request::Restart { daemon } => self.handle_stop_request(token, daemon, true),
            Request::CancelRestart { daemon } => {
                let result = self.roster.get_mut(&daemon).map(|record| record.cancel_restart());
                self.timers.cancel_daemon_wake(&daemon);
                match result {
                    Ok(()) => self.respond(token, Response::ok()),
                    Err(e) => self.respond(token, Response::error(e)),
                }
            }
            Request::ListCommands { daemon } => match self.roster.get(&daemon) {
                Ok(record) => {
                    let names = record.spec.admin_commands.keys().cloned().collect();
                    self.respond(token, Response::ok_with(CommandsResult { names }));
                }
                Err(e) => self.respond(token, Response::error(e)),
            },
            Request::AdminCommand {
                daemon,
                admin_command,
            } => self.start_admin_command(token, &daemon, &admin_command),
        }
    }

    /// `stop`/`restart` (spec.md §4.6): idempotent on an already-stopped
    /// daemon (spec.md §8 law "Idempotent stop" — no-op, result absent).
    /// Otherwise runs `stop_command` if configured (else sends TERM),
    /// arms the kill-deadline timer, and blocks the reply until the
    /// child's exit is reaped (spec.md §4.7's "associated with a
    /// daemon" admin command is exactly this `stop_command` run).
    fn handle_stop_request(&mut self, token: ConnectionToken, daemon: String, restart: bool) {
        let record = match self.roster.get_mut(&daemon) {
            Ok(r) => r,
            Err(e) => {
                self.respond(token, Response::error(e));
                return;
            }
        };

        if !record.is_alive() {
            if restart {
                record.operator_start();
                // The daemon may have been `cooling_down` with a wake
                // timer already scheduled; this restart bypasses it, so
                // the stale timer must not fire into it later (spec.md
                // §4.2, §8 "Cancel-then-start").
                self.timers.cancel_daemon_wake(&daemon);
            }
            self.respond(token, Response::ok());
            return;
        }

        let stop_command = record.begin_stop(restart);
        self.timers.schedule(
            Instant::now() + KILL_GRACE,
            TimerKind::KillDeadline {
                daemon: daemon.clone(),
            },
        );
        if let Some(command) = stop_command {
            let spec = record.spec.clone();
            if let Ok(run) = AdminRun::spawn(&spec, &daemon, "stop_command", &command, None) {
                self.admin_runs.push(run);
            }
        }

        self.pending_stop_replies.push((daemon, token));
        if let Some(conn) = self.connections.iter_mut().find(|c| c.token == token) {
            conn.awaiting_async_reply = true;
        }
    }

    fn start_admin_command(&mut self, token: ConnectionToken, daemon: &str, command_name: &str) {
        let command = match self.roster.resolve_admin_command(daemon, command_name) {
            Ok(c) => c,
            Err(e) => {
                self.respond(token, Response::error(e));
                return;
            }
        };
        let record = match self.roster.get(daemon) {
            Ok(r) => r,
            Err(e) => {
                self.respond(token, Response::error(e));
                return;
            }
        };
        match AdminRun::spawn(&record.spec, daemon, command_name, &command, Some(token)) {
            Ok(run) => {
                self.admin_runs.push(run);
                if let Some(conn) = self.connections.iter_mut().find(|c| c.token == token) {
                    conn.awaiting_async_reply = true;
                }
            }
            Err(e) => self.respond(token, Response::error(e)),
        }
    }

    fn respond(&mut self, token: ConnectionToken, response: Response) {
        let Some(conn) = self.connections.iter_mut().find(|c| c.token == token) else {
            return;
        };
        if let Ok(line) = encode(&response) {
            conn.queue(line);
        }
        conn.close_after_write = true;
    }
}

/// Reads whatever is available into the connection's buffer. Returns
/// `false` if the peer closed the socket (and it has no admin run
/// pending), meaning the connection should be torn down.
fn service_read(conn: &mut Connection) -> bool {
    let mut chunk = [0u8; 4096];
    loop {
        match conn.stream.read(&mut chunk) {
            Ok(0) => {
                conn.closed = true;
                return false;
            }
            Ok(n) => conn.read_buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => {
                conn.closed = true;
                return false;
            }
        }
    }
}

fn service_write(conn: &mut Connection) {
    while conn.write_pos < conn.write_buf.len() {
        match conn.stream.write(&conn.write_buf[conn.write_pos..]) {
            Ok(0) => break,
            Ok(n) => conn.write_pos += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    if conn.write_pos == conn.write_buf.len() {
        conn.write_buf.clear();
        conn.write_pos = 0;
        if conn.close_after_write && !conn.awaiting_async_reply {
            let _ = conn.stream.shutdown(std::net::Shutdown::Both);
            conn.closed = true;
        }
    }
}
