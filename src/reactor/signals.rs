//! Self-pipe signal delivery, grounded on `agent/signal.rs::SignalManager`
//! in the codebase this crate is grounded on, extended from that
//! module's atomic-flag-only approach: the reactor's `poll` loop needs
//! an fd it can wait on, so the raw handler here writes one byte per
//! signal into a non-blocking pipe instead of just flipping a flag for
//! a polling thread to notice later.

use std::os::fd::{IntoRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{pipe, read};

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handler(signum: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = [signum as u8];
        // Safety: write(2) on a valid fd with a 1-byte buffer is
        // async-signal-safe; the result is deliberately ignored.
        unsafe {
            libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// The set of signals the daemon reacts to (spec.md §4.5, §6): SIGCHLD
/// to reap children promptly, SIGHUP to trigger a reload, SIGINT/SIGTERM
/// to begin an orderly shutdown.
const WATCHED: &[libc::c_int] = &[libc::SIGCHLD, libc::SIGHUP, libc::SIGINT, libc::SIGTERM];

pub struct SignalPipe {
    pub read_fd: RawFd,
}

impl SignalPipe {
    pub fn install() -> nix::Result<Self> {
        let (read_end, write_end) = pipe()?;
        // The self-pipe lives for the process lifetime, so the owned
        // fds are intentionally leaked into raw ones here rather than
        // closed when they'd otherwise drop at the end of this scope.
        let read_fd = read_end.into_raw_fd();
        let write_fd = write_end.into_raw_fd();
        set_nonblocking(read_fd)?;
        set_nonblocking(write_fd)?;
        WRITE_FD.store(write_fd, Ordering::Relaxed);

        for &sig in WATCHED {
            unsafe {
                libc::signal(sig, handler as libc::sighandler_t);
            }
        }

        Ok(SignalPipe { read_fd })
    }

    /// Drains every byte currently buffered, returning the distinct
    /// signal numbers observed since the last drain.
    pub fn drain(&self) -> Vec<libc::c_int> {
        let mut seen = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match read(self.read_fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &b in &buf[..n] {
                        let sig = b as libc::c_int;
                        if !seen.contains(&sig) {
                            seen.push(sig);
                        }
                    }
                }
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
        seen
    }
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}
