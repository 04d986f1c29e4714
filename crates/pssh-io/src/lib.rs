//! `IoMap`: a readiness-polling dispatch table for file descriptors (§4.1).
//!
//! Registers read/write handlers per fd, blocks in a single `poll(2)` call
//! bounded by a caller-supplied timeout, and dispatches ready fds to their
//! handlers. A self-pipe wired to `SIGCHLD`/`SIGINT` via `signal-hook`
//! guarantees that a signal arriving while blocked in `poll` wakes it
//! immediately rather than waiting out the timeout.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use pssh_core::PsshError;
use signal_hook::consts::{SIGCHLD, SIGINT};
use signal_hook::low_level::pipe as sh_pipe;
use signal_hook::low_level::unregister as sh_unregister;
use tracing::{trace, warn};

/// A handler invoked when its registered fd becomes ready. Shared via `Rc` so
/// the dispatch loop can drop its borrow of `IoMap` before calling back into
/// it (handlers are free to register/unregister fds, including their own).
pub type Handler = Rc<RefCell<dyn FnMut(RawFd, &mut IoMap)>>;

const DRAIN_CHUNK: usize = 1 << 16;

/// Wraps a closure as a `Handler`.
pub fn handler<F>(f: F) -> Handler
where
    F: FnMut(RawFd, &mut IoMap) + 'static,
{
    Rc::new(RefCell::new(f))
}

pub struct IoMap {
    read_handlers: HashMap<RawFd, Handler>,
    write_handlers: HashMap<RawFd, Handler>,
    _wakeup_write: OwnedFd,
    wakeup_read: OwnedFd,
    sigchld_id: signal_hook::SigId,
    sigint_id: signal_hook::SigId,
}

impl IoMap {
    /// Creates the wakeup pipe and wires `SIGCHLD`/`SIGINT` to its write end,
    /// the Rust equivalent of `signal.set_wakeup_fd` (§4.1, §9).
    pub fn new() -> Result<Self, PsshError> {
        let (read_fd, write_fd) = nix::unistd::pipe()?;
        let sigchld_id = sh_pipe::register(SIGCHLD, write_fd.try_clone()?)
            .map_err(|e| PsshError::Fatal(format!("failed to register SIGCHLD wakeup: {e}")))?;
        let sigint_id = sh_pipe::register(SIGINT, write_fd.try_clone()?)
            .map_err(|e| PsshError::Fatal(format!("failed to register SIGINT wakeup: {e}")))?;

        let mut map = Self {
            read_handlers: HashMap::new(),
            write_handlers: HashMap::new(),
            _wakeup_write: write_fd,
            wakeup_read: read_fd,
            sigchld_id,
            sigint_id,
        };
        let wakeup_fd = map.wakeup_read.as_raw_fd();
        map.register_read(
            wakeup_fd,
            handler(|fd, _iomap| {
                let mut buf = [0u8; DRAIN_CHUNK];
                loop {
                    match nix::unistd::read(unsafe { BorrowedFd::borrow_raw(fd) }, &mut buf) {
                        Ok(0) => break,
                        Ok(_) => continue,
                        Err(nix::errno::Errno::EAGAIN) => break,
                        Err(nix::errno::Errno::EINTR) => continue,
                        Err(e) => {
                            warn!("error draining wakeup pipe: {e}");
                            break;
                        }
                    }
                }
            }),
        );
        // Non-blocking so the drain handler's loop terminates on EAGAIN
        // rather than blocking the event loop.
        set_nonblocking(wakeup_fd)?;
        Ok(map)
    }

    pub fn register_read(&mut self, fd: RawFd, handler: Handler) {
        self.read_handlers.insert(fd, handler);
    }

    pub fn register_write(&mut self, fd: RawFd, handler: Handler) {
        self.write_handlers.insert(fd, handler);
    }

    /// Removes `fd` from both maps (§4.1 invariant: a done `Task` leaves no
    /// registrations behind).
    pub fn unregister(&mut self, fd: RawFd) {
        self.read_handlers.remove(&fd);
        self.write_handlers.remove(&fd);
    }

    pub fn is_quiescent(&self) -> bool {
        self.read_handlers.is_empty() && self.write_handlers.is_empty()
    }

    /// Blocks in `poll(2)` for at most `timeout`, then dispatches ready fds:
    /// reads before writes, each group in OS return order, over a stable
    /// snapshot taken before any handler runs (§4.1).
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<(), PsshError> {
        if self.is_quiescent() {
            return Ok(());
        }

        let read_fds: Vec<RawFd> = self.read_handlers.keys().copied().collect();
        let write_fds: Vec<RawFd> = self.write_handlers.keys().copied().collect();

        let mut fds: Vec<PollFd> = Vec::with_capacity(read_fds.len() + write_fds.len());
        for &fd in &read_fds {
            fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(fd) },
                PollFlags::POLLIN,
            ));
        }
        for &fd in &write_fds {
            fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(fd) },
                PollFlags::POLLOUT,
            ));
        }

        let poll_timeout = to_poll_timeout(timeout);
        match poll(&mut fds, poll_timeout) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => {
                trace!("poll interrupted by signal, looping");
                return Ok(());
            }
            Err(e) => return Err(PsshError::Errno(e)),
        }

        let mut ready_reads = Vec::new();
        let mut ready_writes = Vec::new();
        for (i, &fd) in read_fds.iter().enumerate() {
            if let Some(revents) = fds[i].revents() {
                if revents.intersects(
                    PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
                ) {
                    ready_reads.push(fd);
                }
            }
        }
        let base = read_fds.len();
        for (i, &fd) in write_fds.iter().enumerate() {
            if let Some(revents) = fds[base + i].revents() {
                if revents.intersects(
                    PollFlags::POLLOUT | PollFlags::POLLHUP | PollFlags::POLLERR,
                ) {
                    ready_writes.push(fd);
                }
            }
        }

        for fd in ready_reads {
            if let Some(h) = self.read_handlers.get(&fd).cloned() {
                h.borrow_mut()(fd, self);
            }
        }
        for fd in ready_writes {
            if let Some(h) = self.write_handlers.get(&fd).cloned() {
                h.borrow_mut()(fd, self);
            }
        }
        Ok(())
    }
}

impl Drop for IoMap {
    fn drop(&mut self) {
        sh_unregister(self.sigchld_id);
        sh_unregister(self.sigint_id);
    }
}

fn to_poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(d) => {
            let millis = d.as_millis().min(u32::MAX as u128) as u32;
            PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
        }
    }
}

/// Sets `O_NONBLOCK` on `fd`; used for pipes held across `poll` so handlers
/// can drain with `EAGAIN` tolerance instead of blocking (§4.3, §5).
pub fn set_nonblocking(fd: RawFd) -> Result<(), PsshError> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let flags = fcntl(borrowed, FcntlArg::F_GETFL)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(borrowed, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Sets the close-on-exec flag on `fd` so child spawns never inherit it
/// (§4.2, §5).
pub fn set_cloexec(fd: RawFd) -> Result<(), PsshError> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    fcntl(borrowed, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}
