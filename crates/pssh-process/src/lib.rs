//! `Task`: ownership of one host's child subprocess (§4.3).
//!
//! A `Task` moves through `Pending -> Running -> Done`. While running, its
//! stdout/stderr/stdin pipes are registered with an [`IoMap`] and pumped by
//! handlers that share mutable state with the `Task` through an
//! `Rc<RefCell<_>>` — the event loop is single-threaded, so this is cheaper
//! and simpler than message passing back into the scheduler.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use pssh_core::{failure_reason, Host, TaskOptions, CANCELLED_EXIT_STATUS};
use pssh_io::IoMap;
use pssh_writer::Writer;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Mutable state shared between the `Task` and its registered I/O handlers.
struct Shared {
    host: Host,
    opts: TaskOptions,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
    stdout_eof: bool,
    stderr_eof: bool,
    stdin_offset: usize,
    stdin_payload: Vec<u8>,
    stdout_pipe: Option<ChildStdout>,
    stderr_pipe: Option<ChildStderr>,
    stdin_pipe: Option<ChildStdin>,
    outfile: Option<PathBuf>,
    errfile: Option<PathBuf>,
    writer: Option<Rc<Writer>>,
}

/// One scheduled per-host subprocess execution and its state (§3, §4.3).
pub struct Task {
    pub host: Host,
    argv: Vec<String>,
    stdin_payload: Option<Vec<u8>>,
    opts: TaskOptions,
    pub sequence: Option<usize>,
    start: Option<Instant>,
    shared: Option<Rc<RefCell<Shared>>>,
    child: Option<Child>,
    pid: Option<Pid>,
    exit_status: Option<i32>,
    failure_reasons: Vec<String>,
    outfile: Option<PathBuf>,
    errfile: Option<PathBuf>,
    done: bool,
}

impl Task {
    pub fn new(host: Host, argv: Vec<String>, stdin_payload: Option<Vec<u8>>, opts: TaskOptions) -> Self {
        Self {
            host,
            argv,
            stdin_payload,
            opts,
            sequence: None,
            start: None,
            shared: None,
            child: None,
            pid: None,
            exit_status: None,
            failure_reasons: Vec::new(),
            outfile: None,
            errfile: None,
            done: false,
        }
    }

    /// Spawns the child, wires its pipes into `iomap`, and transitions the
    /// `Task` into the running state (§4.3).
    pub fn start(
        &mut self,
        taskcount: u64,
        iomap: &mut IoMap,
        writer: Option<&Rc<Writer>>,
        askpass_helper: Option<&std::path::Path>,
        askpass_socket: Option<&std::path::Path>,
    ) -> Result<(), pssh_core::PsshError> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| pssh_core::PsshError::SetupFailure("empty argv for task".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.env("PSSH_NODENUM", taskcount.to_string());
        if self.opts.askpass {
            if let (Some(helper), Some(socket)) = (askpass_helper, askpass_socket) {
                cmd.env("SSH_ASKPASS", helper);
                cmd.env("PSSH_ASKPASS_SOCKET", socket);
                // SSH_ASKPASS is only honored by ssh when there is no
                // controlling TTY; setsid (below) already guarantees that.
                cmd.env("DISPLAY", cmd_display_placeholder());
            }
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(if self.stdin_payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        // SAFETY: setsid() is async-signal-safe and runs before exec in the
        // forked child, giving it no controlling terminal so SSH_ASKPASS
        // is honored and SIGKILL on the negated pid reaches the whole group.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| pssh_core::PsshError::SetupFailure(format!("failed to spawn {program}: {e}")))?;
        let pid = Pid::from_raw(child.id() as i32);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        let (outfile, errfile) = match writer {
            Some(w) => w.open_files(self.host.file_label()),
            None => (None, None),
        };
        self.outfile = outfile.clone();
        self.errfile = errfile.clone();

        let stdout_fd = stdout.as_ref().map(|s| s.as_raw_fd());
        let stderr_fd = stderr.as_ref().map(|s| s.as_raw_fd());
        let stdin_fd = stdin.as_ref().map(|s| s.as_raw_fd());

        let shared = Rc::new(RefCell::new(Shared {
            host: self.host.clone(),
            opts: self.opts.clone(),
            stdout_buf: Vec::new(),
            stderr_buf: Vec::new(),
            stdout_eof: stdout.is_none(),
            stderr_eof: stderr.is_none(),
            stdin_offset: 0,
            stdin_payload: self.stdin_payload.clone().unwrap_or_default(),
            stdout_pipe: stdout,
            stderr_pipe: stderr,
            stdin_pipe: stdin,
            outfile,
            errfile,
            writer: writer.cloned(),
        }));

        if let Some(fd) = stdout_fd {
            pssh_io::set_nonblocking(fd)?;
            iomap.register_read(fd, reader_handler(shared.clone(), Stream::Stdout));
        }
        if let Some(fd) = stderr_fd {
            pssh_io::set_nonblocking(fd)?;
            iomap.register_read(fd, reader_handler(shared.clone(), Stream::Stderr));
        }
        if let Some(fd) = stdin_fd {
            pssh_io::set_nonblocking(fd)?;
            iomap.register_write(fd, stdin_handler(shared.clone()));
        }

        self.child = Some(child);
        self.pid = Some(pid);
        self.shared = Some(shared);
        self.start = Some(Instant::now());
        debug!(host = %self.host, pid = pid.as_raw(), "task started");
        Ok(())
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Latches the child's exit status from a `waitpid` result the `Manager`
    /// observed for this `Task`'s pid (§4.5). Idempotent-safe: only the
    /// first call after spawn has effect.
    pub fn latch_wait_status(&mut self, status: WaitStatus) {
        if self.exit_status.is_some() {
            return;
        }
        match status {
            WaitStatus::Exited(_, code) => {
                self.exit_status = Some(code);
                if code != 0 && code != 255 {
                    self.failure_reasons
                        .push(failure_reason::exited_with_code(code));
                } else if code == 255 {
                    self.failure_reasons.push(failure_reason::exited_with_code(255));
                }
            }
            WaitStatus::Signaled(_, sig, _) => {
                self.exit_status = Some(-(sig as i32));
            }
            _ => {}
        }
    }

    /// True until the child has exited *and* both output pipes reached EOF
    /// (§4.3 termination detection).
    pub fn running(&self) -> bool {
        if self.done {
            return false;
        }
        let exited = self.exit_status.is_some();
        let pipes_drained = self
            .shared
            .as_ref()
            .map(|s| {
                let s = s.borrow();
                s.stdout_eof && s.stderr_eof
            })
            .unwrap_or(true);
        !(exited && pipes_drained)
    }

    /// Marks the task fully done: unregisters any lingering pipe fds and
    /// closes writer-owned files. Called by the `Manager` once `running()`
    /// goes false.
    pub fn finish(&mut self, iomap: &mut IoMap) {
        if let Some(shared) = &self.shared {
            let mut s = shared.borrow_mut();
            unregister_stream(iomap, &mut s, Stream::Stdout);
            unregister_stream(iomap, &mut s, Stream::Stderr);
            if let Some(stdin) = s.stdin_pipe.take() {
                drop(stdin);
            }
        }
        self.done = true;
    }

    pub fn elapsed(&self) -> Duration {
        self.start.map(|s| s.elapsed()).unwrap_or_default()
    }

    /// Records a timeout failure and `SIGKILL`s the child's process group
    /// (§4.3). The pid equals the pgid because the child was `setsid`'d.
    pub fn timedout(&mut self) {
        self.failure_reasons.push(failure_reason::TIMED_OUT.to_string());
        self.kill_process_group();
    }

    /// Records an operator interrupt and `SIGKILL`s the child's process
    /// group (§4.3, §4.5).
    pub fn interrupted(&mut self) {
        self.failure_reasons
            .push(failure_reason::INTERRUPTED.to_string());
        self.kill_process_group();
    }

    /// Marks a not-yet-started task cancelled without spawning (§4.3).
    pub fn cancel(&mut self) {
        self.failure_reasons
            .push(failure_reason::CANCELLED.to_string());
        self.exit_status = Some(CANCELLED_EXIT_STATUS);
        self.done = true;
    }

    /// Marks a task that failed to spawn at all (e.g. `exec` failure) as
    /// done with a transport-failure exit status, without ever registering
    /// pipes (§7 setup/transport failure taxonomy).
    pub fn spawn_failed(&mut self, reason: String) {
        self.failure_reasons.push(reason);
        self.exit_status = Some(255);
        self.done = true;
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    pub fn failure_reasons(&self) -> &[String] {
        &self.failure_reasons
    }

    pub fn stdout_buffer(&self) -> Vec<u8> {
        self.shared
            .as_ref()
            .map(|s| s.borrow().stdout_buf.clone())
            .unwrap_or_default()
    }

    pub fn stderr_buffer(&self) -> Vec<u8> {
        self.shared
            .as_ref()
            .map(|s| s.borrow().stderr_buf.clone())
            .unwrap_or_default()
    }

    fn kill_process_group(&mut self) {
        if let Some(pid) = self.pid {
            // Negative pid targets the whole process group (setsid made pid == pgid).
            match kill(Pid::from_raw(-pid.as_raw()), Signal::SIGKILL) {
                Ok(()) => {}
                Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => warn!(host = %self.host, "failed to SIGKILL process group: {e}"),
            }
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
        }
    }
}

fn unregister_stream(iomap: &mut IoMap, shared: &mut Shared, stream: Stream) {
    let fd = match stream {
        Stream::Stdout => shared.stdout_pipe.as_ref().map(|s| s.as_raw_fd()),
        Stream::Stderr => shared.stderr_pipe.as_ref().map(|s| s.as_raw_fd()),
    };
    if let Some(fd) = fd {
        iomap.unregister(fd);
    }
    match stream {
        Stream::Stdout => shared.stdout_pipe = None,
        Stream::Stderr => shared.stderr_pipe = None,
    }
}

fn reader_handler(shared: Rc<RefCell<Shared>>, stream: Stream) -> pssh_io::Handler {
    pssh_io::handler(move |fd, iomap| {
        let mut buf = [0u8; 1 << 16];
        loop {
            let read_result = {
                let mut s = shared.borrow_mut();
                match stream {
                    Stream::Stdout => s
                        .stdout_pipe
                        .as_mut()
                        .map(|p| p.read(&mut buf))
                        .unwrap_or(Ok(0)),
                    Stream::Stderr => s
                        .stderr_pipe
                        .as_mut()
                        .map(|p| p.read(&mut buf))
                        .unwrap_or(Ok(0)),
                }
            };
            match read_result {
                Ok(0) => {
                    let mut s = shared.borrow_mut();
                    match stream {
                        Stream::Stdout => s.stdout_eof = true,
                        Stream::Stderr => s.stderr_eof = true,
                    }
                    let file = match stream {
                        Stream::Stdout => s.outfile.clone(),
                        Stream::Stderr => s.errfile.clone(),
                    };
                    if let (Some(writer), Some(path)) = (&s.writer, &file) {
                        writer.close(path);
                    }
                    unregister_stream(iomap, &mut s, stream);
                    break;
                }
                Ok(n) => {
                    let chunk = buf[..n].to_vec();
                    let mut s = shared.borrow_mut();
                    let (print_prefix, host_label) = (s.opts.print_out, s.host.display_name());
                    match stream {
                        Stream::Stdout => s.stdout_buf.extend_from_slice(&chunk),
                        Stream::Stderr => s.stderr_buf.extend_from_slice(&chunk),
                    }
                    let file = match stream {
                        Stream::Stdout => s.outfile.clone(),
                        Stream::Stderr => s.errfile.clone(),
                    };
                    if let (Some(writer), Some(path)) = (&s.writer, &file) {
                        writer.write(path, chunk.clone());
                    }
                    drop(s);
                    if print_prefix {
                        print_prefixed(&host_label, stream, &chunk);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("read error on fd {fd}: {e}");
                    let mut s = shared.borrow_mut();
                    match stream {
                        Stream::Stdout => s.stdout_eof = true,
                        Stream::Stderr => s.stderr_eof = true,
                    }
                    unregister_stream(iomap, &mut s, stream);
                    break;
                }
            }
        }
    })
}

fn stdin_handler(shared: Rc<RefCell<Shared>>) -> pssh_io::Handler {
    pssh_io::handler(move |fd, iomap| loop {
        let mut s = shared.borrow_mut();
        if s.stdin_offset >= s.stdin_payload.len() {
            iomap.unregister(fd);
            s.stdin_pipe = None;
            return;
        }
        let remaining = s.stdin_payload[s.stdin_offset..].to_vec();
        let write_result = s.stdin_pipe.as_mut().map(|p| p.write(&remaining));
        match write_result {
            Some(Ok(n)) => {
                s.stdin_offset += n;
                if n == 0 {
                    return;
                }
                continue;
            }
            Some(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Some(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Some(Err(e)) => {
                warn!("stdin write error on fd {fd}: {e}");
                iomap.unregister(fd);
                s.stdin_pipe = None;
                return;
            }
            None => {
                iomap.unregister(fd);
                return;
            }
        }
    })
}

fn print_prefixed(host: &str, stream: Stream, chunk: &[u8]) {
    let label = match stream {
        Stream::Stdout => "stdout",
        Stream::Stderr => "stderr",
    };
    let text = String::from_utf8_lossy(chunk);
    for line in text.lines() {
        println!("[{host}:{label}] {line}");
    }
}

fn cmd_display_placeholder() -> &'static str {
    // ssh's askpass path is only taken when DISPLAY is set and there is no
    // controlling TTY; a dummy value is sufficient since X is never reached.
    ":0"
}

#[cfg(test)]
mod tests {
    use super::*;
    use pssh_core::Host;
    use std::time::Duration as StdDuration;

    fn test_opts() -> TaskOptions {
        TaskOptions::default()
    }

    #[test]
    fn test_new_task_is_not_running_before_start() {
        let task = Task::new(
            Host::new("h1", None, None),
            vec!["true".into()],
            None,
            test_opts(),
        );
        assert!(task.running());
        assert!(task.exit_status().is_none());
    }

    #[test]
    fn test_happy_path_exit_zero() {
        let mut iomap = IoMap::new().expect("iomap");
        let mut task = Task::new(
            Host::new("h1", None, None),
            vec!["true".into()],
            None,
            test_opts(),
        );
        task.start(0, &mut iomap, None, None, None).expect("start");
        // Drive the loop until the child is reaped.
        for _ in 0..100 {
            if let Some(pid) = task.pid() {
                if let Ok(status) = nix::sys::wait::waitpid(pid, Some(nix::sys::wait::WaitPidFlag::WNOHANG)) {
                    task.latch_wait_status(status);
                }
            }
            iomap.poll(Some(StdDuration::from_millis(20))).expect("poll");
            if !task.running() {
                break;
            }
        }
        task.finish(&mut iomap);
        assert_eq!(task.exit_status(), Some(0));
        assert!(task.failure_reasons().is_empty());
    }

    #[test]
    fn test_cancel_sets_negative_exit_status_without_spawning() {
        let mut task = Task::new(
            Host::new("h1", None, None),
            vec!["true".into()],
            None,
            test_opts(),
        );
        task.cancel();
        assert!(!task.running());
        assert_eq!(task.exit_status(), Some(CANCELLED_EXIT_STATUS));
        assert_eq!(task.failure_reasons(), &["Cancelled".to_string()]);
    }

    #[test]
    fn test_latch_wait_status_is_idempotent() {
        let mut task = Task::new(
            Host::new("h1", None, None),
            vec!["true".into()],
            None,
            test_opts(),
        );
        task.latch_wait_status(WaitStatus::Exited(Pid::from_raw(1), 7));
        task.latch_wait_status(WaitStatus::Exited(Pid::from_raw(1), 0));
        assert_eq!(task.exit_status(), Some(7));
    }

    #[test]
    fn test_signaled_exit_status_is_negative() {
        let mut task = Task::new(
            Host::new("h1", None, None),
            vec!["true".into()],
            None,
            test_opts(),
        );
        task.latch_wait_status(WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false));
        assert_eq!(task.exit_status(), Some(-(Signal::SIGKILL as i32)));
    }
}
