//! `Manager`: the scheduler (§4.5). Admits tasks up to a concurrency cap,
//! drives the cooperative event loop, reaps children via `waitpid`, enforces
//! per-task deadlines, and runs the test-gate controller (§4.6) around a
//! shared event-loop core.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use pssh_askpass::PasswordServer;
use pssh_core::{ManagerConfig, PsshError, CANCELLED_EXIT_STATUS};
use pssh_io::IoMap;
use pssh_process::Task;
use pssh_writer::{DoneRecord, Writer};
use signal_hook::consts::SIGINT;
use tracing::{debug, warn};

use crate::classify::Classifier;
use crate::reporter::Reporter;
use crate::tally::Tally;

/// One second, the deliberate resolution floor for timeout polling (§4.5
/// "Timeout computation").
const MAX_POLL_WAIT: Duration = Duration::from_secs(1);

pub struct RunOutcome {
    pub done: Vec<Task>,
    pub tally: Tally,
}

impl RunOutcome {
    pub fn process_exit_code(&self) -> i32 {
        self.tally.process_exit_code().into()
    }
}

pub struct Manager {
    config: ManagerConfig,
    classifier: Rc<dyn Classifier>,
    tasks: VecDeque<Task>,
    askpass_helper: Option<PathBuf>,
    export_path: Option<PathBuf>,
}

impl Manager {
    pub fn new(
        config: ManagerConfig,
        classifier: Rc<dyn Classifier>,
        askpass_helper: Option<PathBuf>,
        export_path: Option<PathBuf>,
    ) -> Self {
        Self {
            config,
            classifier,
            tasks: VecDeque::new(),
            askpass_helper,
            export_path,
        }
    }

    pub fn add_task(&mut self, task: Task) {
        self.tasks.push_back(task);
    }

    pub fn pending_count(&self) -> usize {
        self.tasks.len()
    }

    /// Runs all admitted tasks to completion, applying the test gate (§4.6)
    /// when configured, and writes the fork-hosts files if requested (§4.7).
    pub fn run(
        mut self,
        reporter: &mut dyn Reporter,
        confirm: &mut dyn FnMut() -> bool,
    ) -> Result<RunOutcome, PsshError> {
        let total = self.tasks.len();
        let done = if let Some(k) = self.config.gate_count(total) {
            let mut first_tasks = VecDeque::with_capacity(k);
            for _ in 0..k {
                if let Some(t) = self.tasks.pop_front() {
                    first_tasks.push_back(t);
                }
            }
            let remaining_tasks = std::mem::take(&mut self.tasks);

            let mut first = self.sub_manager(first_tasks);
            let done1 = first.run_event_loop(reporter)?;
            let tally1 = Tally::from_done(&done1, self.classifier.as_ref());
            reporter.batch_complete(&tally1);

            if !confirm() {
                done1
            } else {
                let mut second = self.sub_manager(remaining_tasks);
                let done2 = second.run_event_loop(reporter)?;
                let mut merged = done1;
                merged.extend(done2);
                merged
            }
        } else {
            self.run_event_loop(reporter)?
        };

        let tally = Tally::from_done(&done, self.classifier.as_ref());
        if let Some(basename) = &self.config.fork_hosts {
            write_fork_hosts(basename, &tally)?;
        }
        Ok(RunOutcome { done, tally })
    }

    fn sub_manager(&self, tasks: VecDeque<Task>) -> Manager {
        Manager {
            config: self.config.without_gate(),
            classifier: self.classifier.clone(),
            tasks,
            askpass_helper: self.askpass_helper.clone(),
            export_path: self.export_path.clone(),
        }
    }

    /// The cooperative event loop (§4.5 main loop).
    fn run_event_loop(&mut self, reporter: &mut dyn Reporter) -> Result<Vec<Task>, PsshError> {
        let mut iomap = IoMap::new()?;
        let writer = Writer::spawn(
            self.config.outdir.clone(),
            self.config.errdir.clone(),
            self.export_path.clone(),
        )
        .map(Rc::new);

        // Password prompt happens once, before any task is spawned (§4.4,
        // §8 "Password flow").
        let askpass_server = if self.config.askpass {
            let server = Rc::new(PasswordServer::start(self.config.par)?);
            server.install(&mut iomap);
            Some(server)
        } else {
            None
        };
        let askpass_socket: Option<PathBuf> = askpass_server.as_ref().map(|s| s.address.clone());

        let interrupt_flag = Arc::new(AtomicBool::new(false));
        let sigint_id = signal_hook::flag::register(SIGINT, interrupt_flag.clone())
            .map_err(|e| PsshError::Fatal(format!("failed to register SIGINT flag: {e}")))?;

        let mut running: Vec<Task> = Vec::new();
        let mut done: Vec<Task> = Vec::new();
        let mut taskcount: u64 = 0;

        self.admit(
            &mut running,
            &mut done,
            &mut iomap,
            writer.as_ref(),
            askpass_socket.as_deref(),
            &mut taskcount,
            reporter,
        );

        let mut wait: Option<Duration> = None;
        while !running.is_empty() || !self.tasks.is_empty() {
            if interrupt_flag.load(Ordering::Relaxed) {
                self.handle_interrupt(&mut running, &mut done, &mut iomap, writer.as_ref(), reporter);
                break;
            }

            let poll_wait = wait.map(|w| w.min(MAX_POLL_WAIT)).unwrap_or(MAX_POLL_WAIT);
            iomap.poll(Some(poll_wait))?;

            reap_exited_children(&mut running);

            // No explicit signal masking around admission: reaping already
            // happened synchronously above (never from signal context), so
            // there is no window where a wakeup could be lost the way the
            // source's Python implementation had to guard against (§4.5,
            // §9).
            self.admit(
                &mut running,
                &mut done,
                &mut iomap,
                writer.as_ref(),
                askpass_socket.as_deref(),
                &mut taskcount,
                reporter,
            );

            let mut i = 0;
            while i < running.len() {
                if !running[i].running() {
                    let task = running.remove(i);
                    finalize_task(task, &mut iomap, writer.as_ref(), &mut done, reporter);
                } else {
                    i += 1;
                }
            }

            wait = self.check_timeout(&mut running);
        }

        signal_hook::low_level::unregister(sigint_id);

        if let Some(w) = &writer {
            w.signal_quit();
            w.join();
        }

        Ok(done)
    }

    fn admit(
        &mut self,
        running: &mut Vec<Task>,
        done: &mut Vec<Task>,
        iomap: &mut IoMap,
        writer: Option<&Rc<Writer>>,
        askpass_socket: Option<&Path>,
        taskcount: &mut u64,
        reporter: &mut dyn Reporter,
    ) {
        while !self.tasks.is_empty() && running.len() < self.config.par {
            let mut task = self.tasks.pop_front().expect("checked non-empty above");
            match task.start(
                *taskcount,
                iomap,
                writer,
                self.askpass_helper.as_deref(),
                askpass_socket,
            ) {
                Ok(()) => {
                    *taskcount += 1;
                    running.push(task);
                }
                Err(e) => {
                    warn!(host = %task.host, "failed to start task: {e}");
                    task.spawn_failed(format!("Failed to start: {e}"));
                    finalize_task(task, iomap, writer, done, reporter);
                }
            }
        }
    }

    /// Kills timed-out tasks and returns the minimum remaining time across
    /// the running set (§4.5 "Timeout computation").
    fn check_timeout(&self, running: &mut [Task]) -> Option<Duration> {
        if self.config.timeout == 0 {
            return None;
        }
        let timeout = Duration::from_secs(self.config.timeout);
        let mut min_left: Option<Duration> = None;
        for task in running.iter_mut() {
            let elapsed = task.elapsed();
            if elapsed >= timeout {
                task.timedout();
                continue;
            }
            let left = timeout - elapsed;
            min_left = Some(min_left.map_or(left, |m| m.min(left)));
        }
        Some(min_left.unwrap_or(Duration::ZERO))
    }

    /// Keyboard-interrupt cleanup (§4.5 "Keyboard interrupt"): every running
    /// task is killed, every still-pending task is cancelled, and all become
    /// done.
    fn handle_interrupt(
        &mut self,
        running: &mut Vec<Task>,
        done: &mut Vec<Task>,
        iomap: &mut IoMap,
        writer: Option<&Rc<Writer>>,
        reporter: &mut dyn Reporter,
    ) {
        debug!("interrupt received, cleaning up running and pending tasks");
        for mut task in running.drain(..) {
            task.interrupted();
            finalize_task(task, iomap, writer, done, reporter);
        }
        while let Some(mut task) = self.tasks.pop_front() {
            task.cancel();
            finalize_task(task, iomap, writer, done, reporter);
        }
    }
}

fn finalize_task(
    mut task: Task,
    iomap: &mut IoMap,
    writer: Option<&Rc<Writer>>,
    done: &mut Vec<Task>,
    reporter: &mut dyn Reporter,
) {
    task.finish(iomap);
    done.push(task);
    let seq = done.len();
    let task_ref = done.last_mut().expect("just pushed");
    task_ref.sequence = Some(seq);
    reporter.task_done(task_ref);
    if let Some(w) = writer {
        w.export_done(DoneRecord {
            host: task_ref.host.host.clone(),
            port: task_ref.host.port,
            user: task_ref.host.user.clone(),
            sequence: seq,
            exit_status: task_ref.exit_status().unwrap_or(CANCELLED_EXIT_STATUS),
            failure_reasons: task_ref.failure_reasons().to_vec(),
            elapsed_secs: task_ref.elapsed().as_secs_f64(),
        });
    }
}

/// Polls each of our own running children with `waitpid(pid, WNOHANG)` and
/// latches any exited status onto its `Task` (§4.5 step 1, the SIGCHLD
/// handler's "poll every running child" duty, performed here synchronously
/// instead of in signal context).
///
/// Scoped to `running`'s own pids rather than `waitpid(-1, ...)`: the latter
/// reaps whichever child of the *process* exits first, which in a test
/// binary running many `#[cfg(test)]` cases in parallel threads means one
/// test's reap can steal another concurrently-running test's child exit
/// status.
fn reap_exited_children(running: &mut [Task]) {
    for task in running.iter_mut() {
        let Some(pid) = task.pid() else { continue };
        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    task.latch_wait_status(status);
                    break;
                }
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!(host = %task.host, "waitpid error: {e}");
                    break;
                }
            }
        }
    }
}

fn write_fork_hosts(basename: &Path, tally: &Tally) -> Result<(), PsshError> {
    use std::io::Write;
    let failed_path = append_suffix(basename, ".failed.lst");
    let passed_path = append_suffix(basename, ".passed.lst");

    let mut failed = std::fs::File::create(&failed_path)
        .map_err(|e| PsshError::SetupFailure(format!("failed to create {failed_path:?}: {e}")))?;
    for host in tally
        .ssh_failed
        .iter()
        .chain(tally.killed.iter())
        .chain(tally.cmd_failed.iter())
    {
        writeln!(failed, "{}", host.host)
            .map_err(|e| PsshError::SetupFailure(format!("failed to write {failed_path:?}: {e}")))?;
    }

    let mut passed = std::fs::File::create(&passed_path)
        .map_err(|e| PsshError::SetupFailure(format!("failed to create {passed_path:?}: {e}")))?;
    for host in &tally.succeeded {
        writeln!(passed, "{}", host.host)
            .map_err(|e| PsshError::SetupFailure(format!("failed to write {passed_path:?}: {e}")))?;
    }
    Ok(())
}

fn append_suffix(basename: &Path, suffix: &str) -> PathBuf {
    let mut s = basename.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}
