//! Post-run classification and the process exit code rule (§4.7).

use pssh_core::{Host, ProcessExitCode, CANCELLED_EXIT_STATUS};
use pssh_process::Task;

use crate::classify::Classifier;

/// Hosts bucketed by outcome, plus the process-wide exit code (§4.7).
#[derive(Debug, Clone, Default)]
pub struct Tally {
    pub succeeded: Vec<Host>,
    pub ssh_failed: Vec<Host>,
    pub cmd_failed: Vec<Host>,
    pub killed: Vec<Host>,
}

impl Tally {
    pub fn from_done(done: &[Task], classifier: &dyn Classifier) -> Self {
        let mut tally = Tally::default();
        for task in done {
            let status = task.exit_status().unwrap_or(CANCELLED_EXIT_STATUS);
            match classifier.classify(status) {
                pssh_core::Bucket::Succeeded => tally.succeeded.push(task.host.clone()),
                pssh_core::Bucket::SshFailed => tally.ssh_failed.push(task.host.clone()),
                pssh_core::Bucket::CmdFailed => tally.cmd_failed.push(task.host.clone()),
                pssh_core::Bucket::Killed => tally.killed.push(task.host.clone()),
            }
        }
        tally
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.ssh_failed.len() + self.cmd_failed.len() + self.killed.len()
    }

    /// Process exit code (§4.7). Priority, most severe first: any kill wins
    /// outright; otherwise any command failure beats a bare transport
    /// failure. The SCP/rsync classifier never produces `cmd_failed`, so
    /// that branch is unreachable for those variants and they collapse to
    /// `AnyTransportFailure`, matching the spec's "SCP/rsync collapse into
    /// 4" note.
    pub fn process_exit_code(&self) -> ProcessExitCode {
        if !self.killed.is_empty() {
            ProcessExitCode::AnyKilled
        } else if !self.cmd_failed.is_empty() {
            ProcessExitCode::AnyCommandFailure
        } else if !self.ssh_failed.is_empty() {
            ProcessExitCode::AnyTransportFailure
        } else {
            ProcessExitCode::AllSucceeded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{SshClassifier, TransferClassifier};
    use pssh_core::TaskOptions;

    fn done_task(host: &str, exit_status: i32) -> Task {
        let mut t = Task::new(Host::new(host, None, None), vec!["true".into()], None, TaskOptions::default());
        t.cancel();
        // Overwrite the cancel-assigned status for test purposes via a
        // fresh task is awkward since exit_status is private; instead drive
        // through latch_wait_status on a not-yet-started task for exited
        // codes, and rely on cancel()'s own status for the killed case.
        if exit_status != pssh_core::CANCELLED_EXIT_STATUS {
            let mut t2 = Task::new(Host::new(host, None, None), vec!["true".into()], None, TaskOptions::default());
            t2.latch_wait_status(nix::sys::wait::WaitStatus::Exited(nix::unistd::Pid::from_raw(1), exit_status));
            return t2;
        }
        t
    }

    #[test]
    fn test_happy_path_all_succeeded() {
        let done = vec![done_task("h1", 0), done_task("h2", 0), done_task("h3", 0)];
        let tally = Tally::from_done(&done, &SshClassifier);
        assert_eq!(tally.succeeded.len(), 3);
        assert_eq!(i32::from(tally.process_exit_code()), 0);
    }

    #[test]
    fn test_mixed_transport_failure_ssh_variant() {
        let done = vec![done_task("h1", 0), done_task("h2", 255), done_task("h3", 0)];
        let tally = Tally::from_done(&done, &SshClassifier);
        assert_eq!(tally.succeeded.len(), 2);
        assert_eq!(tally.ssh_failed.len(), 1);
        assert_eq!(i32::from(tally.process_exit_code()), 4);
    }

    #[test]
    fn test_command_failure_ssh_variant() {
        let done = vec![done_task("h1", 7), done_task("h2", 0), done_task("h3", 0)];
        let tally = Tally::from_done(&done, &SshClassifier);
        assert_eq!(tally.cmd_failed.len(), 1);
        assert_eq!(i32::from(tally.process_exit_code()), 5);
    }

    #[test]
    fn test_killed_takes_priority_over_cmd_failed() {
        let done = vec![done_task("h1", 7), done_task("h2", -9)];
        let tally = Tally::from_done(&done, &SshClassifier);
        assert_eq!(i32::from(tally.process_exit_code()), 3);
    }

    #[test]
    fn test_transfer_variant_collapses_cmd_failure_into_transport() {
        let done = vec![done_task("h1", 7)];
        let tally = Tally::from_done(&done, &TransferClassifier);
        assert!(tally.cmd_failed.is_empty());
        assert_eq!(tally.ssh_failed.len(), 1);
        assert_eq!(i32::from(tally.process_exit_code()), 4);
    }
}
