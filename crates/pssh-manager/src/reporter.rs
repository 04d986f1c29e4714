//! Reporting hook invoked as tasks finish (§4.7). Colorized summaries,
//! progress-bar rendering, and the interactive confirmation prompt are
//! external collaborators (§1); this trait is the seam the CLI's `ui`
//! module implements.

use crate::tally::Tally;
use pssh_process::Task;

pub trait Reporter {
    /// Called once per task, in completion order, immediately after it is
    /// marked done and assigned a sequence number.
    fn task_done(&mut self, task: &Task);

    /// Called after a test-gate batch completes, before the operator is
    /// asked to confirm continuing (§4.6).
    fn batch_complete(&mut self, _tally: &Tally) {}
}

/// Reporter that does nothing; used by tests and as the default when no
/// outer-ring UI is wired in.
#[derive(Debug, Default)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn task_done(&mut self, _task: &Task) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pssh_core::{Host, TaskOptions};

    #[test]
    fn test_noop_reporter_does_not_panic() {
        let mut r = NoopReporter;
        let task = Task::new(Host::new("h1", None, None), vec!["true".into()], None, TaskOptions::default());
        r.task_done(&task);
        r.batch_complete(&Tally::default());
    }
}
