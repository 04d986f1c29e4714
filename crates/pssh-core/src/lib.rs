//! Shared types for the parallel task executor: host identity, classification
//! buckets, failure-reason vocabulary, and the option snapshots threaded
//! between the CLI, the `Manager`, and each `Task`.

pub mod error;
pub mod options;
pub mod types;

pub use error::PsshError;
pub use options::{ManagerConfig, TaskOptions};
pub use types::{failure_reason, Bucket, Host, ProcessExitCode, CANCELLED_EXIT_STATUS};
