//! The scheduler: admission, the poll-driven event loop, result
//! classification, and the test-gate controller (§4.5, §4.6, §4.7).

pub mod classify;
pub mod manager;
pub mod reporter;
pub mod tally;

pub use classify::{Classifier, SshClassifier, TransferClassifier};
pub use manager::{Manager, RunOutcome};
pub use reporter::{NoopReporter, Reporter};
pub use tally::Tally;
