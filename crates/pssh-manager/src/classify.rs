//! Result classification: the only axis the SSH/SCP/rsync variants differ on
//! (§4.7, §9 "Inheritance of Manager variants").

use pssh_core::Bucket;

/// Buckets a finished task's exit status. Implemented once per transport
/// variant; everything else in the `Manager` is shared.
pub trait Classifier {
    fn classify(&self, exit_status: i32) -> Bucket;
}

/// The `ssh` variant: exit 255 is a transport failure, distinct from other
/// non-zero command failures (§4.7).
#[derive(Debug, Clone, Copy, Default)]
pub struct SshClassifier;

impl Classifier for SshClassifier {
    fn classify(&self, exit_status: i32) -> Bucket {
        if exit_status < 0 {
            Bucket::Killed
        } else if exit_status == 255 {
            Bucket::SshFailed
        } else if exit_status != 0 {
            Bucket::CmdFailed
        } else {
            Bucket::Succeeded
        }
    }
}

/// The `scp`/`rsync` variant: any non-zero, non-negative status is folded
/// into `ssh_failed` — these tools don't distinguish transport failure from
/// command failure the way ssh's 255 convention does (§4.7).
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferClassifier;

impl Classifier for TransferClassifier {
    fn classify(&self, exit_status: i32) -> Bucket {
        if exit_status < 0 {
            Bucket::Killed
        } else if exit_status != 0 {
            Bucket::SshFailed
        } else {
            Bucket::Succeeded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_classifier_buckets() {
        let c = SshClassifier;
        assert_eq!(c.classify(0), Bucket::Succeeded);
        assert_eq!(c.classify(255), Bucket::SshFailed);
        assert_eq!(c.classify(7), Bucket::CmdFailed);
        assert_eq!(c.classify(-9), Bucket::Killed);
    }

    #[test]
    fn test_transfer_classifier_buckets() {
        let c = TransferClassifier;
        assert_eq!(c.classify(0), Bucket::Succeeded);
        assert_eq!(c.classify(255), Bucket::SshFailed);
        assert_eq!(c.classify(7), Bucket::SshFailed);
        assert_eq!(c.classify(-9), Bucket::Killed);
    }
}
