/// Error taxonomy for the scheduler's own failures.
///
/// Per-task outcomes (transport failure, command failure, timeout,
/// interrupt) are never represented here: they are data carried on the
/// `Task` itself (`failure_reasons` + `exit_status`) so that one host's
/// trouble can never unwind the event loop. `PsshError` is reserved for the
/// two categories the design calls out as loop-terminating: `Fatal` and
/// `SetupFailure`.
#[derive(thiserror::Error, Debug)]
pub enum PsshError {
    #[error("setup failed: {0}")]
    SetupFailure(String),

    #[error("fatal scheduler error: {0}")]
    Fatal(String),

    #[error("host file not found: {0}")]
    HostFileNotFound(std::path::PathBuf),

    #[error("invalid host spec '{0}': expected [user@]host[:port]")]
    InvalidHostSpec(String),

    #[error("failed to register fd {fd} with the event loop: {reason}")]
    IoRegistrationFailed { fd: i32, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("signal/syscall error: {0}")]
    Errno(#[from] nix::errno::Errno),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_setup_failure() {
        let err = PsshError::SetupFailure("outdir does not exist".into());
        assert_eq!(
            err.to_string(),
            "setup failed: outdir does not exist"
        );
    }

    #[test]
    fn test_display_fatal() {
        let err = PsshError::Fatal("wakeup pipe closed".into());
        assert_eq!(err.to_string(), "fatal scheduler error: wakeup pipe closed");
    }

    #[test]
    fn test_display_host_file_not_found() {
        let err = PsshError::HostFileNotFound("/tmp/nope".into());
        assert_eq!(err.to_string(), "host file not found: /tmp/nope");
    }

    #[test]
    fn test_display_invalid_host_spec() {
        let err = PsshError::InvalidHostSpec("::::".into());
        assert_eq!(
            err.to_string(),
            "invalid host spec '::::': expected [user@]host[:port]"
        );
    }

    #[test]
    fn test_display_io_registration_failed() {
        let err = PsshError::IoRegistrationFailed {
            fd: 7,
            reason: "duplicate read registration".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to register fd 7 with the event loop: duplicate read registration"
        );
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PsshError>();
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::other("boom");
        let err: PsshError = io_err.into();
        assert!(err.to_string().contains("boom"));
    }
}
