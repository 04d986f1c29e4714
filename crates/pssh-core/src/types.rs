use serde::{Deserialize, Serialize};
use std::fmt;

/// One resolved `(host, port, user)` triple, part of a `ServerPool`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Host {
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
}

impl Host {
    pub fn new(host: impl Into<String>, port: Option<u16>, user: Option<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user,
        }
    }

    /// Pretty display name, e.g. `user@host:port`, used for reporting and
    /// as the basename for per-host output files.
    pub fn display_name(&self) -> String {
        let mut s = String::new();
        if let Some(user) = &self.user {
            s.push_str(user);
            s.push('@');
        }
        s.push_str(&self.host);
        if let Some(port) = self.port {
            s.push(':');
            s.push_str(&port.to_string());
        }
        s
    }

    /// The filename stem for writer output: the bare host label, without
    /// user/port — matches the on-disk naming convention in §6.
    pub fn file_label(&self) -> &str {
        &self.host
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// Classification bucket a finished task falls into (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Succeeded,
    SshFailed,
    CmdFailed,
    Killed,
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Bucket::Succeeded => "succeeded",
            Bucket::SshFailed => "ssh_failed",
            Bucket::CmdFailed => "cmd_failed",
            Bucket::Killed => "killed",
        };
        f.write_str(s)
    }
}

/// Standard failure-reason strings recorded on a `Task` (§4.3, §7).
pub mod failure_reason {
    pub const TIMED_OUT: &str = "Timed out";
    pub const INTERRUPTED: &str = "Interrupted";
    pub const CANCELLED: &str = "Cancelled";

    pub fn exited_with_code(code: i32) -> String {
        format!("Exited with error code {code}")
    }
}

/// Sentinel exit status assigned to cancelled (never-started) tasks.
/// Negative, like a signal-kill exit status, so the universal `killed`
/// predicate (`exitstatus < 0`) classifies it correctly.
pub const CANCELLED_EXIT_STATUS: i32 = -1;

/// Process-wide exit code computed by the reporter (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ProcessExitCode {
    AllSucceeded = 0,
    AnyKilled = 3,
    AnyTransportFailure = 4,
    AnyCommandFailure = 5,
}

impl From<ProcessExitCode> for i32 {
    fn from(value: ProcessExitCode) -> Self {
        value as i32
    }
}
