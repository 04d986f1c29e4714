//! Layered configuration: `toml` file < `PSSH_*` environment variables <
//! `clap` CLI flags (§10.3). CLI always wins; each layer only overrides
//! fields the layer above it actually set.

use std::path::PathBuf;

use clap::Parser;
use pssh_core::{ManagerConfig, PsshError};
use serde::Deserialize;
use tracing::{debug, warn};

/// CLI surface, one flag per `ManagerConfig`/host-resolution field plus the
/// transport variant and command to run (§10.3, §10.5).
#[derive(Debug, Parser)]
#[command(name = "pssh", about = "Run a command in parallel across many hosts over SSH")]
pub struct Cli {
    /// Host to target; may be repeated. `[user@]host[:port]`.
    #[arg(long = "host", value_name = "HOST")]
    pub hosts: Vec<String>,

    /// Host file to read, `user@host:port` per line. May be repeated.
    #[arg(short = 'h', long = "hosts-file", value_name = "FILE")]
    pub host_files: Vec<PathBuf>,

    /// Default user for hosts that don't specify one.
    #[arg(short = 'l', long)]
    pub user: Option<String>,

    /// Regex restricting the resolved pool to matching host labels.
    #[arg(long = "host-filter")]
    pub host_filter: Option<String>,

    /// Randomly sample this many hosts from the resolved pool.
    #[arg(long = "limit")]
    pub limit: Option<usize>,

    #[arg(short = 'p', long)]
    pub par: Option<usize>,

    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    #[arg(short = 'o', long)]
    pub outdir: Option<PathBuf>,

    #[arg(short = 'e', long)]
    pub errdir: Option<PathBuf>,

    #[arg(short = 'A', long)]
    pub askpass: bool,

    #[arg(short = 'v', long)]
    pub verbose: bool,

    #[arg(long)]
    pub summary: bool,

    /// Disable the progress bar even if otherwise enabled.
    #[arg(long)]
    pub no_progress_bar: bool,

    #[arg(short = 'i', long)]
    pub inline: bool,

    #[arg(short = 'P', long = "print")]
    pub print_out: bool,

    /// Run only this many tasks first, then prompt before continuing (§4.6).
    #[arg(long = "test-cases")]
    pub test_cases: Option<usize>,

    /// Write `<prefix>.passed.lst`/`.failed.lst` on completion (§4.7).
    #[arg(long = "fork-hosts")]
    pub fork_hosts: Option<PathBuf>,

    /// Path to a JSON-lines export of each completed task (§4.2, §9).
    #[arg(long = "export")]
    pub export: Option<PathBuf>,

    /// Explicit config file path; overrides the XDG-style default search.
    #[arg(long = "config-file")]
    pub config_file: Option<PathBuf>,

    /// The command to run on each host (ssh variant) or local argv prefix
    /// (scp/rsync variants build their own from `--outdir`-style flags).
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

/// The toml file layer; every field optional so a partial file only
/// overrides what it names (§10.3).
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    par: Option<usize>,
    timeout: Option<u64>,
    outdir: Option<PathBuf>,
    errdir: Option<PathBuf>,
    askpass: Option<bool>,
    verbose: Option<bool>,
    summary: Option<bool>,
    progress_bar: Option<bool>,
    inline: Option<bool>,
    print_out: Option<bool>,
    test_cases: Option<usize>,
    fork_hosts: Option<PathBuf>,
}

/// Fully resolved configuration, ready to drive `ServerPool` resolution and
/// the `Manager` (§10.3).
#[derive(Debug, Clone)]
pub struct PsshConfig {
    pub manager: ManagerConfig,
    pub hosts: Vec<String>,
    pub host_files: Vec<PathBuf>,
    pub user: Option<String>,
    pub host_filter: Option<String>,
    pub limit: Option<usize>,
    pub export: Option<PathBuf>,
    pub command: Vec<String>,
}

impl PsshConfig {
    /// Assembles the layered configuration: file, then env, then CLI
    /// (ascending precedence; §10.3).
    pub fn load(cli: Cli) -> Result<Self, PsshError> {
        let file = load_file_layer(cli.config_file.as_deref())?;

        let mut manager = ManagerConfig {
            par: file.par.unwrap_or(32),
            timeout: file.timeout.unwrap_or(0),
            outdir: file.outdir.clone(),
            errdir: file.errdir.clone(),
            askpass: file.askpass.unwrap_or(false),
            verbose: file.verbose.unwrap_or(false),
            summary: file.summary.unwrap_or(false),
            progress_bar: file.progress_bar.unwrap_or(true),
            inline: file.inline.unwrap_or(false),
            print_out: file.print_out.unwrap_or(false),
            test_cases: file.test_cases,
            fork_hosts: file.fork_hosts.clone(),
        };

        apply_env_layer(&mut manager);

        if let Some(v) = cli.par {
            manager.par = v;
        }
        if let Some(v) = cli.timeout {
            manager.timeout = v;
        }
        if cli.outdir.is_some() {
            manager.outdir = cli.outdir.clone();
        }
        if cli.errdir.is_some() {
            manager.errdir = cli.errdir.clone();
        }
        if cli.askpass {
            manager.askpass = true;
        }
        if cli.verbose {
            manager.verbose = true;
        }
        if cli.summary {
            manager.summary = true;
        }
        if cli.no_progress_bar {
            manager.progress_bar = false;
        }
        if cli.inline {
            manager.inline = true;
        }
        if cli.print_out {
            manager.print_out = true;
        }
        if cli.test_cases.is_some() {
            manager.test_cases = cli.test_cases;
        }
        if cli.fork_hosts.is_some() {
            manager.fork_hosts = cli.fork_hosts.clone();
        }

        Ok(Self {
            manager,
            hosts: cli.hosts,
            host_files: cli.host_files,
            user: cli.user,
            host_filter: cli.host_filter,
            limit: cli.limit,
            export: cli.export,
            command: cli.command,
        })
    }
}

fn load_file_layer(explicit_path: Option<&std::path::Path>) -> Result<FileConfig, PsshError> {
    let path = match explicit_path {
        Some(p) => Some(p.to_path_buf()),
        None => default_config_path(),
    };
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => toml::from_str(&contents)
            .map_err(|e| PsshError::SetupFailure(format!("invalid config file {path:?}: {e}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("no config file at {path:?}, using defaults");
            Ok(FileConfig::default())
        }
        Err(e) => Err(PsshError::SetupFailure(format!(
            "failed to read config file {path:?}: {e}"
        ))),
    }
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "pssh")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Applies `PSSH_*` environment overrides (§10.3). Unrecognized or
/// unparseable values are logged and skipped rather than treated as fatal,
/// since env layering is best-effort by convention.
fn apply_env_layer(manager: &mut ManagerConfig) {
    if let Some(v) = env_usize("PSSH_PAR") {
        manager.par = v;
    }
    if let Some(v) = env_u64("PSSH_TIMEOUT") {
        manager.timeout = v;
    }
    if let Ok(v) = std::env::var("PSSH_OUTDIR") {
        manager.outdir = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("PSSH_ERRDIR") {
        manager.errdir = Some(PathBuf::from(v));
    }
    if let Some(v) = env_bool("PSSH_ASKPASS") {
        manager.askpass = v;
    }
    if let Some(v) = env_bool("PSSH_VERBOSE") {
        manager.verbose = v;
    }
    if let Some(v) = env_bool("PSSH_SUMMARY") {
        manager.summary = v;
    }
    if let Some(v) = env_bool("PSSH_PROGRESS_BAR") {
        manager.progress_bar = v;
    }
    if let Some(v) = env_bool("PSSH_INLINE") {
        manager.inline = v;
    }
    if let Some(v) = env_bool("PSSH_PRINT_OUT") {
        manager.print_out = v;
    }
    if let Some(v) = env_usize("PSSH_TEST_CASES") {
        manager.test_cases = Some(v);
    }
    if let Ok(v) = std::env::var("PSSH_FORK_HOSTS") {
        manager.fork_hosts = Some(PathBuf::from(v));
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| {
        v.parse()
            .inspect_err(|e| warn!("ignoring {key}={v:?}: {e}"))
            .ok()
    })
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| {
        v.parse()
            .inspect_err(|e| warn!("ignoring {key}={v:?}: {e}"))
            .ok()
    })
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|v| match v.as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        other => {
            warn!("ignoring {key}={other:?}: expected 1/0/true/false/yes/no");
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            hosts: vec![],
            host_files: vec![],
            user: None,
            host_filter: None,
            limit: None,
            par: None,
            timeout: None,
            outdir: None,
            errdir: None,
            askpass: false,
            verbose: false,
            summary: false,
            no_progress_bar: false,
            inline: false,
            print_out: false,
            test_cases: None,
            fork_hosts: None,
            export: None,
            config_file: None,
            command: vec![],
        }
    }

    #[test]
    #[serial_test::serial(pssh_par_env)]
    fn test_defaults_when_nothing_configured() {
        std::env::remove_var("PSSH_PAR");
        let cli = base_cli();
        let cfg = PsshConfig::load(cli).expect("load");
        assert_eq!(cfg.manager.par, 32);
        assert!(cfg.manager.progress_bar);
    }

    #[test]
    fn test_file_layer_applies_from_explicit_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "par = 8\ntimeout = 30\n").expect("write");
        let mut cli = base_cli();
        cli.config_file = Some(path);
        let cfg = PsshConfig::load(cli).expect("load");
        assert_eq!(cfg.manager.par, 8);
        assert_eq!(cfg.manager.timeout, 30);
    }

    #[test]
    fn test_cli_overrides_file_layer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "par = 8\n").expect("write");
        let mut cli = base_cli();
        cli.config_file = Some(path);
        cli.par = Some(64);
        let cfg = PsshConfig::load(cli).expect("load");
        assert_eq!(cfg.manager.par, 64);
    }

    #[test]
    #[serial_test::serial(pssh_par_env)]
    fn test_env_layer_overrides_file_but_not_cli() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "par = 8\n").expect("write");
        std::env::set_var("PSSH_PAR", "16");
        let mut cli = base_cli();
        cli.config_file = Some(path);
        let cfg = PsshConfig::load(cli).expect("load");
        assert_eq!(cfg.manager.par, 16);
        std::env::remove_var("PSSH_PAR");
    }

    #[test]
    fn test_missing_config_file_is_not_fatal() {
        let mut cli = base_cli();
        cli.config_file = Some(PathBuf::from("/nonexistent/pssh-config.toml"));
        let cfg = PsshConfig::load(cli).expect("load");
        assert_eq!(cfg.manager.par, 32);
    }

    #[test]
    fn test_malformed_config_file_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "par = [this is not valid toml").expect("write");
        let mut cli = base_cli();
        cli.config_file = Some(path);
        assert!(PsshConfig::load(cli).is_err());
    }
}
