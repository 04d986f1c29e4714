//! Builds the child argv for the `ssh`/`scp`/`rsync` variant from a
//! `PsshConfig` plus the resolved host and command (§10.5, §1 "out of
//! scope: construction of the per-host argv").

use pssh_core::Host;

/// Which external transport binary a run invokes; selects the `Classifier`
/// and the argv shape (§4.7, §9 "Inheritance of Manager variants").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Ssh,
    Scp,
    Rsync,
}

impl Variant {
    pub fn program(self) -> &'static str {
        match self {
            Variant::Ssh => "ssh",
            Variant::Scp => "scp",
            Variant::Rsync => "rsync",
        }
    }
}

/// Builds the ssh variant's argv: `ssh [-l user] [-p port] host -- command...`.
pub fn ssh_argv(host: &Host, command: &[String]) -> Vec<String> {
    let mut argv = vec!["ssh".to_string()];
    argv.push("-o".to_string());
    argv.push("NumberOfPasswordPrompts=1".to_string());
    if let Some(user) = &host.user {
        argv.push("-l".to_string());
        argv.push(user.clone());
    }
    if let Some(port) = host.port {
        argv.push("-p".to_string());
        argv.push(port.to_string());
    }
    argv.push(host.host.clone());
    if !command.is_empty() {
        argv.extend(command.iter().cloned());
    }
    argv
}

/// Builds the scp variant's argv copying `local_path` to `user@host:remote_path`.
pub fn scp_argv(host: &Host, local_path: &str, remote_path: &str, recursive: bool) -> Vec<String> {
    let mut argv = vec!["scp".to_string()];
    if recursive {
        argv.push("-r".to_string());
    }
    if let Some(port) = host.port {
        argv.push("-P".to_string());
        argv.push(port.to_string());
    }
    argv.push(local_path.to_string());
    argv.push(format!("{}:{}", host.display_name(), remote_path));
    argv
}

/// Builds the rsync-over-ssh variant's argv.
pub fn rsync_argv(host: &Host, local_path: &str, remote_path: &str) -> Vec<String> {
    let mut ssh_cmd = "ssh".to_string();
    if let Some(port) = host.port {
        ssh_cmd.push_str(&format!(" -p {port}"));
    }
    vec![
        "rsync".to_string(),
        "-az".to_string(),
        "-e".to_string(),
        ssh_cmd,
        local_path.to_string(),
        format!("{}:{}", host.display_name(), remote_path),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_argv_bare_host() {
        let host = Host::new("db1", None, None);
        let argv = ssh_argv(&host, &["uptime".to_string()]);
        assert_eq!(
            argv,
            vec!["ssh", "-o", "NumberOfPasswordPrompts=1", "db1", "uptime"]
        );
    }

    #[test]
    fn test_ssh_argv_with_user_and_port() {
        let host = Host::new("db1", Some(2222), Some("alice".to_string()));
        let argv = ssh_argv(&host, &["uptime".to_string()]);
        assert_eq!(
            argv,
            vec![
                "ssh",
                "-o",
                "NumberOfPasswordPrompts=1",
                "-l",
                "alice",
                "-p",
                "2222",
                "db1",
                "uptime"
            ]
        );
    }

    #[test]
    fn test_scp_argv_builds_remote_target() {
        let host = Host::new("db1", Some(22), Some("alice".to_string()));
        let argv = scp_argv(&host, "local.txt", "/remote/dir/", false);
        assert_eq!(
            argv,
            vec!["scp", "-P", "22", "local.txt", "alice@db1:/remote/dir/"]
        );
    }

    #[test]
    fn test_rsync_argv_uses_ssh_transport() {
        let host = Host::new("db1", Some(2222), None);
        let argv = rsync_argv(&host, "local/", "/remote/dir/");
        assert_eq!(
            argv,
            vec!["rsync", "-az", "-e", "ssh -p 2222", "local/", "db1:/remote/dir/"]
        );
    }
}
