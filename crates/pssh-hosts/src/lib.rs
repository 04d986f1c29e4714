//! Host-file/host-list resolution into a `ServerPool` (§3, §10.5).
//!
//! Mirrors the original tool's `hosts.py`/`psshutil` behavior: one or more
//! host files plus an optional explicit host list are merged in order,
//! `#`-comments and blank lines are skipped, an optional regex narrows the
//! pool, and an optional sample size draws a random subset without
//! replacement.

use std::fs;
use std::path::Path;

use pssh_core::{Host, PsshError};
use rand::seq::SliceRandom;
use regex::Regex;

/// Options controlling pool resolution, the Rust analogue of the original's
/// `options.host_files`/`host_strings`/`host_regexp`/`sample_size`.
#[derive(Debug, Clone, Default)]
pub struct HostResolveOptions {
    pub host_files: Vec<std::path::PathBuf>,
    pub host_strings: Vec<String>,
    pub default_user: Option<String>,
    pub host_regexp: Option<String>,
    pub sample_size: Option<usize>,
}

/// Ordered, immutable sequence of resolved `(host, port, user)` triples
/// (§3 "ServerPool").
#[derive(Debug, Clone, Default)]
pub struct ServerPool {
    hosts: Vec<Host>,
}

impl ServerPool {
    /// Resolves host files and explicit host strings, applies the regex
    /// filter, then samples, mirroring `hosts.py`'s `ServerPool.__init__`
    /// order of operations.
    pub fn resolve(opts: &HostResolveOptions) -> Result<Self, PsshError> {
        let mut hosts = Vec::new();
        for path in &opts.host_files {
            hosts.extend(read_host_file(path, opts.default_user.as_deref())?);
        }
        for s in &opts.host_strings {
            hosts.push(parse_host_string(s, opts.default_user.as_deref())?);
        }

        if let Some(pattern) = &opts.host_regexp {
            // Anchored at the start, matching Python's `re.match` semantics
            // that the original `ServerPool` filters with — unanchored
            // `is_match` would accept substrings the original rejects.
            let re = Regex::new(&format!("^(?:{pattern})"))
                .map_err(|e| PsshError::InvalidHostSpec(format!("bad --host-filter regex: {e}")))?;
            hosts.retain(|h| re.is_match(&h.host));
            if hosts.is_empty() {
                return Err(PsshError::SetupFailure(
                    "no hosts matched supplied regular expression".into(),
                ));
            }
        }

        if let Some(n) = opts.sample_size {
            if n == 0 {
                return Err(PsshError::SetupFailure("sample size cannot be zero".into()));
            }
            if n > hosts.len() {
                return Err(PsshError::SetupFailure(
                    "sample size larger than population".into(),
                ));
            }
            let mut rng = rand::thread_rng();
            hosts.shuffle(&mut rng);
            hosts.truncate(n);
        }

        Ok(Self { hosts })
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Host> {
        self.hosts.iter()
    }

    pub fn into_hosts(self) -> Vec<Host> {
        self.hosts
    }
}

impl<'a> IntoIterator for &'a ServerPool {
    type Item = &'a Host;
    type IntoIter = std::slice::Iter<'a, Host>;

    fn into_iter(self) -> Self::IntoIter {
        self.hosts.iter()
    }
}

/// Reads one host file: `#`-comments and blank lines skipped, one
/// `[user@]host[:port]` entry per remaining line.
fn read_host_file(path: &Path, default_user: Option<&str>) -> Result<Vec<Host>, PsshError> {
    let contents = fs::read_to_string(path)
        .map_err(|_| PsshError::HostFileNotFound(path.to_path_buf()))?;
    let mut hosts = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        hosts.push(parse_host_string(line, default_user)?);
    }
    Ok(hosts)
}

/// Parses one `[user@]host[:port]` entry.
fn parse_host_string(s: &str, default_user: Option<&str>) -> Result<Host, PsshError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(PsshError::InvalidHostSpec(s.to_string()));
    }

    let (user, rest) = match s.split_once('@') {
        Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
        _ => (default_user.map(str::to_string), s),
    };

    if rest.is_empty() {
        return Err(PsshError::InvalidHostSpec(s.to_string()));
    }

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() => {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| PsshError::InvalidHostSpec(s.to_string()))?;
            (host.to_string(), Some(port))
        }
        _ => (rest.to_string(), None),
    };

    Ok(Host::new(host, port, user))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_host() {
        let h = parse_host_string("db1", None).expect("parse");
        assert_eq!(h, Host::new("db1", None, None));
    }

    #[test]
    fn test_parse_user_and_port() {
        let h = parse_host_string("alice@db1:2222", None).expect("parse");
        assert_eq!(h, Host::new("db1", Some(2222), Some("alice".to_string())));
    }

    #[test]
    fn test_parse_uses_default_user_when_absent() {
        let h = parse_host_string("db1", Some("bob")).expect("parse");
        assert_eq!(h.user, Some("bob".to_string()));
    }

    #[test]
    fn test_parse_rejects_empty_string() {
        assert!(parse_host_string("", None).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_port() {
        assert!(parse_host_string("db1:notaport", None).is_err());
    }

    #[test]
    fn test_read_host_file_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hosts.txt");
        fs::write(&path, "# comment\n\ndb1\nalice@db2:22\n").expect("write");
        let hosts = read_host_file(&path, None).expect("read");
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].host, "db1");
        assert_eq!(hosts[1].user, Some("alice".to_string()));
    }

    #[test]
    fn test_read_host_file_missing_returns_host_file_not_found() {
        let err = read_host_file(Path::new("/nonexistent/hosts.txt"), None).unwrap_err();
        assert!(matches!(err, PsshError::HostFileNotFound(_)));
    }

    #[test]
    fn test_resolve_merges_files_and_strings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hosts.txt");
        fs::write(&path, "db1\ndb2\n").expect("write");
        let opts = HostResolveOptions {
            host_files: vec![path],
            host_strings: vec!["db3".to_string()],
            ..Default::default()
        };
        let pool = ServerPool::resolve(&opts).expect("resolve");
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_resolve_applies_regex_filter() {
        let opts = HostResolveOptions {
            host_strings: vec!["db1".to_string(), "web1".to_string(), "db2".to_string()],
            host_regexp: Some("^db".to_string()),
            ..Default::default()
        };
        let pool = ServerPool::resolve(&opts).expect("resolve");
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_resolve_regex_filter_matching_nothing_errors() {
        let opts = HostResolveOptions {
            host_strings: vec!["db1".to_string()],
            host_regexp: Some("^web".to_string()),
            ..Default::default()
        };
        assert!(ServerPool::resolve(&opts).is_err());
    }

    #[test]
    fn test_resolve_sample_size_rejects_zero() {
        let opts = HostResolveOptions {
            host_strings: vec!["db1".to_string()],
            sample_size: Some(0),
            ..Default::default()
        };
        assert!(ServerPool::resolve(&opts).is_err());
    }

    #[test]
    fn test_resolve_sample_size_rejects_too_large() {
        let opts = HostResolveOptions {
            host_strings: vec!["db1".to_string()],
            sample_size: Some(5),
            ..Default::default()
        };
        assert!(ServerPool::resolve(&opts).is_err());
    }

    #[test]
    fn test_resolve_sample_size_truncates_without_duplicates() {
        let opts = HostResolveOptions {
            host_strings: (0..10).map(|i| format!("db{i}")).collect(),
            sample_size: Some(4),
            ..Default::default()
        };
        let pool = ServerPool::resolve(&opts).expect("resolve");
        assert_eq!(pool.len(), 4);
        let unique: std::collections::HashSet<_> = pool.iter().map(|h| h.host.clone()).collect();
        assert_eq!(unique.len(), 4);
    }
}
