//! Black-box tests driving the `pssh` binary directly (§8/§10.4), rather
//! than going through `Manager` in-process.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_no_hosts_fails_with_clear_message() {
    Command::cargo_bin("pssh")
        .expect("binary built")
        .arg("--")
        .arg("uptime")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no hosts to run against"));
}

#[test]
fn test_help_lists_core_flags() {
    Command::cargo_bin("pssh")
        .expect("binary built")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--host"))
        .stdout(predicate::str::contains("--hosts-file"));
}

#[test]
fn test_askpass_without_helper_on_path_fails_before_spawning() {
    Command::cargo_bin("pssh")
        .expect("binary built")
        .env("PATH", "/nonexistent")
        .arg("--host")
        .arg("example.invalid")
        .arg("-A")
        .arg("--")
        .arg("uptime")
        .assert()
        .failure()
        .stderr(predicate::str::contains("pssh-askpass-helper"));
}
