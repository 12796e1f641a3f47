//! Integration tests for the nm-vpn-service binary
//!
//! Only paths that never touch D-Bus are exercised here.

use assert_cmd::Command;
use predicates::prelude::*;

fn service() -> Command {
    Command::cargo_bin("nm-vpn-service").unwrap()
}

#[test]
fn test_help_command() {
    service()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--provider"))
        .stdout(predicate::str::contains("--session-bus"));
}

#[test]
fn test_unknown_provider_fails_fast() {
    service()
        .args(["--provider", "openvpn", "--session-bus"])
        .timeout(std::time::Duration::from_secs(10))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown provider 'openvpn'"))
        .stderr(predicate::str::contains("zerotier"));
}

#[test]
fn test_provider_is_required() {
    service()
        .assert()
        .failure()
        .stderr(predicate::str::contains("--provider"));
}

#[test]
fn test_invalid_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("service.toml");
    std::fs::write(&path, "graceful_exit_timeout_secs = \"soon\"\n").unwrap();

    service()
        .args(["--provider", "n2n", "--session-bus", "--config"])
        .arg(&path)
        .env("NM_VPN_LOG_SYSLOG", "0")
        .timeout(std::time::Duration::from_secs(10))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid service configuration"));
}
