//! Exit codes and messages of the `daq-session` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::net::TcpListener;

/// Binary run from an empty directory so no stray defaults file is picked up.
fn daq_session(dir: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("daq-session").unwrap();
    cmd.current_dir(dir.path()).env_remove("RUST_LOG");
    cmd
}

fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn test_help_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    daq_session(&dir)
        .arg("--help")
        .assert()
        .code(0)
        .stdout(predicate::str::contains("stream"));
}

#[test]
fn test_version_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    daq_session(&dir).arg("--version").assert().code(0);
}

#[test]
fn test_usage_error_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    daq_session(&dir)
        .args(["stream", "--no-such-flag"])
        .assert()
        .code(1);

    daq_session(&dir)
        .args(["stream", "--host", "127.0.0.1", "--duration", "soon"])
        .assert()
        .code(1);
}

#[test]
fn test_both_targets_rejected_before_connecting() {
    let dir = tempfile::tempdir().unwrap();
    daq_session(&dir)
        .args(["stream", "--host", "127.0.0.1", "--serial", "/dev/ttyUSB0"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("error: InvalidTarget"))
        .stderr(predicate::str::contains("Connecting").not());
}

#[test]
fn test_missing_target_rejected() {
    let dir = tempfile::tempdir().unwrap();
    daq_session(&dir)
        .args(["stream", "--limit", "10"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no target given"));
}

#[test]
fn test_unreachable_device_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let port = closed_port().to_string();
    daq_session(&dir)
        .args([
            "stream",
            "--host",
            "127.0.0.1",
            "--port",
            port.as_str(),
            "--connect-attempts",
            "1",
            "--connect-timeout",
            "500",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("error: ConnectError"));
}

#[test]
fn test_missing_config_file_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    daq_session(&dir)
        .args(["--config", "absent.toml", "ports"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("config file not found"));
}

#[test]
fn test_defaults_file_is_validated() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("daq-session.toml"), "log_level = \"loud\"\n").unwrap();
    daq_session(&dir)
        .args(["stream", "--host", "127.0.0.1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Invalid log_level"));
}
