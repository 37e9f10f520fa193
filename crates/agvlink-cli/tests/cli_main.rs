//! Basic CLI tests for the agvlink command-line interface.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

/// Test that the CLI binary exists and shows help.
#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("agvlink").unwrap();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Telegram dispatch for AGV fleets"))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("decode"))
        .stdout(predicate::str::contains("check"));
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("agvlink").unwrap();
    cmd.arg("--version");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("agvlink"));
}

#[test]
fn test_no_subcommand_shows_error() {
    let mut cmd = Command::cargo_bin("agvlink").unwrap();

    cmd.assert().failure();
}

#[test]
fn test_decode_default_format() {
    let mut cmd = Command::cargo_bin("agvlink").unwrap();
    cmd.args(["decode", "agv-1,rptpos,17,0,A;idle"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"deviceId\": \"agv-1\""))
        .stdout(predicate::str::contains("\"commandKey\": \"rptpos\""))
        .stdout(predicate::str::contains("\"code\": \"17\""))
        .stdout(predicate::str::contains("\"payload\": \"A;idle\""));
}

#[test]
fn test_decode_rejects_short_telegram() {
    let mut cmd = Command::cargo_bin("agvlink").unwrap();
    cmd.args(["decode", "agv-1,rptpos"]);

    cmd.assert().failure();
}

#[test]
fn test_decode_with_framed_format() {
    let config = write_config(
        r###"
[matcher]
format = "delimited"
separator = ";"
prefix = "##"
suffix = "##"
"###,
    );
    let mut cmd = Command::cargo_bin("agvlink").unwrap();
    cmd.args(["decode", "##agv-2;setrout;5;0;A>B##", "--config"])
        .arg(config.path());

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"deviceId\": \"agv-2\""))
        .stdout(predicate::str::contains("\"payload\": \"A>B\""));
}

#[test]
fn test_check_lists_vehicles() {
    let config = write_config(
        r#"
[[vehicles]]
name = "agv-1"
host = "10.0.0.5"
port = 4001
device_address = '[{"deviceId": "charger-1"}]'
"#,
    );
    let mut cmd = Command::cargo_bin("agvlink").unwrap();
    cmd.arg("check").arg("--config").arg(config.path());

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("1 vehicle(s)"))
        .stdout(predicate::str::contains("agv-1 at 10.0.0.5:4001"))
        .stdout(predicate::str::contains("charger-1"));
}

#[test]
fn test_check_rejects_privileged_port() {
    let config = write_config(
        r#"
[[vehicles]]
name = "agv-1"
host = "10.0.0.5"
port = 80
"#,
    );
    let mut cmd = Command::cargo_bin("agvlink").unwrap();
    cmd.arg("check").arg("--config").arg(config.path());

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("agv-1"));
}

#[test]
fn test_serve_requires_readable_config() {
    let mut cmd = Command::cargo_bin("agvlink").unwrap();
    cmd.args(["serve", "--config", "/nonexistent/agvlink.toml"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("loading configuration"));
}
