use assert_cmd::Command;
use predicates::prelude::*;
use std::fs::write;
use tempfile::NamedTempFile;

#[test]
fn help_lists_serve_subcommand() {
    let mut cmd = Command::cargo_bin("doxygen-service").expect("Binary exists");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"));
}

#[test]
fn serve_fails_on_unreadable_config() {
    let mut cmd = Command::cargo_bin("doxygen-service").expect("Binary exists");
    cmd.args(["serve", "--config", "/definitely/not/here/service.yaml"])
        .assert()
        .failure();
}

#[test]
fn serve_fails_on_invalid_config() {
    let config = NamedTempFile::new().expect("Creating temp config file failed");
    write(config.path(), "generator:\n  timeout_secs: 0\n").expect("Writing temp config failed");

    let mut cmd = Command::cargo_bin("doxygen-service").expect("Binary exists");
    cmd.arg("serve")
        .arg("--config")
        .arg(config.path())
        .env_remove("DOXYGEN_TEMPLATE_CONF")
        .assert()
        .failure();
}
