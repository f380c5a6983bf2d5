//! Command-line behaviour that needs no directory

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("gpoctl.toml");
    let contents = format!(
        r#"[directory]
url = "ldap://dc1.example.com"
password = "hunter2"

[sysvol]
root = "{}"

[store]
strategy = "direct"

[signing]
keys_dir = "{}"
"#,
        dir.join("sysvol").display(),
        dir.join("keys").display()
    );
    std::fs::write(&path, contents).unwrap();
    path
}

fn gpoctl() -> Command {
    let mut cmd = Command::cargo_bin("gpoctl").unwrap();
    cmd.env_remove("GPO_REGISTRY_PASSWORD").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_lists_commands() {
    gpoctl()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Group Policy"))
        .stdout(predicate::str::contains("scripts"))
        .stdout(predicate::str::contains("unlink"));
}

#[test]
fn test_config_is_redacted() {
    let tmp = tempdir().unwrap();
    let config = write_config(tmp.path());
    gpoctl()
        .arg("--config")
        .arg(&config)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"strategy\": \"direct\""))
        .stdout(predicate::str::contains("********"))
        .stdout(predicate::str::contains("hunter2").not());
}

#[test]
fn test_password_from_environment() {
    let tmp = tempdir().unwrap();
    let config = write_config(tmp.path());
    gpoctl()
        .env("GPO_REGISTRY_PASSWORD", "from-env")
        .arg("--config")
        .arg(&config)
        .arg("--controller")
        .arg("dc2.example.com")
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("dc2.example.com"))
        .stdout(predicate::str::contains("from-env").not());
}

#[test]
fn test_missing_config_file() {
    let tmp = tempdir().unwrap();
    gpoctl()
        .arg("--config")
        .arg(tmp.path().join("absent.toml"))
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration file not found"));
}

#[test]
fn test_keys_list_empty() {
    let tmp = tempdir().unwrap();
    let config = write_config(tmp.path());
    gpoctl()
        .arg("--config")
        .arg(&config)
        .args(["keys", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("{}"));
}

#[test]
fn test_invalid_guid_is_reported_as_json() {
    let tmp = tempdir().unwrap();
    let config = write_config(tmp.path());
    gpoctl()
        .arg("--config")
        .arg(&config)
        .args(["get", "not-a-guid"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("\"code\": \"INVALID_INPUT\""))
        .stderr(predicate::str::contains("\"status\": 400"));
}

#[test]
fn test_scripts_add_needs_a_source() {
    gpoctl()
        .args(["scripts", "add", "{31B2F340-016D-11D2-945F-00C04FB984F9}", "login"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--file"));
}
