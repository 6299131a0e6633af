//! CLI smoke tests.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn tern(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tern").unwrap();
    cmd.env("TERN_HOME", home.path());
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    let home = TempDir::new().unwrap();
    tern(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("conversations"))
        .stdout(predicate::str::contains("exec"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_config_path_respects_tern_home() {
    let home = TempDir::new().unwrap();
    tern(&home)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn test_config_init_is_idempotent() {
    let home = TempDir::new().unwrap();
    tern(&home)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created"));
    tern(&home)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("already exists"));
}

#[test]
fn test_conversation_new_list_show_roundtrip() {
    let home = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();

    let output = tern(&home)
        .args([
            "conversations",
            "new",
            "--repo",
            repo.path().to_str().unwrap(),
            "--id",
            "demo",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(String::from_utf8_lossy(&output).trim(), "demo");

    tern(&home)
        .args(["conversations", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("demo"))
        .stdout(predicate::str::contains("agent"));

    tern(&home)
        .args(["conversations", "show", "demo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("empty"));
}

#[test]
fn test_conversation_new_research_kind() {
    let home = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();

    tern(&home)
        .args([
            "conversations",
            "new",
            "--repo",
            repo.path().to_str().unwrap(),
            "--id",
            "res",
            "--research",
        ])
        .assert()
        .success();

    tern(&home)
        .args(["conversations", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("research"));
}

#[test]
fn test_show_unknown_conversation_fails() {
    let home = TempDir::new().unwrap();
    tern(&home)
        .args(["conversations", "show", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope"));
}
