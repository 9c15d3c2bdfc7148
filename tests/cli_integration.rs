//! Integration tests for the director command line
//!
//! These run the built binary against scratch configuration files.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::time;

const BASIC_CONFIG: &str = "\
# Director configuration used by the CLI tests
[director]
messaging = no
poll_time = 0.1

[agency]
disabled = yes

[reader]
cat = swipe
agent = agency.testing.fake

[logging]
level = debug
";

fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join("director.cfg");
    fs::write(&path, contents).expect("Failed to write config");
    path
}

async fn director(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_director"))
        .args(args)
        .output()
        .await
        .expect("Failed to run director")
}

#[tokio::test]
async fn test_help_lists_commands() {
    let output = director(&["--help"]).await;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["run", "check", "export"] {
        assert!(stdout.contains(command), "help should mention {}", command);
    }
}

#[tokio::test]
async fn test_check_prints_ordered_records() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, BASIC_CONFIG);
    let output = director(&["--config", path.to_str().unwrap(), "check"]).await;

    assert!(output.status.success(), "check should pass");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let director_at = stdout.find("<Director").expect("director listed");
    let agency_at = stdout.find("<Agency").expect("agency listed");
    assert!(director_at < agency_at);
    assert!(stdout.contains("reader"));
    assert!(stdout.contains("Configuration OK"));
}

#[tokio::test]
async fn test_check_fails_without_director() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[proc]\ncontroller = director.controllers.commandline\n");
    let output = director(&["--config", path.to_str().unwrap(), "check"]).await;

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("director"));
}

#[tokio::test]
async fn test_missing_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nope.cfg");
    let output = director(&["--config", path.to_str().unwrap(), "check"]).await;
    assert_eq!(output.status.code(), Some(1));
}

#[tokio::test]
async fn test_export_json_and_yaml() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, BASIC_CONFIG);

    let output = director(&["--config", path.to_str().unwrap(), "export"]).await;
    assert!(output.status.success());
    let snapshot: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("export should be JSON");
    assert_eq!(snapshot["director"]["name"], "director");
    assert_eq!(snapshot["broker"], "");
    assert!(snapshot["filename"].as_str().unwrap().ends_with("director.cfg"));

    let output = director(&[
        "--config",
        path.to_str().unwrap(),
        "export",
        "--format",
        "yaml",
    ])
    .await;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("filename:"));
}

#[tokio::test]
async fn test_run_keeps_going_until_killed() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, BASIC_CONFIG);

    let mut child = Command::new(env!("CARGO_BIN_EXE_director"))
        .args(["--config", path.to_str().unwrap(), "run"])
        .kill_on_drop(true)
        .spawn()
        .expect("Failed to start director");

    // Still supervising after a few poll intervals
    let waited = time::timeout(Duration::from_millis(500), child.wait()).await;
    assert!(waited.is_err(), "run should not exit on its own");
    child.kill().await.unwrap();
}
