//! Integration tests for the crosspost-send daemon
//!
//! Platforms are small `sh` scripts, so these tests only run on Unix.
#![cfg(unix)]

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

/// Config with one working and one failing platform
fn setup_test_env(retry_limit: u32) -> (TempDir, String) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");

    let config_content = format!(
        r#"
[queue]
tick_interval = "10ms"
retry_limit = {retry_limit}
retry_base_delay = "20ms"

[logging]
level = "error"

[[platforms]]
id = "toutiao"
command = "sh"
args = ["-c", "cat > /dev/null; echo '{{\"id\": \"article-1\"}}'"]

[[platforms]]
id = "douyin"
command = "sh"
args = ["-c", "cat > /dev/null; echo 'network: upstream unreachable' >&2; exit 1"]
"#
    );
    fs::write(&config_path, config_content).unwrap();

    (temp_dir, config_path.to_str().unwrap().to_string())
}

fn daemon(config_path: &str) -> Command {
    let mut cmd = Command::cargo_bin("crosspost-send").unwrap();
    cmd.arg("--config")
        .arg(config_path)
        .arg("--exit-when-idle")
        .env_remove("CROSSPOST_LOG_LEVEL")
        .env_remove("CROSSPOST_LOG_FORMAT")
        .timeout(Duration::from_secs(30));
    cmd
}

fn output_lines(output: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(output)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn finished_status(lines: &[Value]) -> Option<String> {
    lines
        .iter()
        .filter_map(|l| l.get("event"))
        .find(|e| e["type"] == "finished")
        .map(|e| e["status"].as_str().unwrap().to_string())
}

// BASIC FUNCTIONALITY TESTS

#[test]
fn test_submit_completes_and_streams_events() {
    let (_temp_dir, config_path) = setup_test_env(0);

    let output = daemon(&config_path)
        .write_stdin(
            r#"{"op":"submit","content":{"title":"Hello","body":"World"},"platforms":["toutiao"]}"#
                .to_string()
                + "\n",
        )
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let lines = output_lines(&output);
    let response = &lines[0];
    assert_eq!(response["ok"], true);
    assert_eq!(response["op"], "submit");
    assert!(response["result"]["task_id"].as_str().unwrap().starts_with("pub_"));

    let succeeded = lines
        .iter()
        .filter_map(|l| l.get("event"))
        .find(|e| e["type"] == "succeeded")
        .unwrap();
    assert_eq!(succeeded["platform"], "toutiao");
    assert_eq!(succeeded["result"]["id"], "article-1");
    assert_eq!(finished_status(&lines).as_deref(), Some("completed"));
}

#[test]
fn test_partial_failure_reports_partial() {
    let (_temp_dir, config_path) = setup_test_env(0);

    let output = daemon(&config_path)
        .write_stdin(
            r#"{"op":"submit","content":{"title":"Both"},"platforms":["toutiao","douyin"]}"#
                .to_string()
                + "\n",
        )
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let lines = output_lines(&output);
    let failed = lines
        .iter()
        .filter_map(|l| l.get("event"))
        .find(|e| e["type"] == "failed")
        .unwrap();
    assert_eq!(failed["platform"], "douyin");
    assert!(failed["error"].as_str().unwrap().contains("upstream unreachable"));
    assert_eq!(finished_status(&lines).as_deref(), Some("partial"));
}

#[test]
fn test_failed_platform_is_retried() {
    let (_temp_dir, config_path) = setup_test_env(2);

    let output = daemon(&config_path)
        .write_stdin(
            r#"{"op":"submit","content":{"title":"Retry"},"platforms":["douyin"]}"#.to_string()
                + "\n",
        )
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let lines = output_lines(&output);
    let retries = lines
        .iter()
        .filter_map(|l| l.get("event"))
        .filter(|e| e["type"] == "retrying")
        .count();
    assert_eq!(retries, 2);
    assert_eq!(finished_status(&lines).as_deref(), Some("failed"));
}

#[test]
fn test_bad_requests_get_error_responses() {
    let (_temp_dir, config_path) = setup_test_env(0);

    let input = [
        "this is not json",
        r#"{"op":"submit","content":{},"platforms":["unknown"]}"#,
        r#"{"op":"submit","content":{},"platforms":["toutiao"],"priority":"urgent"}"#,
        r#"{"op":"cancel","task_id":"pub_missing"}"#,
        r#"{"op":"queue_stats"}"#,
    ]
    .join("\n")
        + "\n";

    let output = daemon(&config_path)
        .write_stdin(input)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let lines = output_lines(&output);
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[0]["ok"], false);
    assert!(lines[1]["error"].as_str().unwrap().contains("not registered"));
    assert!(lines[2]["error"].as_str().unwrap().contains("Invalid priority"));
    assert!(lines[3]["error"].as_str().unwrap().contains("Task not found"));
    assert_eq!(lines[4]["ok"], true);
    assert_eq!(lines[4]["result"]["total"], 0);
}

#[test]
fn test_pause_holds_dispatch_until_resume() {
    let (_temp_dir, config_path) = setup_test_env(0);

    // Nothing runs while paused, so the first four lines are the responses
    let input = [
        r#"{"op":"pause"}"#,
        r#"{"op":"submit","content":{"title":"Paused"},"platforms":["toutiao"]}"#,
        r#"{"op":"list"}"#,
        r#"{"op":"resume"}"#,
    ]
    .join("\n")
        + "\n";

    let output = daemon(&config_path)
        .write_stdin(input)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let lines = output_lines(&output);
    assert_eq!(lines[0]["result"]["paused"], true);
    assert_eq!(lines[2]["result"].as_array().unwrap().len(), 1);
    assert_eq!(lines[2]["result"][0]["status"], "pending");
    assert_eq!(finished_status(&lines).as_deref(), Some("completed"));
}

// CONFIGURATION TESTS

#[test]
fn test_invalid_config_exits_with_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let invalid_config = temp_dir.path().join("invalid.toml");
    fs::write(&invalid_config, "invalid toml content [[[").unwrap();

    daemon(invalid_config.to_str().unwrap())
        .write_stdin("")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_missing_config_file_is_error() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope.toml");

    daemon(missing.to_str().unwrap())
        .write_stdin("")
        .assert()
        .code(2);
}

#[test]
fn test_zero_max_concurrent_rejected() {
    let (_temp_dir, config_path) = setup_test_env(0);

    daemon(&config_path)
        .arg("--max-concurrent")
        .arg("0")
        .write_stdin("")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("max_concurrent"));
}

#[test]
fn test_empty_stdin_exits_cleanly() {
    let (_temp_dir, config_path) = setup_test_env(0);

    daemon(&config_path)
        .write_stdin("")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

// CLI TESTS

#[test]
fn test_help_lists_protocol() {
    let mut cmd = Command::cargo_bin("crosspost-send").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("queue_stats"))
        .stdout(predicate::str::contains("EXIT CODES"));
}

#[test]
fn test_invalid_log_format_rejected() {
    let mut cmd = Command::cargo_bin("crosspost-send").unwrap();
    cmd.arg("--log-format")
        .arg("xml")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid log format"));
}
