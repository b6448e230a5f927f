//! CLI contract tests for `tm`.
//!
//! Every test runs the real binary against a temp data directory and the
//! in-memory backend unless it is exercising a failure path.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test fixture helpers
// =============================================================================

/// `tm` pointed at a fresh data dir with the in-memory backend.
#[allow(deprecated)]
fn tm_cmd(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tm").expect("tm binary should be built");
    cmd.env_remove("TASKMILL_CONFIG")
        .env_remove("TASKMILL_BACKEND_URL")
        .env_remove("TASKMILL_ENV")
        .env("RUST_LOG", "error")
        .arg("--backend")
        .arg("memory")
        .arg("--data-dir")
        .arg(dir.path());
    cmd
}

fn write_file(dir: &TempDir, name: &str, contents: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).expect("write fixture");
    path.to_string_lossy().to_string()
}

fn json_stdout(output: &std::process::Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(&stdout).unwrap_or_else(|e| panic!("stdout is not JSON ({e}): {stdout}"))
}

const EVENTS: &str = r#"{"task_id":"p","kind":"start","time":"2024-01-01T00:00:00Z","name":"pipeline"}
{"task_id":"c","kind":"start","time":"2024-01-01T00:00:01Z","name":"step","parent_id":"p"}

not json
{"task_id":"c","kind":"success","time":"2024-01-01T00:00:03Z"}
"#;

// =============================================================================
// help / config
// =============================================================================

#[test]
fn help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    tm_cmd(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("ingest"))
        .stdout(predicate::str::contains("queue"))
        .stdout(predicate::str::contains("bootstrap"));
}

#[test]
fn config_check_accepts_defaults() {
    let dir = TempDir::new().unwrap();
    tm_cmd(&dir)
        .args(["--env", "ci", "config", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config OK"))
        .stdout(predicate::str::contains("taskmill-ci"));
}

#[test]
fn config_check_reports_invalid_fields_with_remediation() {
    let dir = TempDir::new().unwrap();
    let config = write_file(&dir, "taskmill.toml", "[indexing]\nindexing_threads = 0\n");
    tm_cmd(&dir)
        .args(["--config", &config, "config", "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("indexing.indexing_threads"))
        .stderr(predicate::str::contains("To fix:"));
}

#[test]
fn missing_config_file_is_actionable() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope.toml");
    tm_cmd(&dir)
        .arg("--config")
        .arg(&missing)
        .args(["config", "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Config file not found"));
}

#[test]
fn config_show_masks_password() {
    let dir = TempDir::new().unwrap();
    let config = write_file(
        &dir,
        "taskmill.toml",
        "[backend]\nusername = \"svc\"\npassword = \"hunter2\"\n",
    );
    tm_cmd(&dir)
        .args(["--config", &config, "config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("svc"))
        .stdout(predicate::str::contains("hunter2").not());
}

// =============================================================================
// bootstrap / ingest
// =============================================================================

#[test]
fn bootstrap_creates_write_alias() {
    let dir = TempDir::new().unwrap();
    let output = tm_cmd(&dir)
        .args(["--env", "ci", "--format", "json", "bootstrap"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = json_stdout(&output);
    assert_eq!(json["alias"], "taskmill-ci");
    assert_eq!(json["write_index"], "taskmill-ci-000001");
}

#[test]
fn ingest_skips_malformed_lines_and_reports() {
    let dir = TempDir::new().unwrap();
    let events = write_file(&dir, "events.jsonl", EVENTS);
    let output = tm_cmd(&dir)
        .args(["--format", "json", "ingest", &events])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let json = json_stdout(&output);
    assert_eq!(json["events"], 3);
    assert_eq!(json["invalid_lines"], 1);
    assert_eq!(json["operations"], 2);
    assert_eq!(json["failed_operations"], 0);
}

#[test]
fn ingest_strict_fails_on_malformed_line() {
    let dir = TempDir::new().unwrap();
    let events = write_file(&dir, "events.jsonl", EVENTS);
    tm_cmd(&dir)
        .args(["ingest", "--strict", &events])
        .assert()
        .failure()
        .stderr(predicate::str::contains("line 4"));
}

#[test]
fn ingest_failure_still_closes_failure_queue() {
    let dir = TempDir::new().unwrap();
    let events = write_file(&dir, "events.jsonl", EVENTS);
    tm_cmd(&dir)
        .env("RUST_LOG", "info")
        .args(["--log-format", "json", "ingest", "--strict", &events])
        .assert()
        .failure()
        .stderr(predicate::str::contains("line 4"))
        .stderr(predicate::str::contains("Failure queue closed"));
}

#[test]
fn ingest_reads_stdin() {
    let dir = TempDir::new().unwrap();
    tm_cmd(&dir)
        .args(["ingest", "-"])
        .write_stdin(
            r#"{"task_id":"s","kind":"spot","time":"2024-01-01T00:00:00Z","name":"ping"}"#,
        )
        .assert()
        .success()
        .stdout(predicate::str::contains("Ingested 1 events"));
}

#[test]
fn unreachable_backend_fails_with_remediation() {
    let dir = TempDir::new().unwrap();
    let config = write_file(
        &dir,
        "taskmill.toml",
        "[backend]\nkind = \"http\"\nurl = \"http://127.0.0.1:1\"\nmax_retries = 0\nrequest_timeout_secs = 2\n",
    );
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("tm").unwrap();
    cmd.env("RUST_LOG", "error")
        .arg("--config")
        .arg(&config)
        .arg("--data-dir")
        .arg(dir.path())
        .arg("bootstrap")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"))
        .stderr(predicate::str::contains("To fix:"));
}

// =============================================================================
// queue
// =============================================================================

#[test]
fn queue_status_on_fresh_data_dir() {
    let dir = TempDir::new().unwrap();
    let output = tm_cmd(&dir)
        .args(["--format", "json", "queue", "status"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = json_stdout(&output);
    assert_eq!(json["pending"], 0);
    assert_eq!(json["healthy"], true);
    assert!(dir.path().join("failed_bulks.db").exists());
}

#[test]
fn queue_reset_requires_confirmation() {
    let dir = TempDir::new().unwrap();
    tm_cmd(&dir)
        .args(["queue", "reset"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--yes"));
    tm_cmd(&dir)
        .args(["queue", "reset", "--yes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("reset"));
}

#[test]
fn queue_drain_with_empty_queue() {
    let dir = TempDir::new().unwrap();
    let output = tm_cmd(&dir)
        .args(["--format", "json", "queue", "drain"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = json_stdout(&output);
    assert_eq!(json["rounds"], 0);
    assert_eq!(json["remaining"], 0);
}
