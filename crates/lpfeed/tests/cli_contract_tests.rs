//! CLI command contract tests.
//!
//! Each test runs the binary against a temp data directory. State carries
//! across invocations only through the store files.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

fn lpfeed(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("lpfeed").expect("binary built");
    cmd.current_dir(dir.path())
        .arg("--data-dir")
        .arg(dir.path().join("data"))
        .arg("--log-level")
        .arg("warn")
        .env_remove("RUST_LOG")
        .env_remove("LPFEED_CONFIG");
    cmd
}

fn stdout_json(cmd: &mut Command) -> Value {
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).expect("stdout is JSON")
}

fn create_event(owner: &str, pool: &str, signature: &str) -> String {
    serde_json::json!({
        "signature": signature,
        "events": [{
            "kind": "position_create", "owner": owner, "lb_pair": pool,
            "position": format!("pos-{signature}"), "token_x": "SOL", "token_y": "USDC"
        }]
    })
    .to_string()
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn status_on_empty_data_dir() {
    let dir = TempDir::new().unwrap();
    let status = stdout_json(lpfeed(&dir).arg("status"));
    assert_eq!(status["positions"], 0);
    assert_eq!(status["wallets"], 0);
}

#[test]
fn wallet_registration_persists() {
    let dir = TempDir::new().unwrap();
    let added = stdout_json(lpfeed(&dir).args(["wallet", "add", "42", "W1"]));
    assert_eq!(added["added"], true);

    let listed = stdout_json(lpfeed(&dir).args(["wallet", "list", "42"]));
    assert_eq!(listed["wallets"], serde_json::json!(["W1"]));

    lpfeed(&dir)
        .args(["wallet", "add", "7", "W1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already registered"));

    let removed = stdout_json(lpfeed(&dir).args(["wallet", "remove", "42", "W1"]));
    assert_eq!(removed["removed"], true);
}

#[test]
fn wallet_key_with_delimiter_is_rejected() {
    let dir = TempDir::new().unwrap();
    lpfeed(&dir)
        .args(["wallet", "add", "a:b", "W1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("delimiter"));
}

#[test]
fn ingest_tracks_registered_wallets_and_drops_duplicates() {
    let dir = TempDir::new().unwrap();
    lpfeed(&dir).args(["wallet", "add", "42", "W1"]).assert().success();

    let input = [
        create_event("W1", "P1", "s1"),
        create_event("W1", "P1", "s1"),
        create_event("W1", "P2", "s2"),
        create_event("W9", "P1", "s3"),
        "not json".to_string(),
        String::new(),
    ]
    .join("\n");
    let input_path = dir.path().join("deliveries.jsonl");
    std::fs::write(&input_path, input).unwrap();

    let report = stdout_json(
        lpfeed(&dir)
            .arg("ingest")
            .arg("--input")
            .arg(&input_path),
    );
    assert_eq!(report["pipeline"]["received"], 4);
    assert_eq!(report["pipeline"]["duplicates"], 1);
    assert_eq!(report["pipeline"]["processed"], 3);
    assert_eq!(report["pipeline"]["failed"], 0);
    assert_eq!(report["invalid_lines"], 1);
    assert_eq!(report["stores"]["positions"], 2);

    let pools = stdout_json(lpfeed(&dir).args(["positions", "pools", "SOL"]));
    assert_eq!(pools["pools"], serde_json::json!(["P1", "P2"]));
    assert_eq!(pools["unique_owners"], 1);

    let users = stdout_json(lpfeed(&dir).args(["positions", "users", "USDC", "P1"]));
    assert_eq!(users["users"][0]["owner"], "W1");
    assert_eq!(users["users"][0]["positions"], 1);
}

#[test]
fn ingest_reads_stdin() {
    let dir = TempDir::new().unwrap();
    let report = stdout_json(
        lpfeed(&dir)
            .arg("ingest")
            .write_stdin(format!("{}\n", create_event("W1", "P1", "s1"))),
    );
    // unregistered owner: processed but nothing stored
    assert_eq!(report["pipeline"]["processed"], 1);
    assert_eq!(report["stores"]["positions"], 0);
}

#[test]
fn invalid_config_fails_with_remediation() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("bad.toml");
    std::fs::write(&config, "[pipeline]\nworkers = 0\n").unwrap();
    lpfeed(&dir)
        .arg("--config")
        .arg(&config)
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("pipeline.workers must be positive"))
        .stderr(predicate::str::contains("To fix:"));
}

#[test]
fn missing_config_file_suggests_defaults() {
    let dir = TempDir::new().unwrap();
    lpfeed(&dir)
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Omit --config"));
}
