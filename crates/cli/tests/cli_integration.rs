//! CLI integration tests.
//!
//! Spawns the `timeline` binary with `assert_cmd` and checks exit codes and
//! output for both subcommands.

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn timeline() -> Command {
    let mut cmd = cargo_bin_cmd!("timeline");
    cmd.env_remove("RUST_LOG");
    cmd
}

fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

// Help and version

#[test]
fn help_lists_subcommands() {
    timeline()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("replay"))
        .stdout(predicate::str::contains("check-config"));
}

#[test]
fn version_exits_0() {
    timeline()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("timeline"));
}

// replay

#[test]
fn replay_reports_codes_and_sweep() {
    timeline()
        .arg("replay")
        .arg(fixture("node_and_zombie.json"))
        .assert()
        .success()
        .stdout(predicate::str::contains("code=2"))
        .stdout(predicate::str::contains("code=0"))
        .stdout(predicate::str::contains("requeued [2]"))
        .stdout(predicate::str::contains("compute_node/R0-CH0-CN0"))
        .stdout(predicate::str::contains("12 step(s), 0 failed"));
}

#[test]
fn replay_json_output_is_structured() {
    let output = timeline()
        .args(["--output", "json", "replay"])
        .arg(fixture("node_and_zombie.json"))
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["failed"], 0);
    assert_eq!(report["steps"][3]["code"], 2);
    assert_eq!(report["steps"][4]["code"], 0);
    assert_eq!(report["live_workers"], serde_json::json!(["RAS/5"]));

    let node = &report["entities"][0];
    assert_eq!(node["key"], "compute_node/R0-CH0-CN0");
    assert_eq!(node["active_state"], "M");
    assert_eq!(node["history_rows"], 3);

    let requeued = report["work_items"]
        .as_array()
        .unwrap()
        .iter()
        .find(|w| w["id"] == 2)
        .unwrap();
    assert_eq!(requeued["state"], "Requeued");
}

#[test]
fn failing_step_exits_1_but_replay_continues() {
    let dir = TempDir::new().unwrap();
    let scenario = write(
        &dir,
        "bad.json",
        r#"[
            {"op": "acknowledge", "id": 77},
            {"op": "create", "key": {"kind": "job", "id": "j1"}, "state": "S",
             "ts": 1000, "requester": {"adapter_type": "WLM"}}
        ]"#,
    );
    timeline()
        .arg("replay")
        .arg(&scenario)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("FAIL"))
        .stdout(predicate::str::contains("work item not found: 77"))
        .stdout(predicate::str::contains("job/j1 created"))
        .stdout(predicate::str::contains("2 step(s), 1 failed"));
}

#[test]
fn malformed_scenario_exits_1() {
    let dir = TempDir::new().unwrap();
    let scenario = write(&dir, "broken.json", r#"[{"op": "explode"}]"#);
    timeline()
        .arg("replay")
        .arg(&scenario)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid scenario"));
}

#[test]
fn missing_scenario_exits_1_with_json_error() {
    timeline()
        .args(["--output", "json", "replay", "does-not-exist.json"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("\"error\""));
}

#[test]
fn replay_honours_config_slack_window() {
    let dir = TempDir::new().unwrap();
    let config = write(&dir, "tight.toml", "[reconcile]\nslack_window_us = 0\n");
    // With no slack the 9s change has no baseline before it.
    timeline()
        .arg("replay")
        .arg(fixture("node_and_zombie.json"))
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("no historical baseline"));
}

// check-config

#[test]
fn check_config_accepts_valid_file() {
    let dir = TempDir::new().unwrap();
    let config = write(
        &dir,
        "timeline.toml",
        "[reconcile]\nslack_window_us = 250000\n\n[work_items]\ncoalesce_checkpoints = true\n",
    );
    timeline()
        .arg("check-config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("valid"))
        .stdout(predicate::str::contains("250000"));
}

#[test]
fn check_config_json_output() {
    let dir = TempDir::new().unwrap();
    let config = write(&dir, "empty.toml", "");
    let output = timeline()
        .args(["--output", "json", "check-config"])
        .arg(&config)
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["valid"], true);
    assert_eq!(value["slack_window_us"], 1_500_000);
}

#[test]
fn check_config_rejects_unknown_key() {
    let dir = TempDir::new().unwrap();
    let config = write(&dir, "typo.toml", "[reconcile]\nslak_window_us = 5\n");
    timeline()
        .arg("check-config")
        .arg(&config)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("config error"));
}

#[test]
fn check_config_rejects_negative_slack() {
    let dir = TempDir::new().unwrap();
    let config = write(&dir, "neg.toml", "[reconcile]\nslack_window_us = -1\n");
    timeline()
        .arg("check-config")
        .arg(&config)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("must not be negative"));
}
