//! Integration tests for spf-cli.
//!
//! Tests cover the `spf` binary: the buffering calculator, driving the demo
//! graph through its lifecycle, the monitoring dump and error reporting for
//! bad graph files.

use std::path::PathBuf;
use std::process::Command;

fn spf_bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_spf"))
}

fn demo_graph() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../demos/chain.toml")
}

// ---------------------------------------------------------------------------
// `spf icb`
// ---------------------------------------------------------------------------

#[test]
fn cli_icb_defaults() {
    let output = spf_bin()
        .args(["icb", "--down-rt"])
        .output()
        .expect("failed to run spf icb");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Regular buffers:    5"), "got: {stdout}");
    assert!(stdout.contains("Pre-filled buffers: 0"));
}

#[test]
fn cli_icb_json() {
    let output = spf_bin()
        .args(["icb", "--up-us", "1000", "--down-us", "1000", "--json"])
        .output()
        .expect("failed to run spf icb --json");
    assert!(output.status.success());

    let v: serde_json::Value = serde_json::from_slice(&output.stdout).expect("icb output is JSON");
    // NRT downstream, equal frames: single buffer
    assert_eq!(v["num_reg_bufs"], 1);
    assert_eq!(v["double_buf_disabled"], true);
}

// ---------------------------------------------------------------------------
// `spf run`
// ---------------------------------------------------------------------------

#[test]
fn cli_run_demo_lifecycle() {
    let output = spf_bin()
        .arg("run")
        .arg(demo_graph())
        .arg("--votes")
        .output()
        .expect("failed to run spf run");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Container 0x4000"));
    assert!(stdout.contains("After PREPARE:"));
    assert!(stdout.contains("After START:"));
    assert!(stdout.contains("After STOP:"));
    assert!(stdout.contains("subgraph 1: STARTED"));
    assert!(stdout.contains("Power votes:"));
    assert!(stdout.contains("clock 5 mpps"));
}

#[test]
fn cli_run_custom_steps() {
    let output = spf_bin()
        .arg("run")
        .arg(demo_graph())
        .args(["--steps", "prepare,close"])
        .output()
        .expect("failed to run spf run --steps");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("After CLOSE:"));
    assert!(!stdout.contains("After START:"));
}

#[test]
fn cli_run_pushes_frames_through() {
    let output = spf_bin()
        .arg("run")
        .arg(demo_graph())
        .args(["--frames", "3"])
        .output()
        .expect("failed to run spf run --frames");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("sink 0x11:1:"), "got: {stdout}");
    assert!(!stdout.contains("sink 0x11:1: 0 bytes"), "got: {stdout}");
}

#[test]
fn cli_run_missing_file_fails() {
    let output = spf_bin()
        .args(["run", "/nonexistent/graph.toml"])
        .output()
        .expect("failed to run spf run");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to load graph description"));
}

#[test]
fn cli_run_rejects_unknown_subgraph() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(
        &path,
        "[container]\nid = 1\n\n[[modules]]\ninstance_id = 0x10\nmodule_id = 1\nsubgraph = 9\n",
    )
    .unwrap();

    let output = spf_bin().arg("run").arg(&path).output().unwrap();
    assert!(!output.status.success());
}

// ---------------------------------------------------------------------------
// `spf rtm`
// ---------------------------------------------------------------------------

#[test]
fn cli_rtm_dumps_every_port() {
    let output = spf_bin()
        .arg("rtm")
        .arg(demo_graph())
        .output()
        .expect("failed to run spf rtm");
    assert!(output.status.success());

    let v: serde_json::Value = serde_json::from_slice(&output.stdout).expect("rtm output is JSON");
    let packets = v.as_array().expect("array of packets");
    assert!(!packets.is_empty());
    let ports: u64 = packets.iter().map(|p| p["num_ports"].as_u64().unwrap()).sum();
    assert_eq!(ports, 4);
    assert!(packets.iter().all(|p| p["container_id"] == 0x4000));
    assert!(packets.iter().all(|p| p.get("hex").is_none()));
}
