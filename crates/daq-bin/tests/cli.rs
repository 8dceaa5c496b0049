//! Tests of the `digi-daq` binary as a whole.
//!
//! Run with: cargo test -p daq-bin --test cli

use std::path::Path;
use std::process::{Command, Output};

fn digi_daq(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_digi-daq"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute digi-daq")
}

fn write_config(dir: &Path, sink_dir: &Path) -> std::path::PathBuf {
    let path = dir.join("run.toml");
    let text = format!(
        r#"
run_name = "cli_test"
log_level = "warn"

[processing]
workers = 2
idle_grace = "20ms"

[[boards]]
id = 1
kind = "v1724"

[[boards]]
id = 2
kind = "v1724"
channel_mask = 0x03

[sink]
type = "file"
directory = "{}"
"#,
        sink_dir.display()
    );
    std::fs::write(&path, text).unwrap();
    path
}

#[test]
fn test_help_lists_commands() {
    let output = digi_daq(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for cmd in ["run", "calibration", "check-config"] {
        assert!(stdout.contains(cmd), "help should mention {}", cmd);
    }
}

#[test]
fn test_check_config_accepts_sample() {
    let sample = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/run.toml");
    let output = digi_daq(&["check-config", sample.to_str().unwrap()]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ok (2 digitizers, controller: none, 4 workers)"));
    assert!(stdout.contains("run_name = \"sim_0001\""));
}

#[test]
fn test_check_config_rejects_duplicate_ids() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(
        &path,
        "[[boards]]\nid = 1\nkind = \"v1724\"\n[[boards]]\nid = 1\nkind = \"v1724\"\n",
    )
    .unwrap();
    let output = digi_daq(&["check-config", path.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Duplicate board id"));
}

#[test]
fn test_calibration_prints_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cal.txt");
    std::fs::write(
        &path,
        "24031714\n1  1A2B\n2  1A40\n3  1000\n4  1000\n5  1000\n6  1000\n7  1000\n8  19F0\n",
    )
    .unwrap();
    let output = digi_daq(&["calibration", path.to_str().unwrap()]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("created 2024-03-17 14:00"));
    assert!(stdout.contains("1  1A2B"));
    assert!(stdout.contains("8  19F0"));
}

#[test]
fn test_short_simulated_run_writes_records() {
    let dir = tempfile::tempdir().unwrap();
    let sink_dir = dir.path().join("out");
    let config = write_config(dir.path(), &sink_dir);
    let output = digi_daq(&[
        "run",
        "--config",
        config.to_str().unwrap(),
        "--duration",
        "300ms",
        "--report-every",
        "100ms",
        "--trigger-rate",
        "500",
    ]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let files = daq_recorder::list_files(&sink_dir, "digi").unwrap();
    assert!(!files.is_empty());
    let stored: usize = files
        .iter()
        .map(|f| daq_recorder::read_file(f).unwrap().len())
        .sum();
    assert!(stored > 0);
}
