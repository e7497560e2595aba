use std::fs;
use std::path::Path;
use std::process::Command;

use serde_json::Value;

const CONFIG: &str = "seed: 42\nchain_length: 500\nstore_every: 250\noutput:\n  state_file: chain.state\n  trace_log: chain.log\n  log_every: 50\n  screen_every: 0\n";

const MODEL: &str = r#"
state:
  - type: real
    id: x
    values: [0.5]
priors:
  - type: normal
    id: x.prior
    x: x
    mean: 0.0
    sigma: 1.0
operators:
  - type: random-walk
    id: x.walk
    weight: 1.0
    parameter: x
    window: 1.0
"#;

fn write_inputs(dir: &Path) {
    fs::write(dir.join("run.yaml"), CONFIG).unwrap();
    fs::write(dir.join("model.yaml"), MODEL).unwrap();
}

fn arbor(dir: &Path, extra: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_arbor-sim"))
        .arg("run")
        .arg("--config")
        .arg(dir.join("run.yaml"))
        .arg("--model")
        .arg(dir.join("model.yaml"))
        .arg("--out")
        .arg(dir.join("out"))
        .args(extra)
        .output()
        .expect("run arbor-sim")
}

#[test]
fn run_writes_summary_and_logs() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path());
    let output = arbor(dir.path(), &[]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let body = fs::read_to_string(dir.path().join("out/summary.json")).unwrap();
    let summary: Value = serde_json::from_str(&body).unwrap();
    let hash = summary["final_state_hash"].as_str().unwrap();
    assert_eq!(String::from_utf8(output.stdout).unwrap().trim(), hash);
    assert!(dir.path().join("out/chain.state").exists());
    assert!(dir.path().join("out/chain.log").exists());
}

#[test]
fn second_run_needs_a_mode_flag() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path());
    assert!(arbor(dir.path(), &[]).status.success());

    let refused = arbor(dir.path(), &[]);
    assert!(!refused.status.success());
    let stderr = String::from_utf8_lossy(&refused.stderr);
    assert!(stderr.contains("hint: pass --overwrite"), "{stderr}");

    assert!(arbor(dir.path(), &["--resume"]).status.success());
    assert!(arbor(dir.path(), &["--overwrite", "--seed", "7"]).status.success());
    assert!(!arbor(dir.path(), &["--resume", "--overwrite"]).status.success());
}

#[test]
fn check_prints_the_schedule() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path());
    let output = Command::new(env!("CARGO_BIN_EXE_arbor-sim"))
        .arg("check")
        .arg("--config")
        .arg(dir.path().join("run.yaml"))
        .arg("--model")
        .arg(dir.path().join("model.yaml"))
        .output()
        .expect("run arbor-sim check");
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.starts_with("x\treal"));
    assert!(stdout.contains("x.walk"));
    assert!(!dir.path().join("out").exists());
}
