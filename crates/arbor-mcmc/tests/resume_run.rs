use std::fs;
use std::path::Path;
use std::sync::Arc;

use arbor_mcmc::checkpoint::{operators_path, StateCheckpoint};
use arbor_mcmc::clock::StepClock;
use arbor_mcmc::{run, Model, ModelSpec, OutputConfig, RunConfig, RunMode};

const MODEL: &str = r#"
state:
  - type: real
    id: x
    values: [0.5]
  - type: tree
    id: tree
    newick: "((A:1,B:1):1,(C:1.5,D:1.5):0.5);"
  - type: real
    id: rate
    values: [2.0]
    lower: 0.0
priors:
  - type: normal
    id: x.prior
    x: x
    mean: 0.0
    sigma: 1.0
  - type: yule
    id: yule
    tree: tree
    birth_rate: rate
  - type: exponential
    id: rate.prior
    x: rate
    mean: 1.0
likelihoods:
  - type: gaussian
    id: data
    x: x
    observations: [1000.0]
    sigma: 0.001
operators:
  - type: random-walk
    id: x.walk
    weight: 1.0
    parameter: x
    window: 1.0
  - type: scale
    id: rate.scale
    weight: 1.0
    parameter: rate
    scale_factor: 0.5
  - type: narrow-exchange
    id: narrow
    weight: 1.0
    tree: tree
  - type: tree-scale
    id: tree.scale
    weight: 1.0
    tree: tree
    scale_factor: 0.5
"#;

fn model(config: &RunConfig) -> Model {
    ModelSpec::from_yaml_str(MODEL)
        .unwrap()
        .build(Arc::new(StepClock::new(1.0)), &config.tuning)
        .unwrap()
}

fn config(dir: &Path, chain_length: u64, mode: RunMode) -> RunConfig {
    let output = OutputConfig {
        state_file: Some("chain.state".into()),
        trace_log: Some("chain.log".into()),
        tree_log: Some("chain.trees".into()),
        log_every: 100,
        screen_every: 0,
        manifest_file: Some("manifest.json".into()),
    };
    RunConfig {
        chain_length,
        store_every: 500,
        mode,
        output: output.rooted_at(dir),
        ..RunConfig::default()
    }
}

fn trace_lines(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("chain.log"))
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn resume_appends_to_existing_logs() {
    let dir = tempfile::tempdir().unwrap();
    let first = config(dir.path(), 1000, RunMode::Fresh);
    let summary = run(&first, model(&first)).unwrap();
    assert_eq!(summary.start_sample, 0);
    let state_file = dir.path().join("chain.state");
    assert_eq!(summary.state_file.as_deref(), Some(state_file.as_path()));
    assert_eq!(StateCheckpoint::load(&state_file).unwrap().sample, 1000);
    assert!(operators_path(&state_file).exists());
    assert_eq!(trace_lines(dir.path()).len(), 1 + 11);

    let second = config(dir.path(), 2000, RunMode::Resume);
    let resumed = run(&second, model(&second)).unwrap();
    assert_eq!(resumed.start_sample, 1001);
    assert_eq!(StateCheckpoint::load(&state_file).unwrap().sample, 2000);

    let lines = trace_lines(dir.path());
    assert_eq!(lines.iter().filter(|l| l.starts_with("Sample")).count(), 1);
    assert_eq!(lines.len(), 1 + 21);
    assert!(lines[11].starts_with("1000\t"));
    assert!(lines[12].starts_with("1100\t"));
    assert!(lines.last().unwrap().starts_with("2000\t"));

    let trees = fs::read_to_string(dir.path().join("chain.trees")).unwrap();
    assert_eq!(trees.lines().filter(|l| l.contains(';')).count(), 21);

    // Operator counts carry over through the companion file.
    let proposals: u64 = resumed
        .operator_rates
        .iter()
        .map(|r| r.accepted + r.rejected)
        .sum();
    assert_eq!(proposals, 1001 + 1000);
}

#[test]
fn fresh_run_refuses_existing_output() {
    let dir = tempfile::tempdir().unwrap();
    let first = config(dir.path(), 200, RunMode::Fresh);
    run(&first, model(&first)).unwrap();

    let err = run(&first, model(&first)).unwrap_err();
    assert_eq!(err.code(), "output-exists");
    assert!(err.info().hint.as_deref().unwrap().contains("--overwrite"));

    let overwrite = config(dir.path(), 200, RunMode::Overwrite);
    run(&overwrite, model(&overwrite)).unwrap();
    assert_eq!(trace_lines(dir.path()).len(), 1 + 3);
}

#[test]
fn resume_without_checkpoint_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), 200, RunMode::Resume);
    let err = run(&config, model(&config)).unwrap_err();
    assert_eq!(err.code(), "checkpoint-read");
}

#[test]
fn manifest_records_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), 300, RunMode::Fresh);
    let summary = run(&config, model(&config)).unwrap();
    let path = summary.manifest_path.unwrap();
    let manifest: serde_json::Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(manifest["master_seed"], 127);
    assert_eq!(manifest["final_state_hash"], summary.final_state_hash.as_str());
    assert!(manifest["finished_at"].is_string());
    // The step clock advances once per read: chain start and chain end.
    assert_eq!(manifest["elapsed_ms"].as_f64(), Some(1.0));
    assert_eq!(manifest["operators"].as_array().unwrap().len(), 4);
}

#[test]
fn sampling_from_the_prior_drops_the_likelihood() {
    let dir = tempfile::tempdir().unwrap();
    let with_data = config(dir.path(), 300, RunMode::Fresh);
    let posterior = run(&with_data, model(&with_data)).unwrap().final_posterior;
    // The observation sits far from the prior, so the likelihood dominates.
    assert!(posterior < -1e6);

    let prior_only = RunConfig {
        sample_from_prior: true,
        mode: RunMode::Overwrite,
        ..with_data
    };
    let prior = run(&prior_only, model(&prior_only)).unwrap().final_posterior;
    assert!(prior.is_finite());
    assert!(prior > -1e3);
}
