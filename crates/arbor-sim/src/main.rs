use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use arbor_core::ArborError;
use arbor_mcmc::{run, ModelSpec, RunConfig, RunContext, RunMode, RunSummary};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "arbor-sim", about = "Bayesian MCMC over time trees and parameters")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run (or resume) a chain from a run configuration and a model description.
    Run(RunArgs),
    /// Build the model and print its operator schedule without sampling.
    Check(CheckArgs),
}

#[derive(ClapArgs, Debug)]
struct RunArgs {
    /// YAML run configuration.
    #[arg(long)]
    config: PathBuf,
    /// YAML model description.
    #[arg(long)]
    model: PathBuf,
    /// Directory that relative output paths are resolved against.
    #[arg(long, default_value = ".")]
    out: PathBuf,
    /// Continue from the state file and append to the logs.
    #[arg(long, conflicts_with = "overwrite")]
    resume: bool,
    /// Replace existing output files.
    #[arg(long)]
    overwrite: bool,
    /// Override the configured master seed.
    #[arg(long)]
    seed: Option<u64>,
    /// Override the configured worker thread count.
    #[arg(long)]
    threads: Option<usize>,
}

#[derive(ClapArgs, Debug)]
struct CheckArgs {
    /// YAML run configuration.
    #[arg(long)]
    config: PathBuf,
    /// YAML model description.
    #[arg(long)]
    model: PathBuf,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(args) => run_chain(args),
        Command::Check(args) => check_model(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            if let Some(hint) = err
                .downcast_ref::<ArborError>()
                .and_then(|arbor| arbor.info().hint.as_deref())
            {
                eprintln!("hint: {hint}");
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_chain(args: RunArgs) -> Result<(), Box<dyn Error>> {
    fs::create_dir_all(&args.out)?;
    let config = load_config(&args)?;
    let model =
        ModelSpec::load(&args.model)?.build(RunContext::clock_for(&config), &config.tuning)?;

    let summary = run(&config, model)?;
    write_json(args.out.join("summary.json"), &summary)?;
    report(&summary);
    Ok(())
}

fn load_config(args: &RunArgs) -> Result<RunConfig, ArborError> {
    let mut config = RunConfig::load(&args.config)?;
    if args.resume {
        config.mode = RunMode::Resume;
    } else if args.overwrite {
        config.mode = RunMode::Overwrite;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    config.output = config.output.rooted_at(&args.out);
    config.validate()?;
    Ok(config)
}

fn check_model(args: CheckArgs) -> Result<(), Box<dyn Error>> {
    let config = RunConfig::load(&args.config)?;
    let model =
        ModelSpec::load(&args.model)?.build(RunContext::clock_for(&config), &config.tuning)?;
    let nodes = model.state.nodes();
    for id in nodes.ids() {
        let value = nodes.get(id)?;
        println!("{}\t{}", nodes.label(id)?, value.kind());
    }
    println!();
    println!("{}", model.schedule.rates_table());
    info!(
        operators = model.schedule.len(),
        initialisers = model.initialisers.len(),
        "model is valid"
    );
    Ok(())
}

fn report(summary: &RunSummary) {
    info!(
        start_sample = summary.start_sample,
        final_posterior = summary.final_posterior,
        effective_sample_size = summary.effective_sample_size,
        corrections = summary.corrections,
        "run finished"
    );
    println!("{}", summary.final_state_hash);
}

fn write_json<P: AsRef<Path>, T: serde::Serialize>(path: P, value: &T) -> Result<(), Box<dyn Error>> {
    if let Some(parent) = path.as_ref().parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    Ok(())
}
