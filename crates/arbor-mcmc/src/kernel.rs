use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use arbor_core::errors::ErrorInfo;
use arbor_core::ArborError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{self, Audit, AuditOutcome};
use crate::checkpoint::{self, ScheduleCheckpoint, StateCheckpoint};
use crate::config::{OutputConfig, RunConfig, RunMode};
use crate::context::RunContext;
use crate::distributions::LIKELIHOOD_LABEL;
use crate::init;
use crate::logger::{self, ChainLogger, ScreenLogger, TraceLogger, TreeLogger};
use crate::manifest::RunManifest;
use crate::metrics::{PosteriorRecorder, PosteriorSample};
use crate::operator::{Proposal, Rejection};
use crate::registry::Model;
use crate::schedule::{OperatorRate, OperatorSchedule};
use crate::state::{State, StateValue};

/// Summary returned to callers after a run completes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    /// Acceptance rate per operator id.
    pub acceptance_rates: BTreeMap<String, f64>,
    /// Final operator table.
    pub operator_rates: Vec<OperatorRate>,
    /// Posterior of the final state.
    pub final_posterior: f64,
    /// SHA-256 over the checkpoint text of the final state.
    pub final_state_hash: String,
    /// Audit corrections applied.
    pub corrections: usize,
    /// Proposals whose posterior was not a number.
    pub numerical_failures: usize,
    /// First sample of this invocation.
    pub start_sample: i64,
    /// Posterior samples recorded at the logging points.
    pub samples: Vec<PosteriorSample>,
    /// Crude effective sample size of the posterior trace.
    pub effective_sample_size: f64,
    /// State file written during the run.
    pub state_file: Option<PathBuf>,
    /// Manifest path, if emitted.
    pub manifest_path: Option<PathBuf>,
}

/// Runs the chain described by `config` over `model`. Delegates to
/// [`resume`] when the mode asks for it.
pub fn run(config: &RunConfig, model: Model) -> Result<RunSummary, ArborError> {
    config.validate()?;
    if config.mode == RunMode::Resume {
        return resume(config, model);
    }
    if config.mode == RunMode::Fresh {
        refuse_existing_output(&config.output)?;
    }

    let Model {
        mut state,
        mut schedule,
        mut initialisers,
        clock,
    } = model;
    let mut ctx = RunContext::new(config, clock)?;
    info!(
        seed = config.seed,
        chain_length = config.chain_length,
        pre_burn_in = config.pre_burn_in,
        operators = schedule.len(),
        "starting chain"
    );
    if config.sample_from_prior {
        drop_likelihood(&mut state);
    }
    let mut init_rng = ctx.init_rng();
    let posterior = init::initialise(
        &mut state,
        &mut initialisers,
        config.init_attempts,
        &mut init_rng,
        ctx.pool(),
    )?;
    debug!(posterior, "initial state");

    let chain = Chain {
        config,
        start_sample: -(config.pre_burn_in as i64),
        posterior,
        resumed: false,
    };
    chain.run(&mut state, &mut schedule, &mut ctx)
}

/// Continues the chain from the checkpoint in `config.output.state_file`.
///
/// Pre-burn-in is skipped, the posterior is recomputed from scratch and the
/// loggers append to their existing files.
pub fn resume(config: &RunConfig, model: Model) -> Result<RunSummary, ArborError> {
    let state_path = config.output.state_file.as_deref().ok_or_else(|| {
        ArborError::Config(
            ErrorInfo::new("resume-without-state", "resuming needs a state file")
                .with_hint("set output.state_file"),
        )
    })?;
    let Model {
        mut state,
        mut schedule,
        clock,
        ..
    } = model;
    let mut ctx = RunContext::new(config, clock)?;
    if config.sample_from_prior {
        drop_likelihood(&mut state);
    }

    let checkpoint = StateCheckpoint::load(state_path)?;
    state.restore_checkpoint(&checkpoint)?;
    let operators = checkpoint::operators_path(state_path);
    if operators.exists() {
        schedule.restore_checkpoint(&ScheduleCheckpoint::load(&operators)?)?;
    } else {
        warn!(path = %operators.display(), "no operator checkpoint; operators keep their defaults");
    }
    ctx.reseed_for_resume(checkpoint.sample);
    let posterior = state.robustly_calc_posterior(ctx.pool())?;
    info!(
        sample = checkpoint.sample,
        posterior,
        chain_length = config.chain_length,
        "resuming chain"
    );

    let chain = Chain {
        config,
        start_sample: checkpoint.sample + 1,
        posterior,
        resumed: true,
    };
    chain.run(&mut state, &mut schedule, &mut ctx)
}

fn drop_likelihood(state: &mut State) {
    if state.graph_mut().drop_root_child(LIKELIHOOD_LABEL) {
        info!("sampling from the prior");
    } else {
        warn!(label = LIKELIHOOD_LABEL, "sample_from_prior set but the posterior has no such child");
    }
}

fn refuse_existing_output(output: &OutputConfig) -> Result<(), ArborError> {
    let paths = [
        output.state_file.as_ref(),
        output.trace_log.as_ref(),
        output.tree_log.as_ref(),
        output.manifest_file.as_ref(),
    ];
    if let Some(path) = paths.into_iter().flatten().find(|path| path.exists()) {
        return Err(ArborError::Config(
            ErrorInfo::new("output-exists", "output file already exists")
                .with_context("path", path.display().to_string())
                .with_hint("pass --overwrite to replace it or --resume to continue"),
        ));
    }
    Ok(())
}

/// Tree log path for `label`; the configured path is used as is when the
/// state holds a single tree.
fn tree_log_path(path: &Path, label: &str, trees: usize) -> PathBuf {
    if trees == 1 {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}.{label}.{}", ext.to_string_lossy()),
        None => format!("{stem}.{label}"),
    };
    path.with_file_name(name)
}

fn build_loggers(
    output: &OutputConfig,
    state: &State,
) -> Result<Vec<Box<dyn ChainLogger>>, ArborError> {
    let mut loggers: Vec<Box<dyn ChainLogger>> = Vec::new();
    if let Some(path) = &output.trace_log {
        loggers.push(Box::new(TraceLogger::new(path, output.log_every)));
    }
    if let Some(path) = &output.tree_log {
        let mut trees = Vec::new();
        for id in state.nodes().ids() {
            if matches!(state.get(id)?, StateValue::Tree(_)) {
                trees.push((id, state.nodes().label(id)?.to_string()));
            }
        }
        for (id, label) in &trees {
            loggers.push(Box::new(TreeLogger::new(
                tree_log_path(path, label, trees.len()),
                output.log_every,
                *id,
            )));
        }
    }
    if output.screen_every > 0 {
        loggers.push(Box::new(ScreenLogger::new(output.screen_every)));
    }
    Ok(loggers)
}

struct Chain<'a> {
    config: &'a RunConfig,
    start_sample: i64,
    posterior: f64,
    resumed: bool,
}

struct Counters {
    numerical_failures: usize,
}

impl Chain<'_> {
    fn run(
        mut self,
        state: &mut State,
        schedule: &mut OperatorSchedule,
        ctx: &mut RunContext,
    ) -> Result<RunSummary, ArborError> {
        let config = self.config;
        let chain_length = config.chain_length as i64;
        let mut audit = Audit::new(&config.audit);
        let mut recorder = PosteriorRecorder::new();
        let mut counters = Counters {
            numerical_failures: 0,
        };
        let mut loggers = build_loggers(&config.output, state)?;
        for logger in loggers.iter_mut() {
            logger.init(state, self.resumed)?;
        }

        let started_ms = ctx.now_ms();
        for sample in self.start_sample..=chain_length {
            self.posterior =
                self.propagate_state(sample, state, schedule, ctx, &audit, &mut counters)?;

            if audit.should_check(sample) {
                if let AuditOutcome::Corrected { posterior } =
                    audit.check(state, ctx.pool(), sample, self.posterior)?
                {
                    self.posterior = posterior;
                }
            }
            if self.posterior == f64::INFINITY {
                return Err(ArborError::Posterior(
                    ErrorInfo::new("infinite-posterior", "posterior became positive infinity")
                        .with_context("sample", sample.to_string())
                        .with_context("breakdown", state.graph().breakdown().join("\n"))
                        .with_hint("a density is improper at the current state"),
                ));
            }

            for logger in loggers.iter_mut() {
                if logger::should_log(sample, logger.every()) {
                    logger.log(sample, state)?;
                }
            }
            if logger::should_log(sample, config.output.log_every) {
                recorder.push(sample, self.posterior);
            }

            let store_every = config.store_every as i64;
            if (store_every > 0 && (sample + 1) % store_every == 0) || sample == chain_length {
                write_checkpoint(&config.output, state, schedule, sample)?;
            }
        }

        for logger in loggers.iter_mut() {
            logger.close()?;
        }
        let elapsed_ms = ctx.now_ms() - started_ms;
        info!(elapsed_ms, "operator summary\n{}", schedule.rates_table());

        let operator_rates = schedule.rates();
        let acceptance_rates = operator_rates
            .iter()
            .map(|rate| (rate.id.clone(), rate.acceptance))
            .collect();
        let final_state_hash = state.state_hash();
        let manifest_path = match &config.output.manifest_file {
            Some(path) => {
                RunManifest {
                    config: config.clone(),
                    master_seed: ctx.master_seed(),
                    start_sample: self.start_sample,
                    final_state_hash: final_state_hash.clone(),
                    final_posterior: self.posterior,
                    state_file: config.output.state_file.clone(),
                    trace_log: config.output.trace_log.clone(),
                    tree_log: config.output.tree_log.clone(),
                    operators: operator_rates.clone(),
                    elapsed_ms,
                    finished_at: chrono::Utc::now(),
                }
                .write(path)?;
                Some(path.clone())
            }
            None => None,
        };

        Ok(RunSummary {
            acceptance_rates,
            operator_rates,
            final_posterior: self.posterior,
            final_state_hash,
            corrections: audit.corrections(),
            numerical_failures: counters.numerical_failures,
            start_sample: self.start_sample,
            effective_sample_size: recorder.effective_sample_size(),
            samples: recorder.samples().to_vec(),
            state_file: config.output.state_file.clone(),
            manifest_path,
        })
    }

    /// One Metropolis-Hastings step. Returns the posterior of the state the
    /// chain holds afterwards.
    fn propagate_state(
        &self,
        sample: i64,
        state: &mut State,
        schedule: &mut OperatorSchedule,
        ctx: &mut RunContext,
        audit: &Audit,
        counters: &mut Counters,
    ) -> Result<f64, ArborError> {
        let debug = audit.debug_active(sample);
        let tuned = sample >= 0;
        state.store(sample);
        let idx = schedule.select_operator(ctx.rng_mut());
        let before = if debug { Some(state.checksums()) } else { None };

        let (operator, tuner) = schedule.operator_and_tuner(idx);
        let proposal = operator.proposal(state, ctx.rng_mut())?;
        let mut posterior = self.posterior;
        let mut log_alpha = f64::NEG_INFINITY;

        match proposal {
            Proposal::Move(log_hastings_ratio) => {
                let new_posterior = state.calculate_log_p(ctx.pool())?;
                if new_posterior.is_nan() {
                    counters.numerical_failures += 1;
                    warn!(
                        sample,
                        operator = operator.id(),
                        failures = counters.numerical_failures,
                        "posterior is not a number"
                    );
                    if counters.numerical_failures > self.config.audit.max_numerical_failures {
                        return Err(ArborError::Posterior(
                            ErrorInfo::new("numerical-failure", "too many non-numeric posteriors")
                                .with_context("sample", sample.to_string())
                                .with_context("failures", counters.numerical_failures.to_string())
                                .with_context("breakdown", state.graph().breakdown().join("\n")),
                        ));
                    }
                }
                log_alpha = new_posterior - self.posterior + log_hastings_ratio;
                let accepted = log_alpha >= 0.0
                    || (log_alpha != f64::NEG_INFINITY && ctx.rng_mut().uniform() < log_alpha.exp());
                if accepted {
                    state.accept_calculation_nodes();
                    state.accept();
                    if tuned {
                        operator.accept(state, &*tuner);
                    }
                    posterior = new_posterior;
                } else {
                    if tuned {
                        let reason = if new_posterior == f64::NEG_INFINITY {
                            Rejection::InvalidPosterior
                        } else {
                            Rejection::Posterior
                        };
                        operator.reject(reason, &*tuner);
                    }
                    state.restore();
                    state.restore_calculation_nodes();
                    if let Some(before) = &before {
                        audit::validate_restore(before, &state.checksums(), sample, operator.id())?;
                    }
                }
                state.set_everything_dirty(false);
            }
            Proposal::Invalid => {
                if tuned {
                    operator.reject(Rejection::InvalidProposal, &*tuner);
                }
                state.restore();
                state.set_everything_dirty(false);
                state.restore_calculation_nodes();
            }
        }

        // Audited samples do not tune.
        if tuned && !audit.should_check(sample) {
            operator.optimize(log_alpha, tuner);
        }
        Ok(posterior)
    }
}

fn write_checkpoint(
    output: &OutputConfig,
    state: &State,
    schedule: &OperatorSchedule,
    sample: i64,
) -> Result<(), ArborError> {
    let Some(path) = &output.state_file else {
        return Ok(());
    };
    state.to_checkpoint(sample).store(path)?;
    schedule
        .to_checkpoint()
        .store(&checkpoint::operators_path(path))?;
    info!(sample, path = %path.display(), "checkpoint written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_tree_keeps_configured_path() {
        let path = Path::new("out/run.trees");
        assert_eq!(tree_log_path(path, "t", 1), PathBuf::from("out/run.trees"));
        assert_eq!(tree_log_path(path, "t", 2), PathBuf::from("out/run.t.trees"));
    }
}
