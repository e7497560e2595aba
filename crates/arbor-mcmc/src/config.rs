use std::fs;
use std::path::{Path, PathBuf};

use arbor_core::errors::{ArborError, ErrorInfo};
use serde::{Deserialize, Serialize};

/// YAML-configurable parameters governing a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Master seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Last sample number of the chain.
    #[serde(default = "default_chain_length")]
    pub chain_length: u64,
    /// Samples drawn before sample 0 that are neither logged nor tuned.
    #[serde(default)]
    pub pre_burn_in: u64,
    /// Worker threads for posterior evaluation; 1 keeps evaluation inline.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Whether to start afresh, overwrite existing output or resume.
    #[serde(default)]
    pub mode: RunMode,
    /// Checkpoint interval in samples; 0 writes only at the end.
    #[serde(default)]
    pub store_every: u64,
    /// Attempts at finding an initial state with a finite posterior.
    #[serde(default = "default_init_attempts")]
    pub init_attempts: usize,
    /// Drop the likelihood and sample from the prior.
    #[serde(default)]
    pub sample_from_prior: bool,
    /// Posterior audit settings.
    #[serde(default)]
    pub audit: AuditConfig,
    /// Operator tuning settings.
    #[serde(default)]
    pub tuning: TuningConfig,
    /// Output files.
    #[serde(default)]
    pub output: OutputConfig,
    /// Clock used to time operators.
    #[serde(default)]
    pub runtime_clock: ClockConfig,
}

fn default_seed() -> u64 {
    127
}

fn default_chain_length() -> u64 {
    10_000
}

fn default_threads() -> usize {
    1
}

fn default_init_attempts() -> usize {
    10
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            chain_length: default_chain_length(),
            pre_burn_in: 0,
            threads: default_threads(),
            mode: RunMode::default(),
            store_every: 0,
            init_attempts: default_init_attempts(),
            sample_from_prior: false,
            audit: AuditConfig::default(),
            tuning: TuningConfig::default(),
            output: OutputConfig::default(),
            runtime_clock: ClockConfig::default(),
        }
    }
}

impl RunConfig {
    /// Parses YAML text and validates it.
    pub fn from_yaml_str(text: &str) -> Result<Self, ArborError> {
        let config: Self = serde_yaml::from_str(text).map_err(|err| {
            ArborError::Config(ErrorInfo::new("config-parse", err.to_string()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a YAML file.
    pub fn load(path: &Path) -> Result<Self, ArborError> {
        let text = fs::read_to_string(path).map_err(|err| {
            ArborError::Config(
                ErrorInfo::new("config-read", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        Self::from_yaml_str(&text).map_err(|err| {
            ArborError::Config(
                err.info()
                    .clone()
                    .with_context("path", path.display().to_string()),
            )
        })
    }

    /// Rejects settings the chain cannot run with.
    pub fn validate(&self) -> Result<(), ArborError> {
        let invalid = |field: &str, value: String| {
            ArborError::Config(
                ErrorInfo::new("invalid-setting", "setting out of range")
                    .with_context("field", field.to_string())
                    .with_context("value", value),
            )
        };
        if self.threads == 0 {
            return Err(invalid("threads", self.threads.to_string()));
        }
        if self.init_attempts == 0 {
            return Err(invalid("init_attempts", self.init_attempts.to_string()));
        }
        if !(self.audit.tolerance > 0.0) {
            return Err(invalid("audit.tolerance", self.audit.tolerance.to_string()));
        }
        if self.audit.every == 0 {
            return Err(invalid("audit.every", self.audit.every.to_string()));
        }
        if self.output.log_every == 0 {
            return Err(invalid("output.log_every", self.output.log_every.to_string()));
        }
        if let ClockConfig::Step { step_ms } = self.runtime_clock {
            if !(step_ms > 0.0) {
                return Err(invalid("runtime_clock.step_ms", step_ms.to_string()));
            }
        }
        if self.mode == RunMode::Resume && self.output.state_file.is_none() {
            return Err(ArborError::Config(
                ErrorInfo::new("resume-without-state", "resuming requires a state file")
                    .with_hint("set output.state_file"),
            ));
        }
        Ok(())
    }
}

/// How existing output is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Refuse to touch existing output.
    #[default]
    Fresh,
    /// Truncate existing output.
    Overwrite,
    /// Continue from the state file and append to logs.
    Resume,
}

/// Posterior audit settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Audit every sample (and validate restores) inside the debug window.
    #[serde(default)]
    pub debug: bool,
    /// Samples covered by the debug window; a mismatch inside it is fatal.
    #[serde(default = "default_debug_window")]
    pub debug_window: u64,
    /// Audit interval outside the debug window.
    #[serde(default = "default_audit_every")]
    pub every: u64,
    /// Absolute tolerance between incremental and recomputed posteriors.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Corrections tolerated after the debug window.
    #[serde(default = "default_max_corrections")]
    pub max_corrections: usize,
    /// Non-numeric posteriors tolerated before the chain stops.
    #[serde(default = "default_max_numerical_failures")]
    pub max_numerical_failures: usize,
}

fn default_debug_window() -> u64 {
    3 * 2000
}

fn default_audit_every() -> u64 {
    10_000
}

fn default_tolerance() -> f64 {
    1e-6
}

fn default_max_corrections() -> usize {
    100
}

fn default_max_numerical_failures() -> usize {
    100
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            debug: false,
            debug_window: default_debug_window(),
            every: default_audit_every(),
            tolerance: default_tolerance(),
            max_corrections: default_max_corrections(),
            max_numerical_failures: default_max_numerical_failures(),
        }
    }
}

/// Operator tuning settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Whether operators tune themselves.
    #[serde(default = "default_auto_optimize")]
    pub auto_optimize: bool,
    /// Tuning steps skipped before tuning starts.
    #[serde(default = "default_delay")]
    pub delay: u64,
    /// Transform applied to the step count.
    #[serde(default)]
    pub transform: TuningTransform,
}

fn default_auto_optimize() -> bool {
    true
}

fn default_delay() -> u64 {
    10_000
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            auto_optimize: default_auto_optimize(),
            delay: default_delay(),
            transform: TuningTransform::default(),
        }
    }
}

/// Transform of the Robbins-Monro step count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TuningTransform {
    /// Use the count as is.
    #[default]
    None,
    /// Natural log of count + 1.
    Log,
    /// Square root.
    Sqrt,
}

/// Output file layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Checkpoint state file.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    /// Tab separated trace of the posterior and parameters.
    #[serde(default)]
    pub trace_log: Option<PathBuf>,
    /// One Newick line per logged sample and tree.
    #[serde(default)]
    pub tree_log: Option<PathBuf>,
    /// File logger interval.
    #[serde(default = "default_log_every")]
    pub log_every: u64,
    /// Progress interval; 0 disables screen logging.
    #[serde(default = "default_screen_every")]
    pub screen_every: u64,
    /// Run manifest written at the end.
    #[serde(default)]
    pub manifest_file: Option<PathBuf>,
}

fn default_log_every() -> u64 {
    1000
}

fn default_screen_every() -> u64 {
    10_000
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            state_file: None,
            trace_log: None,
            tree_log: None,
            log_every: default_log_every(),
            screen_every: default_screen_every(),
            manifest_file: None,
        }
    }
}

impl OutputConfig {
    /// Resolves every relative path against `dir`.
    pub fn rooted_at(&self, dir: &Path) -> Self {
        let root = |path: &Option<PathBuf>| path.as_ref().map(|p| dir.join(p));
        Self {
            state_file: root(&self.state_file),
            trace_log: root(&self.trace_log),
            tree_log: root(&self.tree_log),
            log_every: self.log_every,
            screen_every: self.screen_every,
            manifest_file: root(&self.manifest_file),
        }
    }
}

/// Clock used for operator runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClockConfig {
    /// Wall clock.
    #[default]
    Monotonic,
    /// Deterministic clock advancing by `step_ms` per read.
    Step {
        /// Milliseconds per read.
        #[serde(default = "default_step_ms")]
        step_ms: f64,
    },
}

fn default_step_ms() -> f64 {
    1.0
}
