#![deny(missing_docs)]

//! Metropolis-Hastings engine for phylogenetic time trees and parameters.
//!
//! A [`State`] owns the sampled values and the calculation graph whose root
//! is the posterior. Operators edit the state in place; the kernel accepts or
//! restores the edit, tunes the operator and periodically audits the cached
//! posterior against a recomputation from scratch.

/// Adaptive meta-operator that learns which wrapped operator to use.
pub mod adaptive;
/// Incremental posterior audit and restore validation.
pub mod audit;
/// Bactrian and symmetric proposal kernels.
pub mod bactrian;
/// State and operator checkpoint files.
pub mod checkpoint;
/// Runtime clocks.
pub mod clock;
/// YAML run configuration schema and defaults.
pub mod config;
/// Per-run resources.
pub mod context;
/// Deterministic seed derivation helpers.
pub mod determinism;
/// Reference densities.
pub mod distributions;
/// Calculation graph.
pub mod graph;
/// Starting-state initialisers.
pub mod init;
/// Core sampling loop and public `run`/`resume` entry points.
pub mod kernel;
/// Trace, tree and screen loggers.
pub mod logger;
/// Run manifest serialization helpers.
pub mod manifest;
/// Posterior trace summaries.
pub mod metrics;
/// Parameter and whole-tree operators.
pub mod moves_param;
/// Tree topology and height operators.
pub mod moves_tree;
/// Operator contract and tuning.
pub mod operator;
/// Bounded real and integer vector parameters.
pub mod parameter;
/// YAML model registry.
pub mod registry;
/// Operator schedule.
pub mod schedule;
/// State arena.
pub mod state;

pub use adaptive::AdaptableOperatorSampler;
pub use config::{AuditConfig, OutputConfig, RunConfig, RunMode, TuningConfig};
pub use context::RunContext;
pub use graph::{CalculationNode, ModelGraph};
pub use kernel::{resume, run, RunSummary};
pub use metrics::PosteriorSample;
pub use operator::{Operator, Proposal, Rejection};
pub use parameter::{IntegerParameter, RealParameter};
pub use registry::{Model, ModelSpec};
pub use schedule::{OperatorRate, OperatorSchedule};
pub use state::{State, StateValue};
