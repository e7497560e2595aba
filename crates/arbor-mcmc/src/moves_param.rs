//! Parameter and whole-tree moves: scaling, random walks and up/down.

use arbor_core::errors::{ArborError, ErrorInfo};
use arbor_core::{RngHandle, StateNode, StateNodeId};

use crate::bactrian::KernelDistribution;
use crate::operator::{check_weight, tune_log_space, Operator, OperatorStats, Proposal, Tuner};
use crate::state::State;

/// Smallest scale factor tuning may reach.
pub const SCALE_FACTOR_LOWER: f64 = 1e-8;
/// Largest scale factor tuning may reach.
pub const SCALE_FACTOR_UPPER: f64 = 10.0;

fn check_positive(id: &str, field: &str, value: f64) -> Result<(), ArborError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ArborError::Operator(
            ErrorInfo::new("bad-tuning", "tuning parameter must be positive and finite")
                .with_context("id", id.to_string())
                .with_context(field, value.to_string()),
        ))
    }
}

/// What a [`ScaleOperator`] scales.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleTarget {
    /// A real parameter: one random dimension, or all of them together.
    Parameter {
        /// Parameter handle.
        id: StateNodeId,
        /// Scale every dimension by the same factor.
        scale_all: bool,
        /// Degrees of freedom used in the Hastings ratio when scaling all
        /// dimensions; defaults to the dimension count.
        degrees_of_freedom: Option<usize>,
    },
    /// A tree: every internal height, or the root height only.
    Tree {
        /// Tree handle.
        id: StateNodeId,
        /// Scale only the root.
        root_only: bool,
    },
}

impl ScaleTarget {
    fn node(&self) -> StateNodeId {
        match *self {
            ScaleTarget::Parameter { id, .. } | ScaleTarget::Tree { id, .. } => id,
        }
    }
}

/// Multiplicative move with a kernel-drawn scale `s`.
#[derive(Debug, Clone)]
pub struct ScaleOperator {
    id: String,
    weight: f64,
    target: ScaleTarget,
    scale_factor: f64,
    optimise: bool,
    kernel: KernelDistribution,
    stats: OperatorStats,
}

impl ScaleOperator {
    /// Scale operator with the default Bactrian kernel.
    pub fn new(
        id: impl Into<String>,
        weight: f64,
        target: ScaleTarget,
        scale_factor: f64,
    ) -> Result<Self, ArborError> {
        let id = id.into();
        check_weight(&id, weight)?;
        check_positive(&id, "scale_factor", scale_factor)?;
        Ok(Self {
            id,
            weight,
            target,
            scale_factor: scale_factor.clamp(SCALE_FACTOR_LOWER, SCALE_FACTOR_UPPER),
            optimise: true,
            kernel: KernelDistribution::default(),
            stats: OperatorStats::default(),
        })
    }

    /// Replaces the kernel.
    pub fn with_kernel(mut self, kernel: KernelDistribution) -> Self {
        self.kernel = kernel;
        self
    }

    /// Switches tuning on or off.
    pub fn with_optimise(mut self, optimise: bool) -> Self {
        self.optimise = optimise;
        self
    }

    /// What is scaled.
    pub fn target(&self) -> ScaleTarget {
        self.target
    }
}

impl Operator for ScaleOperator {
    fn id(&self) -> &str {
        &self.id
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn stats(&self) -> &OperatorStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut OperatorStats {
        &mut self.stats
    }

    fn state_nodes(&self) -> Vec<StateNodeId> {
        vec![self.target.node()]
    }

    fn proposal(&mut self, state: &mut State, rng: &mut RngHandle) -> Result<Proposal, ArborError> {
        match self.target {
            ScaleTarget::Tree { id, root_only: true } => {
                let tree = state.tree(id)?;
                let root = tree.root();
                let scale = self.kernel.scaler(rng, self.scale_factor);
                let new_height = tree.height(root) * scale;
                let oldest_child = tree
                    .children(root)
                    .iter()
                    .map(|&child| tree.height(child))
                    .fold(f64::NEG_INFINITY, f64::max);
                if new_height < oldest_child {
                    return Ok(Proposal::Invalid);
                }
                state.edit_tree(id)?.set_height(root, new_height);
                Ok(Proposal::from_log_ratio(scale.ln()))
            }
            ScaleTarget::Tree { id, root_only: false } => {
                let scale = self.kernel.scaler(rng, self.scale_factor);
                match state.edit_tree(id)?.scale(scale) {
                    Ok(scaled) => Ok(Proposal::from_log_ratio(scaled as f64 * scale.ln())),
                    Err(_) => Ok(Proposal::Invalid),
                }
            }
            ScaleTarget::Parameter {
                id,
                scale_all: true,
                degrees_of_freedom,
            } => {
                let scale = self.kernel.scaler(rng, self.scale_factor);
                match state.edit_real(id)?.scale(scale) {
                    Ok(computed) => {
                        let dof = degrees_of_freedom.unwrap_or(computed);
                        Ok(Proposal::from_log_ratio(dof as f64 * scale.ln()))
                    }
                    Err(_) => Ok(Proposal::Invalid),
                }
            }
            ScaleTarget::Parameter { id, .. } => {
                let param = state.real(id)?;
                let dim = rng.index(param.dimension());
                let old = param.value(dim);
                if old == 0.0 {
                    return Ok(Proposal::Invalid);
                }
                let scale = self.kernel.scaler(rng, self.scale_factor);
                let new = old * scale;
                if !param.in_bounds(new) {
                    return Ok(Proposal::Invalid);
                }
                state.edit_real(id)?.set_value(dim, new);
                Ok(Proposal::from_log_ratio(scale.ln()))
            }
        }
    }

    fn optimize(&mut self, log_alpha: f64, tuner: &mut Tuner) {
        if self.optimise {
            let delta = tuner.calc_delta(&self.stats, self.target_acceptance(), log_alpha);
            self.set_tuning(tune_log_space(self.scale_factor, delta));
        }
    }

    fn target_acceptance(&self) -> f64 {
        0.3
    }

    fn tuning(&self) -> Option<f64> {
        Some(self.scale_factor)
    }

    fn set_tuning(&mut self, value: f64) {
        self.scale_factor = value.clamp(SCALE_FACTOR_LOWER, SCALE_FACTOR_UPPER);
    }
}

/// Additive move on one random dimension of a real parameter.
#[derive(Debug, Clone)]
pub struct RandomWalkOperator {
    id: String,
    weight: f64,
    parameter: StateNodeId,
    window: f64,
    optimise: bool,
    kernel: KernelDistribution,
    stats: OperatorStats,
}

impl RandomWalkOperator {
    /// Random walk with window size `window`.
    pub fn new(
        id: impl Into<String>,
        weight: f64,
        parameter: StateNodeId,
        window: f64,
    ) -> Result<Self, ArborError> {
        let id = id.into();
        check_weight(&id, weight)?;
        check_positive(&id, "window", window)?;
        Ok(Self {
            id,
            weight,
            parameter,
            window,
            optimise: true,
            kernel: KernelDistribution::default(),
            stats: OperatorStats::default(),
        })
    }

    /// Replaces the kernel.
    pub fn with_kernel(mut self, kernel: KernelDistribution) -> Self {
        self.kernel = kernel;
        self
    }

    /// Switches tuning on or off.
    pub fn with_optimise(mut self, optimise: bool) -> Self {
        self.optimise = optimise;
        self
    }
}

impl Operator for RandomWalkOperator {
    fn id(&self) -> &str {
        &self.id
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn stats(&self) -> &OperatorStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut OperatorStats {
        &mut self.stats
    }

    fn state_nodes(&self) -> Vec<StateNodeId> {
        vec![self.parameter]
    }

    fn proposal(&mut self, state: &mut State, rng: &mut RngHandle) -> Result<Proposal, ArborError> {
        let param = state.real(self.parameter)?;
        let dim = rng.index(param.dimension());
        let new = param.value(dim) + self.kernel.random_delta(rng, self.window);
        if !param.in_bounds(new) {
            return Ok(Proposal::Invalid);
        }
        state.edit_real(self.parameter)?.set_value(dim, new);
        Ok(Proposal::symmetric())
    }

    fn optimize(&mut self, log_alpha: f64, tuner: &mut Tuner) {
        if self.optimise {
            let delta = tuner.calc_delta(&self.stats, self.target_acceptance(), log_alpha);
            self.window = tune_log_space(self.window, delta);
        }
    }

    fn tuning(&self) -> Option<f64> {
        Some(self.window)
    }

    fn set_tuning(&mut self, value: f64) {
        if value > 0.0 && value.is_finite() {
            self.window = value;
        }
    }
}

/// Uniform integer step in `[-window, window]` on one random dimension.
#[derive(Debug, Clone)]
pub struct IntRandomWalkOperator {
    id: String,
    weight: f64,
    parameter: StateNodeId,
    window: i64,
    stats: OperatorStats,
}

impl IntRandomWalkOperator {
    /// Integer random walk; `window` must be at least one.
    pub fn new(
        id: impl Into<String>,
        weight: f64,
        parameter: StateNodeId,
        window: i64,
    ) -> Result<Self, ArborError> {
        let id = id.into();
        check_weight(&id, weight)?;
        if window < 1 {
            return Err(ArborError::Operator(
                ErrorInfo::new("bad-tuning", "integer window must be at least one")
                    .with_context("id", id)
                    .with_context("window", window.to_string()),
            ));
        }
        Ok(Self {
            id,
            weight,
            parameter,
            window,
            stats: OperatorStats::default(),
        })
    }
}

impl Operator for IntRandomWalkOperator {
    fn id(&self) -> &str {
        &self.id
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn stats(&self) -> &OperatorStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut OperatorStats {
        &mut self.stats
    }

    fn state_nodes(&self) -> Vec<StateNodeId> {
        vec![self.parameter]
    }

    fn proposal(&mut self, state: &mut State, rng: &mut RngHandle) -> Result<Proposal, ArborError> {
        let param = state.integer(self.parameter)?;
        let dim = rng.index(param.dimension());
        let span = (2 * self.window + 1) as usize;
        let step = rng.index(span) as i64 - self.window;
        let new = param.value(dim) + step;
        if !param.in_bounds(new) {
            return Ok(Proposal::Invalid);
        }
        state.edit_integer(self.parameter)?.set_value(dim, new);
        Ok(Proposal::symmetric())
    }

    fn tuning(&self) -> Option<f64> {
        Some(self.window as f64)
    }
}

/// Scales "up" nodes by `s` and "down" nodes by `1/s`.
#[derive(Debug, Clone)]
pub struct UpDownOperator {
    id: String,
    weight: f64,
    up: Vec<StateNodeId>,
    down: Vec<StateNodeId>,
    scale_factor: f64,
    optimise: bool,
    kernel: KernelDistribution,
    stats: OperatorStats,
}

impl UpDownOperator {
    /// Up/down operator; at least one of `up` and `down` must be non-empty.
    pub fn new(
        id: impl Into<String>,
        weight: f64,
        up: Vec<StateNodeId>,
        down: Vec<StateNodeId>,
        scale_factor: f64,
    ) -> Result<Self, ArborError> {
        let id = id.into();
        check_weight(&id, weight)?;
        check_positive(&id, "scale_factor", scale_factor)?;
        if up.is_empty() && down.is_empty() {
            return Err(ArborError::Operator(
                ErrorInfo::new("empty-operator", "up/down operator needs something to scale")
                    .with_context("id", id),
            ));
        }
        Ok(Self {
            id,
            weight,
            up,
            down,
            scale_factor: scale_factor.clamp(SCALE_FACTOR_LOWER, SCALE_FACTOR_UPPER),
            optimise: true,
            kernel: KernelDistribution::default(),
            stats: OperatorStats::default(),
        })
    }

    /// Replaces the kernel.
    pub fn with_kernel(mut self, kernel: KernelDistribution) -> Self {
        self.kernel = kernel;
        self
    }

    /// Switches tuning on or off.
    pub fn with_optimise(mut self, optimise: bool) -> Self {
        self.optimise = optimise;
        self
    }
}

impl Operator for UpDownOperator {
    fn id(&self) -> &str {
        &self.id
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn stats(&self) -> &OperatorStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut OperatorStats {
        &mut self.stats
    }

    fn state_nodes(&self) -> Vec<StateNodeId> {
        let mut nodes: Vec<StateNodeId> = self.up.iter().chain(&self.down).copied().collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    fn proposal(&mut self, state: &mut State, rng: &mut RngHandle) -> Result<Proposal, ArborError> {
        let scale = self.kernel.scaler(rng, self.scale_factor);
        let mut going_up = 0usize;
        for &id in &self.up {
            match state.edit(id)?.scale(scale) {
                Ok(dof) => going_up += dof,
                Err(_) => return Ok(Proposal::Invalid),
            }
        }
        let mut going_down = 0usize;
        for &id in &self.down {
            match state.edit(id)?.scale(1.0 / scale) {
                Ok(dof) => going_down += dof,
                Err(_) => return Ok(Proposal::Invalid),
            }
        }
        let dof = going_up as f64 - going_down as f64;
        Ok(Proposal::from_log_ratio(dof * scale.ln()))
    }

    fn optimize(&mut self, log_alpha: f64, tuner: &mut Tuner) {
        if self.optimise {
            let delta = tuner.calc_delta(&self.stats, self.target_acceptance(), log_alpha);
            self.set_tuning(tune_log_space(self.scale_factor, delta));
        }
    }

    fn target_acceptance(&self) -> f64 {
        0.3
    }

    fn tuning(&self) -> Option<f64> {
        Some(self.scale_factor)
    }

    fn set_tuning(&mut self, value: f64) {
        self.scale_factor = value.clamp(SCALE_FACTOR_LOWER, SCALE_FACTOR_UPPER);
    }
}
