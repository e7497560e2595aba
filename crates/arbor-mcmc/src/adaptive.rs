//! Composite operator that learns which wrapped operator to delegate to.
//!
//! Selection runs in three phases keyed on the number of proposals made so
//! far. During burn-in the delegate is drawn uniformly and nothing is
//! recorded. During learning the sampler records, per delegate, the mean
//! squared change of every monitored quantity on acceptance together with the
//! acceptance rate and the mean runtime, while selection stays uniform. Once
//! teaching starts the delegate is drawn in proportion to
//!
//! ```text
//! acceptance(i) * sum_p mean_SS(i, p) / (runtime(i) * var(p)) / P
//! ```
//!
//! except for a fixed fraction of uniform draws that keeps every delegate
//! alive.

use std::collections::BTreeSet;
use std::sync::Arc;

use arbor_core::errors::{ArborError, ErrorInfo};
use arbor_core::{RngHandle, StateNode, StateNodeId};
use arbor_tree::{Tree, TreeMetric};
use serde_json::{json, Value};
use tracing::warn;

use crate::clock::{Clock, MonotonicClock};
use crate::operator::{
    base_record, check_weight, decode_f64, encode_f64, parse_base_record, record_map, Operator,
    OperatorStats, Proposal, Rejection, Tuner,
};
use crate::state::State;

const DEFAULT_BURNIN: u64 = 1000;
const LEARNIN_PER_OPERATOR: u64 = 100;
const DEFAULT_UNIFORM_P: f64 = 0.1;
const DEFAULT_MAX_RUNTIME_MS: f64 = 1e6;
const MIN_RUNTIME_MS: f64 = 0.001;

/// Builder for [`AdaptableOperatorSampler`].
pub struct AdaptableSamplerBuilder {
    id: String,
    weight: Option<f64>,
    operators: Vec<Box<dyn Operator>>,
    parameters: Vec<StateNodeId>,
    trees: Vec<StateNodeId>,
    metric: Option<Box<dyn TreeMetric>>,
    burnin: u64,
    learnin: Option<u64>,
    uniform_p: f64,
    max_runtime_ms: f64,
    clock: Option<Arc<dyn Clock>>,
}

impl AdaptableSamplerBuilder {
    /// Selection weight. Without one the sampler weighs itself by the
    /// dimension of what it monitors.
    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Adds a delegate.
    pub fn operator(mut self, operator: Box<dyn Operator>) -> Self {
        self.operators.push(operator);
        self
    }

    /// Monitors a real or integer parameter.
    pub fn parameter(mut self, id: StateNodeId) -> Self {
        self.parameters.push(id);
        self
    }

    /// Monitors a tree (its node heights, or a distance under the metric).
    pub fn tree(mut self, id: StateNodeId) -> Self {
        self.trees.push(id);
        self
    }

    /// Measures tree changes with `metric` instead of node heights.
    pub fn metric(mut self, metric: Box<dyn TreeMetric>) -> Self {
        self.metric = Some(metric);
        self
    }

    /// Proposals before any statistics are recorded.
    pub fn burnin(mut self, burnin: u64) -> Self {
        self.burnin = burnin;
        self
    }

    /// Proposals spent learning after burn-in. Defaults to 100 per delegate.
    pub fn learnin(mut self, learnin: u64) -> Self {
        self.learnin = Some(learnin);
        self
    }

    /// Probability of a uniform draw once teaching; clamped to `[0, 1]`.
    pub fn uniform_p(mut self, p: f64) -> Self {
        self.uniform_p = p.clamp(0.0, 1.0);
        self
    }

    /// Ceiling on a single runtime measurement.
    pub fn max_runtime_ms(mut self, ms: f64) -> Self {
        self.max_runtime_ms = ms;
        self
    }

    /// Clock used to time delegates.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validates the monitored nodes against `state` and builds the sampler.
    pub fn build(self, state: &State) -> Result<AdaptableOperatorSampler, ArborError> {
        let id = self.id;
        let mut operators = Vec::with_capacity(self.operators.len());
        for op in self.operators {
            if op.weight() > 0.0 {
                operators.push(op);
            } else {
                warn!(sampler = %id, operator = op.id(), "ignoring operator without positive weight");
            }
        }
        if operators.is_empty() {
            return Err(ArborError::Operator(
                ErrorInfo::new("empty-operator", "adaptive sampler has no operator to delegate to")
                    .with_context("id", id),
            ));
        }

        for &param in &self.parameters {
            state.nodes().parameter_values(param).map_err(|err| {
                ArborError::Operator(err.info().clone().with_context("sampler", id.clone()))
            })?;
        }
        for &tree in &self.trees {
            state.tree(tree).map_err(|err| {
                ArborError::Operator(err.info().clone().with_context("sampler", id.clone()))
            })?;
        }

        let num_params = if self.metric.is_some() {
            if self.trees.is_empty() || !self.parameters.is_empty() {
                return Err(ArborError::Operator(
                    ErrorInfo::new(
                        "bad-monitor",
                        "a tree metric needs at least one tree and no parameters",
                    )
                    .with_context("id", id),
                ));
            }
            1
        } else {
            self.parameters.len() + usize::from(!self.trees.is_empty())
        };

        let weight = match self.weight {
            Some(weight) => weight,
            None => dimensional_weight(state, &self.parameters, &self.trees, self.metric.is_some())?,
        };
        check_weight(&id, weight)?;

        let n = operators.len();
        let learnin = self.learnin.unwrap_or(LEARNIN_PER_OPERATOR * n as u64);
        Ok(AdaptableOperatorSampler {
            id,
            weight,
            stats: OperatorStats::default(),
            operators,
            parameters: self.parameters,
            trees: self.trees,
            metric: self.metric,
            clock: self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::new())),
            burnin: self.burnin,
            learnin,
            uniform_p: self.uniform_p,
            max_runtime_ms: self.max_runtime_ms,
            num_params,
            n_proposals: 0,
            param_mean_sum: vec![0.0; num_params],
            param_mean_ss: vec![0.0; num_params],
            mean_ss: vec![vec![0.0; num_params]; n],
            num_accepts: vec![0; n],
            num_proposals: vec![0; n],
            mean_runtimes: vec![MIN_RUNTIME_MS; n],
            weights: vec![1.0 / n as f64; n],
            last: 0,
            learning: self.burnin == 0,
            teaching: self.burnin + learnin == 0,
            before: Vec::new(),
            trees_before: Vec::new(),
            start_ms: 0.0,
        })
    }
}

/// Total dimension monitored: parameter dimensions plus tree node counts, or
/// the number of branches when a metric is used.
fn dimensional_weight(
    state: &State,
    parameters: &[StateNodeId],
    trees: &[StateNodeId],
    metric: bool,
) -> Result<f64, ArborError> {
    let mut weight = 0usize;
    for &tree in trees {
        let nodes = state.tree(tree)?.node_count();
        weight += if metric { nodes.saturating_sub(1) } else { nodes };
    }
    for &param in parameters {
        weight += state.get(param)?.dimension();
    }
    Ok(weight as f64)
}

/// Operator that delegates to a learned mixture of wrapped operators.
pub struct AdaptableOperatorSampler {
    id: String,
    weight: f64,
    stats: OperatorStats,
    operators: Vec<Box<dyn Operator>>,
    parameters: Vec<StateNodeId>,
    trees: Vec<StateNodeId>,
    metric: Option<Box<dyn TreeMetric>>,
    clock: Arc<dyn Clock>,
    burnin: u64,
    learnin: u64,
    uniform_p: f64,
    max_runtime_ms: f64,
    num_params: usize,
    n_proposals: u64,
    param_mean_sum: Vec<f64>,
    param_mean_ss: Vec<f64>,
    mean_ss: Vec<Vec<f64>>,
    num_accepts: Vec<u64>,
    num_proposals: Vec<u64>,
    mean_runtimes: Vec<f64>,
    weights: Vec<f64>,
    last: usize,
    learning: bool,
    teaching: bool,
    before: Vec<Vec<f64>>,
    trees_before: Vec<Tree>,
    start_ms: f64,
}

impl AdaptableOperatorSampler {
    /// Starts a builder with the default phase lengths.
    pub fn builder(id: impl Into<String>) -> AdaptableSamplerBuilder {
        AdaptableSamplerBuilder {
            id: id.into(),
            weight: None,
            operators: Vec::new(),
            parameters: Vec::new(),
            trees: Vec::new(),
            metric: None,
            burnin: DEFAULT_BURNIN,
            learnin: None,
            uniform_p: DEFAULT_UNIFORM_P,
            max_runtime_ms: DEFAULT_MAX_RUNTIME_MS,
            clock: None,
        }
    }

    /// Delegates in selection order.
    pub fn delegates(&self) -> impl Iterator<Item = &dyn Operator> + '_ {
        self.operators.iter().map(|op| op.as_ref())
    }

    /// Number of monitored quantities.
    pub fn num_params(&self) -> usize {
        self.num_params
    }

    /// Proposals made so far.
    pub fn proposals(&self) -> u64 {
        self.n_proposals
    }

    /// Whether statistics are being recorded.
    pub fn is_learning(&self) -> bool {
        self.learning
    }

    /// Whether selection uses the learned weights.
    pub fn is_teaching(&self) -> bool {
        self.teaching
    }

    /// Selection probabilities used for the last draw.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Mean runtime per delegate in milliseconds.
    pub fn mean_runtimes(&self) -> &[f64] {
        &self.mean_runtimes
    }

    /// Accepted proposals per delegate counted while learning.
    pub fn accepts(&self) -> &[u64] {
        &self.num_accepts
    }

    /// Proposals per delegate counted while learning.
    pub fn delegate_proposals(&self) -> &[u64] {
        &self.num_proposals
    }

    /// Mean squared change of quantity `param` under delegate `op`.
    pub fn mean_squared_change(&self, op: usize, param: usize) -> f64 {
        self.mean_ss[op][param]
    }

    /// Index of the delegate chosen by the last proposal.
    pub fn last_delegate(&self) -> usize {
        self.last
    }

    /// Current value of every monitored quantity. Trees contribute one entry
    /// holding the heights of all their nodes.
    fn monitored(&self, state: &State) -> Result<Vec<Vec<f64>>, ArborError> {
        let mut values = self
            .parameters
            .iter()
            .map(|&id| state.nodes().parameter_values(id))
            .collect::<Result<Vec<_>, _>>()?;
        if self.metric.is_none() && !self.trees.is_empty() {
            let mut heights = Vec::new();
            for &id in &self.trees {
                heights.extend(state.tree(id)?.monitored_values());
            }
            values.push(heights);
        }
        Ok(values)
    }

    fn update_param_stats(&mut self, values: &[Vec<f64>]) {
        let n = self.n_proposals.saturating_sub(self.burnin) as f64;
        for (p, dims) in values.iter().enumerate() {
            if dims.is_empty() {
                continue;
            }
            let mean = dims.iter().sum::<f64>() / dims.len() as f64;
            self.param_mean_sum[p] = (self.param_mean_sum[p] * n + mean) / (n + 1.0);
            self.param_mean_ss[p] = (self.param_mean_ss[p] * n + mean * mean) / (n + 1.0);
        }
    }

    fn selection_weights(&self) -> Vec<f64> {
        let n = self.operators.len();
        let mut weights = vec![0.0; n];
        for (i, weight) in weights.iter_mut().enumerate() {
            let acceptance = self.num_accepts[i] as f64 / self.num_proposals[i] as f64;
            let mut z_sum = 0.0;
            for p in 0..self.num_params {
                let variance = if self.metric.is_some() {
                    1.0
                } else {
                    self.param_mean_ss[p] - self.param_mean_sum[p] * self.param_mean_sum[p]
                };
                let z = self.mean_ss[i][p] / (self.mean_runtimes[i] * variance);
                if z.is_finite() {
                    z_sum += z;
                }
            }
            let w = acceptance * z_sum / self.num_params as f64;
            *weight = if w.is_finite() { w } else { 0.0 };
        }
        let total: f64 = weights.iter().sum();
        if total > 0.0 {
            weights.iter().map(|w| w / total).collect()
        } else {
            vec![1.0 / n as f64; n]
        }
    }

    fn record_runtime(&mut self) {
        let elapsed = (self.clock.now_ms() - self.start_ms).clamp(MIN_RUNTIME_MS, self.max_runtime_ms);
        let n = self.num_proposals[self.last].max(1) as f64;
        let mean = &mut self.mean_runtimes[self.last];
        *mean = (*mean * (n - 1.0) + elapsed) / n;
    }

    fn squared_changes(&self, state: &State) -> Vec<f64> {
        if let Some(metric) = &self.metric {
            let sq = self
                .trees
                .iter()
                .zip(&self.trees_before)
                .filter_map(|(&id, before)| {
                    state.tree(id).ok().map(|after| {
                        let d = metric.distance(before, after);
                        d * d
                    })
                })
                .sum();
            return vec![sq];
        }
        let after = match self.monitored(state) {
            Ok(after) => after,
            Err(err) => {
                warn!(sampler = %self.id, code = err.code(), "monitored values unavailable after a proposal");
                return Vec::new();
            }
        };
        after
            .iter()
            .zip(&self.before)
            .map(|(after, before)| {
                before
                    .iter()
                    .zip(after)
                    .map(|(b, a)| (b - a) * (b - a))
                    .sum()
            })
            .collect()
    }
}

impl Operator for AdaptableOperatorSampler {
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
        let nodes: BTreeSet<StateNodeId> =
            self.operators.iter().flat_map(|op| op.state_nodes()).collect();
        nodes.into_iter().collect()
    }

    fn proposal(&mut self, state: &mut State, rng: &mut RngHandle) -> Result<Proposal, ArborError> {
        let values = self.monitored(state)?;
        if self.metric.is_some() {
            self.trees_before = self
                .trees
                .iter()
                .map(|&id| state.tree(id).cloned())
                .collect::<Result<_, _>>()?;
        } else if self.learning {
            self.update_param_stats(&values);
        }
        self.before = values;

        let n = self.operators.len();
        self.weights = if self.teaching && rng.uniform() >= self.uniform_p {
            self.selection_weights()
        } else {
            vec![1.0 / n as f64; n]
        };
        let cumulative: Vec<f64> = self
            .weights
            .iter()
            .scan(0.0, |acc, w| {
                *acc += w;
                Some(*acc)
            })
            .collect();
        self.last = rng.sample_cumulative(&cumulative);

        self.n_proposals += 1;
        self.learning = self.n_proposals >= self.burnin;
        self.teaching = self.n_proposals >= self.burnin + self.learnin;
        if self.learning {
            self.num_proposals[self.last] += 1;
        }

        self.start_ms = self.clock.now_ms();
        self.operators[self.last].proposal(state, rng)
    }

    fn accept(&mut self, state: &State, tuner: &Tuner) {
        let past = tuner.is_past_delay();
        self.stats.record_accept(past);
        if self.learning {
            self.record_runtime();
            let changes = self.squared_changes(state);
            let op = self.last;
            let n = self.num_accepts[op] as f64;
            for (p, sq) in changes.into_iter().enumerate().take(self.num_params) {
                self.mean_ss[op][p] = (self.mean_ss[op][p] * n + sq) / (n + 1.0);
            }
            self.num_accepts[op] += 1;
        }
        self.operators[self.last].accept(state, tuner);
    }

    fn reject(&mut self, reason: Rejection, tuner: &Tuner) {
        let past = tuner.is_past_delay();
        self.stats.record_reject(reason, past);
        if self.learning {
            self.record_runtime();
        }
        self.operators[self.last].reject(reason, tuner);
    }

    fn optimize(&mut self, log_alpha: f64, tuner: &mut Tuner) {
        self.operators[self.last].optimize(log_alpha, tuner);
    }

    fn to_record(&self) -> Value {
        let mut record = base_record(&self.id, None, &self.stats);
        let floats = |values: &[f64]| Value::Array(values.iter().map(|&v| encode_f64(v)).collect());
        let flat: Vec<f64> = self.mean_ss.iter().flatten().copied().collect();
        if let Some(map) = record.as_object_mut() {
            map.insert("nProposals".into(), json!(self.n_proposals));
            map.insert("param_mean_sum".into(), floats(&self.param_mean_sum));
            map.insert("param_mean_SS".into(), floats(&self.param_mean_ss));
            map.insert("numAccepts".into(), json!(self.num_accepts));
            map.insert("numProposals".into(), json!(self.num_proposals));
            map.insert("operator_mean_runtimes".into(), floats(&self.mean_runtimes));
            map.insert("mean_SS".into(), floats(&flat));
            map.insert("weights".into(), floats(&self.weights));
            map.insert(
                "operators".into(),
                Value::Array(self.operators.iter().map(|op| op.to_record()).collect()),
            );
        }
        record
    }

    fn restore_record(&mut self, record: &Value) -> Result<(), ArborError> {
        let (_, stats) = parse_base_record(record)?;
        let map = record_map(record)?;
        let n = self.operators.len();
        let p = self.num_params;

        let num_accepts = self.u64_array(map.get("numAccepts"), "numAccepts", n, "operators")?;
        let num_proposals =
            self.u64_array(map.get("numProposals"), "numProposals", n, "operators")?;
        let runtimes = self.f64_array(
            map.get("operator_mean_runtimes"),
            "operator_mean_runtimes",
            n,
            "operators",
        )?;
        let param_mean_sum = self.f64_array(map.get("param_mean_sum"), "param_mean_sum", p, "params")?;
        let param_mean_ss = self.f64_array(map.get("param_mean_SS"), "param_mean_SS", p, "params")?;
        let flat = self.f64_array(
            map.get("mean_SS"),
            "mean_SS",
            n * p,
            "operator-parameter combinations",
        )?;
        let sub_records = match map.get("operators") {
            Some(Value::Array(records)) => records.as_slice(),
            _ => &[],
        };
        if sub_records.len() != n {
            return Err(self.mismatch("operators", sub_records.len(), n, "operators"));
        }
        let weights = match map.get("weights") {
            Some(value) => self.f64_array(Some(value), "weights", n, "operators")?,
            None => vec![1.0 / n as f64; n],
        };

        for (op, sub) in self.operators.iter_mut().zip(sub_records) {
            op.restore_record(sub)?;
        }
        self.stats = stats;
        self.n_proposals = map.get("nProposals").and_then(Value::as_u64).unwrap_or(0);
        self.learning = self.n_proposals >= self.burnin;
        self.teaching = self.n_proposals >= self.burnin + self.learnin;
        self.num_accepts = num_accepts;
        self.num_proposals = num_proposals;
        self.mean_runtimes = runtimes;
        self.param_mean_sum = param_mean_sum;
        self.param_mean_ss = param_mean_ss;
        self.mean_ss = if p == 0 {
            vec![Vec::new(); n]
        } else {
            flat.chunks(p).map(<[f64]>::to_vec).collect()
        };
        self.weights = weights;
        Ok(())
    }
}

impl AdaptableOperatorSampler {
    fn mismatch(&self, key: &str, found: usize, expected: usize, unit: &str) -> ArborError {
        ArborError::Checkpoint(
            ErrorInfo::new(
                "checkpoint-dimension-mismatch",
                format!(
                    "Cannot resume because there are {found} elements in {key} but {expected} {unit}"
                ),
            )
            .with_context("sampler", self.id.clone())
            .with_context("key", key.to_string())
            .with_context("found", found.to_string())
            .with_context("expected", expected.to_string()),
        )
    }

    fn f64_array(
        &self,
        value: Option<&Value>,
        key: &str,
        expected: usize,
        unit: &str,
    ) -> Result<Vec<f64>, ArborError> {
        let items = value.and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]);
        if items.len() != expected {
            return Err(self.mismatch(key, items.len(), expected, unit));
        }
        items
            .iter()
            .map(|item| {
                decode_f64(item).ok_or_else(|| {
                    ArborError::Checkpoint(
                        ErrorInfo::new("checkpoint-parse", "expected a number")
                            .with_context("sampler", self.id.clone())
                            .with_context("key", key.to_string()),
                    )
                })
            })
            .collect()
    }

    fn u64_array(
        &self,
        value: Option<&Value>,
        key: &str,
        expected: usize,
        unit: &str,
    ) -> Result<Vec<u64>, ArborError> {
        let items = value.and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]);
        if items.len() != expected {
            return Err(self.mismatch(key, items.len(), expected, unit));
        }
        items
            .iter()
            .map(|item| {
                item.as_u64().ok_or_else(|| {
                    ArborError::Checkpoint(
                        ErrorInfo::new("checkpoint-parse", "expected a count")
                            .with_context("sampler", self.id.clone())
                            .with_context("key", key.to_string()),
                    )
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::StepClock;
    use crate::moves_param::RandomWalkOperator;
    use crate::parameter::RealParameter;

    fn sampler() -> (State, AdaptableOperatorSampler) {
        let mut state = State::new();
        let x = state
            .add_real("x", RealParameter::unbounded(vec![0.0, 1.0]).unwrap())
            .unwrap();
        let a = RandomWalkOperator::new("a", 1.0, x, 0.5).unwrap();
        let b = RandomWalkOperator::new("b", 1.0, x, 2.0).unwrap();
        let zero = RandomWalkOperator::new("zero", 0.0, x, 1.0).unwrap();
        let sampler = AdaptableOperatorSampler::builder("aos")
            .operator(Box::new(a))
            .operator(Box::new(b))
            .operator(Box::new(zero))
            .parameter(x)
            .clock(Arc::new(StepClock::new(1.0)))
            .build(&state)
            .unwrap();
        (state, sampler)
    }

    #[test]
    fn zero_weight_delegates_are_dropped() {
        let (_, sampler) = sampler();
        assert_eq!(sampler.delegates().count(), 2);
        assert_eq!(sampler.weight(), 2.0);
        assert_eq!(sampler.num_params(), 1);
    }

    #[test]
    fn metric_with_parameters_is_refused() {
        let mut state = State::new();
        let x = state
            .add_real("x", RealParameter::unbounded(vec![0.0]).unwrap())
            .unwrap();
        let a = RandomWalkOperator::new("a", 1.0, x, 0.5).unwrap();
        let err = AdaptableOperatorSampler::builder("aos")
            .operator(Box::new(a))
            .parameter(x)
            .metric(Box::new(arbor_tree::RobinsonFoulds))
            .build(&state)
            .err()
            .unwrap();
        assert_eq!(err.code(), "bad-monitor");
    }

    #[test]
    fn record_lists_every_delegate() {
        let (_, sampler) = sampler();
        let record = sampler.to_record();
        assert_eq!(record["numAccepts"], json!([0, 0]));
        assert_eq!(record["mean_SS"].as_array().unwrap().len(), 2);
        assert_eq!(record["operators"].as_array().unwrap().len(), 2);
    }
}
