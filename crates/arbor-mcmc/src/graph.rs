//! Calculation graph: cached log densities over state nodes with dirty-driven
//! lazy recomputation.
//!
//! Calculation nodes are registered after their inputs, so registration order
//! is a topological order. Nodes are grouped into depth levels; every dirty
//! node of a level is independent of the others and may be evaluated on the
//! run's worker pool.

use std::fmt::Debug;

use arbor_core::errors::{ArborError, ErrorInfo};
use arbor_core::{CalcNodeId, StateNodeId};
use arbor_tree::Tree;
use indexmap::IndexMap;
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::parameter::{IntegerParameter, RealParameter};
use crate::state::StateNodes;

const AFFECTED_MEMO_CAPACITY: usize = 256;

/// Input edge of a calculation node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Input {
    /// A state node.
    State(StateNodeId),
    /// Another calculation node.
    Calc(CalcNodeId),
}

/// Read-only view handed to calculation nodes during evaluation.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    state: &'a StateNodes,
    log_p: &'a [f64],
    dirty: &'a [bool],
}

impl<'a> EvalContext<'a> {
    /// State arena.
    pub fn state(&self) -> &'a StateNodes {
        self.state
    }

    /// Real parameter behind `id`.
    pub fn real(&self, id: StateNodeId) -> Result<&'a RealParameter, ArborError> {
        self.state.real(id)
    }

    /// Integer parameter behind `id`.
    pub fn integer(&self, id: StateNodeId) -> Result<&'a IntegerParameter, ArborError> {
        self.state.integer(id)
    }

    /// Tree behind `id`.
    pub fn tree(&self, id: StateNodeId) -> Result<&'a Tree, ArborError> {
        self.state.tree(id)
    }

    /// Numeric values of a real or integer parameter.
    pub fn values(&self, id: StateNodeId) -> Result<Vec<f64>, ArborError> {
        self.state.parameter_values(id)
    }

    /// Current log density of another calculation node.
    pub fn log_p(&self, id: CalcNodeId) -> f64 {
        self.log_p[id.index()]
    }

    /// Whether an input changed in the current proposal.
    pub fn is_dirty(&self, input: Input) -> bool {
        match input {
            Input::State(id) => self.state.is_dirty(id),
            Input::Calc(id) => self.dirty[id.index()],
        }
    }
}

/// Cached computation over state nodes and other calculation nodes.
///
/// The engine owns the `(logP, storedLogP)` pair of every node; implementors
/// only compute. Nodes with private caches (partials, matrices) mirror the
/// store/restore/accept hooks.
pub trait CalculationNode: Send + Debug {
    /// Label used in breakdowns and by `sample_from_prior`.
    fn id(&self) -> &str;

    /// Inputs the node reads.
    fn inputs(&self) -> Vec<Input>;

    /// Whether the cached value must be recomputed. `inputs_dirty` is true when
    /// any input changed; returning false reuses the cached log density.
    fn requires_recalculation(&mut self, _ctx: &EvalContext<'_>, inputs_dirty: bool) -> bool {
        inputs_dirty
    }

    /// Computes the log density from the current inputs.
    fn calculate_log_p(&mut self, ctx: &EvalContext<'_>) -> Result<f64, ArborError>;

    /// Saves private caches before a proposal is evaluated.
    fn store(&mut self) {}

    /// Reverts private caches after a rejection.
    fn restore(&mut self) {}

    /// Commits private caches after an acceptance.
    fn accept(&mut self) {}

    /// Stochastic nodes return a noisy estimate on each evaluation.
    fn is_stochastic(&self) -> bool {
        false
    }

    /// Compound nodes sum their calculation-node inputs.
    fn is_compound(&self) -> bool {
        false
    }

    /// Removes a calculation-node input. Returns false when unsupported.
    fn drop_input(&mut self, _input: CalcNodeId) -> bool {
        false
    }

    /// Debug checksum of private caches.
    fn checksum(&self) -> Option<u64> {
        None
    }
}

/// Registered calculation nodes and their cached log densities.
#[derive(Debug, Default)]
pub struct ModelGraph {
    nodes: Vec<Box<dyn CalculationNode>>,
    log_p: Vec<f64>,
    stored_log_p: Vec<f64>,
    dirty: Vec<bool>,
    inputs: Vec<Vec<Input>>,
    level: Vec<usize>,
    level_count: usize,
    calc_outputs: Vec<Vec<usize>>,
    state_outputs: Vec<Vec<usize>>,
    reachable: Vec<bool>,
    root: Option<CalcNodeId>,
    affected_memo: IndexMap<Vec<StateNodeId>, Vec<usize>>,
    touched: Vec<usize>,
}

impl ModelGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node. Calculation-node inputs must already be registered.
    pub fn add(&mut self, node: Box<dyn CalculationNode>) -> Result<CalcNodeId, ArborError> {
        let index = self.nodes.len();
        let inputs = node.inputs();
        let mut level = 0;
        for input in &inputs {
            if let Input::Calc(calc) = input {
                if calc.index() >= index {
                    return Err(ArborError::State(
                        ErrorInfo::new("unknown-calc-node", "input registered after its consumer")
                            .with_context("node", node.id().to_string())
                            .with_context("input", calc.index().to_string()),
                    ));
                }
                level = level.max(self.level[calc.index()] + 1);
            }
        }
        if self.position(node.id()).is_some() {
            return Err(ArborError::State(
                ErrorInfo::new("duplicate-calc-node", "calculation node id already registered")
                    .with_context("id", node.id().to_string()),
            ));
        }
        self.nodes.push(node);
        self.log_p.push(0.0);
        self.stored_log_p.push(0.0);
        self.dirty.push(true);
        self.inputs.push(inputs);
        self.level.push(level);
        self.level_count = self.level_count.max(level + 1);
        self.root = Some(CalcNodeId::from_raw(index));
        self.rewire();
        Ok(CalcNodeId::from_raw(index))
    }

    /// Selects the posterior node. Defaults to the last registered node.
    pub fn set_root(&mut self, root: CalcNodeId) -> Result<(), ArborError> {
        self.check(root)?;
        self.root = Some(root);
        self.rewire();
        Ok(())
    }

    /// Posterior node.
    pub fn root(&self) -> Option<CalcNodeId> {
        self.root
    }

    /// Looks a node up by label.
    pub fn find(&self, id: &str) -> Option<CalcNodeId> {
        self.position(id).map(CalcNodeId::from_raw)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|node| node.id() == id)
    }

    fn check(&self, id: CalcNodeId) -> Result<(), ArborError> {
        if id.index() < self.nodes.len() {
            Ok(())
        } else {
            Err(ArborError::State(
                ErrorInfo::new("unknown-calc-node", "calculation node handle out of range")
                    .with_context("index", id.index().to_string()),
            ))
        }
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no node is registered.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Current log density of a node.
    pub fn log_p(&self, id: CalcNodeId) -> f64 {
        self.log_p[id.index()]
    }

    /// Stored log density of a node.
    pub fn stored_log_p(&self, id: CalcNodeId) -> f64 {
        self.stored_log_p[id.index()]
    }

    /// Current posterior (root log density).
    pub fn posterior(&self) -> f64 {
        self.root.map(|root| self.log_p[root.index()]).unwrap_or(0.0)
    }

    /// True when any reachable node is stochastic.
    pub fn is_stochastic(&self) -> bool {
        self.nodes
            .iter()
            .enumerate()
            .any(|(idx, node)| self.reachable[idx] && node.is_stochastic())
    }

    /// State nodes read by any reachable calculation node.
    pub(crate) fn state_inputs(&self) -> Vec<StateNodeId> {
        let mut ids: Vec<StateNodeId> = self
            .inputs
            .iter()
            .enumerate()
            .filter(|(idx, _)| self.reachable[*idx])
            .flat_map(|(_, inputs)| inputs.iter())
            .filter_map(|input| match input {
                Input::State(id) => Some(*id),
                Input::Calc(_) => None,
            })
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Removes the root's child labelled `label`, so the posterior becomes the
    /// prior. Returns whether a child was dropped.
    pub fn drop_root_child(&mut self, label: &str) -> bool {
        let (Some(root), Some(child)) = (self.root, self.find(label)) else {
            return false;
        };
        if !self.nodes[root.index()].drop_input(child) {
            return false;
        }
        self.inputs[root.index()].retain(|input| *input != Input::Calc(child));
        self.rewire();
        true
    }

    fn rewire(&mut self) {
        let count = self.nodes.len();
        self.calc_outputs = vec![Vec::new(); count];
        let state_len = self
            .inputs
            .iter()
            .flatten()
            .filter_map(|input| match input {
                Input::State(id) => Some(id.index() + 1),
                Input::Calc(_) => None,
            })
            .max()
            .unwrap_or(0);
        self.state_outputs = vec![Vec::new(); state_len];
        for (idx, inputs) in self.inputs.iter().enumerate() {
            for input in inputs {
                match input {
                    Input::State(id) => self.state_outputs[id.index()].push(idx),
                    Input::Calc(id) => self.calc_outputs[id.index()].push(idx),
                }
            }
        }
        self.reachable = vec![false; count];
        if let Some(root) = self.root {
            let mut stack = vec![root.index()];
            while let Some(idx) = stack.pop() {
                if self.reachable[idx] {
                    continue;
                }
                self.reachable[idx] = true;
                for input in &self.inputs[idx] {
                    if let Input::Calc(id) = input {
                        stack.push(id.index());
                    }
                }
            }
        }
        self.affected_memo.clear();
    }

    /// Reachable nodes downstream of `changed`, in topological order.
    fn affected(&mut self, changed: &[StateNodeId]) -> Vec<usize> {
        if let Some(hit) = self.affected_memo.get(changed) {
            return hit.clone();
        }
        let mut marked = vec![false; self.nodes.len()];
        let mut stack: Vec<usize> = changed
            .iter()
            .filter_map(|id| self.state_outputs.get(id.index()))
            .flatten()
            .copied()
            .collect();
        while let Some(idx) = stack.pop() {
            if marked[idx] {
                continue;
            }
            marked[idx] = true;
            stack.extend_from_slice(&self.calc_outputs[idx]);
        }
        let affected: Vec<usize> = (0..self.nodes.len())
            .filter(|&idx| marked[idx] && self.reachable[idx])
            .collect();
        if self.affected_memo.len() >= AFFECTED_MEMO_CAPACITY {
            self.affected_memo.shift_remove_index(0);
        }
        self.affected_memo.insert(changed.to_vec(), affected.clone());
        affected
    }

    /// Saves the nodes affected by `changed` (every reachable node when
    /// `everything` is set) ahead of evaluation.
    pub(crate) fn store_affected(&mut self, changed: &[StateNodeId], everything: bool) {
        self.touched = if everything {
            (0..self.nodes.len()).filter(|&idx| self.reachable[idx]).collect()
        } else {
            self.affected(changed)
        };
        for &idx in &self.touched {
            self.stored_log_p[idx] = self.log_p[idx];
            self.nodes[idx].store();
        }
    }

    /// Evaluates each touched node's dirtiness predicate in topological order.
    /// `force` marks every touched node dirty regardless of its predicate.
    pub(crate) fn check_dirtiness(&mut self, state: &StateNodes, force: bool) {
        for &idx in &self.touched {
            let inputs_dirty = self.inputs[idx].iter().any(|input| match input {
                Input::State(id) => state.is_dirty(*id),
                Input::Calc(id) => self.dirty[id.index()],
            });
            let ctx = EvalContext {
                state,
                log_p: &self.log_p,
                dirty: &self.dirty,
            };
            let needs = self.nodes[idx].requires_recalculation(&ctx, inputs_dirty);
            self.dirty[idx] = force || needs;
        }
    }

    /// Recomputes every dirty touched node level by level and returns the
    /// posterior.
    pub(crate) fn evaluate(
        &mut self,
        state: &StateNodes,
        pool: Option<&ThreadPool>,
    ) -> Result<f64, ArborError> {
        let root = self.root.ok_or_else(|| {
            ArborError::Posterior(ErrorInfo::new("no-posterior", "model graph has no root node"))
        })?;
        let mut due = vec![false; self.nodes.len()];
        for &idx in &self.touched {
            due[idx] = self.dirty[idx];
        }
        for level in 0..self.level_count {
            let batch: Vec<usize> = (0..self.nodes.len())
                .filter(|&idx| due[idx] && self.level[idx] == level)
                .collect();
            if batch.is_empty() {
                continue;
            }
            let results = {
                let ctx = EvalContext {
                    state,
                    log_p: &self.log_p,
                    dirty: &self.dirty,
                };
                let levels = &self.level;
                let compute = |nodes: &mut [Box<dyn CalculationNode>]| {
                    nodes
                        .par_iter_mut()
                        .enumerate()
                        .filter(|(idx, _)| due[*idx] && levels[*idx] == level)
                        .map(|(idx, node)| node.calculate_log_p(&ctx).map(|value| (idx, value)))
                        .collect::<Result<Vec<(usize, f64)>, ArborError>>()
                };
                match (pool, batch.len() > 1) {
                    (Some(pool), true) => pool.install(|| compute(&mut self.nodes)),
                    _ => batch
                        .iter()
                        .map(|&idx| self.nodes[idx].calculate_log_p(&ctx).map(|value| (idx, value)))
                        .collect(),
                }
            }?;
            for (idx, value) in results {
                self.log_p[idx] = value;
            }
        }
        Ok(self.log_p[root.index()])
    }

    /// Commits every touched node.
    pub(crate) fn accept(&mut self) {
        for &idx in &self.touched {
            self.stored_log_p[idx] = self.log_p[idx];
            self.nodes[idx].accept();
            self.dirty[idx] = false;
        }
        self.touched.clear();
    }

    /// Rolls every touched node back to its stored log density.
    pub(crate) fn restore(&mut self) {
        for &idx in &self.touched {
            self.log_p[idx] = self.stored_log_p[idx];
            self.nodes[idx].restore();
            self.dirty[idx] = false;
        }
        self.touched.clear();
    }

    /// Marks every node dirty or clean.
    pub(crate) fn set_everything_dirty(&mut self, dirty: bool) {
        self.dirty.iter_mut().for_each(|d| *d = dirty);
    }

    /// Recomputes every reachable non-stochastic node from scratch and sums the
    /// non-stochastic part of the posterior.
    pub(crate) fn recompute_non_stochastic(&mut self, state: &StateNodes) -> Result<f64, ArborError> {
        for idx in 0..self.nodes.len() {
            if !self.reachable[idx] || self.nodes[idx].is_stochastic() {
                continue;
            }
            let ctx = EvalContext {
                state,
                log_p: &self.log_p,
                dirty: &self.dirty,
            };
            self.log_p[idx] = self.nodes[idx].calculate_log_p(&ctx)?;
        }
        Ok(self.non_stochastic_log_p())
    }

    /// Non-stochastic part of the cached posterior: stochastic nodes count as
    /// zero and compound nodes sum their children.
    pub fn non_stochastic_log_p(&self) -> f64 {
        match self.root {
            Some(root) => self.non_stochastic_of(root.index()),
            None => 0.0,
        }
    }

    fn non_stochastic_of(&self, idx: usize) -> f64 {
        let node = &self.nodes[idx];
        if node.is_stochastic() {
            return 0.0;
        }
        if node.is_compound() {
            return self.inputs[idx]
                .iter()
                .filter_map(|input| match input {
                    Input::Calc(id) => Some(self.non_stochastic_of(id.index())),
                    Input::State(_) => None,
                })
                .sum();
        }
        self.log_p[idx]
    }

    /// Posterior breakdown, one line per node reachable from the root:
    /// `P(id) = logP (was storedLogP)`, with ` **` when the value changed.
    pub fn breakdown(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(root) = self.root {
            self.breakdown_of(root.index(), 0, &mut lines);
        }
        lines
    }

    fn breakdown_of(&self, idx: usize, depth: usize, lines: &mut Vec<String>) {
        let log_p = self.log_p[idx];
        let stored = self.stored_log_p[idx];
        let marker = if log_p.to_bits() == stored.to_bits() { "" } else { " **" };
        lines.push(format!(
            "{}P({}) = {} (was {}){}",
            "\t".repeat(depth),
            self.nodes[idx].id(),
            log_p,
            stored,
            marker
        ));
        for input in &self.inputs[idx] {
            if let Input::Calc(id) = input {
                self.breakdown_of(id.index(), depth + 1, lines);
            }
        }
    }

    /// Debug checksums of every node's cached value and private caches.
    pub(crate) fn checksums(&self) -> Vec<u64> {
        self.nodes
            .iter()
            .zip(&self.log_p)
            .map(|(node, log_p)| node.checksum().unwrap_or(0) ^ log_p.to_bits())
            .collect()
    }

    /// Label of node `idx`.
    pub fn label(&self, id: CalcNodeId) -> &str {
        self.nodes[id.index()].id()
    }
}
