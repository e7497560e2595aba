//! State arena, per-proposal copy-on-first-write and checkpoint text.
//!
//! Every sampled value lives in exactly one [`StateSlot`]. A proposal edits a
//! slot through [`State::edit`], which snapshots the value the first time it
//! is touched. Rejection swaps the snapshot back; acceptance drops it.

use arbor_core::errors::{ArborError, ErrorInfo};
use arbor_core::escape::{escape, unescape};
use arbor_core::{StateNode, StateNodeId};
use arbor_tree::Tree;
use indexmap::IndexMap;
use rayon::ThreadPool;
use sha2::{Digest, Sha256};

use crate::checkpoint::StateCheckpoint;
use crate::graph::{CalculationNode, ModelGraph};
use crate::parameter::{IntegerParameter, RealParameter};

/// Any sampled value kind.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    /// Real vector parameter.
    Real(RealParameter),
    /// Integer vector parameter.
    Integer(IntegerParameter),
    /// Time tree.
    Tree(Tree),
}

impl StateValue {
    /// Short kind label used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            StateValue::Real(_) => "real",
            StateValue::Integer(_) => "integer",
            StateValue::Tree(_) => "tree",
        }
    }
}

impl StateNode for StateValue {
    fn dimension(&self) -> usize {
        match self {
            StateValue::Real(p) => p.dimension(),
            StateValue::Integer(p) => p.dimension(),
            StateValue::Tree(t) => t.dimension(),
        }
    }

    fn is_dirty(&self) -> bool {
        match self {
            StateValue::Real(p) => p.is_dirty(),
            StateValue::Integer(p) => p.is_dirty(),
            StateValue::Tree(t) => t.is_dirty(),
        }
    }

    fn set_everything_dirty(&mut self, dirty: bool) {
        match self {
            StateValue::Real(p) => p.set_everything_dirty(dirty),
            StateValue::Integer(p) => p.set_everything_dirty(dirty),
            StateValue::Tree(t) => t.set_everything_dirty(dirty),
        }
    }

    fn to_text(&self, id: &str) -> String {
        match self {
            StateValue::Real(p) => p.to_text(id),
            StateValue::Integer(p) => p.to_text(id),
            StateValue::Tree(t) => t.to_text(id),
        }
    }

    fn assign_from_text(&mut self, text: &str) -> Result<(), ArborError> {
        match self {
            StateValue::Real(p) => p.assign_from_text(text),
            StateValue::Integer(p) => p.assign_from_text(text),
            StateValue::Tree(t) => t.assign_from_text(text),
        }
    }

    fn scale(&mut self, factor: f64) -> Result<usize, ArborError> {
        match self {
            StateValue::Real(p) => p.scale(factor),
            StateValue::Integer(p) => p.scale(factor),
            StateValue::Tree(t) => t.scale(factor),
        }
    }

    fn monitored_values(&self) -> Vec<f64> {
        match self {
            StateValue::Real(p) => p.monitored_values(),
            StateValue::Integer(p) => p.monitored_values(),
            StateValue::Tree(t) => t.monitored_values(),
        }
    }

    fn checksum(&self) -> u64 {
        match self {
            StateValue::Real(p) => p.checksum(),
            StateValue::Integer(p) => p.checksum(),
            StateValue::Tree(t) => t.checksum(),
        }
    }
}

/// Per-proposal lifecycle of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodePhase {
    /// Untouched since the last store.
    #[default]
    Clean,
    /// Edited by the current proposal; the snapshot holds the old value.
    ProposedDirty,
    /// Edited and accepted; reset to clean at the next store.
    Committed,
}

#[derive(Debug, Clone)]
struct StateSlot {
    id: String,
    value: StateValue,
    snapshot: Option<StateValue>,
    phase: NodePhase,
}

/// Arena of state nodes addressed by [`StateNodeId`].
#[derive(Debug, Clone, Default)]
pub struct StateNodes {
    slots: Vec<StateSlot>,
    by_id: IndexMap<String, StateNodeId>,
    changed: Vec<StateNodeId>,
    sample: i64,
}

impl StateNodes {
    fn slot(&self, id: StateNodeId) -> Result<&StateSlot, ArborError> {
        self.slots.get(id.index()).ok_or_else(|| unknown_handle(id))
    }

    /// Value behind a handle.
    pub fn get(&self, id: StateNodeId) -> Result<&StateValue, ArborError> {
        self.slot(id).map(|slot| &slot.value)
    }

    /// Label of a handle.
    pub fn label(&self, id: StateNodeId) -> Result<&str, ArborError> {
        self.slot(id).map(|slot| slot.id.as_str())
    }

    /// Handle registered under `label`.
    pub fn lookup(&self, label: &str) -> Option<StateNodeId> {
        self.by_id.get(label).copied()
    }

    /// Handles in registration order.
    pub fn ids(&self) -> impl Iterator<Item = StateNodeId> + '_ {
        self.by_id.values().copied()
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Real parameter behind a handle.
    pub fn real(&self, id: StateNodeId) -> Result<&RealParameter, ArborError> {
        match self.get(id)? {
            StateValue::Real(p) => Ok(p),
            other => Err(kind_mismatch(id, "real", other.kind())),
        }
    }

    /// Integer parameter behind a handle.
    pub fn integer(&self, id: StateNodeId) -> Result<&IntegerParameter, ArborError> {
        match self.get(id)? {
            StateValue::Integer(p) => Ok(p),
            other => Err(kind_mismatch(id, "integer", other.kind())),
        }
    }

    /// Tree behind a handle.
    pub fn tree(&self, id: StateNodeId) -> Result<&Tree, ArborError> {
        match self.get(id)? {
            StateValue::Tree(t) => Ok(t),
            other => Err(kind_mismatch(id, "tree", other.kind())),
        }
    }

    /// Values of a real or integer parameter as floats.
    pub fn parameter_values(&self, id: StateNodeId) -> Result<Vec<f64>, ArborError> {
        match self.get(id)? {
            StateValue::Tree(_) => Err(kind_mismatch(id, "parameter", "tree")),
            value => Ok(value.monitored_values()),
        }
    }

    /// Whether the node changed in the current proposal.
    pub fn is_dirty(&self, id: StateNodeId) -> bool {
        self.slots
            .get(id.index())
            .map(|slot| slot.phase == NodePhase::ProposedDirty || slot.value.is_dirty())
            .unwrap_or(false)
    }

    /// Lifecycle phase of a node.
    pub fn phase(&self, id: StateNodeId) -> Result<NodePhase, ArborError> {
        self.slot(id).map(|slot| slot.phase)
    }

    /// Sample number passed to the last store.
    pub fn sample(&self) -> i64 {
        self.sample
    }
}

fn unknown_handle(id: StateNodeId) -> ArborError {
    ArborError::State(
        ErrorInfo::new("unknown-state-node", "state node handle is not registered")
            .with_context("index", id.index().to_string()),
    )
}

fn kind_mismatch(id: StateNodeId, expected: &str, found: &str) -> ArborError {
    ArborError::State(
        ErrorInfo::new("kind-mismatch", "state node has a different kind")
            .with_context("index", id.index().to_string())
            .with_context("expected", expected.to_string())
            .with_context("found", found.to_string()),
    )
}

/// Sampled state plus the calculation graph evaluated over it.
#[derive(Debug, Default)]
pub struct State {
    nodes: StateNodes,
    graph: ModelGraph,
}

impl State {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a value under a unique label.
    pub fn add(&mut self, id: impl Into<String>, value: StateValue) -> Result<StateNodeId, ArborError> {
        let id = id.into();
        if self.nodes.by_id.contains_key(&id) {
            return Err(ArborError::State(
                ErrorInfo::new("duplicate-state-node", "state node id already registered")
                    .with_context("id", id),
            ));
        }
        let handle = StateNodeId::from_raw(self.nodes.slots.len());
        self.nodes.slots.push(StateSlot {
            id: id.clone(),
            value,
            snapshot: None,
            phase: NodePhase::Clean,
        });
        self.nodes.by_id.insert(id, handle);
        Ok(handle)
    }

    /// Registers a real parameter.
    pub fn add_real(&mut self, id: impl Into<String>, value: RealParameter) -> Result<StateNodeId, ArborError> {
        self.add(id, StateValue::Real(value))
    }

    /// Registers an integer parameter.
    pub fn add_integer(
        &mut self,
        id: impl Into<String>,
        value: IntegerParameter,
    ) -> Result<StateNodeId, ArborError> {
        self.add(id, StateValue::Integer(value))
    }

    /// Registers a tree.
    pub fn add_tree(&mut self, id: impl Into<String>, value: Tree) -> Result<StateNodeId, ArborError> {
        self.add(id, StateValue::Tree(value))
    }

    /// Registers a calculation node after checking its state inputs.
    pub fn add_calculation(
        &mut self,
        node: Box<dyn CalculationNode>,
    ) -> Result<arbor_core::CalcNodeId, ArborError> {
        for input in node.inputs() {
            if let crate::graph::Input::State(id) = input {
                self.nodes.slot(id)?;
            }
        }
        self.graph.add(node)
    }

    /// Read access to the arena.
    pub fn nodes(&self) -> &StateNodes {
        &self.nodes
    }

    /// Read access to the calculation graph.
    pub fn graph(&self) -> &ModelGraph {
        &self.graph
    }

    /// Mutable access to the calculation graph (root selection, prior-only runs).
    pub fn graph_mut(&mut self) -> &mut ModelGraph {
        &mut self.graph
    }

    /// Value behind a handle.
    pub fn get(&self, id: StateNodeId) -> Result<&StateValue, ArborError> {
        self.nodes.get(id)
    }

    /// Real parameter behind a handle.
    pub fn real(&self, id: StateNodeId) -> Result<&RealParameter, ArborError> {
        self.nodes.real(id)
    }

    /// Integer parameter behind a handle.
    pub fn integer(&self, id: StateNodeId) -> Result<&IntegerParameter, ArborError> {
        self.nodes.integer(id)
    }

    /// Tree behind a handle.
    pub fn tree(&self, id: StateNodeId) -> Result<&Tree, ArborError> {
        self.nodes.tree(id)
    }

    /// Handle registered under `label`.
    pub fn lookup(&self, label: &str) -> Result<StateNodeId, ArborError> {
        self.nodes.lookup(label).ok_or_else(|| {
            ArborError::State(
                ErrorInfo::new("unknown-state-node", "no state node with this id")
                    .with_context("id", label.to_string()),
            )
        })
    }

    /// Starts a new iteration: previously edited slots return to clean.
    pub fn store(&mut self, sample: i64) {
        self.nodes.sample = sample;
        for id in std::mem::take(&mut self.nodes.changed) {
            let slot = &mut self.nodes.slots[id.index()];
            slot.snapshot = None;
            slot.phase = NodePhase::Clean;
        }
    }

    /// Mutable access for a proposal. The first edit of a slot in an iteration
    /// takes the undo snapshot.
    pub fn edit(&mut self, id: StateNodeId) -> Result<&mut StateValue, ArborError> {
        let slot = self
            .nodes
            .slots
            .get_mut(id.index())
            .ok_or_else(|| unknown_handle(id))?;
        if slot.phase != NodePhase::ProposedDirty {
            slot.snapshot = Some(slot.value.clone());
            slot.phase = NodePhase::ProposedDirty;
            self.nodes.changed.push(id);
        }
        Ok(&mut slot.value)
    }

    /// Editable real parameter.
    pub fn edit_real(&mut self, id: StateNodeId) -> Result<&mut RealParameter, ArborError> {
        self.nodes.real(id)?;
        match self.edit(id)? {
            StateValue::Real(p) => Ok(p),
            other => Err(kind_mismatch(id, "real", other.kind())),
        }
    }

    /// Editable integer parameter.
    pub fn edit_integer(&mut self, id: StateNodeId) -> Result<&mut IntegerParameter, ArborError> {
        self.nodes.integer(id)?;
        match self.edit(id)? {
            StateValue::Integer(p) => Ok(p),
            other => Err(kind_mismatch(id, "integer", other.kind())),
        }
    }

    /// Editable tree.
    pub fn edit_tree(&mut self, id: StateNodeId) -> Result<&mut Tree, ArborError> {
        self.nodes.tree(id)?;
        match self.edit(id)? {
            StateValue::Tree(t) => Ok(t),
            other => Err(kind_mismatch(id, "tree", other.kind())),
        }
    }

    /// Replaces a value outside any proposal (initialisers, restores).
    pub fn assign(&mut self, id: StateNodeId, mut value: StateValue) -> Result<(), ArborError> {
        let slot = self
            .nodes
            .slots
            .get_mut(id.index())
            .ok_or_else(|| unknown_handle(id))?;
        if slot.value.kind() != value.kind() {
            return Err(kind_mismatch(id, slot.value.kind(), value.kind()));
        }
        value.set_everything_dirty(true);
        slot.value = value;
        Ok(())
    }

    /// Commits the proposal: snapshots are dropped.
    pub fn accept(&mut self) {
        for id in &self.nodes.changed {
            let slot = &mut self.nodes.slots[id.index()];
            if slot.phase == NodePhase::ProposedDirty {
                slot.snapshot = None;
                slot.phase = NodePhase::Committed;
            }
        }
    }

    /// Rolls every edited slot back to its snapshot.
    pub fn restore(&mut self) {
        for id in std::mem::take(&mut self.nodes.changed) {
            let slot = &mut self.nodes.slots[id.index()];
            if let Some(mut snapshot) = slot.snapshot.take() {
                snapshot.set_everything_dirty(false);
                slot.value = snapshot;
            }
            slot.phase = NodePhase::Clean;
        }
    }

    /// Marks every state and calculation node dirty (or clean).
    pub fn set_everything_dirty(&mut self, dirty: bool) {
        for slot in &mut self.nodes.slots {
            slot.value.set_everything_dirty(dirty);
        }
        self.graph.set_everything_dirty(dirty);
    }

    /// Saves the calculation nodes affected by the current edits.
    pub fn store_calculation_nodes(&mut self) {
        let mut changed = self.nodes.changed.clone();
        changed.sort();
        self.graph.store_affected(&changed, false);
    }

    /// Runs the dirtiness predicates of the affected calculation nodes.
    pub fn check_calculation_nodes_dirtiness(&mut self) {
        self.graph.check_dirtiness(&self.nodes, false);
    }

    /// Incrementally evaluates the posterior after an edit.
    pub fn calculate_log_p(&mut self, pool: Option<&ThreadPool>) -> Result<f64, ArborError> {
        self.store_calculation_nodes();
        self.check_calculation_nodes_dirtiness();
        self.graph.evaluate(&self.nodes, pool)
    }

    /// Commits the evaluated calculation nodes.
    pub fn accept_calculation_nodes(&mut self) {
        self.graph.accept();
    }

    /// Rolls the evaluated calculation nodes back.
    pub fn restore_calculation_nodes(&mut self) {
        self.graph.restore();
    }

    /// Recomputes the posterior from scratch, ignoring cached values and
    /// dirtiness predicates, and commits the result.
    pub fn robustly_calc_posterior(&mut self, pool: Option<&ThreadPool>) -> Result<f64, ArborError> {
        let sample = self.nodes.sample;
        self.store(-1);
        self.set_everything_dirty(true);
        self.graph.store_affected(&[], true);
        self.graph.check_dirtiness(&self.nodes, true);
        let result = self.graph.evaluate(&self.nodes, pool);
        self.set_everything_dirty(false);
        self.graph.accept();
        self.nodes.sample = sample;
        result
    }

    /// Recomputes the non-stochastic part of the posterior from scratch.
    pub fn robustly_calc_non_stochastic_posterior(&mut self) -> Result<f64, ArborError> {
        let sample = self.nodes.sample;
        self.store(-1);
        self.set_everything_dirty(true);
        self.graph.store_affected(&[], true);
        let result = self.graph.recompute_non_stochastic(&self.nodes);
        self.set_everything_dirty(false);
        self.graph.accept();
        self.nodes.sample = sample;
        result
    }

    /// Debug checksums of every state and calculation node.
    pub fn checksums(&self) -> Vec<u64> {
        let mut sums: Vec<u64> = self.nodes.slots.iter().map(|slot| slot.value.checksum()).collect();
        sums.extend(self.graph.checksums());
        sums
    }

    /// Serialises every state node for a checkpoint.
    pub fn to_checkpoint(&self, sample: i64) -> StateCheckpoint {
        StateCheckpoint {
            sample,
            nodes: self
                .nodes
                .slots
                .iter()
                .map(|slot| (slot.id.clone(), escape(&slot.value.to_text(&slot.id))))
                .collect(),
        }
    }

    /// Restores every state node from a checkpoint. Each registered node must
    /// appear exactly once; afterwards everything is dirty.
    pub fn restore_checkpoint(&mut self, checkpoint: &StateCheckpoint) -> Result<(), ArborError> {
        let mut seen = vec![false; self.nodes.slots.len()];
        for (label, text) in &checkpoint.nodes {
            let id = self.nodes.lookup(label).ok_or_else(|| {
                ArborError::Checkpoint(
                    ErrorInfo::new("unknown-state-node", "checkpoint names an unregistered node")
                        .with_context("id", label.clone()),
                )
            })?;
            let slot = &mut self.nodes.slots[id.index()];
            slot.value.assign_from_text(&unescape(text)).map_err(|err| {
                let info = err.info().clone().with_context("id", label.clone());
                ArborError::Checkpoint(info)
            })?;
            slot.snapshot = None;
            slot.phase = NodePhase::Clean;
            seen[id.index()] = true;
        }
        if let Some(missing) = seen.iter().position(|s| !s) {
            return Err(ArborError::Checkpoint(
                ErrorInfo::new("missing-state-node", "checkpoint lacks a registered node")
                    .with_context("id", self.nodes.slots[missing].id.clone()),
            ));
        }
        self.nodes.changed.clear();
        self.nodes.sample = checkpoint.sample;
        self.set_everything_dirty(true);
        Ok(())
    }

    /// SHA-256 over the checkpoint text of the current state.
    pub fn state_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_checkpoint(0).body().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
