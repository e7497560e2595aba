//! Tree topology and height moves.
//!
//! Each move is split into a deterministic core that edits a [`Tree`] given
//! every random choice, and an [`Operator`] that draws those choices. Cores
//! return [`Proposal::Invalid`] for degenerate inputs; they may leave the tree
//! partially edited in that case, which the state restore undoes.

use arbor_core::errors::{ArborError, ErrorInfo};
use arbor_core::{RngHandle, StateNodeId};
use arbor_tree::{NodeIndex, Tree};

use crate::bactrian::KernelDistribution;
use crate::moves_param::{SCALE_FACTOR_LOWER, SCALE_FACTOR_UPPER};
use crate::operator::{check_weight, tune_log_space, Operator, OperatorStats, Proposal, Tuner};
use crate::state::State;

/// 1 when an internal node has at least one internal child.
fn isg(tree: &Tree, idx: NodeIndex) -> usize {
    if tree.is_leaf(tree.left(idx)) && tree.is_leaf(tree.right(idx)) {
        0
    } else {
        1
    }
}

fn sisg(tree: &Tree, idx: NodeIndex) -> usize {
    if tree.is_leaf(idx) {
        0
    } else {
        isg(tree, idx)
    }
}

/// Internal nodes a narrow exchange may pick as grandparent.
pub fn valid_grandparents(tree: &Tree) -> usize {
    tree.internal_nodes().map(|idx| isg(tree, idx)).sum()
}

/// Narrow exchange below `grandparent`: one child of its older child swaps
/// places with its younger child. `pick_left` selects which grandchild moves.
///
/// The log Hastings ratio is `ln(before) - ln(after)` over
/// [`valid_grandparents`].
pub fn narrow_exchange_at(tree: &mut Tree, grandparent: NodeIndex, pick_left: bool) -> Proposal {
    if tree.is_leaf(grandparent) || isg(tree, grandparent) == 0 {
        return Proposal::Invalid;
    }
    let (mut parent, mut uncle) = (tree.left(grandparent), tree.right(grandparent));
    if tree.height(parent) < tree.height(uncle) {
        std::mem::swap(&mut parent, &mut uncle);
    }
    if tree.is_leaf(parent) {
        return Proposal::Invalid;
    }
    let before = valid_grandparents(tree);
    let moved_out = sisg(tree, parent) + sisg(tree, uncle);
    let grandchild = if pick_left {
        tree.left(parent)
    } else {
        tree.right(parent)
    };
    if tree.exchange_nodes(grandchild, uncle).is_err() {
        return Proposal::Invalid;
    }
    let after = before - moved_out + sisg(tree, parent) + sisg(tree, uncle);
    if after == 0 || !tree.branch_lengths_valid() {
        return Proposal::Invalid;
    }
    Proposal::from_log_ratio((before as f64).ln() - (after as f64).ln())
}

/// Wide exchange of the subtrees below `i` and `j`. Symmetric when valid.
pub fn wide_exchange_pair(tree: &mut Tree, i: NodeIndex, j: NodeIndex) -> Proposal {
    if i == j {
        return Proposal::Invalid;
    }
    let (Some(p), Some(jp)) = (tree.parent(i), tree.parent(j)) else {
        return Proposal::Invalid;
    };
    let unrelated = p != jp && i != jp && j != p;
    let ordered = tree.height(j) < tree.height(p) && tree.height(i) < tree.height(jp);
    if !(unrelated && ordered) {
        return Proposal::Invalid;
    }
    if tree.exchange_nodes(i, j).is_err() || !tree.branch_lengths_valid() {
        return Proposal::Invalid;
    }
    Proposal::symmetric()
}

/// Wilson-Balding move: prunes `i` together with its parent and regrafts it on
/// the branch above `j` at a height drawn from the new attachment window with
/// uniform variate `u`.
pub fn wilson_balding_move(tree: &mut Tree, i: NodeIndex, j: NodeIndex, u: f64) -> Proposal {
    if i == j || tree.is_root(i) || tree.is_root(j) {
        return Proposal::Invalid;
    }
    let (Some(p), Some(jp)) = (tree.parent(i), tree.parent(j)) else {
        return Proposal::Invalid;
    };
    let Some(pip) = tree.parent(p) else {
        return Proposal::Invalid;
    };
    if jp == p || j == p || jp == i {
        return Proposal::Invalid;
    }
    let cip = tree.other_child(p, i);

    let new_min = tree.height(i).max(tree.height(j));
    let new_range = tree.height(jp) - new_min;
    let new_age = new_min + u * new_range;
    let old_min = tree.height(i).max(tree.height(cip));
    let old_range = tree.height(pip) - old_min;
    if old_range == 0.0 || new_range == 0.0 {
        return Proposal::Invalid;
    }

    tree.replace_child(pip, p, cip);
    tree.replace_child(p, cip, j);
    tree.replace_child(jp, j, p);
    tree.set_height(p, new_age);

    if !tree.branch_lengths_valid() {
        return Proposal::Invalid;
    }
    Proposal::from_log_ratio((new_range / old_range.abs()).ln())
}

/// Stretches internal heights inside `(low, hi]` towards `low` by `scale`
/// and shifts older heights by the change of the upper boundary.
///
/// The log Hastings ratio is `scaled * ln(scale)`. Fewer than two scaled
/// nodes leave the transform underdetermined and give an invalid proposal.
pub fn epoch_flex_transform(tree: &mut Tree, low: f64, hi: f64, scale: f64) -> Proposal {
    let (low, hi) = if hi < low { (hi, low) } else { (low, hi) };
    let delta = (hi - low) * (scale - 1.0);
    let mut scaled = 0usize;
    for idx in tree.internal_nodes() {
        let height = tree.height(idx);
        if height > low && height <= hi {
            tree.set_height(idx, low + scale * (height - low));
            scaled += 1;
        } else if height > hi {
            tree.set_height(idx, height + delta);
        }
    }
    if scaled < 2 || !tree.branch_lengths_valid() {
        return Proposal::Invalid;
    }
    Proposal::from_log_ratio(scaled as f64 * scale.ln())
}

macro_rules! counters {
    () => {
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
            vec![self.tree]
        }
    };
}

/// Narrow or wide subtree exchange.
#[derive(Debug, Clone)]
pub struct ExchangeOperator {
    id: String,
    weight: f64,
    tree: StateNodeId,
    narrow: bool,
    stats: OperatorStats,
}

impl ExchangeOperator {
    /// Narrow exchange.
    pub fn narrow(id: impl Into<String>, weight: f64, tree: StateNodeId) -> Result<Self, ArborError> {
        Self::build(id.into(), weight, tree, true)
    }

    /// Wide exchange.
    pub fn wide(id: impl Into<String>, weight: f64, tree: StateNodeId) -> Result<Self, ArborError> {
        Self::build(id.into(), weight, tree, false)
    }

    fn build(id: String, weight: f64, tree: StateNodeId, narrow: bool) -> Result<Self, ArborError> {
        check_weight(&id, weight)?;
        Ok(Self {
            id,
            weight,
            tree,
            narrow,
            stats: OperatorStats::default(),
        })
    }

    /// True for the narrow variant.
    pub fn is_narrow(&self) -> bool {
        self.narrow
    }
}

impl Operator for ExchangeOperator {
    counters!();

    fn proposal(&mut self, state: &mut State, rng: &mut RngHandle) -> Result<Proposal, ArborError> {
        let tree = state.tree(self.tree)?;
        if self.narrow {
            if tree.internal_node_count() <= 1 {
                return Ok(Proposal::Invalid);
            }
            let candidates: Vec<NodeIndex> =
                tree.internal_nodes().filter(|&idx| isg(tree, idx) == 1).collect();
            if candidates.is_empty() {
                return Ok(Proposal::Invalid);
            }
            let grandparent = candidates[rng.index(candidates.len())];
            let pick_left = rng.coin();
            Ok(narrow_exchange_at(state.edit_tree(self.tree)?, grandparent, pick_left))
        } else {
            let count = tree.node_count();
            let root = tree.root();
            if count < 3 {
                return Ok(Proposal::Invalid);
            }
            let mut i = root;
            while i == root {
                i = rng.index(count);
            }
            let mut j = i;
            while j == i || j == root {
                j = rng.index(count);
            }
            Ok(wide_exchange_pair(state.edit_tree(self.tree)?, i, j))
        }
    }
}

/// Subtree prune and regraft that keeps the root fixed.
#[derive(Debug, Clone)]
pub struct WilsonBaldingOperator {
    id: String,
    weight: f64,
    tree: StateNodeId,
    stats: OperatorStats,
}

impl WilsonBaldingOperator {
    /// Wilson-Balding operator on `tree`.
    pub fn new(id: impl Into<String>, weight: f64, tree: StateNodeId) -> Result<Self, ArborError> {
        let id = id.into();
        check_weight(&id, weight)?;
        Ok(Self {
            id,
            weight,
            tree,
            stats: OperatorStats::default(),
        })
    }
}

impl Operator for WilsonBaldingOperator {
    counters!();

    fn proposal(&mut self, state: &mut State, rng: &mut RngHandle) -> Result<Proposal, ArborError> {
        let tree = state.tree(self.tree)?;
        let count = tree.node_count();
        let root = tree.root();
        if count < 3 {
            return Ok(Proposal::Invalid);
        }
        let mut i = root;
        while i == root {
            i = rng.index(count);
        }
        let height = tree.height(i);
        let j = loop {
            let j = rng.index(count);
            let above = tree.parent(j).map_or(true, |jp| tree.height(jp) > height);
            if above && j != i {
                break j;
            }
        };
        let u = rng.uniform();
        Ok(wilson_balding_move(state.edit_tree(self.tree)?, i, j, u))
    }
}

/// Stretches a height interval of the tree, either between two random
/// internal heights or across a group of coalescent intervals.
#[derive(Debug, Clone)]
pub struct EpochFlexOperator {
    id: String,
    weight: f64,
    tree: StateNodeId,
    scale_factor: f64,
    group_sizes: Option<Vec<usize>>,
    optimise: bool,
    kernel: KernelDistribution,
    stats: OperatorStats,
}

impl EpochFlexOperator {
    /// Epoch-flex operator with scale factor 0.05 and no interval groups.
    pub fn new(id: impl Into<String>, weight: f64, tree: StateNodeId) -> Result<Self, ArborError> {
        let id = id.into();
        check_weight(&id, weight)?;
        Ok(Self {
            id,
            weight,
            tree,
            scale_factor: 0.05,
            group_sizes: None,
            optimise: true,
            kernel: KernelDistribution::default(),
            stats: OperatorStats::default(),
        })
    }

    /// Sets the initial scale factor.
    pub fn with_scale_factor(mut self, scale_factor: f64) -> Result<Self, ArborError> {
        if !(scale_factor > 0.0 && scale_factor.is_finite()) {
            return Err(ArborError::Operator(
                ErrorInfo::new("bad-tuning", "scale factor must be positive and finite")
                    .with_context("id", self.id.clone())
                    .with_context("scale_factor", scale_factor.to_string()),
            ));
        }
        self.scale_factor = scale_factor.clamp(SCALE_FACTOR_LOWER, SCALE_FACTOR_UPPER);
        Ok(self)
    }

    /// Picks intervals from groups of consecutive coalescent events.
    pub fn with_group_sizes(mut self, sizes: Vec<usize>) -> Result<Self, ArborError> {
        if sizes.is_empty() || sizes.contains(&0) {
            return Err(ArborError::Operator(
                ErrorInfo::new("bad-group-sizes", "group sizes must be non-empty and positive")
                    .with_context("id", self.id.clone()),
            ));
        }
        self.group_sizes = Some(sizes);
        Ok(self)
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

    fn interval(&self, tree: &Tree, rng: &mut RngHandle) -> Option<(f64, f64)> {
        match &self.group_sizes {
            Some(sizes) => {
                let k = rng.index(sizes.len());
                let start: usize = sizes[..k].iter().sum();
                let times = tree.coalescent_times();
                let low = *times.get(start)?;
                let hi = *times.get(start + sizes[k])?;
                Some((low, hi))
            }
            None => {
                let internal = tree.internal_node_count();
                if internal < 2 {
                    return None;
                }
                let first = tree.leaf_count() + rng.index(internal);
                let mut second = first;
                while second == first {
                    second = tree.leaf_count() + rng.index(internal);
                }
                Some((tree.height(first), tree.height(second)))
            }
        }
    }
}

impl Operator for EpochFlexOperator {
    counters!();

    fn proposal(&mut self, state: &mut State, rng: &mut RngHandle) -> Result<Proposal, ArborError> {
        let Some((low, hi)) = self.interval(state.tree(self.tree)?, rng) else {
            return Ok(Proposal::Invalid);
        };
        let scale = self.kernel.scaler(rng, self.scale_factor);
        Ok(epoch_flex_transform(state.edit_tree(self.tree)?, low, hi, scale))
    }

    fn optimize(&mut self, log_alpha: f64, tuner: &mut Tuner) {
        if self.optimise {
            let delta = tuner.calc_delta(&self.stats, self.target_acceptance(), log_alpha);
            self.set_tuning(tune_log_space(self.scale_factor, delta));
        }
    }

    fn target_acceptance(&self) -> f64 {
        0.4
    }

    fn tuning(&self) -> Option<f64> {
        Some(self.scale_factor)
    }

    fn set_tuning(&mut self, value: f64) {
        self.scale_factor = value.clamp(SCALE_FACTOR_LOWER, SCALE_FACTOR_UPPER);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cherry_only_tree_has_no_narrow_move() {
        let mut tree = Tree::from_newick("(A:1,B:1);").unwrap();
        let root = tree.root();
        assert_eq!(narrow_exchange_at(&mut tree, root, true), Proposal::Invalid);
    }

    #[test]
    fn epoch_flex_needs_two_nodes_in_the_interval() {
        let mut tree = Tree::from_newick("((A:1,B:1):1,C:2);").unwrap();
        let proposal = epoch_flex_transform(&mut tree, 1.0, 2.0, 1.1);
        assert_eq!(proposal, Proposal::Invalid);
    }
}
