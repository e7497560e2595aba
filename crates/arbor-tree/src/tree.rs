//! Binary time tree stored as a node arena.
//!
//! Leaves occupy indices `0..leaf_count`, internal nodes the remaining
//! indices. Node indices are stable across topology edits; only parent and
//! child links move.

use arbor_core::errors::{ArborError, ErrorInfo};
use arbor_core::{checksum_values, Dirtiness, StateNode};

use crate::newick;

/// Index of a node inside a [`Tree`].
pub type NodeIndex = usize;

/// A single node of a time tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    parent: Option<NodeIndex>,
    children: Vec<NodeIndex>,
    height: f64,
    taxon: Option<String>,
    dirty: Dirtiness,
}

impl TreeNode {
    /// Parent index, `None` for the root.
    pub fn parent(&self) -> Option<NodeIndex> {
        self.parent
    }

    /// Children indices (empty for leaves, two for internal nodes).
    pub fn children(&self) -> &[NodeIndex] {
        &self.children
    }

    /// Node height (time before present).
    pub fn height(&self) -> f64 {
        self.height
    }

    /// Taxon label carried by leaves.
    pub fn taxon(&self) -> Option<&str> {
        self.taxon.as_deref()
    }

    /// Change marker since the last clean.
    pub fn dirtiness(&self) -> Dirtiness {
        self.dirty
    }
}

/// Rooted binary tree with node heights.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    nodes: Vec<TreeNode>,
    root: NodeIndex,
    leaf_count: usize,
}

impl Tree {
    /// Builds a tree from parallel arrays indexed by node number.
    ///
    /// `taxa` names the leaves, which must be the first `taxa.len()` nodes.
    /// Every other node must have exactly two children and exactly one node
    /// must lack a parent.
    pub fn from_parts(
        taxa: Vec<String>,
        parents: &[Option<NodeIndex>],
        heights: &[f64],
    ) -> Result<Self, ArborError> {
        let count = parents.len();
        let leaf_count = taxa.len();
        if heights.len() != count {
            return Err(ArborError::Tree(
                ErrorInfo::new("length-mismatch", "parents and heights differ in length")
                    .with_context("parents", count.to_string())
                    .with_context("heights", heights.len().to_string()),
            ));
        }
        if leaf_count < 2 || count != 2 * leaf_count - 1 {
            return Err(ArborError::Tree(
                ErrorInfo::new("not-binary", "node count does not match a binary tree")
                    .with_context("leaves", leaf_count.to_string())
                    .with_context("nodes", count.to_string()),
            ));
        }
        let mut taxa = taxa.into_iter();
        let mut nodes: Vec<TreeNode> = (0..count)
            .map(|idx| TreeNode {
                parent: parents[idx],
                children: Vec::new(),
                height: heights[idx],
                taxon: if idx < leaf_count { taxa.next() } else { None },
                dirty: Dirtiness::Clean,
            })
            .collect();
        let mut root = None;
        for idx in 0..count {
            match parents[idx] {
                Some(parent) if parent < count && parent >= leaf_count => {
                    nodes[parent].children.push(idx);
                }
                Some(parent) => {
                    return Err(ArborError::Tree(
                        ErrorInfo::new("bad-parent", "parent index is not an internal node")
                            .with_context("node", idx.to_string())
                            .with_context("parent", parent.to_string()),
                    ));
                }
                None if root.is_none() => root = Some(idx),
                None => {
                    return Err(ArborError::Tree(
                        ErrorInfo::new("multiple-roots", "more than one node lacks a parent")
                            .with_context("node", idx.to_string()),
                    ));
                }
            }
        }
        let root = root.ok_or_else(|| {
            ArborError::Tree(ErrorInfo::new("no-root", "every node has a parent"))
        })?;
        for (idx, node) in nodes.iter().enumerate().skip(leaf_count) {
            if node.children.len() != 2 {
                return Err(ArborError::Tree(
                    ErrorInfo::new("not-binary", "internal node must have two children")
                        .with_context("node", idx.to_string())
                        .with_context("children", node.children.len().to_string()),
                ));
            }
        }
        let tree = Self {
            nodes,
            root,
            leaf_count,
        };
        tree.check_connected()?;
        Ok(tree)
    }

    /// Parses a Newick string. See [`newick::parse`].
    pub fn from_newick(text: &str) -> Result<Self, ArborError> {
        newick::parse(text)
    }

    fn check_connected(&self) -> Result<(), ArborError> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![self.root];
        while let Some(idx) = stack.pop() {
            if seen[idx] {
                return Err(ArborError::Tree(
                    ErrorInfo::new("cycle", "node reached twice").with_context("node", idx.to_string()),
                ));
            }
            seen[idx] = true;
            stack.extend_from_slice(&self.nodes[idx].children);
        }
        if let Some(orphan) = seen.iter().position(|s| !s) {
            return Err(ArborError::Tree(
                ErrorInfo::new("disconnected", "node not reachable from the root")
                    .with_context("node", orphan.to_string()),
            ));
        }
        Ok(())
    }

    /// Total number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of leaves.
    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Number of internal nodes, root included.
    pub fn internal_node_count(&self) -> usize {
        self.nodes.len() - self.leaf_count
    }

    /// Root index.
    pub fn root(&self) -> NodeIndex {
        self.root
    }

    /// Borrow a node.
    pub fn node(&self, idx: NodeIndex) -> &TreeNode {
        &self.nodes[idx]
    }

    /// True for the root.
    pub fn is_root(&self, idx: NodeIndex) -> bool {
        idx == self.root
    }

    /// True for leaves.
    pub fn is_leaf(&self, idx: NodeIndex) -> bool {
        idx < self.leaf_count
    }

    /// Parent of `idx`.
    pub fn parent(&self, idx: NodeIndex) -> Option<NodeIndex> {
        self.nodes[idx].parent
    }

    /// Children of `idx`.
    pub fn children(&self, idx: NodeIndex) -> &[NodeIndex] {
        &self.nodes[idx].children
    }

    /// First child of an internal node.
    pub fn left(&self, idx: NodeIndex) -> NodeIndex {
        self.nodes[idx].children[0]
    }

    /// Second child of an internal node.
    pub fn right(&self, idx: NodeIndex) -> NodeIndex {
        self.nodes[idx].children[1]
    }

    /// Height of `idx`.
    pub fn height(&self, idx: NodeIndex) -> f64 {
        self.nodes[idx].height
    }

    /// Height of the root.
    pub fn root_height(&self) -> f64 {
        self.nodes[self.root].height
    }

    /// Length of the branch above `idx` (zero for the root).
    pub fn branch_length(&self, idx: NodeIndex) -> f64 {
        match self.nodes[idx].parent {
            Some(parent) => self.nodes[parent].height - self.nodes[idx].height,
            None => 0.0,
        }
    }

    /// The other child of `idx`'s parent.
    pub fn sibling(&self, idx: NodeIndex) -> Option<NodeIndex> {
        let parent = self.nodes[idx].parent?;
        self.nodes[parent].children.iter().copied().find(|&c| c != idx)
    }

    /// Child of `parent` that is not `child`.
    pub fn other_child(&self, parent: NodeIndex, child: NodeIndex) -> NodeIndex {
        let children = &self.nodes[parent].children;
        if children[0] == child {
            children[1]
        } else {
            children[0]
        }
    }

    /// Taxon names ordered by leaf index.
    pub fn taxa(&self) -> Vec<&str> {
        self.nodes[..self.leaf_count]
            .iter()
            .map(|node| node.taxon.as_deref().unwrap_or(""))
            .collect()
    }

    /// Leaf index carrying `taxon`.
    pub fn leaf_by_taxon(&self, taxon: &str) -> Option<NodeIndex> {
        self.nodes[..self.leaf_count]
            .iter()
            .position(|node| node.taxon.as_deref() == Some(taxon))
    }

    /// Internal node indices (root included).
    pub fn internal_nodes(&self) -> std::ops::Range<NodeIndex> {
        self.leaf_count..self.nodes.len()
    }

    /// Post-order traversal starting at the root.
    pub fn postorder(&self) -> Vec<NodeIndex> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(idx) = stack.pop() {
            order.push(idx);
            stack.extend_from_slice(&self.nodes[idx].children);
        }
        order.reverse();
        order
    }

    /// Sets the height of `idx`, marking it and its children dirty (their
    /// branch lengths change too).
    pub fn set_height(&mut self, idx: NodeIndex, height: f64) {
        self.nodes[idx].height = height;
        self.mark(idx, Dirtiness::Dirty);
        for child in self.nodes[idx].children.clone() {
            self.mark(child, Dirtiness::Dirty);
        }
    }

    /// Replaces `child` of `parent` with `replacement`, rewiring the parent
    /// link of `replacement`. `child` is left detached.
    pub fn replace_child(&mut self, parent: NodeIndex, child: NodeIndex, replacement: NodeIndex) {
        if let Some(slot) = self.nodes[parent].children.iter_mut().find(|c| **c == child) {
            *slot = replacement;
        }
        self.nodes[replacement].parent = Some(parent);
        if self.nodes[child].parent == Some(parent) {
            self.nodes[child].parent = None;
        }
        self.mark(parent, Dirtiness::Filthy);
        self.mark(replacement, Dirtiness::Filthy);
    }

    /// Swaps the subtrees rooted at `a` and `b` between their parents.
    pub fn exchange_nodes(&mut self, a: NodeIndex, b: NodeIndex) -> Result<(), ArborError> {
        let (pa, pb) = match (self.nodes[a].parent, self.nodes[b].parent) {
            (Some(pa), Some(pb)) => (pa, pb),
            _ => {
                return Err(ArborError::Tree(
                    ErrorInfo::new("exchange-root", "cannot exchange the root")
                        .with_context("a", a.to_string())
                        .with_context("b", b.to_string()),
                ))
            }
        };
        self.replace_child(pa, a, b);
        self.replace_child(pb, b, a);
        Ok(())
    }

    fn mark(&mut self, idx: NodeIndex, level: Dirtiness) {
        let node = &mut self.nodes[idx];
        if level > node.dirty {
            node.dirty = level;
        }
    }

    /// True when every branch length is non-negative.
    pub fn branch_lengths_valid(&self) -> bool {
        (0..self.nodes.len()).all(|idx| self.branch_length(idx) >= 0.0)
    }

    /// Writes plain Newick with taxon labels and branch lengths.
    pub fn to_newick(&self) -> String {
        newick::write(self, false)
    }

    /// Sorted heights of internal nodes preceded by the youngest tip height.
    ///
    /// Entry `j` is the time at which `j` coalescences have happened, so a
    /// group of `k` consecutive coalescent events starting after event `j`
    /// spans `[times[j], times[j + k]]`.
    pub fn coalescent_times(&self) -> Vec<f64> {
        let youngest = self.nodes[..self.leaf_count]
            .iter()
            .map(|node| node.height)
            .fold(f64::INFINITY, f64::min);
        let mut times: Vec<f64> = self.internal_nodes().map(|idx| self.nodes[idx].height).collect();
        times.sort_by(f64::total_cmp);
        times.insert(0, youngest);
        times
    }

    pub(crate) fn assign(&mut self, other: Tree) {
        *self = other;
        self.set_everything_dirty(true);
    }
}

impl StateNode for Tree {
    fn dimension(&self) -> usize {
        self.nodes.len()
    }

    fn is_dirty(&self) -> bool {
        self.nodes.iter().any(|node| node.dirty.is_dirty())
    }

    fn set_everything_dirty(&mut self, dirty: bool) {
        let level = if dirty {
            Dirtiness::Filthy
        } else {
            Dirtiness::Clean
        };
        for node in &mut self.nodes {
            node.dirty = level;
        }
    }

    fn to_text(&self, _id: &str) -> String {
        newick::write(self, true)
    }

    fn assign_from_text(&mut self, text: &str) -> Result<(), ArborError> {
        let parsed = newick::parse(text)?;
        if parsed.leaf_count != self.leaf_count && self.leaf_count > 0 {
            return Err(ArborError::Tree(
                ErrorInfo::new("taxon-count-mismatch", "stored tree has a different taxon count")
                    .with_context("expected", self.leaf_count.to_string())
                    .with_context("found", parsed.leaf_count.to_string()),
            ));
        }
        self.assign(parsed);
        Ok(())
    }

    fn scale(&mut self, factor: f64) -> Result<usize, ArborError> {
        let mut scaled = 0;
        for idx in self.internal_nodes() {
            let height = self.nodes[idx].height * factor;
            self.set_height(idx, height);
            scaled += 1;
        }
        if !self.branch_lengths_valid() {
            return Err(ArborError::Tree(
                ErrorInfo::new("negative-branch", "scaling produced a negative branch length")
                    .with_context("factor", factor.to_string()),
            ));
        }
        Ok(scaled)
    }

    fn monitored_values(&self) -> Vec<f64> {
        self.nodes.iter().map(|node| node.height).collect()
    }

    fn checksum(&self) -> u64 {
        let links = self.nodes.iter().map(|node| match node.parent {
            Some(parent) => parent as f64,
            None => -1.0,
        });
        let heights = self.nodes.iter().map(|node| node.height);
        checksum_values(links.chain(heights).chain(std::iter::once(self.root as f64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cherry_with_outgroup() -> Tree {
        // ((A,B)3,C)4
        Tree::from_parts(
            vec!["A".into(), "B".into(), "C".into()],
            &[Some(3), Some(3), Some(4), Some(4), None],
            &[0.0, 0.0, 0.0, 1.0, 2.0],
        )
        .unwrap()
    }

    #[test]
    fn set_height_marks_children_dirty() {
        let mut tree = cherry_with_outgroup();
        tree.set_height(3, 0.5);
        assert_eq!(tree.node(3).dirtiness(), Dirtiness::Dirty);
        assert_eq!(tree.node(0).dirtiness(), Dirtiness::Dirty);
        assert_eq!(tree.node(2).dirtiness(), Dirtiness::Clean);
    }

    #[test]
    fn coalescent_times_start_at_youngest_tip() {
        let tree = cherry_with_outgroup();
        assert_eq!(tree.coalescent_times(), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn rejects_multiple_roots() {
        let err = Tree::from_parts(
            vec!["A".into(), "B".into()],
            &[Some(2), None, None],
            &[0.0, 0.0, 1.0],
        )
        .unwrap_err();
        assert!(matches!(err, ArborError::Tree(info) if info.code == "multiple-roots"));
    }
}
