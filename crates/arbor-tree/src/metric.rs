//! Distances between trees over the same taxon set.

use std::collections::BTreeSet;

use crate::tree::{NodeIndex, Tree};

/// A distance between two trees.
pub trait TreeMetric: Send + Sync {
    /// Distance from `a` to `b`; zero for identical trees.
    fn distance(&self, a: &Tree, b: &Tree) -> f64;
}

/// Robinson-Foulds distance: size of the symmetric difference of the
/// non-trivial clade sets, with clades identified by taxon name.
#[derive(Debug, Clone, Copy, Default)]
pub struct RobinsonFoulds;

impl TreeMetric for RobinsonFoulds {
    fn distance(&self, a: &Tree, b: &Tree) -> f64 {
        let left = clades(a);
        let right = clades(b);
        left.symmetric_difference(&right).count() as f64
    }
}

/// Absolute difference between root heights.
#[derive(Debug, Clone, Copy, Default)]
pub struct RootHeightDistance;

impl TreeMetric for RootHeightDistance {
    fn distance(&self, a: &Tree, b: &Tree) -> f64 {
        (a.root_height() - b.root_height()).abs()
    }
}

/// Clades below internal non-root nodes as sorted taxon lists.
pub fn clades(tree: &Tree) -> BTreeSet<Vec<String>> {
    let mut below: Vec<Vec<String>> = vec![Vec::new(); tree.node_count()];
    let mut out = BTreeSet::new();
    for idx in tree.postorder() {
        let taxa = collect(tree, idx, &below);
        if !tree.is_leaf(idx) && !tree.is_root(idx) {
            out.insert(taxa.clone());
        }
        below[idx] = taxa;
    }
    out
}

fn collect(tree: &Tree, idx: NodeIndex, below: &[Vec<String>]) -> Vec<String> {
    if tree.is_leaf(idx) {
        return vec![tree.node(idx).taxon().unwrap_or("").to_string()];
    }
    let mut taxa: Vec<String> = tree
        .children(idx)
        .iter()
        .flat_map(|&child| below[child].iter().cloned())
        .collect();
    taxa.sort();
    taxa
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_topologies_have_zero_distance() {
        let a = Tree::from_newick("((A:1,B:1):1,(C:1,D:1):1);").unwrap();
        let b = Tree::from_newick("((D:2,C:2):1,(B:1,A:1):2);").unwrap();
        assert_eq!(RobinsonFoulds.distance(&a, &b), 0.0);
    }

    #[test]
    fn one_swap_moves_two_clades() {
        let a = Tree::from_newick("(((A:1,B:1):1,C:2):1,D:3);").unwrap();
        let b = Tree::from_newick("(((A:1,C:1):1,B:2):1,D:3);").unwrap();
        assert_eq!(RobinsonFoulds.distance(&a, &b), 2.0);
    }
}
