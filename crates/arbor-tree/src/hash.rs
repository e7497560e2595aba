use sha2::{Digest, Sha256};

use crate::tree::{NodeIndex, Tree};

/// Canonical structural hash of a tree.
///
/// Independent of node numbering and child order: two trees hash equal when
/// they have the same clades over the same taxa at bit-identical heights.
pub fn canonical_hash(tree: &Tree) -> String {
    let mut hasher = Sha256::new();
    hasher.update((tree.leaf_count() as u64).to_le_bytes());
    hasher.update(canonical_form(tree, tree.root()).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hash of the topology alone (heights ignored).
pub fn topology_hash(tree: &Tree) -> String {
    let mut hasher = Sha256::new();
    hasher.update(topology_form(tree, tree.root()).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn canonical_form(tree: &Tree, idx: NodeIndex) -> String {
    let height = tree.height(idx).to_bits();
    if tree.is_leaf(idx) {
        return format!("{}@{height:x}", tree.node(idx).taxon().unwrap_or(""));
    }
    let mut parts: Vec<String> = tree
        .children(idx)
        .iter()
        .map(|&child| canonical_form(tree, child))
        .collect();
    parts.sort();
    format!("({})@{height:x}", parts.join(","))
}

fn topology_form(tree: &Tree, idx: NodeIndex) -> String {
    if tree.is_leaf(idx) {
        return tree.node(idx).taxon().unwrap_or("").to_string();
    }
    let mut parts: Vec<String> = tree
        .children(idx)
        .iter()
        .map(|&child| topology_form(tree, child))
        .collect();
    parts.sort();
    format!("({})", parts.join(","))
}
