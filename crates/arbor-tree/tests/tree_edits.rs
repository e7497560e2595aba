use arbor_core::{Dirtiness, StateNode};
use arbor_tree::{topology_hash, Tree};

fn balanced() -> Tree {
    Tree::from_newick("((A:1,B:1):1,(C:1.5,D:1.5):0.5);").unwrap()
}

#[test]
fn exchange_swaps_subtrees_and_marks_parents() {
    let mut tree = balanced();
    let a = tree.leaf_by_taxon("A").unwrap();
    let c = tree.leaf_by_taxon("C").unwrap();
    let pa = tree.parent(a).unwrap();
    let pc = tree.parent(c).unwrap();
    tree.exchange_nodes(a, c).unwrap();
    assert_eq!(tree.parent(a), Some(pc));
    assert_eq!(tree.parent(c), Some(pa));
    assert_eq!(tree.node(pa).dirtiness(), Dirtiness::Filthy);
    assert_eq!(topology_hash(&tree), topology_hash(&Tree::from_newick("((C:1,B:1):1,(A:1,D:1):1);").unwrap()));
}

#[test]
fn exchange_refuses_root() {
    let mut tree = balanced();
    let root = tree.root();
    let err = tree.exchange_nodes(root, 0).unwrap_err();
    assert_eq!(err.code(), "exchange-root");
}

#[test]
fn scale_counts_internal_nodes() {
    let mut tree = balanced();
    let scaled = tree.scale(2.0).unwrap();
    assert_eq!(scaled, 3);
    assert_eq!(tree.root_height(), 4.0);
}

#[test]
fn scale_with_dated_tips_can_fail() {
    let mut tree = Tree::from_newick("(A:0.5,B:1);").unwrap();
    // A sits at height 0.5, the root at 1.0.
    let err = tree.scale(0.25).unwrap_err();
    assert_eq!(err.code(), "negative-branch");
}
