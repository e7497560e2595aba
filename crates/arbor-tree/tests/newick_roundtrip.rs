use arbor_core::{RngHandle, StateNode};
use arbor_tree::{canonical_hash, random_coalescent, Tree};
use proptest::prelude::*;

#[test]
fn parses_heights_from_branch_lengths() {
    let tree = Tree::from_newick("(((A:1,B:1):1,C:2):1,D:3)").unwrap();
    assert_eq!(tree.leaf_count(), 4);
    assert_eq!(tree.node_count(), 7);
    assert_eq!(tree.root(), 6);
    assert_eq!(tree.root_height(), 3.0);
    let a = tree.leaf_by_taxon("A").unwrap();
    let ab = tree.parent(a).unwrap();
    assert_eq!(tree.height(ab), 1.0);
    assert_eq!(tree.height(tree.parent(ab).unwrap()), 2.0);
    assert!(tree.branch_lengths_valid());
}

#[test]
fn metadata_text_reproduces_numbering_and_heights() {
    let tree = Tree::from_newick("((A:0.1,B:0.1):0.2,(C:0.15,'D E':0.15):0.15);").unwrap();
    let text = tree.to_text("tree");
    assert!(text.contains("'D E'"));
    let mut restored = Tree::from_newick("((A:1,B:1):1,(C:1,X:1):1);").unwrap();
    restored.assign_from_text(&text).unwrap();
    restored.set_everything_dirty(false);
    let mut original = tree.clone();
    original.set_everything_dirty(false);
    assert_eq!(restored, original);
}

#[test]
fn rejects_taxon_count_change() {
    let four = Tree::from_newick("((A:1,B:1):1,(C:1,D:1):1);").unwrap();
    let mut three = Tree::from_newick("((A:1,B:1):1,C:2);").unwrap();
    let err = three.assign_from_text(&four.to_text("t")).unwrap_err();
    assert_eq!(err.code(), "taxon-count-mismatch");
}

proptest! {
    #[test]
    fn random_trees_survive_text_round_trip(seed in any::<u64>(), taxa in 2usize..12) {
        let names: Vec<String> = (0..taxa).map(|i| format!("t{i}")).collect();
        let mut rng = RngHandle::from_seed(seed);
        let tree = random_coalescent(&names, 0.7, &mut rng).unwrap();
        let parsed = Tree::from_newick(&tree.to_text("tree")).unwrap();
        prop_assert_eq!(canonical_hash(&parsed), canonical_hash(&tree));
        prop_assert_eq!(parsed.checksum(), tree.checksum());
    }
}
