use arbor_core::{RngHandle, StateNodeId};
use arbor_mcmc::moves_tree::{
    epoch_flex_transform, narrow_exchange_at, valid_grandparents, wide_exchange_pair,
    wilson_balding_move, EpochFlexOperator, ExchangeOperator,
};
use arbor_mcmc::{Operator, Proposal, State};
use arbor_tree::{random_coalescent, topology_hash, Tree};
use proptest::prelude::*;

fn node_above(tree: &Tree, taxon: &str, steps: usize) -> usize {
    let mut idx = tree.leaf_by_taxon(taxon).unwrap();
    for _ in 0..steps {
        idx = tree.parent(idx).unwrap();
    }
    idx
}

#[test]
fn wide_exchange_refuses_root_adjacent_nodes() {
    let mut tree = Tree::from_newick("(((A:1,B:1):1,C:2):1,D:3)").unwrap();
    let abc = node_above(&tree, "C", 1);
    let d = tree.leaf_by_taxon("D").unwrap();
    let root = tree.root();

    let proposal = wide_exchange_pair(&mut tree, abc, d);
    assert_eq!(proposal, Proposal::Invalid);
    assert_eq!(proposal.log_hastings_ratio(), f64::NEG_INFINITY);
    assert_eq!(wide_exchange_pair(&mut tree, root, d), Proposal::Invalid);
    assert_eq!(wide_exchange_pair(&mut tree, d, d), Proposal::Invalid);
}

#[test]
fn wide_exchange_is_symmetric_when_valid() {
    let mut tree = Tree::from_newick("(((A:1,B:1):1,C:2):1,D:3)").unwrap();
    let a = tree.leaf_by_taxon("A").unwrap();
    let d = tree.leaf_by_taxon("D").unwrap();
    assert_eq!(wide_exchange_pair(&mut tree, a, d), Proposal::Move(0.0));
    assert!(tree.branch_lengths_valid());
    let expected = Tree::from_newick("(((D:1,B:1):1,C:2):1,A:3)").unwrap();
    assert_eq!(topology_hash(&tree), topology_hash(&expected));
}

#[test]
fn wide_exchange_refuses_negative_branches() {
    let mut tree = Tree::from_newick("(((A:1,B:1):1,C:2):1,D:3)").unwrap();
    let ab = node_above(&tree, "A", 1);
    let d = tree.leaf_by_taxon("D").unwrap();
    let c = tree.leaf_by_taxon("C").unwrap();
    // A hangs below AB, so the pair is related.
    let a = tree.leaf_by_taxon("A").unwrap();
    assert_eq!(wide_exchange_pair(&mut tree, ab, a), Proposal::Invalid);
    assert_eq!(wide_exchange_pair(&mut tree, c, d), Proposal::Move(0.0));
}

#[test]
fn narrow_exchange_on_cherry_is_invalid() {
    let mut tree = Tree::from_newick("(A:1,B:1)").unwrap();
    let root = tree.root();
    assert_eq!(narrow_exchange_at(&mut tree, root, false), Proposal::Invalid);

    let mut state = State::new();
    let id = state.add_tree("t", tree).unwrap();
    let mut op = ExchangeOperator::narrow("narrow", 1.0, id).unwrap();
    let mut rng = RngHandle::from_seed(1);
    state.store(0);
    let proposal = op.proposal(&mut state, &mut rng).unwrap();
    assert_eq!(proposal.log_hastings_ratio(), f64::NEG_INFINITY);
}

#[test]
fn narrow_exchange_refuses_an_older_tip_uncle() {
    // Two internal nodes; C is older than the AB cherry, so there is no parent to swap below.
    let mut state = State::new();
    let id = state
        .add_tree("t", Tree::from_newick("((A:1,B:1):2,C:0.5);").unwrap())
        .unwrap();
    let mut op = ExchangeOperator::narrow("narrow", 1.0, id).unwrap();
    let mut rng = RngHandle::from_seed(5);
    for _ in 0..20 {
        state.store(0);
        let proposal = op.proposal(&mut state, &mut rng).unwrap();
        assert_eq!(proposal.log_hastings_ratio(), f64::NEG_INFINITY);
        state.restore();
    }
}

#[test]
fn narrow_exchange_counts_grandparents() {
    // ((A,B),(C,D)) has two cherries below the root: one valid grandparent.
    let mut tree = Tree::from_newick("((A:1,B:1):1,(C:1.5,D:1.5):0.5)").unwrap();
    assert_eq!(valid_grandparents(&tree), 1);
    let root = tree.root();
    let proposal = narrow_exchange_at(&mut tree, root, true);
    // The older child CD loses a tip to AB, leaving a caterpillar with two
    // valid grandparents.
    assert_eq!(valid_grandparents(&tree), 2);
    assert_eq!(proposal, Proposal::Move(1f64.ln() - 2f64.ln()));
    assert!(tree.branch_lengths_valid());
}

proptest! {
    #[test]
    fn narrow_ratio_matches_grandparent_counts(seed in any::<u64>(), taxa in 4usize..10) {
        let names: Vec<String> = (0..taxa).map(|i| format!("t{i}")).collect();
        let mut rng = RngHandle::from_seed(seed);
        let tree = random_coalescent(&names, 1.0, &mut rng).unwrap();
        for gp in tree.internal_nodes() {
            for pick_left in [true, false] {
                let mut edited = tree.clone();
                let before = valid_grandparents(&tree);
                match narrow_exchange_at(&mut edited, gp, pick_left) {
                    Proposal::Move(ratio) => {
                        let after = valid_grandparents(&edited);
                        prop_assert!(before >= 1 && after >= 1);
                        prop_assert_eq!(ratio, (before as f64).ln() - (after as f64).ln());
                        prop_assert!(edited.branch_lengths_valid());
                    }
                    Proposal::Invalid => {}
                }
            }
        }
    }

    #[test]
    fn wide_exchange_never_returns_a_nonzero_ratio(seed in any::<u64>(), taxa in 3usize..10) {
        let names: Vec<String> = (0..taxa).map(|i| format!("t{i}")).collect();
        let mut rng = RngHandle::from_seed(seed);
        let tree = random_coalescent(&names, 1.0, &mut rng).unwrap();
        for i in 0..tree.node_count() {
            for j in 0..tree.node_count() {
                let mut edited = tree.clone();
                match wide_exchange_pair(&mut edited, i, j) {
                    Proposal::Move(ratio) => {
                        prop_assert_eq!(ratio, 0.0);
                        prop_assert!(edited.branch_lengths_valid());
                    }
                    Proposal::Invalid => {}
                }
            }
        }
    }
}

#[test]
fn wilson_balding_refuses_zero_width_window() {
    let mut tree = Tree::from_newick("(((A:1,B:1):0,C:1):2,(D:2,E:2):1)").unwrap();
    let d = tree.leaf_by_taxon("D").unwrap();
    let ab = node_above(&tree, "A", 1);
    // The branch above AB has zero length, so D cannot be attached to it.
    let proposal = wilson_balding_move(&mut tree, d, ab, 0.5);
    assert_eq!(proposal, Proposal::Invalid);
    assert!(!proposal.log_hastings_ratio().is_nan());
}

#[test]
fn wilson_balding_ratio_is_window_ratio() {
    let mut tree = Tree::from_newick("((A:1,B:1):1,(C:1.5,D:1.5):0.5)").unwrap();
    let a = tree.leaf_by_taxon("A").unwrap();
    let c = tree.leaf_by_taxon("C").unwrap();
    let ab = tree.parent(a).unwrap();
    let proposal = wilson_balding_move(&mut tree, a, c, 0.5);
    assert_eq!(proposal, Proposal::Move((1.5f64 / 2.0).ln()));
    assert_eq!(tree.height(ab), 0.75);
    assert_eq!(tree.parent(c), Some(ab));
    assert!(tree.branch_lengths_valid());
}

#[test]
fn wilson_balding_never_moves_the_root() {
    let mut tree = Tree::from_newick("((A:1,B:1):1,(C:1.5,D:1.5):0.5)").unwrap();
    let root = tree.root();
    let a = tree.leaf_by_taxon("A").unwrap();
    assert_eq!(wilson_balding_move(&mut tree, root, a, 0.5), Proposal::Invalid);
    assert_eq!(wilson_balding_move(&mut tree, a, root, 0.5), Proposal::Invalid);
}

#[test]
fn epoch_flex_stretches_and_shifts() {
    let mut tree = Tree::from_newick("((A:1,B:1):1,(C:1.5,D:1.5):0.5)").unwrap();
    let ab = node_above(&tree, "A", 1);
    let cd = node_above(&tree, "C", 1);
    let proposal = epoch_flex_transform(&mut tree, 0.5, 1.5, 2.0);
    assert_eq!(proposal, Proposal::Move(2.0 * 2f64.ln()));
    assert_eq!(tree.height(ab), 1.5);
    assert_eq!(tree.height(cd), 2.5);
    assert_eq!(tree.root_height(), 3.0);
}

#[test]
fn epoch_flex_rejects_negative_branches() {
    // Shrinking (0, 1.5] pulls DE below its dated tip E.
    let mut tree = Tree::from_newick("((A:1,B:1):1,(C:1.5,(D:0.5,E:0.1):1):0.5)").unwrap();
    let proposal = epoch_flex_transform(&mut tree, 0.0, 1.5, 0.1);
    assert_eq!(proposal, Proposal::Invalid);
}

fn flex_state(newick: &str) -> (State, StateNodeId) {
    let mut state = State::new();
    let id = state.add_tree("t", Tree::from_newick(newick).unwrap()).unwrap();
    (state, id)
}

#[test]
fn epoch_flex_groups_use_coalescent_boundaries() {
    let (mut state, id) = flex_state("(((A:1,B:1):1,C:2):1,(D:0.5,E:0.5):2.5)");
    let mut op = EpochFlexOperator::new("flex", 1.0, id)
        .unwrap()
        .with_group_sizes(vec![4])
        .unwrap();
    let mut rng = RngHandle::from_seed(11);
    for _ in 0..50 {
        state.store(0);
        match op.proposal(&mut state, &mut rng).unwrap() {
            Proposal::Move(ratio) => {
                // One group spans every coalescence, so the root is always the
                // upper boundary and all four internal nodes are scaled.
                assert!(ratio.is_finite());
                assert!(state.tree(id).unwrap().branch_lengths_valid());
            }
            Proposal::Invalid => {}
        }
        state.restore();
    }
    assert!(EpochFlexOperator::new("bad", 1.0, id)
        .unwrap()
        .with_group_sizes(vec![2, 0])
        .is_err());
}

#[test]
fn epoch_flex_on_cherry_is_invalid() {
    let (mut state, id) = flex_state("(A:1,B:1)");
    let mut op = EpochFlexOperator::new("flex", 1.0, id).unwrap();
    let mut rng = RngHandle::from_seed(3);
    state.store(0);
    assert_eq!(op.proposal(&mut state, &mut rng).unwrap(), Proposal::Invalid);
}
