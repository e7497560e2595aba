use arbor_core::{RngHandle, StateNodeId};
use arbor_mcmc::bactrian::{KernelDistribution, KernelMode};
use arbor_mcmc::moves_param::{
    IntRandomWalkOperator, RandomWalkOperator, ScaleOperator, ScaleTarget, UpDownOperator,
};
use arbor_mcmc::{IntegerParameter, Operator, Proposal, RealParameter, State};
use arbor_tree::Tree;

fn real(state: &mut State, id: &str, values: Vec<f64>, lower: f64, upper: f64) -> StateNodeId {
    state
        .add_real(id, RealParameter::new(values, lower, upper).unwrap())
        .unwrap()
}

#[test]
fn scale_outside_bounds_is_invalid() {
    let mut state = State::new();
    let x = real(&mut state, "x", vec![1.0], 0.99, 1.01);
    let mut op = ScaleOperator::new(
        "x.scale",
        1.0,
        ScaleTarget::Parameter {
            id: x,
            scale_all: false,
            degrees_of_freedom: None,
        },
        0.5,
    )
    .unwrap();
    let mut rng = RngHandle::from_seed(17);
    let mut invalid = 0;
    for _ in 0..100 {
        state.store(0);
        match op.proposal(&mut state, &mut rng).unwrap() {
            Proposal::Invalid => {
                invalid += 1;
                assert_eq!(state.real(x).unwrap().value(0), 1.0);
            }
            Proposal::Move(ratio) => {
                let value = state.real(x).unwrap().value(0);
                assert!((0.99..=1.01).contains(&value));
                assert!((ratio - value.ln()).abs() < 1e-12);
            }
        }
        state.restore();
    }
    assert!(invalid > 50);
}

#[test]
fn scaling_zero_is_invalid() {
    let mut state = State::new();
    let x = real(&mut state, "x", vec![0.0], f64::NEG_INFINITY, f64::INFINITY);
    let mut op = ScaleOperator::new(
        "x.scale",
        1.0,
        ScaleTarget::Parameter {
            id: x,
            scale_all: false,
            degrees_of_freedom: None,
        },
        0.5,
    )
    .unwrap();
    state.store(0);
    let proposal = op.proposal(&mut state, &mut RngHandle::from_seed(1)).unwrap();
    assert_eq!(proposal, Proposal::Invalid);
}

#[test]
fn scale_all_uses_degrees_of_freedom() {
    let mut state = State::new();
    let x = real(&mut state, "x", vec![1.0, 2.0, 4.0], 0.0, f64::INFINITY);
    let mut rng = RngHandle::from_seed(23);
    for (dof, expected) in [(None, 3.0), (Some(1), 1.0)] {
        let mut op = ScaleOperator::new(
            "x.scale",
            1.0,
            ScaleTarget::Parameter {
                id: x,
                scale_all: true,
                degrees_of_freedom: dof,
            },
            0.5,
        )
        .unwrap();
        state.store(0);
        let ratio = op.proposal(&mut state, &mut rng).unwrap().log_hastings_ratio();
        let values = state.real(x).unwrap().values().to_vec();
        let scale = values[0];
        assert!((values[1] - 2.0 * scale).abs() < 1e-12);
        assert!((values[2] - 4.0 * scale).abs() < 1e-12);
        assert!((ratio - expected * scale.ln()).abs() < 1e-12);
        state.restore();
    }
}

#[test]
fn root_scale_keeps_the_root_above_its_children() {
    let mut state = State::new();
    let tree = state
        .add_tree("tree", Tree::from_newick("((A:1,B:1):1,(C:1.5,D:1.5):0.5);").unwrap())
        .unwrap();
    let mut op = ScaleOperator::new(
        "root",
        1.0,
        ScaleTarget::Tree {
            id: tree,
            root_only: true,
        },
        0.9,
    )
    .unwrap();
    let mut rng = RngHandle::from_seed(4);
    for _ in 0..200 {
        state.store(0);
        match op.proposal(&mut state, &mut rng).unwrap() {
            Proposal::Move(ratio) => {
                let t = state.tree(tree).unwrap();
                assert!(t.root_height() >= 1.5);
                assert!((ratio - (t.root_height() / 2.0).ln()).abs() < 1e-12);
                assert!(t.branch_lengths_valid());
            }
            Proposal::Invalid => assert_eq!(state.tree(tree).unwrap().root_height(), 2.0),
        }
        state.restore();
    }
}

#[test]
fn up_down_ratio_counts_net_degrees_of_freedom() {
    let mut state = State::new();
    let tree = state
        .add_tree("tree", Tree::from_newick("((A:1,B:1):1,(C:1.5,D:1.5):0.5);").unwrap())
        .unwrap();
    let rate = real(&mut state, "rate", vec![2.0], 0.0, f64::INFINITY);
    let mut op = UpDownOperator::new("updown", 1.0, vec![tree], vec![rate], 0.5).unwrap();
    let mut rng = RngHandle::from_seed(8);
    for _ in 0..20 {
        state.store(0);
        let proposal = op.proposal(&mut state, &mut rng).unwrap();
        let scale = state.tree(tree).unwrap().root_height() / 2.0;
        assert!((state.real(rate).unwrap().value(0) - 2.0 / scale).abs() < 1e-12);
        // Three internal heights go up, one rate goes down.
        assert!((proposal.log_hastings_ratio() - 2.0 * scale.ln()).abs() < 1e-12);
        state.restore();
    }
    assert!(UpDownOperator::new("empty", 1.0, vec![], vec![], 0.5).is_err());
}

#[test]
fn up_down_refuses_out_of_bounds_results() {
    let mut state = State::new();
    let up = real(&mut state, "up", vec![1.0], 0.5, 2.0);
    let down = real(&mut state, "down", vec![1.0], 0.5, 2.0);
    let mut op = UpDownOperator::new("updown", 1.0, vec![up], vec![down], 10.0).unwrap();
    let mut rng = RngHandle::from_seed(12);
    let mut invalid = 0;
    for _ in 0..100 {
        state.store(0);
        let proposal = op.proposal(&mut state, &mut rng).unwrap();
        if proposal.is_valid() {
            let (u, d) = (state.real(up).unwrap().value(0), state.real(down).unwrap().value(0));
            assert!((u * d - 1.0).abs() < 1e-12);
            assert_eq!(proposal.log_hastings_ratio(), 0.0);
        } else {
            invalid += 1;
        }
        state.restore();
        assert_eq!(state.real(up).unwrap().value(0), 1.0);
    }
    assert!(invalid > 0);
}

#[test]
fn random_walk_is_symmetric_and_bounded() {
    let mut state = State::new();
    let x = real(&mut state, "x", vec![0.0, 0.5], -1.0, 1.0);
    let kernel = KernelDistribution::new(KernelMode::Uniform, 0.95).unwrap();
    let mut op = RandomWalkOperator::new("walk", 1.0, x, 0.4)
        .unwrap()
        .with_kernel(kernel);
    let mut rng = RngHandle::from_seed(31);
    for _ in 0..200 {
        state.store(0);
        match op.proposal(&mut state, &mut rng).unwrap() {
            Proposal::Move(ratio) => {
                assert_eq!(ratio, 0.0);
                assert!(state.real(x).unwrap().values().iter().all(|v| v.abs() <= 1.0));
            }
            Proposal::Invalid => {}
        }
        state.restore();
    }
    assert!(RandomWalkOperator::new("bad", 1.0, x, 0.0).is_err());
}

#[test]
fn integer_walk_stays_in_window() {
    let mut state = State::new();
    let k = state
        .add_integer("k", IntegerParameter::new(vec![5, 0], 0, 10).unwrap())
        .unwrap();
    let mut op = IntRandomWalkOperator::new("k.walk", 1.0, k, 2).unwrap();
    let mut rng = RngHandle::from_seed(77);
    let mut seen_invalid = false;
    for _ in 0..300 {
        state.store(0);
        match op.proposal(&mut state, &mut rng).unwrap() {
            Proposal::Move(ratio) => {
                assert_eq!(ratio, 0.0);
                let values = state.integer(k).unwrap().values().to_vec();
                assert!((3..=7).contains(&values[0]));
                assert!((0..=2).contains(&values[1]));
            }
            Proposal::Invalid => seen_invalid = true,
        }
        state.restore();
    }
    // Steps below zero from the second dimension fall outside the bounds.
    assert!(seen_invalid);
    let err = IntRandomWalkOperator::new("k.walk", 1.0, k, 0).unwrap_err();
    assert_eq!(err.code(), "bad-tuning");
}
