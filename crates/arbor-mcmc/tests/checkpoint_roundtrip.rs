use arbor_core::{StateNode, StateNodeId};
use arbor_mcmc::checkpoint::{operators_path, ScheduleCheckpoint, StateCheckpoint};
use arbor_mcmc::distributions::{Compound, NormalPrior, YulePrior};
use arbor_mcmc::moves_param::{ScaleOperator, ScaleTarget};
use arbor_mcmc::operator::Rejection;
use arbor_mcmc::{Operator, OperatorSchedule, RealParameter, State, TuningConfig};
use arbor_tree::{canonical_hash, Tree};

const TREE: &str = "((A:1,B:1):1,(C:0.5,(D:0.25,E:0.25):0.25):1.5);";

fn state(x: f64, newick: &str) -> (State, StateNodeId, StateNodeId) {
    let mut state = State::new();
    let xs = state
        .add_real("x", RealParameter::new(vec![x], 0.0, f64::INFINITY).unwrap())
        .unwrap();
    let tree = state
        .add_tree("tree", Tree::from_newick(newick).unwrap())
        .unwrap();
    let prior = state
        .add_calculation(Box::new(NormalPrior::new("x.prior", xs, 1.0, 2.0)))
        .unwrap();
    let yule = state
        .add_calculation(Box::new(YulePrior::new("yule", tree, xs)))
        .unwrap();
    state
        .add_calculation(Box::new(Compound::new("posterior", vec![prior, yule])))
        .unwrap();
    (state, xs, tree)
}

#[test]
fn stored_state_restores_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chain.state");

    let (mut original, x, tree) = state(3.14, TREE);
    let posterior = original.robustly_calc_posterior(None).unwrap();
    original.to_checkpoint(77).store(&path).unwrap();

    let (mut restored, rx, rtree) = state(0.5, "((A:2,C:2):1,(B:1,(D:0.5,E:0.5):0.5):2);");
    let checkpoint = StateCheckpoint::load(&path).unwrap();
    assert_eq!(checkpoint.sample, 77);
    restored.restore_checkpoint(&checkpoint).unwrap();

    let value = restored.real(rx).unwrap();
    assert_eq!(value.values().len(), 1);
    assert_eq!(value.value(0), 3.14);
    let (a, b) = (original.tree(tree).unwrap(), restored.tree(rtree).unwrap());
    assert_eq!(a.to_newick(), b.to_newick());
    assert_eq!(canonical_hash(a), canonical_hash(b));
    assert_eq!(restored.nodes().sample(), 77);
    assert!(restored.get(rx).unwrap().is_dirty());

    let again = restored.robustly_calc_posterior(None).unwrap();
    assert_eq!(again.to_bits(), posterior.to_bits());
    assert_eq!(restored.state_hash(), original.state_hash());
    assert_eq!(original.real(x).unwrap().value(0), 3.14);
}

#[test]
fn state_file_layout() {
    let (original, _, _) = state(3.14, TREE);
    let text = original.to_checkpoint(5).to_text();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("<chainstate version='1.0' sample='5'>"));
    assert!(lines.next().unwrap().starts_with("<statenode id='x'>"));
    assert!(lines.next().unwrap().starts_with("<statenode id='tree'>"));
    assert_eq!(lines.next(), Some("</chainstate>"));
    assert_eq!(StateCheckpoint::parse(&text).unwrap(), original.to_checkpoint(5));
}

#[test]
fn node_ids_with_markup_survive_the_state_file() {
    let mut state = State::new();
    state
        .add_real("rate'>s & <mu>", RealParameter::new(vec![0.5], 0.0, 1.0).unwrap())
        .unwrap();
    let checkpoint = state.to_checkpoint(9);
    let text = checkpoint.to_text();
    assert!(text.contains("<statenode id='rate&apos;&gt;s &amp; &lt;mu&gt;'>"));

    let parsed = StateCheckpoint::parse(&text).unwrap();
    assert_eq!(parsed, checkpoint);
    assert_eq!(parsed.nodes[0].0, "rate'>s & <mu>");

    let mut target = State::new();
    let id = target
        .add_real("rate'>s & <mu>", RealParameter::new(vec![0.1], 0.0, 1.0).unwrap())
        .unwrap();
    target.restore_checkpoint(&parsed).unwrap();
    assert_eq!(target.real(id).unwrap().value(0), 0.5);
}

#[test]
fn missing_and_unknown_nodes_are_refused() {
    let (original, _, _) = state(3.14, TREE);
    let mut checkpoint = original.to_checkpoint(1);

    let mut partial = checkpoint.clone();
    partial.nodes.retain(|(id, _)| id != "tree");
    let (mut target, _, _) = state(1.0, TREE);
    let err = target.restore_checkpoint(&partial).unwrap_err();
    assert_eq!(err.code(), "missing-state-node");
    assert_eq!(err.info().context.get("id").map(String::as_str), Some("tree"));

    checkpoint.nodes.push(("rate".into(), "rate[1] (0,inf): 1.0 ".into()));
    let err = target.restore_checkpoint(&checkpoint).unwrap_err();
    assert_eq!(err.code(), "unknown-state-node");
}

#[test]
fn taxon_count_must_match() {
    let (original, _, _) = state(3.14, TREE);
    let checkpoint = original.to_checkpoint(1);
    let (mut target, _, _) = state(1.0, "((A:1,B:1):1,(C:1,D:1):1);");
    let err = target.restore_checkpoint(&checkpoint).unwrap_err();
    assert_eq!(err.code(), "taxon-count-mismatch");
    assert_eq!(err.info().context.get("id").map(String::as_str), Some("tree"));
}

#[test]
fn truncated_state_file_fails_to_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chain.state");
    std::fs::write(&path, "<chainstate version='1.0' sample='3'>\n<statenode id='x'>").unwrap();
    let err = StateCheckpoint::load(&path).unwrap_err();
    assert_eq!(err.code(), "checkpoint-parse");
    assert!(err.info().context.contains_key("path"));
}

fn schedule(x: StateNodeId, tree: StateNodeId) -> OperatorSchedule {
    let ops: Vec<Box<dyn Operator>> = vec![
        Box::new(
            ScaleOperator::new(
                "x.scale",
                1.0,
                ScaleTarget::Parameter {
                    id: x,
                    scale_all: false,
                    degrees_of_freedom: None,
                },
                0.75,
            )
            .unwrap(),
        ),
        Box::new(
            ScaleOperator::new(
                "root.scale",
                2.0,
                ScaleTarget::Tree {
                    id: tree,
                    root_only: true,
                },
                0.75,
            )
            .unwrap(),
        ),
    ];
    OperatorSchedule::new(ops, &TuningConfig::default()).unwrap()
}

#[test]
fn operator_file_sits_next_to_the_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chain.state");
    let (_, x, tree) = state(3.14, TREE);

    let mut written = schedule(x, tree);
    {
        let (op, tuner) = written.operator_and_tuner(1);
        op.reject(Rejection::InvalidPosterior, tuner);
        op.set_tuning(0.5);
    }
    written.to_checkpoint().store(&operators_path(&path)).unwrap();
    assert!(dir.path().join("chain.state.operators.json").exists());

    let loaded = ScheduleCheckpoint::load(&operators_path(&path)).unwrap();
    let mut fresh = schedule(x, tree);
    fresh.restore_checkpoint(&loaded).unwrap();
    assert_eq!(fresh.operator(1).tuning(), Some(0.5));
    assert_eq!(fresh.operator(1).stats().rejected, 1);
    assert_eq!(fresh.operator(0).tuning(), Some(0.75));
    assert_eq!(fresh.rates(), written.rates());
}
