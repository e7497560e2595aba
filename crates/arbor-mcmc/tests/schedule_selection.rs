use arbor_core::{RngHandle, StateNodeId};
use arbor_mcmc::moves_param::RandomWalkOperator;
use arbor_mcmc::operator::Rejection;
use arbor_mcmc::schedule::SubSchedule;
use arbor_mcmc::{Operator, OperatorSchedule, RealParameter, State, TuningConfig};

fn parameter() -> StateNodeId {
    let mut state = State::new();
    state
        .add_real("x", RealParameter::unbounded(vec![0.0]).unwrap())
        .unwrap()
}

fn walk(id: &str, weight: f64, x: StateNodeId) -> Box<dyn Operator> {
    Box::new(RandomWalkOperator::new(id, weight, x, 1.0).unwrap())
}

#[test]
fn selection_follows_weights() {
    let x = parameter();
    let schedule =
        OperatorSchedule::new(vec![walk("a", 1.0, x), walk("b", 3.0, x)], &TuningConfig::default())
            .unwrap();
    let mut rng = RngHandle::from_seed(42);
    let draws = 100_000;
    let second = (0..draws)
        .filter(|_| schedule.select_operator(&mut rng) == 1)
        .count();
    let fraction = second as f64 / draws as f64;
    assert!((fraction - 0.75).abs() < 0.01, "fraction {fraction}");
}

#[test]
fn percentage_subschedule_takes_its_share() {
    let x = parameter();
    let sub = SubSchedule {
        weight: 20.0,
        weight_is_percentage: true,
        operators: vec![walk("c", 1.0, x), walk("d", 1.0, x)],
    };
    let schedule = OperatorSchedule::with_subschedules(
        vec![walk("a", 1.0, x), walk("b", 3.0, x)],
        vec![sub],
        &TuningConfig::default(),
    )
    .unwrap();
    let p = schedule.probabilities();
    assert_eq!(p.len(), 4);
    assert!((p[0] - 0.2).abs() < 1e-12);
    assert!((p[1] - 0.6).abs() < 1e-12);
    assert!((p[2] - 0.1).abs() < 1e-12);
    assert!((p[3] - 0.1).abs() < 1e-12);
}

#[test]
fn full_percentage_starves_top_level_operators() {
    let x = parameter();
    let sub = SubSchedule {
        weight: 100.0,
        weight_is_percentage: true,
        operators: vec![walk("c", 1.0, x)],
    };
    let err = OperatorSchedule::with_subschedules(
        vec![walk("a", 1.0, x)],
        vec![sub],
        &TuningConfig::default(),
    )
    .err()
    .unwrap();
    assert_eq!(err.code(), "bad-subschedule");
}

#[test]
fn duplicate_ids_are_refused() {
    let x = parameter();
    let err = OperatorSchedule::new(vec![walk("a", 1.0, x), walk("a", 2.0, x)], &TuningConfig::default())
        .err()
        .unwrap();
    assert_eq!(err.code(), "duplicate-operator");
}

#[test]
fn checkpoint_restores_counts_and_delay() {
    let x = parameter();
    let mut schedule =
        OperatorSchedule::new(vec![walk("a", 1.0, x), walk("b", 3.0, x)], &TuningConfig::default())
            .unwrap();
    {
        let (op, tuner) = schedule.operator_and_tuner(1);
        op.reject(Rejection::Posterior, tuner);
        op.reject(Rejection::InvalidProposal, tuner);
        op.set_tuning(0.25);
    }
    let checkpoint = schedule.to_checkpoint();

    let mut fresh =
        OperatorSchedule::new(vec![walk("b", 3.0, x), walk("a", 1.0, x)], &TuningConfig::default())
            .unwrap();
    fresh.restore_checkpoint(&checkpoint).unwrap();
    assert_eq!(fresh.operator(0).id(), "b");
    assert_eq!(fresh.operator(0).stats().rejected, 2);
    assert_eq!(fresh.operator(0).tuning(), Some(0.25));
    assert_eq!(fresh.operator(1).stats().total(), 0);
    assert_eq!(fresh.tuner().delay_count(), 2);
}

#[test]
fn rate_table_lists_every_operator() {
    let x = parameter();
    let schedule =
        OperatorSchedule::new(vec![walk("alpha", 1.0, x), walk("beta", 1.0, x)], &TuningConfig::default())
            .unwrap();
    let table = schedule.rates_table();
    let mut lines = table.lines();
    let header = lines.next().unwrap();
    for column in ["Operator", "Tuning", "#accept", "#reject", "Pr(m)", "Pr(acc|m)"] {
        assert!(header.contains(column), "missing {column}");
    }
    assert!(lines.next().unwrap().starts_with("alpha"));
    assert!(lines.next().unwrap().starts_with("beta"));
}
