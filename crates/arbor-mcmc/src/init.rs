//! Starting-state construction and the retry loop that looks for a state
//! with a finite posterior.

use std::collections::BTreeSet;

use arbor_core::errors::{ArborError, ErrorInfo};
use arbor_core::{RngHandle, StateNodeId};
use arbor_tree::random_coalescent;
use rayon::ThreadPool;
use tracing::{error, info};

use crate::state::{State, StateValue};

/// Assigns starting values to some state nodes.
pub trait StateNodeInitialiser: Send {
    /// Label used in diagnostics.
    fn id(&self) -> &str;

    /// Nodes this initialiser writes.
    fn initialised_nodes(&self) -> Vec<StateNodeId>;

    /// Draws new starting values.
    fn init_state_nodes(&mut self, state: &mut State, rng: &mut RngHandle) -> Result<(), ArborError>;
}

/// Replaces a tree with a constant-size coalescent draw over its taxa.
#[derive(Debug, Clone)]
pub struct RandomTreeInitialiser {
    id: String,
    tree: StateNodeId,
    population_size: f64,
}

impl RandomTreeInitialiser {
    /// Initialiser for `tree` with coalescent population size `population_size`.
    pub fn new(id: impl Into<String>, tree: StateNodeId, population_size: f64) -> Self {
        Self {
            id: id.into(),
            tree,
            population_size,
        }
    }
}

impl StateNodeInitialiser for RandomTreeInitialiser {
    fn id(&self) -> &str {
        &self.id
    }

    fn initialised_nodes(&self) -> Vec<StateNodeId> {
        vec![self.tree]
    }

    fn init_state_nodes(&mut self, state: &mut State, rng: &mut RngHandle) -> Result<(), ArborError> {
        let taxa: Vec<String> = state
            .tree(self.tree)?
            .taxa()
            .into_iter()
            .map(str::to_string)
            .collect();
        let tree = random_coalescent(&taxa, self.population_size, rng)?;
        state.assign(self.tree, StateValue::Tree(tree))
    }
}

/// Draws every dimension of a parameter uniformly within its bounds,
/// optionally narrowed to `[lower, upper]`.
#[derive(Debug, Clone)]
pub struct UniformParameterInitialiser {
    id: String,
    parameter: StateNodeId,
    lower: f64,
    upper: f64,
}

impl UniformParameterInitialiser {
    /// Initialiser using the parameter's own bounds.
    pub fn new(id: impl Into<String>, parameter: StateNodeId) -> Self {
        Self {
            id: id.into(),
            parameter,
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
        }
    }

    /// Narrows the range further.
    pub fn within(mut self, lower: f64, upper: f64) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }

    fn range(&self, lower: f64, upper: f64) -> Result<(f64, f64), ArborError> {
        let (lo, hi) = (lower.max(self.lower), upper.min(self.upper));
        if !(lo.is_finite() && hi.is_finite() && lo <= hi) {
            return Err(ArborError::Init(
                ErrorInfo::new("unbounded-initialiser", "uniform initialiser needs a finite range")
                    .with_context("id", self.id.clone())
                    .with_context("lower", lo.to_string())
                    .with_context("upper", hi.to_string())
                    .with_hint("give the parameter finite bounds or narrow the initialiser"),
            ));
        }
        Ok((lo, hi))
    }
}

impl StateNodeInitialiser for UniformParameterInitialiser {
    fn id(&self) -> &str {
        &self.id
    }

    fn initialised_nodes(&self) -> Vec<StateNodeId> {
        vec![self.parameter]
    }

    fn init_state_nodes(&mut self, state: &mut State, rng: &mut RngHandle) -> Result<(), ArborError> {
        let value = match state.get(self.parameter)? {
            StateValue::Real(param) => {
                let (lo, hi) = self.range(param.lower(), param.upper())?;
                let mut param = param.clone();
                for idx in 0..param.values().len() {
                    param.set_value(idx, lo + rng.uniform() * (hi - lo));
                }
                StateValue::Real(param)
            }
            StateValue::Integer(param) => {
                let (lo, hi) = self.range(param.lower() as f64, param.upper() as f64)?;
                let (lo, hi) = (lo.ceil() as i64, hi.floor() as i64);
                let span = hi
                    .checked_sub(lo)
                    .and_then(|span| usize::try_from(span).ok())
                    .and_then(|span| span.checked_add(1))
                    .ok_or_else(|| {
                        ArborError::Init(
                            ErrorInfo::new("unbounded-initialiser", "integer range is too wide")
                                .with_context("id", self.id.clone()),
                        )
                    })?;
                let mut param = param.clone();
                for idx in 0..param.values().len() {
                    param.set_value(idx, lo + rng.index(span) as i64);
                }
                StateValue::Integer(param)
            }
            StateValue::Tree(_) => {
                return Err(ArborError::Init(
                    ErrorInfo::new("kind-mismatch", "uniform initialiser needs a parameter")
                        .with_context("id", self.id.clone()),
                ))
            }
        };
        state.assign(self.parameter, value)
    }
}

/// Runs every initialiser and recomputes the posterior, retrying up to
/// `attempts` times while it is not finite. Returns the starting posterior.
pub fn initialise(
    state: &mut State,
    initialisers: &mut [Box<dyn StateNodeInitialiser>],
    attempts: usize,
    rng: &mut RngHandle,
    pool: Option<&ThreadPool>,
) -> Result<f64, ArborError> {
    let mut seen = BTreeSet::new();
    for init in initialisers.iter() {
        for node in init.initialised_nodes() {
            if !seen.insert(node) {
                return Err(ArborError::Init(
                    ErrorInfo::new("duplicate-initialiser", "state node initialised twice")
                        .with_context("initialiser", init.id().to_string())
                        .with_context("node", state.nodes().label(node)?.to_string()),
                ));
            }
        }
    }

    let attempts = if initialisers.is_empty() { 1 } else { attempts.max(1) };
    let mut posterior = f64::NEG_INFINITY;
    for attempt in 1..=attempts {
        for init in initialisers.iter_mut() {
            init.init_state_nodes(state, rng)?;
        }
        posterior = state.robustly_calc_posterior(pool)?;
        if posterior.is_finite() {
            return Ok(posterior);
        }
        info!(attempt, posterior, "initial state has no finite posterior, retrying");
    }

    let breakdown = state.graph().breakdown();
    for line in &breakdown {
        error!("{line}");
    }
    Err(ArborError::Init(
        ErrorInfo::new(
            "init-exhausted",
            "could not find a starting state with a finite posterior",
        )
        .with_context("attempts", attempts.to_string())
        .with_context("posterior", posterior.to_string())
        .with_context("breakdown", breakdown.join("\n"))
        .with_hint("check the starting values against the prior bounds"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::UniformPrior;
    use crate::parameter::RealParameter;

    #[test]
    fn uniform_initialiser_respects_bounds() {
        let mut state = State::new();
        let x = state
            .add_real("x", RealParameter::new(vec![0.5; 4], 2.0, 3.0).unwrap())
            .unwrap();
        state
            .add_calculation(Box::new(UniformPrior::new("prior", x, 2.0, 3.0)))
            .unwrap();
        let mut inits: Vec<Box<dyn StateNodeInitialiser>> =
            vec![Box::new(UniformParameterInitialiser::new("init.x", x))];
        let mut rng = RngHandle::from_seed(3);
        let posterior = initialise(&mut state, &mut inits, 5, &mut rng, None).unwrap();
        assert_eq!(posterior, 0.0);
        assert!(state.real(x).unwrap().values().iter().all(|v| (2.0..=3.0).contains(v)));
    }

    #[test]
    fn duplicate_initialisers_are_refused() {
        let mut state = State::new();
        let x = state
            .add_real("x", RealParameter::new(vec![2.5], 2.0, 3.0).unwrap())
            .unwrap();
        state
            .add_calculation(Box::new(UniformPrior::new("prior", x, 2.0, 3.0)))
            .unwrap();
        let mut inits: Vec<Box<dyn StateNodeInitialiser>> = vec![
            Box::new(UniformParameterInitialiser::new("a", x)),
            Box::new(UniformParameterInitialiser::new("b", x)),
        ];
        let mut rng = RngHandle::from_seed(3);
        let err = initialise(&mut state, &mut inits, 5, &mut rng, None).unwrap_err();
        assert_eq!(err.code(), "duplicate-initialiser");
    }

    #[test]
    fn exhausted_attempts_report_breakdown() {
        let mut state = State::new();
        let x = state
            .add_real("x", RealParameter::new(vec![2.5], 2.0, 3.0).unwrap())
            .unwrap();
        state
            .add_calculation(Box::new(UniformPrior::new("prior", x, 5.0, 6.0)))
            .unwrap();
        let mut inits: Vec<Box<dyn StateNodeInitialiser>> =
            vec![Box::new(UniformParameterInitialiser::new("init.x", x))];
        let mut rng = RngHandle::from_seed(3);
        let err = initialise(&mut state, &mut inits, 3, &mut rng, None).unwrap_err();
        assert_eq!(err.code(), "init-exhausted");
        assert_eq!(err.info().context["attempts"], "3");
        assert!(err.info().context["breakdown"].starts_with("P(prior) = -inf"));
    }
}
