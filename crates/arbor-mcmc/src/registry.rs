//! YAML model description: state nodes, densities, operators and
//! initialisers, each a tagged variant resolved at compile time.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use arbor_core::errors::{ArborError, ErrorInfo};
use arbor_core::{CalcNodeId, StateNodeId};
use arbor_tree::{RobinsonFoulds, RootHeightDistance, Tree, TreeMetric};
use serde::{Deserialize, Serialize};

use crate::adaptive::AdaptableOperatorSampler;
use crate::bactrian::{KernelDistribution, KernelMode, DEFAULT_M};
use crate::clock::Clock;
use crate::config::TuningConfig;
use crate::distributions::{
    Compound, ExponentialPrior, GaussianLikelihood, NormalPrior, UniformPrior, YulePrior,
    LIKELIHOOD_LABEL,
};
use crate::init::{RandomTreeInitialiser, StateNodeInitialiser, UniformParameterInitialiser};
use crate::moves_param::{
    IntRandomWalkOperator, RandomWalkOperator, ScaleOperator, ScaleTarget, UpDownOperator,
};
use crate::moves_tree::{EpochFlexOperator, ExchangeOperator, WilsonBaldingOperator};
use crate::operator::Operator;
use crate::parameter::{IntegerParameter, RealParameter};
use crate::schedule::{OperatorSchedule, SubSchedule};
use crate::state::State;

/// Label of the compound node summing the priors.
pub const PRIOR_LABEL: &str = "prior";
/// Label of the posterior root.
pub const POSTERIOR_LABEL: &str = "posterior";

/// Whole model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Sampled values in registration order.
    pub state: Vec<StateSpec>,
    /// Prior densities.
    #[serde(default)]
    pub priors: Vec<DensitySpec>,
    /// Likelihood densities; dropped when sampling from the prior.
    #[serde(default)]
    pub likelihoods: Vec<DensitySpec>,
    /// Top-level operators.
    pub operators: Vec<OperatorSpec>,
    /// Operator groups with a shared weight.
    #[serde(default)]
    pub subschedules: Vec<SubScheduleSpec>,
    /// Starting-state initialisers.
    #[serde(default)]
    pub initialisers: Vec<InitialiserSpec>,
}

/// A state node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StateSpec {
    /// Real vector parameter.
    Real {
        /// Label.
        id: String,
        /// Starting values.
        values: Vec<f64>,
        /// Lower bound.
        #[serde(default = "neg_inf")]
        lower: f64,
        /// Upper bound.
        #[serde(default = "pos_inf")]
        upper: f64,
    },
    /// Integer vector parameter.
    Integer {
        /// Label.
        id: String,
        /// Starting values.
        values: Vec<i64>,
        /// Lower bound.
        #[serde(default = "min_i64")]
        lower: i64,
        /// Upper bound.
        #[serde(default = "max_i64")]
        upper: i64,
    },
    /// Time tree given as Newick text.
    Tree {
        /// Label.
        id: String,
        /// Starting tree.
        newick: String,
    },
}

fn neg_inf() -> f64 {
    f64::NEG_INFINITY
}

fn pos_inf() -> f64 {
    f64::INFINITY
}

fn min_i64() -> i64 {
    i64::MIN
}

fn max_i64() -> i64 {
    i64::MAX
}

/// A density over state nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DensitySpec {
    /// Independent normal on every dimension.
    Normal {
        /// Label.
        id: String,
        /// Parameter label.
        x: String,
        /// Mean.
        mean: f64,
        /// Standard deviation.
        sigma: f64,
    },
    /// Exponential with the given mean.
    Exponential {
        /// Label.
        id: String,
        /// Parameter label.
        x: String,
        /// Mean.
        mean: f64,
    },
    /// Uniform on `[lower, upper]`.
    Uniform {
        /// Label.
        id: String,
        /// Parameter label.
        x: String,
        /// Lower bound.
        #[serde(default = "neg_inf")]
        lower: f64,
        /// Upper bound.
        #[serde(default = "pos_inf")]
        upper: f64,
    },
    /// Pure-birth tree prior.
    Yule {
        /// Label.
        id: String,
        /// Tree label.
        tree: String,
        /// Birth-rate parameter label.
        birth_rate: String,
    },
    /// Normal observations around a parameter.
    Gaussian {
        /// Label.
        id: String,
        /// Parameter label.
        x: String,
        /// Observed values.
        observations: Vec<f64>,
        /// Observation noise.
        sigma: f64,
    },
}

/// Proposal kernel settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    /// Kernel shape.
    #[serde(default)]
    pub mode: KernelMode,
    /// Hump offset.
    #[serde(default = "default_m")]
    pub m: f64,
}

fn default_m() -> f64 {
    DEFAULT_M
}

impl KernelSpec {
    fn build(&self) -> Result<KernelDistribution, ArborError> {
        KernelDistribution::new(self.mode, self.m)
    }
}

fn default_true() -> bool {
    true
}

/// An operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OperatorSpec {
    /// Scales a real parameter.
    Scale {
        /// Label.
        id: String,
        /// Selection weight.
        weight: f64,
        /// Parameter label.
        parameter: String,
        /// Scale every dimension together.
        #[serde(default)]
        scale_all: bool,
        /// Degrees of freedom when scaling all dimensions.
        #[serde(default)]
        degrees_of_freedom: Option<usize>,
        /// Initial scale factor.
        scale_factor: f64,
        /// Tune the scale factor.
        #[serde(default = "default_true")]
        optimise: bool,
        /// Kernel override.
        #[serde(default)]
        kernel: Option<KernelSpec>,
    },
    /// Scales tree heights.
    TreeScale {
        /// Label.
        id: String,
        /// Selection weight.
        weight: f64,
        /// Tree label.
        tree: String,
        /// Scale the root only.
        #[serde(default)]
        root_only: bool,
        /// Initial scale factor.
        scale_factor: f64,
        /// Tune the scale factor.
        #[serde(default = "default_true")]
        optimise: bool,
        /// Kernel override.
        #[serde(default)]
        kernel: Option<KernelSpec>,
    },
    /// Real random walk.
    RandomWalk {
        /// Label.
        id: String,
        /// Selection weight.
        weight: f64,
        /// Parameter label.
        parameter: String,
        /// Initial window.
        window: f64,
        /// Tune the window.
        #[serde(default = "default_true")]
        optimise: bool,
        /// Kernel override.
        #[serde(default)]
        kernel: Option<KernelSpec>,
    },
    /// Integer random walk.
    IntRandomWalk {
        /// Label.
        id: String,
        /// Selection weight.
        weight: f64,
        /// Parameter label.
        parameter: String,
        /// Window.
        window: i64,
    },
    /// Opposite scaling of two node groups.
    UpDown {
        /// Label.
        id: String,
        /// Selection weight.
        weight: f64,
        /// Labels scaled by `s`.
        #[serde(default)]
        up: Vec<String>,
        /// Labels scaled by `1/s`.
        #[serde(default)]
        down: Vec<String>,
        /// Initial scale factor.
        scale_factor: f64,
        /// Tune the scale factor.
        #[serde(default = "default_true")]
        optimise: bool,
    },
    /// Narrow exchange.
    NarrowExchange {
        /// Label.
        id: String,
        /// Selection weight.
        weight: f64,
        /// Tree label.
        tree: String,
    },
    /// Wide exchange.
    WideExchange {
        /// Label.
        id: String,
        /// Selection weight.
        weight: f64,
        /// Tree label.
        tree: String,
    },
    /// Wilson-Balding prune and regraft.
    WilsonBalding {
        /// Label.
        id: String,
        /// Selection weight.
        weight: f64,
        /// Tree label.
        tree: String,
    },
    /// Height-interval stretch.
    EpochFlex {
        /// Label.
        id: String,
        /// Selection weight.
        weight: f64,
        /// Tree label.
        tree: String,
        /// Initial scale factor.
        #[serde(default)]
        scale_factor: Option<f64>,
        /// Coalescent interval group sizes.
        #[serde(default)]
        group_sizes: Option<Vec<usize>>,
        /// Tune the scale factor.
        #[serde(default = "default_true")]
        optimise: bool,
        /// Kernel override.
        #[serde(default)]
        kernel: Option<KernelSpec>,
    },
    /// Learned mixture of operators.
    Adaptive {
        /// Label.
        id: String,
        /// Selection weight; defaults to the monitored dimension.
        #[serde(default)]
        weight: Option<f64>,
        /// Delegates.
        operators: Vec<OperatorSpec>,
        /// Monitored parameter labels.
        #[serde(default)]
        parameters: Vec<String>,
        /// Monitored tree labels.
        #[serde(default)]
        trees: Vec<String>,
        /// Tree distance used instead of node heights.
        #[serde(default)]
        metric: Option<MetricSpec>,
        /// Proposals before learning.
        #[serde(default)]
        burnin: Option<u64>,
        /// Proposals spent learning.
        #[serde(default)]
        learnin: Option<u64>,
        /// Probability of a uniform draw once teaching.
        #[serde(default)]
        uniform_p: Option<f64>,
        /// Ceiling on one runtime measurement.
        #[serde(default)]
        max_runtime_ms: Option<f64>,
    },
}

/// Tree distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetricSpec {
    /// Robinson-Foulds clade distance.
    RobinsonFoulds,
    /// Root height difference.
    RootHeight,
}

impl MetricSpec {
    fn build(self) -> Box<dyn TreeMetric> {
        match self {
            MetricSpec::RobinsonFoulds => Box::new(RobinsonFoulds),
            MetricSpec::RootHeight => Box::new(RootHeightDistance),
        }
    }
}

/// Operator group with a shared weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubScheduleSpec {
    /// Group weight.
    pub weight: f64,
    /// Interpret `weight` as a percentage of the total.
    #[serde(default)]
    pub percentage: bool,
    /// Member operators.
    pub operators: Vec<OperatorSpec>,
}

/// A starting-state initialiser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InitialiserSpec {
    /// Coalescent tree over the taxa of the named tree.
    RandomTree {
        /// Tree label.
        tree: String,
        /// Coalescent population size.
        #[serde(default = "default_population_size")]
        population_size: f64,
    },
    /// Uniform draw within the parameter bounds.
    Uniform {
        /// Parameter label.
        parameter: String,
        /// Narrower lower bound.
        #[serde(default = "neg_inf")]
        lower: f64,
        /// Narrower upper bound.
        #[serde(default = "pos_inf")]
        upper: f64,
    },
}

fn default_population_size() -> f64 {
    1.0
}

/// Model ready to run.
pub struct Model {
    /// State and calculation graph.
    pub state: State,
    /// Operator schedule.
    pub schedule: OperatorSchedule,
    /// Starting-state initialisers.
    pub initialisers: Vec<Box<dyn StateNodeInitialiser>>,
    /// Clock shared by the operators that time themselves.
    pub clock: Arc<dyn Clock>,
}

impl ModelSpec {
    /// Parses YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self, ArborError> {
        serde_yaml::from_str(text)
            .map_err(|err| ArborError::Config(ErrorInfo::new("model-parse", err.to_string())))
    }

    /// Reads a YAML file.
    pub fn load(path: &Path) -> Result<Self, ArborError> {
        let text = fs::read_to_string(path).map_err(|err| {
            ArborError::Config(
                ErrorInfo::new("model-read", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        Self::from_yaml_str(&text).map_err(|err| {
            ArborError::Config(
                err.info()
                    .clone()
                    .with_context("path", path.display().to_string()),
            )
        })
    }

    /// Builds the state, the posterior graph, the schedule and the initialisers.
    ///
    /// The posterior is a compound named `posterior` over a compound `prior`
    /// and, when likelihoods are given, a compound `likelihood`.
    pub fn build(&self, clock: Arc<dyn Clock>, tuning: &TuningConfig) -> Result<Model, ArborError> {
        let mut state = State::new();
        for spec in &self.state {
            match spec {
                StateSpec::Real {
                    id,
                    values,
                    lower,
                    upper,
                } => {
                    state.add_real(id.clone(), RealParameter::new(values.clone(), *lower, *upper)?)?;
                }
                StateSpec::Integer {
                    id,
                    values,
                    lower,
                    upper,
                } => {
                    state.add_integer(
                        id.clone(),
                        IntegerParameter::new(values.clone(), *lower, *upper)?,
                    )?;
                }
                StateSpec::Tree { id, newick } => {
                    state.add_tree(id.clone(), Tree::from_newick(newick)?)?;
                }
            }
        }

        let priors = self
            .priors
            .iter()
            .map(|density| add_density(&mut state, density))
            .collect::<Result<Vec<_>, _>>()?;
        let likelihoods = self
            .likelihoods
            .iter()
            .map(|density| add_density(&mut state, density))
            .collect::<Result<Vec<_>, _>>()?;
        let mut root_children = vec![state.add_calculation(Box::new(Compound::new(PRIOR_LABEL, priors)))?];
        if !likelihoods.is_empty() {
            root_children.push(
                state.add_calculation(Box::new(Compound::new(LIKELIHOOD_LABEL, likelihoods)))?,
            );
        }
        let root = state.add_calculation(Box::new(Compound::new(POSTERIOR_LABEL, root_children)))?;
        state.graph_mut().set_root(root)?;

        let operators = self
            .operators
            .iter()
            .map(|spec| build_operator(spec, &state, &clock))
            .collect::<Result<Vec<_>, _>>()?;
        let subschedules = self
            .subschedules
            .iter()
            .map(|sub| {
                Ok(SubSchedule {
                    weight: sub.weight,
                    weight_is_percentage: sub.percentage,
                    operators: sub
                        .operators
                        .iter()
                        .map(|spec| build_operator(spec, &state, &clock))
                        .collect::<Result<Vec<_>, ArborError>>()?,
                })
            })
            .collect::<Result<Vec<_>, ArborError>>()?;
        let schedule = OperatorSchedule::with_subschedules(operators, subschedules, tuning)?;

        let initialisers = self
            .initialisers
            .iter()
            .enumerate()
            .map(|(idx, spec)| -> Result<Box<dyn StateNodeInitialiser>, ArborError> {
                Ok(match spec {
                    InitialiserSpec::RandomTree {
                        tree,
                        population_size,
                    } => Box::new(RandomTreeInitialiser::new(
                        format!("init.{idx}"),
                        state.lookup(tree)?,
                        *population_size,
                    )),
                    InitialiserSpec::Uniform {
                        parameter,
                        lower,
                        upper,
                    } => Box::new(
                        UniformParameterInitialiser::new(format!("init.{idx}"), state.lookup(parameter)?)
                            .within(*lower, *upper),
                    ),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Model {
            state,
            schedule,
            initialisers,
            clock,
        })
    }
}

fn add_density(state: &mut State, spec: &DensitySpec) -> Result<CalcNodeId, ArborError> {
    let node: Box<dyn crate::graph::CalculationNode> = match spec {
        DensitySpec::Normal { id, x, mean, sigma } => {
            Box::new(NormalPrior::new(id.clone(), state.lookup(x)?, *mean, *sigma))
        }
        DensitySpec::Exponential { id, x, mean } => {
            Box::new(ExponentialPrior::new(id.clone(), state.lookup(x)?, *mean))
        }
        DensitySpec::Uniform { id, x, lower, upper } => {
            Box::new(UniformPrior::new(id.clone(), state.lookup(x)?, *lower, *upper))
        }
        DensitySpec::Yule {
            id,
            tree,
            birth_rate,
        } => Box::new(YulePrior::new(
            id.clone(),
            state.lookup(tree)?,
            state.lookup(birth_rate)?,
        )),
        DensitySpec::Gaussian {
            id,
            x,
            observations,
            sigma,
        } => Box::new(GaussianLikelihood::with_id(
            id.clone(),
            state.lookup(x)?,
            observations.clone(),
            *sigma,
        )),
    };
    state.add_calculation(node)
}

fn lookup_all(state: &State, labels: &[String]) -> Result<Vec<StateNodeId>, ArborError> {
    labels.iter().map(|label| state.lookup(label)).collect()
}

fn build_operator(
    spec: &OperatorSpec,
    state: &State,
    clock: &Arc<dyn Clock>,
) -> Result<Box<dyn Operator>, ArborError> {
    let kernel = |spec: &Option<KernelSpec>| -> Result<KernelDistribution, ArborError> {
        spec.as_ref()
            .map(KernelSpec::build)
            .unwrap_or_else(|| Ok(KernelDistribution::default()))
    };
    Ok(match spec {
        OperatorSpec::Scale {
            id,
            weight,
            parameter,
            scale_all,
            degrees_of_freedom,
            scale_factor,
            optimise,
            kernel: k,
        } => {
            let target = ScaleTarget::Parameter {
                id: state.lookup(parameter)?,
                scale_all: *scale_all,
                degrees_of_freedom: *degrees_of_freedom,
            };
            Box::new(
                ScaleOperator::new(id.clone(), *weight, target, *scale_factor)?
                    .with_kernel(kernel(k)?)
                    .with_optimise(*optimise),
            )
        }
        OperatorSpec::TreeScale {
            id,
            weight,
            tree,
            root_only,
            scale_factor,
            optimise,
            kernel: k,
        } => {
            let target = ScaleTarget::Tree {
                id: state.lookup(tree)?,
                root_only: *root_only,
            };
            Box::new(
                ScaleOperator::new(id.clone(), *weight, target, *scale_factor)?
                    .with_kernel(kernel(k)?)
                    .with_optimise(*optimise),
            )
        }
        OperatorSpec::RandomWalk {
            id,
            weight,
            parameter,
            window,
            optimise,
            kernel: k,
        } => Box::new(
            RandomWalkOperator::new(id.clone(), *weight, state.lookup(parameter)?, *window)?
                .with_kernel(kernel(k)?)
                .with_optimise(*optimise),
        ),
        OperatorSpec::IntRandomWalk {
            id,
            weight,
            parameter,
            window,
        } => Box::new(IntRandomWalkOperator::new(
            id.clone(),
            *weight,
            state.lookup(parameter)?,
            *window,
        )?),
        OperatorSpec::UpDown {
            id,
            weight,
            up,
            down,
            scale_factor,
            optimise,
        } => Box::new(
            UpDownOperator::new(
                id.clone(),
                *weight,
                lookup_all(state, up)?,
                lookup_all(state, down)?,
                *scale_factor,
            )?
            .with_optimise(*optimise),
        ),
        OperatorSpec::NarrowExchange { id, weight, tree } => {
            Box::new(ExchangeOperator::narrow(id.clone(), *weight, state.lookup(tree)?)?)
        }
        OperatorSpec::WideExchange { id, weight, tree } => {
            Box::new(ExchangeOperator::wide(id.clone(), *weight, state.lookup(tree)?)?)
        }
        OperatorSpec::WilsonBalding { id, weight, tree } => {
            Box::new(WilsonBaldingOperator::new(id.clone(), *weight, state.lookup(tree)?)?)
        }
        OperatorSpec::EpochFlex {
            id,
            weight,
            tree,
            scale_factor,
            group_sizes,
            optimise,
            kernel: k,
        } => {
            let mut op = EpochFlexOperator::new(id.clone(), *weight, state.lookup(tree)?)?
                .with_kernel(kernel(k)?)
                .with_optimise(*optimise);
            if let Some(sf) = scale_factor {
                op = op.with_scale_factor(*sf)?;
            }
            if let Some(sizes) = group_sizes {
                op = op.with_group_sizes(sizes.clone())?;
            }
            Box::new(op)
        }
        OperatorSpec::Adaptive {
            id,
            weight,
            operators,
            parameters,
            trees,
            metric,
            burnin,
            learnin,
            uniform_p,
            max_runtime_ms,
        } => {
            let mut builder = AdaptableOperatorSampler::builder(id.clone()).clock(Arc::clone(clock));
            for op in operators {
                builder = builder.operator(build_operator(op, state, clock)?);
            }
            for label in parameters {
                builder = builder.parameter(state.lookup(label)?);
            }
            for label in trees {
                builder = builder.tree(state.lookup(label)?);
            }
            if let Some(metric) = metric {
                builder = builder.metric(metric.build());
            }
            if let Some(weight) = weight {
                builder = builder.weight(*weight);
            }
            if let Some(burnin) = burnin {
                builder = builder.burnin(*burnin);
            }
            if let Some(learnin) = learnin {
                builder = builder.learnin(*learnin);
            }
            if let Some(p) = uniform_p {
                builder = builder.uniform_p(*p);
            }
            if let Some(ms) = max_runtime_ms {
                builder = builder.max_runtime_ms(*ms);
            }
            Box::new(builder.build(state)?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::StepClock;

    const MODEL: &str = r#"
state:
  - type: real
    id: rate
    values: [1.0]
    lower: 0.0
  - type: tree
    id: tree
    newick: "((A:1,B:1):1,(C:1.5,D:1.5):0.5);"
priors:
  - type: exponential
    id: rate.prior
    x: rate
    mean: 1.0
  - type: yule
    id: yule
    tree: tree
    birth_rate: rate
operators:
  - type: scale
    id: rate.scale
    weight: 1.0
    parameter: rate
    scale_factor: 0.5
  - type: adaptive
    id: tree.aos
    weight: 3.0
    trees: [tree]
    operators:
      - type: narrow-exchange
        id: narrow
        weight: 1.0
        tree: tree
      - type: tree-scale
        id: root
        weight: 1.0
        tree: tree
        root_only: true
        scale_factor: 0.75
initialisers:
  - type: random-tree
    tree: tree
"#;

    #[test]
    fn yaml_model_builds() {
        let spec = ModelSpec::from_yaml_str(MODEL).unwrap();
        let model = spec
            .build(Arc::new(StepClock::new(1.0)), &TuningConfig::default())
            .unwrap();
        assert_eq!(model.state.nodes().len(), 2);
        assert_eq!(model.schedule.len(), 2);
        assert!((model.schedule.probabilities()[1] - 0.75).abs() < 1e-12);
        assert_eq!(model.initialisers.len(), 1);
        assert_eq!(model.state.graph().label(model.state.graph().root().unwrap()), POSTERIOR_LABEL);
    }

    #[test]
    fn unknown_label_is_reported() {
        let text = MODEL.replace("birth_rate: rate", "birth_rate: lambda");
        let spec = ModelSpec::from_yaml_str(&text).unwrap();
        let err = spec
            .build(Arc::new(StepClock::new(1.0)), &TuningConfig::default())
            .err()
            .unwrap();
        assert_eq!(err.code(), "unknown-state-node");
    }
}
