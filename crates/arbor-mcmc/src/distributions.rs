//! Reference densities used to exercise the engine without scientific models.

use std::f64::consts::PI;

use arbor_core::errors::ArborError;
use arbor_core::{CalcNodeId, StateNodeId};

use crate::graph::{CalculationNode, EvalContext, Input};

/// Label given to likelihood nodes; prior-only runs drop the root child with
/// this label.
pub const LIKELIHOOD_LABEL: &str = "likelihood";

/// Sum of child densities.
#[derive(Debug, Clone)]
pub struct Compound {
    id: String,
    children: Vec<CalcNodeId>,
}

impl Compound {
    /// Compound over `children`.
    pub fn new(id: impl Into<String>, children: Vec<CalcNodeId>) -> Self {
        Self {
            id: id.into(),
            children,
        }
    }
}

impl CalculationNode for Compound {
    fn id(&self) -> &str {
        &self.id
    }

    fn inputs(&self) -> Vec<Input> {
        self.children.iter().copied().map(Input::Calc).collect()
    }

    fn calculate_log_p(&mut self, ctx: &EvalContext<'_>) -> Result<f64, ArborError> {
        let mut log_p = 0.0;
        for &child in &self.children {
            log_p += ctx.log_p(child);
            if log_p == f64::NEG_INFINITY {
                return Ok(log_p);
            }
        }
        Ok(log_p)
    }

    fn is_compound(&self) -> bool {
        true
    }

    fn drop_input(&mut self, input: CalcNodeId) -> bool {
        let before = self.children.len();
        self.children.retain(|&child| child != input);
        self.children.len() != before
    }
}

fn normal_log_density(x: f64, mean: f64, sigma: f64) -> f64 {
    let z = (x - mean) / sigma;
    -0.5 * z * z - sigma.ln() - 0.5 * (2.0 * PI).ln()
}

/// Independent normal prior on every dimension of a parameter.
#[derive(Debug, Clone)]
pub struct NormalPrior {
    id: String,
    x: StateNodeId,
    mean: f64,
    sigma: f64,
}

impl NormalPrior {
    /// Normal(mean, sigma) prior on `x`.
    pub fn new(id: impl Into<String>, x: StateNodeId, mean: f64, sigma: f64) -> Self {
        Self {
            id: id.into(),
            x,
            mean,
            sigma,
        }
    }
}

impl CalculationNode for NormalPrior {
    fn id(&self) -> &str {
        &self.id
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::State(self.x)]
    }

    fn calculate_log_p(&mut self, ctx: &EvalContext<'_>) -> Result<f64, ArborError> {
        Ok(ctx
            .values(self.x)?
            .iter()
            .map(|&x| normal_log_density(x, self.mean, self.sigma))
            .sum())
    }
}

/// Exponential prior with the given mean.
#[derive(Debug, Clone)]
pub struct ExponentialPrior {
    id: String,
    x: StateNodeId,
    mean: f64,
}

impl ExponentialPrior {
    /// Exponential(mean) prior on `x`.
    pub fn new(id: impl Into<String>, x: StateNodeId, mean: f64) -> Self {
        Self {
            id: id.into(),
            x,
            mean,
        }
    }
}

impl CalculationNode for ExponentialPrior {
    fn id(&self) -> &str {
        &self.id
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::State(self.x)]
    }

    fn calculate_log_p(&mut self, ctx: &EvalContext<'_>) -> Result<f64, ArborError> {
        let mut log_p = 0.0;
        for x in ctx.values(self.x)? {
            if x < 0.0 {
                return Ok(f64::NEG_INFINITY);
            }
            log_p += -self.mean.ln() - x / self.mean;
        }
        Ok(log_p)
    }
}

/// Uniform prior on `[lower, upper]`; improper (zero) when a bound is infinite.
#[derive(Debug, Clone)]
pub struct UniformPrior {
    id: String,
    x: StateNodeId,
    lower: f64,
    upper: f64,
}

impl UniformPrior {
    /// Uniform(lower, upper) prior on `x`.
    pub fn new(id: impl Into<String>, x: StateNodeId, lower: f64, upper: f64) -> Self {
        Self {
            id: id.into(),
            x,
            lower,
            upper,
        }
    }
}

impl CalculationNode for UniformPrior {
    fn id(&self) -> &str {
        &self.id
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::State(self.x)]
    }

    fn calculate_log_p(&mut self, ctx: &EvalContext<'_>) -> Result<f64, ArborError> {
        let width = self.upper - self.lower;
        let density = if width.is_finite() { -width.ln() } else { 0.0 };
        let mut log_p = 0.0;
        for x in ctx.values(self.x)? {
            if x < self.lower || x > self.upper {
                return Ok(f64::NEG_INFINITY);
            }
            log_p += density;
        }
        Ok(log_p)
    }
}

/// Pure-birth prior on a tree given a birth-rate parameter.
///
/// With full sampling and no conditioning the density is
/// `(n - 1) ln r - r * sum(internal heights) - r * root height`.
#[derive(Debug, Clone)]
pub struct YulePrior {
    id: String,
    tree: StateNodeId,
    birth_rate: StateNodeId,
}

impl YulePrior {
    /// Yule prior on `tree` with rate `birth_rate`.
    pub fn new(id: impl Into<String>, tree: StateNodeId, birth_rate: StateNodeId) -> Self {
        Self {
            id: id.into(),
            tree,
            birth_rate,
        }
    }
}

impl CalculationNode for YulePrior {
    fn id(&self) -> &str {
        &self.id
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::State(self.tree), Input::State(self.birth_rate)]
    }

    fn calculate_log_p(&mut self, ctx: &EvalContext<'_>) -> Result<f64, ArborError> {
        let tree = ctx.tree(self.tree)?;
        let rate = ctx.values(self.birth_rate)?.first().copied().unwrap_or(0.0);
        if !(rate > 0.0) {
            return Ok(f64::NEG_INFINITY);
        }
        let taxa = tree.leaf_count() as f64;
        let internal: f64 = tree.internal_nodes().map(|idx| tree.height(idx)).sum();
        Ok((taxa - 1.0) * rate.ln() - rate * internal - rate * tree.root_height())
    }
}

/// Normal likelihood of fixed observations around a parameter.
///
/// Observation `i` is centred on dimension `i % dim`.
#[derive(Debug, Clone)]
pub struct GaussianLikelihood {
    id: String,
    x: StateNodeId,
    observations: Vec<f64>,
    sigma: f64,
}

impl GaussianLikelihood {
    /// Likelihood labelled [`LIKELIHOOD_LABEL`].
    pub fn new(x: StateNodeId, observations: Vec<f64>, sigma: f64) -> Self {
        Self::with_id(LIKELIHOOD_LABEL, x, observations, sigma)
    }

    /// Likelihood with a custom label.
    pub fn with_id(id: impl Into<String>, x: StateNodeId, observations: Vec<f64>, sigma: f64) -> Self {
        Self {
            id: id.into(),
            x,
            observations,
            sigma,
        }
    }
}

impl CalculationNode for GaussianLikelihood {
    fn id(&self) -> &str {
        &self.id
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::State(self.x)]
    }

    fn calculate_log_p(&mut self, ctx: &EvalContext<'_>) -> Result<f64, ArborError> {
        let means = ctx.values(self.x)?;
        Ok(self
            .observations
            .iter()
            .enumerate()
            .map(|(i, &obs)| normal_log_density(obs, means[i % means.len()], self.sigma))
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_normal_density_at_zero() {
        let expected = -0.5 * (2.0 * PI).ln();
        assert!((normal_log_density(0.0, 0.0, 1.0) - expected).abs() < 1e-15);
    }
}
