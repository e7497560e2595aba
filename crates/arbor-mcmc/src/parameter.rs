use std::fmt::{Debug, Display};
use std::str::FromStr;

use arbor_core::errors::{ArborError, ErrorInfo};
use arbor_core::{checksum_values, StateNode};

/// Scalar element type stored in a [`Parameter`].
pub trait ParameterValue:
    Copy + PartialOrd + Display + FromStr + Debug + Send + Sync + 'static
{
    /// Smallest representable bound.
    const MIN: Self;
    /// Largest representable bound.
    const MAX: Self;

    /// Lossy view used by monitors and priors.
    fn to_f64(self) -> f64;

    /// Multiplies by `factor`, `None` when the element type cannot be scaled.
    fn scale_by(self, factor: f64) -> Option<Self>;
}

impl ParameterValue for f64 {
    const MIN: Self = f64::NEG_INFINITY;
    const MAX: Self = f64::INFINITY;

    fn to_f64(self) -> f64 {
        self
    }

    fn scale_by(self, factor: f64) -> Option<Self> {
        Some(self * factor)
    }
}

impl ParameterValue for i64 {
    const MIN: Self = i64::MIN;
    const MAX: Self = i64::MAX;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn scale_by(self, _factor: f64) -> Option<Self> {
        None
    }
}

/// Bounded vector parameter with per-dimension dirty flags.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter<T: ParameterValue> {
    values: Vec<T>,
    lower: T,
    upper: T,
    dirty: Vec<bool>,
}

/// Real valued parameter.
pub type RealParameter = Parameter<f64>;
/// Integer valued parameter.
pub type IntegerParameter = Parameter<i64>;

impl<T: ParameterValue> Parameter<T> {
    /// Creates a parameter, checking that every value lies within the bounds.
    pub fn new(values: Vec<T>, lower: T, upper: T) -> Result<Self, ArborError> {
        if values.is_empty() {
            return Err(ArborError::State(ErrorInfo::new(
                "empty-parameter",
                "parameter needs at least one dimension",
            )));
        }
        if lower > upper {
            return Err(ArborError::State(
                ErrorInfo::new("bad-bounds", "lower bound exceeds upper bound")
                    .with_context("lower", lower.to_string())
                    .with_context("upper", upper.to_string()),
            ));
        }
        let parameter = Self {
            dirty: vec![false; values.len()],
            values,
            lower,
            upper,
        };
        parameter.check_bounds()?;
        Ok(parameter)
    }

    /// Unbounded parameter.
    pub fn unbounded(values: Vec<T>) -> Result<Self, ArborError> {
        Self::new(values, T::MIN, T::MAX)
    }

    /// Value of dimension `idx`.
    pub fn value(&self, idx: usize) -> T {
        self.values[idx]
    }

    /// All values.
    pub fn values(&self) -> &[T] {
        &self.values
    }

    /// Lower bound shared by all dimensions.
    pub fn lower(&self) -> T {
        self.lower
    }

    /// Upper bound shared by all dimensions.
    pub fn upper(&self) -> T {
        self.upper
    }

    /// True when `value` lies inside `[lower, upper]`.
    pub fn in_bounds(&self, value: T) -> bool {
        value >= self.lower && value <= self.upper
    }

    /// Overwrites dimension `idx` and marks it dirty. Bounds are the caller's
    /// responsibility; operators check them before writing.
    pub fn set_value(&mut self, idx: usize, value: T) {
        self.values[idx] = value;
        self.dirty[idx] = true;
    }

    /// Whether dimension `idx` changed since the flags were cleared.
    pub fn is_dimension_dirty(&self, idx: usize) -> bool {
        self.dirty[idx]
    }

    fn check_bounds(&self) -> Result<(), ArborError> {
        match self.values.iter().position(|&v| !self.in_bounds(v)) {
            None => Ok(()),
            Some(idx) => Err(ArborError::State(
                ErrorInfo::new("out-of-bounds", "parameter value outside its bounds")
                    .with_context("dimension", idx.to_string())
                    .with_context("value", self.values[idx].to_string())
                    .with_context("lower", self.lower.to_string())
                    .with_context("upper", self.upper.to_string()),
            )),
        }
    }

    /// Parses the text form written by [`StateNode::to_text`]:
    /// `id[dim] (lower,upper): v1 v2 `.
    pub fn parse_text(text: &str) -> Result<Self, ArborError> {
        let malformed = |what: &str| {
            ArborError::State(
                ErrorInfo::new("bad-parameter-text", format!("malformed parameter text: {what}"))
                    .with_context("text", text.to_string()),
            )
        };
        let open = text.find('[').ok_or_else(|| malformed("missing '['"))?;
        let close = text[open..]
            .find(']')
            .map(|i| i + open)
            .ok_or_else(|| malformed("missing ']'"))?;
        let dimension: usize = text[open + 1..close]
            .trim()
            .parse()
            .map_err(|_| malformed("dimension"))?;
        let rest = &text[close + 1..];
        let lparen = rest.find('(').ok_or_else(|| malformed("missing '('"))?;
        let rparen = rest.find(')').ok_or_else(|| malformed("missing ')'"))?;
        let (lower, upper) = rest[lparen + 1..rparen]
            .split_once(',')
            .ok_or_else(|| malformed("bounds"))?;
        let lower: T = lower.trim().parse().map_err(|_| malformed("lower bound"))?;
        let upper: T = upper.trim().parse().map_err(|_| malformed("upper bound"))?;
        let colon = rest[rparen..]
            .find(':')
            .map(|i| i + rparen)
            .ok_or_else(|| malformed("missing ':'"))?;
        let values = rest[colon + 1..]
            .split_whitespace()
            .map(|token| token.parse::<T>().map_err(|_| malformed("value")))
            .collect::<Result<Vec<T>, _>>()?;
        if values.len() != dimension {
            return Err(ArborError::State(
                ErrorInfo::new("dimension-mismatch", "declared dimension disagrees with values")
                    .with_context("declared", dimension.to_string())
                    .with_context("found", values.len().to_string()),
            ));
        }
        Self::new(values, lower, upper)
    }
}

impl<T: ParameterValue> StateNode for Parameter<T> {
    fn dimension(&self) -> usize {
        self.values.len()
    }

    fn is_dirty(&self) -> bool {
        self.dirty.iter().any(|&d| d)
    }

    fn set_everything_dirty(&mut self, dirty: bool) {
        self.dirty.iter_mut().for_each(|d| *d = dirty);
    }

    fn to_text(&self, id: &str) -> String {
        let mut text = format!("{id}[{}] ({},{}): ", self.values.len(), self.lower, self.upper);
        for value in &self.values {
            text.push_str(&value.to_string());
            text.push(' ');
        }
        text
    }

    fn assign_from_text(&mut self, text: &str) -> Result<(), ArborError> {
        let parsed = Self::parse_text(text)?;
        *self = parsed;
        self.set_everything_dirty(true);
        Ok(())
    }

    fn scale(&mut self, factor: f64) -> Result<usize, ArborError> {
        for idx in 0..self.values.len() {
            let scaled = self.values[idx].scale_by(factor).ok_or_else(|| {
                ArborError::State(ErrorInfo::new(
                    "not-scalable",
                    "integer parameters cannot be scaled",
                ))
            })?;
            self.set_value(idx, scaled);
        }
        self.check_bounds()?;
        Ok(self.values.len())
    }

    fn monitored_values(&self) -> Vec<f64> {
        self.values.iter().map(|v| v.to_f64()).collect()
    }

    fn checksum(&self) -> u64 {
        let bounds = [self.lower.to_f64(), self.upper.to_f64()];
        checksum_values(bounds.into_iter().chain(self.values.iter().map(|v| v.to_f64())))
    }
}
