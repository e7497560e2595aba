//! Operator contract, proposal outcomes, acceptance bookkeeping and the
//! Robbins-Monro tuning step shared by tunable operators.

use arbor_core::errors::{ArborError, ErrorInfo};
use arbor_core::{RngHandle, StateNodeId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::{TuningConfig, TuningTransform};
use crate::state::State;

/// Result of a proposal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Proposal {
    /// Valid move with the given log Hastings ratio.
    Move(f64),
    /// The move cannot be made; rejected without evaluating the posterior.
    Invalid,
}

impl Proposal {
    /// Symmetric move.
    pub fn symmetric() -> Self {
        Proposal::Move(0.0)
    }

    /// Wraps a raw log ratio, mapping negative infinity and NaN to
    /// [`Proposal::Invalid`].
    pub fn from_log_ratio(log_ratio: f64) -> Self {
        if log_ratio.is_nan() || log_ratio == f64::NEG_INFINITY {
            Proposal::Invalid
        } else {
            Proposal::Move(log_ratio)
        }
    }

    /// Log Hastings ratio; exactly negative infinity when invalid.
    pub fn log_hastings_ratio(&self) -> f64 {
        match self {
            Proposal::Move(ratio) => *ratio,
            Proposal::Invalid => f64::NEG_INFINITY,
        }
    }

    /// True for [`Proposal::Move`].
    pub fn is_valid(&self) -> bool {
        matches!(self, Proposal::Move(_))
    }
}

/// Why a proposal was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Ordinary Metropolis-Hastings rejection.
    Posterior,
    /// Valid proposal whose posterior is negative infinity.
    InvalidPosterior,
    /// The operator itself declared the proposal invalid.
    InvalidProposal,
}

impl Rejection {
    /// Numeric reason code: 0, -1 or -2.
    pub fn reason_code(&self) -> i32 {
        match self {
            Rejection::Posterior => 0,
            Rejection::InvalidPosterior => -1,
            Rejection::InvalidProposal => -2,
        }
    }
}

/// Acceptance counters of one operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorStats {
    /// Accepted proposals.
    pub accepted: u64,
    /// Rejected proposals (all reasons).
    pub rejected: u64,
    /// Accepts counted once the optimisation delay has passed.
    pub accepted_for_correction: u64,
    /// Rejects counted once the optimisation delay has passed.
    pub rejected_for_correction: u64,
    /// Rejections for reasons -1 and -2.
    pub rejected_invalid: u64,
    /// Rejections for reason -2.
    pub rejected_operator: u64,
}

impl OperatorStats {
    /// Records an accept.
    pub fn record_accept(&mut self, past_delay: bool) {
        self.accepted += 1;
        if past_delay {
            self.accepted_for_correction += 1;
        }
    }

    /// Records a reject.
    pub fn record_reject(&mut self, reason: Rejection, past_delay: bool) {
        self.rejected += 1;
        if past_delay {
            self.rejected_for_correction += 1;
        }
        match reason {
            Rejection::Posterior => {}
            Rejection::InvalidPosterior => self.rejected_invalid += 1,
            Rejection::InvalidProposal => {
                self.rejected_invalid += 1;
                self.rejected_operator += 1;
            }
        }
    }

    /// Proposals seen.
    pub fn total(&self) -> u64 {
        self.accepted + self.rejected
    }

    /// Accepted fraction, zero before the first proposal.
    pub fn acceptance_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.accepted as f64 / total as f64,
        }
    }
}

/// Schedule-wide tuning settings and the optimisation delay counter.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuner {
    auto_optimize: bool,
    delay: u64,
    delay_count: u64,
    transform: TuningTransform,
}

impl Default for Tuner {
    fn default() -> Self {
        Self::new(&TuningConfig::default())
    }
}

impl Tuner {
    /// Tuner from configuration.
    pub fn new(config: &TuningConfig) -> Self {
        Self {
            auto_optimize: config.auto_optimize,
            delay: config.delay,
            delay_count: 0,
            transform: config.transform,
        }
    }

    /// Whether the optimisation delay has passed.
    pub fn is_past_delay(&self) -> bool {
        self.delay_count >= self.delay
    }

    /// Optimisation counter.
    pub fn delay_count(&self) -> u64 {
        self.delay_count
    }

    /// Sets the optimisation counter (used on resume).
    pub fn set_delay_count(&mut self, count: u64) {
        self.delay_count = count;
    }

    /// Robbins-Monro step towards `target`. Zero while the delay is running
    /// or when tuning is switched off.
    pub fn calc_delta(&mut self, stats: &OperatorStats, target: f64, log_alpha: f64) -> f64 {
        if self.delay_count < self.delay || !self.auto_optimize {
            self.delay_count += 1;
            return 0.0;
        }
        let mut count =
            (stats.rejected_for_correction + stats.accepted_for_correction) as f64 + 1.0;
        count = match self.transform {
            TuningTransform::None => count,
            TuningTransform::Log => (count + 1.0).ln(),
            TuningTransform::Sqrt => count.sqrt(),
        };
        let delta = (log_alpha.min(0.0).exp() - target) / count;
        if delta.is_finite() {
            delta
        } else {
            0.0
        }
    }
}

/// Applies a log-space step to a positive tuning parameter.
pub fn tune_log_space(current: f64, delta: f64) -> f64 {
    (delta + current.ln()).exp()
}

/// Stochastic proposal generator.
pub trait Operator: Send {
    /// Unique label.
    fn id(&self) -> &str;

    /// Unnormalised selection weight.
    fn weight(&self) -> f64;

    /// Acceptance counters.
    fn stats(&self) -> &OperatorStats;

    /// Mutable acceptance counters.
    fn stats_mut(&mut self) -> &mut OperatorStats;

    /// State nodes the operator may edit.
    fn state_nodes(&self) -> Vec<StateNodeId>;

    /// Draws a move, edits the state in place and returns the outcome.
    fn proposal(&mut self, state: &mut State, rng: &mut RngHandle) -> Result<Proposal, ArborError>;

    /// Called after the proposal was accepted; the state still holds the
    /// proposed values.
    fn accept(&mut self, _state: &State, tuner: &Tuner) {
        let past = tuner.is_past_delay();
        self.stats_mut().record_accept(past);
    }

    /// Called after the proposal was rejected, before the state is restored.
    fn reject(&mut self, reason: Rejection, tuner: &Tuner) {
        let past = tuner.is_past_delay();
        self.stats_mut().record_reject(reason, past);
    }

    /// Adjusts the tuning parameter after a post burn-in iteration.
    fn optimize(&mut self, _log_alpha: f64, _tuner: &mut Tuner) {}

    /// Acceptance probability the tuning aims for.
    fn target_acceptance(&self) -> f64 {
        0.234
    }

    /// Current tuning parameter, if the operator has one.
    fn tuning(&self) -> Option<f64> {
        None
    }

    /// Overwrites the tuning parameter.
    fn set_tuning(&mut self, _value: f64) {}

    /// Human readable advice when the acceptance rate is far from target.
    fn performance_suggestion(&self) -> Option<String> {
        default_suggestion(self.stats(), self.target_acceptance(), self.tuning())
    }

    /// Checkpoint record.
    fn to_record(&self) -> Value {
        base_record(self.id(), self.tuning(), self.stats())
    }

    /// Restores state from a checkpoint record.
    fn restore_record(&mut self, record: &Value) -> Result<(), ArborError> {
        let (tuning, stats) = parse_base_record(record)?;
        if let Some(value) = tuning {
            self.set_tuning(value);
        }
        *self.stats_mut() = stats;
        Ok(())
    }
}

/// Suggestion text used by [`Operator::performance_suggestion`].
pub fn default_suggestion(stats: &OperatorStats, target: f64, tuning: Option<f64>) -> Option<String> {
    if stats.total() == 0 {
        return None;
    }
    let rate = stats.acceptance_rate();
    let ratio = (rate / target).clamp(0.5, 2.0);
    let suggested = tuning.map(|value| value * ratio);
    if rate < 0.1 {
        Some(match suggested {
            Some(value) => format!("Try setting the tuning parameter to about {value:.3}"),
            None => "Try decreasing the size of the move".to_string(),
        })
    } else if rate > 0.4 {
        Some(match suggested {
            Some(value) => format!("Try setting the tuning parameter to about {value:.3}"),
            None => "Try increasing the size of the move".to_string(),
        })
    } else {
        None
    }
}

/// Checkpoint record shared by all operators.
pub fn base_record(id: &str, tuning: Option<f64>, stats: &OperatorStats) -> Value {
    json!({
        "id": id,
        "p": encode_f64(tuning.unwrap_or(f64::NAN)),
        "accept": stats.accepted,
        "reject": stats.rejected,
        "acceptFC": stats.accepted_for_correction,
        "rejectFC": stats.rejected_for_correction,
        "rejectIv": stats.rejected_invalid,
        "rejectOp": stats.rejected_operator,
    })
}

/// Parses the common part of a checkpoint record.
pub fn parse_base_record(record: &Value) -> Result<(Option<f64>, OperatorStats), ArborError> {
    let map = record_map(record)?;
    let tuning = match map.get("p") {
        Some(value) => decode_f64(value).filter(|v| !v.is_nan()),
        None => None,
    };
    let count = |key: &str| map.get(key).and_then(Value::as_u64).unwrap_or(0);
    let stats = OperatorStats {
        accepted: count("accept"),
        rejected: count("reject"),
        accepted_for_correction: count("acceptFC"),
        rejected_for_correction: count("rejectFC"),
        rejected_invalid: count("rejectIv"),
        rejected_operator: count("rejectOp"),
    };
    Ok((tuning, stats))
}

/// Borrow a record as a JSON object.
pub fn record_map(record: &Value) -> Result<&Map<String, Value>, ArborError> {
    record.as_object().ok_or_else(|| {
        ArborError::Checkpoint(ErrorInfo::new(
            "checkpoint-parse",
            "operator record is not a JSON object",
        ))
    })
}

/// JSON has no encoding for non-finite numbers; they are written as strings.
pub fn encode_f64(value: f64) -> Value {
    if value.is_finite() {
        json!(value)
    } else if value.is_nan() {
        json!("NaN")
    } else if value > 0.0 {
        json!("Infinity")
    } else {
        json!("-Infinity")
    }
}

/// Inverse of [`encode_f64`].
pub fn decode_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.as_str() {
            "NaN" => Some(f64::NAN),
            "Infinity" => Some(f64::INFINITY),
            "-Infinity" => Some(f64::NEG_INFINITY),
            other => other.parse().ok(),
        },
        _ => None,
    }
}

/// Checks a construction-time weight.
pub fn check_weight(id: &str, weight: f64) -> Result<(), ArborError> {
    if weight.is_finite() && weight >= 0.0 {
        Ok(())
    } else {
        Err(ArborError::Operator(
            ErrorInfo::new("bad-weight", "operator weight must be finite and non-negative")
                .with_context("id", id.to_string())
                .with_context("weight", weight.to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_proposal_is_exactly_negative_infinity() {
        assert_eq!(Proposal::Invalid.log_hastings_ratio(), f64::NEG_INFINITY);
        assert_eq!(Proposal::from_log_ratio(f64::NAN), Proposal::Invalid);
        assert_eq!(Proposal::from_log_ratio(f64::NEG_INFINITY), Proposal::Invalid);
    }

    #[test]
    fn delay_suppresses_tuning() {
        let mut tuner = Tuner::new(&TuningConfig {
            auto_optimize: true,
            delay: 2,
            transform: TuningTransform::None,
        });
        let stats = OperatorStats::default();
        assert_eq!(tuner.calc_delta(&stats, 0.3, 0.0), 0.0);
        assert_eq!(tuner.calc_delta(&stats, 0.3, 0.0), 0.0);
        let delta = tuner.calc_delta(&stats, 0.3, 0.0);
        assert!((delta - 0.7).abs() < 1e-12);
        assert!(tuner.calc_delta(&stats, 0.3, f64::NEG_INFINITY) < 0.0);
    }

    #[test]
    fn counters_split_by_reason() {
        let mut stats = OperatorStats::default();
        stats.record_reject(Rejection::InvalidProposal, false);
        stats.record_reject(Rejection::InvalidPosterior, true);
        stats.record_accept(true);
        assert_eq!(stats.rejected, 2);
        assert_eq!(stats.rejected_invalid, 2);
        assert_eq!(stats.rejected_operator, 1);
        assert_eq!(stats.rejected_for_correction, 1);
        assert_eq!(stats.accepted_for_correction, 1);
    }

    #[test]
    fn record_round_trip_keeps_nan_tuning_absent() {
        let mut stats = OperatorStats::default();
        stats.record_accept(false);
        let record = base_record("op", None, &stats);
        assert_eq!(record["p"], json!("NaN"));
        let (tuning, parsed) = parse_base_record(&record).unwrap();
        assert_eq!(tuning, None);
        assert_eq!(parsed, stats);
    }
}
