//! Weighted operator selection, sub-schedules, the rate table and the
//! schedule checkpoint.

use std::collections::BTreeSet;

use arbor_core::errors::{ArborError, ErrorInfo};
use arbor_core::RngHandle;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::checkpoint::ScheduleCheckpoint;
use crate::config::TuningConfig;
use crate::operator::{record_map, Operator, Tuner};

/// Group of operators sharing a weight, either absolute or a percentage of
/// the total selection probability.
pub struct SubSchedule {
    /// Schedule weight.
    pub weight: f64,
    /// Interpret `weight` as a percentage.
    pub weight_is_percentage: bool,
    /// Member operators.
    pub operators: Vec<Box<dyn Operator>>,
}

/// One row of the operator rate table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorRate {
    /// Operator id.
    pub id: String,
    /// Tuning parameter, if any.
    pub tuning: Option<f64>,
    /// Accepted proposals.
    pub accepted: u64,
    /// Rejected proposals.
    pub rejected: u64,
    /// Normalised selection probability.
    pub probability: f64,
    /// Acceptance rate.
    pub acceptance: f64,
    /// Tuning advice.
    pub suggestion: Option<String>,
}

/// Ordered operators with a cumulative-probability table.
pub struct OperatorSchedule {
    operators: Vec<Box<dyn Operator>>,
    probabilities: Vec<f64>,
    cumulative: Vec<f64>,
    tuner: Tuner,
}

impl std::fmt::Debug for OperatorSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorSchedule")
            .field("operators", &self.operators.iter().map(|op| op.id()).collect::<Vec<_>>())
            .field("probabilities", &self.probabilities)
            .field("tuner", &self.tuner)
            .finish()
    }
}

impl OperatorSchedule {
    /// Schedule over top-level operators only.
    pub fn new(operators: Vec<Box<dyn Operator>>, tuning: &TuningConfig) -> Result<Self, ArborError> {
        Self::with_subschedules(operators, Vec::new(), tuning)
    }

    /// Schedule over top-level operators and sub-schedules.
    pub fn with_subschedules(
        operators: Vec<Box<dyn Operator>>,
        subschedules: Vec<SubSchedule>,
        tuning: &TuningConfig,
    ) -> Result<Self, ArborError> {
        let percentage: f64 = subschedules
            .iter()
            .filter(|s| s.weight_is_percentage)
            .map(|s| s.weight)
            .sum();
        if percentage > 100.0 {
            return Err(ArborError::Operator(
                ErrorInfo::new("bad-subschedule", "sub-schedule percentages exceed 100")
                    .with_context("sum", percentage.to_string()),
            ));
        }
        if (percentage - 100.0).abs() < 1e-6 && !operators.is_empty() {
            return Err(ArborError::Operator(
                ErrorInfo::new(
                    "bad-subschedule",
                    "sub-schedule percentages add to 100 so top-level operators would never run",
                )
                .with_hint("reduce the weight of the sub-schedules"),
            ));
        }

        let local_weight: f64 = operators.iter().map(|op| op.weight()).sum();
        let absolute_weight: f64 = subschedules
            .iter()
            .filter(|s| !s.weight_is_percentage)
            .map(|s| s.weight)
            .sum();
        let total_weight = if percentage >= 100.0 {
            100.0
        } else {
            (local_weight + absolute_weight) * 100.0 / (100.0 - percentage)
        };

        let mut probabilities: Vec<f64> = operators.iter().map(|op| op.weight() / total_weight).collect();
        let mut all = operators;
        for sub in subschedules {
            let sub_weight: f64 = sub.operators.iter().map(|op| op.weight()).sum();
            let factor = if sub.weight_is_percentage {
                sub.weight / 100.0 / sub_weight
            } else {
                sub.weight / sub_weight / total_weight
            };
            for op in sub.operators {
                probabilities.push(op.weight() * factor);
                all.push(op);
            }
        }

        if all.is_empty() {
            return Err(ArborError::Operator(ErrorInfo::new(
                "empty-schedule",
                "operator schedule has no operators",
            )));
        }
        let mut seen = BTreeSet::new();
        for op in &all {
            if !seen.insert(op.id().to_string()) {
                return Err(ArborError::Operator(
                    ErrorInfo::new("duplicate-operator", "operator id used twice")
                        .with_context("id", op.id().to_string()),
                ));
            }
        }
        if probabilities.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(ArborError::Operator(ErrorInfo::new(
                "bad-weight",
                "operator weights do not form a probability table",
            )));
        }
        let total: f64 = probabilities.iter().sum();
        if !(total > 0.0) {
            return Err(ArborError::Operator(ErrorInfo::new(
                "bad-weight",
                "total operator weight is zero",
            )));
        }
        let probabilities: Vec<f64> = probabilities.iter().map(|p| p / total).collect();
        let cumulative = probabilities
            .iter()
            .scan(0.0, |acc, p| {
                *acc += p;
                Some(*acc)
            })
            .collect();

        Ok(Self {
            operators: all,
            probabilities,
            cumulative,
            tuner: Tuner::new(tuning),
        })
    }

    /// Draws the index of the next operator by inverse-CDF sampling.
    pub fn select_operator(&self, rng: &mut RngHandle) -> usize {
        rng.sample_cumulative(&self.cumulative)
    }

    /// Number of operators (sub-schedules flattened).
    pub fn len(&self) -> usize {
        self.operators.len()
    }

    /// True when the schedule is empty (never, once constructed).
    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Normalised selection probabilities.
    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }

    /// Borrow an operator.
    pub fn operator(&self, idx: usize) -> &dyn Operator {
        self.operators[idx].as_ref()
    }

    /// Operators in selection order.
    pub fn operators(&self) -> impl Iterator<Item = &dyn Operator> + '_ {
        self.operators.iter().map(|op| op.as_ref())
    }

    /// Borrow an operator together with the tuner.
    pub fn operator_and_tuner(&mut self, idx: usize) -> (&mut dyn Operator, &mut Tuner) {
        (self.operators[idx].as_mut(), &mut self.tuner)
    }

    /// Shared tuner.
    pub fn tuner(&self) -> &Tuner {
        &self.tuner
    }

    /// One row per operator.
    pub fn rates(&self) -> Vec<OperatorRate> {
        self.operators
            .iter()
            .zip(&self.probabilities)
            .map(|(op, &probability)| {
                let stats = op.stats();
                OperatorRate {
                    id: op.id().to_string(),
                    tuning: op.tuning(),
                    accepted: stats.accepted,
                    rejected: stats.rejected,
                    probability,
                    acceptance: stats.acceptance_rate(),
                    suggestion: op.performance_suggestion(),
                }
            })
            .collect()
    }

    /// Fixed-width operator table.
    pub fn rates_table(&self) -> String {
        let rates = self.rates();
        let width = rates.iter().map(|r| r.id.len()).max().unwrap_or(8).max(8);
        let mut table = format!(
            "{:<width$} {:>12} {:>10} {:>10} {:>10} {:>10}\n",
            "Operator", "Tuning", "#accept", "#reject", "Pr(m)", "Pr(acc|m)"
        );
        for rate in &rates {
            let tuning = rate
                .tuning
                .map(|t| format!("{t:.5}"))
                .unwrap_or_else(|| "-".to_string());
            table.push_str(&format!(
                "{:<width$} {:>12} {:>10} {:>10} {:>10.5} {:>10.5}",
                rate.id, tuning, rate.accepted, rate.rejected, rate.probability, rate.acceptance
            ));
            if let Some(suggestion) = &rate.suggestion {
                table.push_str(&format!(" {suggestion}"));
            }
            table.push('\n');
        }
        table
    }

    /// Checkpoint record of every operator.
    pub fn to_checkpoint(&self) -> ScheduleCheckpoint {
        ScheduleCheckpoint {
            operators: self.operators.iter().map(|op| op.to_record()).collect(),
        }
    }

    /// Restores operator records by id. Unknown records are skipped with a
    /// warning; the optimisation counter becomes the total of accepts and
    /// rejects.
    pub fn restore_checkpoint(&mut self, checkpoint: &ScheduleCheckpoint) -> Result<(), ArborError> {
        let mut restored = vec![false; self.operators.len()];
        for record in &checkpoint.operators {
            let id = record_map(record)?
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ArborError::Checkpoint(ErrorInfo::new(
                        "checkpoint-parse",
                        "operator record lacks an id",
                    ))
                })?;
            match self.operators.iter().position(|op| op.id() == id) {
                Some(idx) => {
                    self.operators[idx].restore_record(record)?;
                    restored[idx] = true;
                }
                None => warn!(operator = id, "checkpoint record for unknown operator ignored"),
            }
        }
        for (op, done) in self.operators.iter().zip(&restored) {
            if !*done {
                warn!(operator = op.id(), "no checkpoint record; operator keeps its defaults");
            }
        }
        let count = self.operators.iter().map(|op| op.stats().total()).sum();
        self.tuner.set_delay_count(count);
        Ok(())
    }
}
