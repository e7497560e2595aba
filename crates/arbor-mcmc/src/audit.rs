//! Periodic check that the incrementally maintained posterior matches a
//! recomputation from scratch, and debug validation of rejected proposals.

use arbor_core::errors::{ArborError, ErrorInfo};
use rayon::ThreadPool;
use tracing::{error, warn};

use crate::config::AuditConfig;
use crate::state::State;

/// Result of one audit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuditOutcome {
    /// Incremental and recomputed values agree.
    Consistent,
    /// A divergence after the debug window was repaired; the chain continues
    /// from `posterior`.
    Corrected {
        /// Posterior recomputed from scratch.
        posterior: f64,
    },
}

/// Audit schedule and correction budget.
#[derive(Debug, Clone)]
pub struct Audit {
    config: AuditConfig,
    corrections: usize,
}

impl Audit {
    /// Audit with no corrections spent.
    pub fn new(config: &AuditConfig) -> Self {
        Self {
            config: config.clone(),
            corrections: 0,
        }
    }

    /// Corrections spent so far.
    pub fn corrections(&self) -> usize {
        self.corrections
    }

    /// Whether debug checks (every-sample audit, restore checksums) apply to
    /// `sample`. They switch off once the debug window has passed.
    pub fn debug_active(&self, sample: i64) -> bool {
        self.config.debug && self.in_debug_window(sample)
    }

    /// Whether `sample` falls inside the window where divergence is fatal.
    pub fn in_debug_window(&self, sample: i64) -> bool {
        sample <= self.config.debug_window as i64
    }

    /// Whether the posterior is audited after `sample`.
    pub fn should_check(&self, sample: i64) -> bool {
        self.debug_active(sample) || sample.rem_euclid(self.config.every as i64) == 0
    }

    fn too_different(&self, a: f64, b: f64) -> bool {
        a != b && !((a - b).abs() <= self.config.tolerance)
    }

    /// Recomputes the posterior from scratch and compares it with `current`.
    ///
    /// When any reachable node is stochastic only the non-stochastic part is
    /// compared. A divergence inside the debug window, or beyond the
    /// correction budget, is an [`ArborError::Audit`].
    pub fn check(
        &mut self,
        state: &mut State,
        pool: Option<&ThreadPool>,
        sample: i64,
        current: f64,
    ) -> Result<AuditOutcome, ArborError> {
        let (incremental, recomputed) = if state.graph().is_stochastic() {
            let incremental = state.graph().non_stochastic_log_p();
            (incremental, state.robustly_calc_non_stochastic_posterior()?)
        } else {
            (current, state.robustly_calc_posterior(pool)?)
        };
        if !self.too_different(incremental, recomputed) {
            return Ok(AuditOutcome::Consistent);
        }

        let divergence = |phase: &str, message: &str, corrections: usize| {
            ArborError::Audit(
                ErrorInfo::new("correction-budget-exceeded", message.to_string())
                    .with_context("phase", phase.to_string())
                    .with_context("sample", sample.to_string())
                    .with_context("incremental", incremental.to_string())
                    .with_context("recomputed", recomputed.to_string())
                    .with_context("corrections", corrections.to_string())
                    .with_hint("a calculation node does not mark itself dirty when its inputs change"),
            )
        };
        if self.in_debug_window(sample) {
            error!(sample, incremental, recomputed, "posterior diverged inside the debug window");
            return Err(divergence(
                "debug-window",
                "incremental posterior diverged from recomputation inside the debug window",
                self.corrections,
            ));
        }
        self.corrections += 1;
        if self.corrections > self.config.max_corrections {
            error!(sample, incremental, recomputed, "too many posterior corrections");
            return Err(divergence("post-window", "posterior needed too many corrections", self.corrections));
        }
        warn!(
            sample,
            incremental,
            recomputed,
            corrections = self.corrections,
            "posterior corrected"
        );
        let posterior = state.robustly_calc_posterior(pool)?;
        Ok(AuditOutcome::Corrected { posterior })
    }
}

/// Compares checksums taken before a proposal with those after its rejection.
pub fn validate_restore(
    before: &[u64],
    after: &[u64],
    sample: i64,
    operator: &str,
) -> Result<(), ArborError> {
    if let Some(position) = before.iter().zip(after).position(|(b, a)| b != a) {
        return Err(ArborError::Audit(
            ErrorInfo::new("restore-mismatch", "state differs after a rejected proposal")
                .with_context("sample", sample.to_string())
                .with_context("operator", operator.to_string())
                .with_context("node", position.to_string())
                .with_hint("the operator or a calculation node does not restore what it changed"),
        ));
    }
    if before.len() != after.len() {
        return Err(ArborError::Audit(
            ErrorInfo::new("restore-mismatch", "node count changed during a proposal")
                .with_context("sample", sample.to_string())
                .with_context("operator", operator.to_string()),
        ));
    }
    Ok(())
}
