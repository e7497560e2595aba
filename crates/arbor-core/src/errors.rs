//! Structured error types shared across arbor crates.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured payload attached to every [`ArborError`] variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable machine readable error code.
    pub code: String,
    /// Human readable diagnostic message.
    pub message: String,
    /// Contextual key value pairs (identifiers, sizes, etc.).
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Optional hint that may help the caller resolve the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorInfo {
    /// Creates a new error payload with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: BTreeMap::new(),
            hint: None,
        }
    }

    /// Adds a context entry to the payload.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets a human readable hint for remediation.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Canonical error type for the arbor engine.
///
/// Rejected or invalid proposals are not errors; they travel as values through
/// the operator API. Everything here is either an I/O problem, a malformed
/// input or a detected defect in incremental recomputation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "family", content = "detail")]
pub enum ArborError {
    /// Tree structure and Newick errors.
    #[error("tree error: {0}")]
    Tree(ErrorInfo),
    /// State arena errors (unknown handles, kind mismatches, bounds).
    #[error("state error: {0}")]
    State(ErrorInfo),
    /// Operator construction and bookkeeping errors.
    #[error("operator error: {0}")]
    Operator(ErrorInfo),
    /// Checkpoint read, parse and dimension errors.
    #[error("checkpoint error: {0}")]
    Checkpoint(ErrorInfo),
    /// Posterior evaluation failures (infinite or repeatedly non-numeric values).
    #[error("posterior error: {0}")]
    Posterior(ErrorInfo),
    /// Divergence between incremental and full recomputation.
    #[error("audit error: {0}")]
    Audit(ErrorInfo),
    /// Initialisation failures.
    #[error("init error: {0}")]
    Init(ErrorInfo),
    /// Configuration and model description errors.
    #[error("config error: {0}")]
    Config(ErrorInfo),
    /// Randomness and seeding errors.
    #[error("rng error: {0}")]
    Rng(ErrorInfo),
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code: {})", self.message, self.code)?;
        if !self.context.is_empty() {
            write!(f, " | context: [")?;
            for (idx, (key, value)) in self.context.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{key}={value}")?;
            }
            write!(f, "]")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " | hint: {hint}")?;
        }
        Ok(())
    }
}

impl ArborError {
    /// Returns a reference to the payload describing the error.
    pub fn info(&self) -> &ErrorInfo {
        match self {
            ArborError::Tree(info)
            | ArborError::State(info)
            | ArborError::Operator(info)
            | ArborError::Checkpoint(info)
            | ArborError::Posterior(info)
            | ArborError::Audit(info)
            | ArborError::Init(info)
            | ArborError::Config(info)
            | ArborError::Rng(info) => info,
        }
    }

    /// Shorthand for the stable error code.
    pub fn code(&self) -> &str {
        &self.info().code
    }
}
