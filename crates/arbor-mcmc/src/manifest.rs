//! JSON manifest written when a chain finishes.

use std::fs;
use std::path::{Path, PathBuf};

use arbor_core::errors::ErrorInfo;
use arbor_core::ArborError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::schedule::OperatorRate;

/// Structured manifest describing a completed chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    /// Configuration used for the run.
    pub config: RunConfig,
    /// Master seed used to derive the chain substreams.
    pub master_seed: u64,
    /// First sample of this invocation (negative during pre-burn-in, or the
    /// sample after the checkpoint on resume).
    pub start_sample: i64,
    /// SHA-256 over the checkpoint text of the final state.
    pub final_state_hash: String,
    /// Posterior of the final state.
    pub final_posterior: f64,
    /// State file written during the run.
    pub state_file: Option<PathBuf>,
    /// Trace log written during the run.
    pub trace_log: Option<PathBuf>,
    /// Tree log written during the run.
    pub tree_log: Option<PathBuf>,
    /// Final operator rates.
    pub operators: Vec<OperatorRate>,
    /// Chain duration on the runtime clock, in milliseconds.
    pub elapsed_ms: f64,
    /// Wall-clock time the run finished.
    pub finished_at: DateTime<Utc>,
}

impl RunManifest {
    /// Writes the manifest to a JSON file.
    pub fn write(&self, path: &Path) -> Result<(), ArborError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                ArborError::Checkpoint(
                    ErrorInfo::new("manifest-mkdir", err.to_string())
                        .with_context("path", parent.display().to_string()),
                )
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|err| {
            ArborError::Checkpoint(
                ErrorInfo::new("manifest-serialize", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        fs::write(path, json).map_err(|err| {
            ArborError::Checkpoint(
                ErrorInfo::new("manifest-write", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })
    }

    /// Loads a manifest from disk.
    pub fn load(path: &Path) -> Result<Self, ArborError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            ArborError::Checkpoint(
                ErrorInfo::new("manifest-read", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        serde_json::from_str(&contents).map_err(|err| {
            ArborError::Checkpoint(
                ErrorInfo::new("manifest-parse", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })
    }
}
