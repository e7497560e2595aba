//! Trace, tree and progress loggers driven by the chain.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use arbor_core::errors::{ArborError, ErrorInfo};
use arbor_core::{StateNode, StateNodeId};
use tracing::info;

use crate::state::{State, StateValue};

/// Receives the chain state at logging points.
pub trait ChainLogger: Send {
    /// Logging interval in samples.
    fn every(&self) -> u64;

    /// Opens outputs. `resume` appends to existing files instead of truncating.
    fn init(&mut self, state: &State, resume: bool) -> Result<(), ArborError>;

    /// Records the state after `sample`.
    fn log(&mut self, sample: i64, state: &State) -> Result<(), ArborError>;

    /// Flushes and releases outputs.
    fn close(&mut self) -> Result<(), ArborError> {
        Ok(())
    }
}

/// Whether a logger with interval `every` records `sample`.
pub fn should_log(sample: i64, every: u64) -> bool {
    every > 0 && sample >= 0 && sample % every as i64 == 0
}

fn io_error(code: &str, err: std::io::Error, path: &Path) -> ArborError {
    ArborError::Config(
        ErrorInfo::new(code, err.to_string()).with_context("path", path.display().to_string()),
    )
}

/// Opens `path` for writing; returns the writer and whether the file already
/// had content (in which case a header is not repeated).
fn open_log(path: &Path, resume: bool) -> Result<(BufWriter<File>, bool), ArborError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|err| io_error("log-mkdir", err, parent))?;
    }
    let existing = resume && path.metadata().map(|m| m.len() > 0).unwrap_or(false);
    let file = if resume {
        OpenOptions::new().create(true).append(true).open(path)
    } else {
        File::create(path)
    }
    .map_err(|err| io_error("log-open", err, path))?;
    Ok((BufWriter::new(file), existing))
}

/// Tab separated trace: sample, posterior, every parameter dimension and
/// every tree's root height.
#[derive(Debug)]
pub struct TraceLogger {
    path: PathBuf,
    every: u64,
    columns: Vec<StateNodeId>,
    out: Option<BufWriter<File>>,
}

impl TraceLogger {
    /// Trace over every registered state node.
    pub fn new(path: impl Into<PathBuf>, every: u64) -> Self {
        Self {
            path: path.into(),
            every,
            columns: Vec::new(),
            out: None,
        }
    }

    fn header(&self, state: &State) -> Result<String, ArborError> {
        let mut header = String::from("Sample\tposterior");
        for &id in &self.columns {
            let label = state.nodes().label(id)?;
            match state.get(id)? {
                StateValue::Tree(_) => header.push_str(&format!("\t{label}.height")),
                value if value.dimension() == 1 => header.push_str(&format!("\t{label}")),
                value => {
                    for dim in 1..=value.dimension() {
                        header.push_str(&format!("\t{label}.{dim}"));
                    }
                }
            }
        }
        Ok(header)
    }
}

impl ChainLogger for TraceLogger {
    fn every(&self) -> u64 {
        self.every
    }

    fn init(&mut self, state: &State, resume: bool) -> Result<(), ArborError> {
        self.columns = state.nodes().ids().collect();
        let (mut out, existing) = open_log(&self.path, resume)?;
        if !existing {
            let header = self.header(state)?;
            writeln!(out, "{header}").map_err(|err| io_error("log-write", err, &self.path))?;
        }
        self.out = Some(out);
        Ok(())
    }

    fn log(&mut self, sample: i64, state: &State) -> Result<(), ArborError> {
        let mut line = format!("{sample}\t{}", state.graph().posterior());
        for &id in &self.columns {
            match state.get(id)? {
                StateValue::Tree(tree) => line.push_str(&format!("\t{}", tree.root_height())),
                value => {
                    for v in value.monitored_values() {
                        line.push_str(&format!("\t{v}"));
                    }
                }
            }
        }
        if let Some(out) = self.out.as_mut() {
            writeln!(out, "{line}").map_err(|err| io_error("log-write", err, &self.path))?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), ArborError> {
        if let Some(mut out) = self.out.take() {
            out.flush().map_err(|err| io_error("log-write", err, &self.path))?;
        }
        Ok(())
    }
}

/// One Newick line per logged sample.
#[derive(Debug)]
pub struct TreeLogger {
    path: PathBuf,
    every: u64,
    tree: StateNodeId,
    out: Option<BufWriter<File>>,
}

impl TreeLogger {
    /// Logs `tree` to `path`.
    pub fn new(path: impl Into<PathBuf>, every: u64, tree: StateNodeId) -> Self {
        Self {
            path: path.into(),
            every,
            tree,
            out: None,
        }
    }
}

impl ChainLogger for TreeLogger {
    fn every(&self) -> u64 {
        self.every
    }

    fn init(&mut self, state: &State, resume: bool) -> Result<(), ArborError> {
        state.tree(self.tree)?;
        self.out = Some(open_log(&self.path, resume)?.0);
        Ok(())
    }

    fn log(&mut self, _sample: i64, state: &State) -> Result<(), ArborError> {
        let newick = state.tree(self.tree)?.to_newick();
        if let Some(out) = self.out.as_mut() {
            writeln!(out, "{newick}").map_err(|err| io_error("log-write", err, &self.path))?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), ArborError> {
        if let Some(mut out) = self.out.take() {
            out.flush().map_err(|err| io_error("log-write", err, &self.path))?;
        }
        Ok(())
    }
}

/// Progress report through `tracing`.
#[derive(Debug)]
pub struct ScreenLogger {
    every: u64,
    started: Option<Instant>,
}

impl ScreenLogger {
    /// Reports every `every` samples.
    pub fn new(every: u64) -> Self {
        Self {
            every,
            started: None,
        }
    }
}

impl ChainLogger for ScreenLogger {
    fn every(&self) -> u64 {
        self.every
    }

    fn init(&mut self, _state: &State, _resume: bool) -> Result<(), ArborError> {
        self.started = Some(Instant::now());
        Ok(())
    }

    fn log(&mut self, sample: i64, state: &State) -> Result<(), ArborError> {
        let elapsed_s = self
            .started
            .map(|start| start.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        info!(sample, posterior = state.graph().posterior(), elapsed_s, "progress");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_points_skip_burn_in() {
        assert!(should_log(0, 10));
        assert!(should_log(20, 10));
        assert!(!should_log(-10, 10));
        assert!(!should_log(5, 10));
        assert!(!should_log(0, 0));
    }
}
