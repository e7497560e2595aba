use std::fs;
use std::path::{Path, PathBuf};

use arbor_core::errors::ErrorInfo;
use arbor_core::escape::{escape, unescape};
use arbor_core::ArborError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const HEADER_PREFIX: &str = "<chainstate version='1.0' sample='";
const FOOTER: &str = "</chainstate>";
const NODE_PREFIX: &str = "<statenode id='";
const NODE_SUFFIX: &str = "</statenode>";

/// State file contents: the sample number and one escaped text record per
/// state node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateCheckpoint {
    /// Sample at which the state was written.
    pub sample: i64,
    /// `(id, escaped text)` pairs in registration order. Ids are held
    /// unescaped and escaped on write.
    pub nodes: Vec<(String, String)>,
}

impl StateCheckpoint {
    /// Node records without the header, one per line.
    pub fn body(&self) -> String {
        let mut body = String::new();
        for (id, text) in &self.nodes {
            body.push_str(&format!("{NODE_PREFIX}{}'>{text}{NODE_SUFFIX}\n", escape(id)));
        }
        body
    }

    /// Full state file text.
    pub fn to_text(&self) -> String {
        format!("{HEADER_PREFIX}{}'>\n{}{FOOTER}\n", self.sample, self.body())
    }

    /// Parses the text written by [`StateCheckpoint::to_text`].
    pub fn parse(text: &str) -> Result<Self, ArborError> {
        let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty());
        let header = lines.next().ok_or_else(|| parse_error("empty state file", ""))?;
        let sample = header
            .strip_prefix(HEADER_PREFIX)
            .and_then(|rest| rest.strip_suffix("'>"))
            .ok_or_else(|| parse_error("malformed header", header))?
            .parse::<i64>()
            .map_err(|_| parse_error("malformed sample number", header))?;
        let mut nodes = Vec::new();
        let mut closed = false;
        for line in lines {
            if line == FOOTER {
                closed = true;
                break;
            }
            let record = line
                .strip_prefix(NODE_PREFIX)
                .and_then(|rest| rest.strip_suffix(NODE_SUFFIX))
                .ok_or_else(|| parse_error("malformed state node record", line))?;
            let (id, escaped) = record
                .split_once("'>")
                .ok_or_else(|| parse_error("malformed state node id", line))?;
            nodes.push((unescape(id), escaped.to_string()));
        }
        if !closed {
            return Err(parse_error("missing closing tag", FOOTER));
        }
        Ok(Self { sample, nodes })
    }

    /// Reads a state file.
    pub fn load(path: &Path) -> Result<Self, ArborError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            ArborError::Checkpoint(
                ErrorInfo::new("checkpoint-read", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        Self::parse(&contents).map_err(|err| {
            ArborError::Checkpoint(
                err.info()
                    .clone()
                    .with_context("path", path.display().to_string()),
            )
        })
    }

    /// Writes the state file atomically.
    pub fn store(&self, path: &Path) -> Result<(), ArborError> {
        write_atomically(path, &self.to_text())
    }
}

fn parse_error(message: &str, line: &str) -> ArborError {
    ArborError::Checkpoint(
        ErrorInfo::new("checkpoint-parse", message.to_string()).with_context("line", line.to_string()),
    )
}

/// Operator schedule checkpoint: one JSON record per operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleCheckpoint {
    /// Operator records, matched by their `id` key on restore.
    pub operators: Vec<Value>,
}

impl ScheduleCheckpoint {
    /// Reads the companion operator file.
    pub fn load(path: &Path) -> Result<Self, ArborError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            ArborError::Checkpoint(
                ErrorInfo::new("checkpoint-read", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        serde_json::from_str(&contents).map_err(|err| {
            ArborError::Checkpoint(
                ErrorInfo::new("checkpoint-parse", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })
    }

    /// Writes the companion operator file atomically.
    pub fn store(&self, path: &Path) -> Result<(), ArborError> {
        let json = serde_json::to_string_pretty(self).map_err(|err| {
            ArborError::Checkpoint(
                ErrorInfo::new("checkpoint-serialize", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        write_atomically(path, &json)
    }
}

/// Companion operator checkpoint path: `<state>.operators.json`.
pub fn operators_path(state_path: &Path) -> PathBuf {
    let mut name = state_path.as_os_str().to_os_string();
    name.push(".operators.json");
    PathBuf::from(name)
}

/// Writes `<path>.new` and renames it over `path`.
fn write_atomically(path: &Path, contents: &str) -> Result<(), ArborError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| {
            ArborError::Checkpoint(
                ErrorInfo::new("checkpoint-mkdir", err.to_string())
                    .with_context("path", parent.display().to_string()),
            )
        })?;
    }
    let mut staging = path.as_os_str().to_os_string();
    staging.push(".new");
    let staging = PathBuf::from(staging);
    fs::write(&staging, contents).map_err(|err| {
        ArborError::Checkpoint(
            ErrorInfo::new("checkpoint-write", err.to_string())
                .with_context("path", staging.display().to_string()),
        )
    })?;
    fs::rename(&staging, path).map_err(|err| {
        ArborError::Checkpoint(
            ErrorInfo::new("checkpoint-rename", err.to_string())
                .with_context("path", path.display().to_string()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_round_trip() {
        let checkpoint = StateCheckpoint {
            sample: 42,
            nodes: vec![
                ("x".into(), "x[1] (0,inf): 1.5 ".into()),
                ("tree".into(), "(A:1,B:1)[&amp;nr=2,height=1];".into()),
            ],
        };
        let text = checkpoint.to_text();
        assert!(text.starts_with("<chainstate version='1.0' sample='42'>\n<statenode id='x'>"));
        assert_eq!(StateCheckpoint::parse(&text).unwrap(), checkpoint);
    }

    #[test]
    fn truncated_file_is_rejected() {
        let err = StateCheckpoint::parse("<chainstate version='1.0' sample='3'>\n").unwrap_err();
        assert_eq!(err.code(), "checkpoint-parse");
    }

    #[test]
    fn operators_path_appends_suffix() {
        assert_eq!(
            operators_path(Path::new("run/chain.state")),
            PathBuf::from("run/chain.state.operators.json")
        );
    }
}
