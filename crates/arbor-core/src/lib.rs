#![deny(missing_docs)]
//! Core traits and data types for the arbor sampling engine.
//!
//! State nodes live in an arena owned by the chain state and are addressed
//! through the lightweight handles defined here; calculation nodes refer to
//! them by handle only, so no node ever holds a reference back into the arena.

use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

pub mod errors;
pub mod escape;
pub mod rng;

pub use errors::{ArborError, ErrorInfo};
pub use rng::{derive_substream_seed, inverse_cdf, RngHandle};

/// Handle of a state node registered in a state arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateNodeId(usize);

impl StateNodeId {
    /// Creates a handle from its arena index.
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the arena index.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Handle of a calculation node registered in a model graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CalcNodeId(usize);

impl CalcNodeId {
    /// Creates a handle from its graph index.
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the graph index.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Fine grained change marker for parts of a state node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Dirtiness {
    /// Unchanged since the last store.
    #[default]
    Clean,
    /// Value changed.
    Dirty,
    /// Structure changed (topology for trees).
    Filthy,
}

impl Dirtiness {
    /// True unless the marker is [`Dirtiness::Clean`].
    pub fn is_dirty(&self) -> bool {
        !matches!(self, Dirtiness::Clean)
    }
}

/// Contract shared by every sampled value kind (parameters and trees).
///
/// Values are cloned to take the single-slot undo snapshot, so `Clone` plays
/// the role of a deep copy.
pub trait StateNode: Clone + std::fmt::Debug + Send + Sync {
    /// Number of scalar values exposed to monitors and loggers.
    fn dimension(&self) -> usize;

    /// True when any part of the node changed since the dirty flags were cleared.
    fn is_dirty(&self) -> bool;

    /// Marks every part of the node dirty (or clean).
    fn set_everything_dirty(&mut self, dirty: bool);

    /// Text form stored in checkpoints. Must round trip exactly through
    /// [`StateNode::assign_from_text`].
    fn to_text(&self, id: &str) -> String;

    /// Replaces the value with one parsed from [`StateNode::to_text`] output.
    fn assign_from_text(&mut self, text: &str) -> Result<(), ArborError>;

    /// Scales the node by `factor`, returning the number of degrees of freedom
    /// that were scaled. Fails when the result is not a valid value.
    fn scale(&mut self, factor: f64) -> Result<usize, ArborError>;

    /// Flat numeric view (parameter dimensions or node heights).
    fn monitored_values(&self) -> Vec<f64>;

    /// Debug checksum of the full value.
    fn checksum(&self) -> u64;
}

/// Order sensitive checksum over a sequence of floats (bit exact).
pub fn checksum_values<I>(values: I) -> u64
where
    I: IntoIterator<Item = f64>,
{
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    for value in values {
        hasher.write_u64(value.to_bits());
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_bit_exact() {
        let a = checksum_values([0.1, 0.2]);
        let b = checksum_values([0.1, 0.2]);
        let c = checksum_values([0.1, 0.2 + f64::EPSILON]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn dirtiness_orders_by_severity() {
        assert!(Dirtiness::Filthy > Dirtiness::Dirty);
        assert!(!Dirtiness::Clean.is_dirty());
    }
}
