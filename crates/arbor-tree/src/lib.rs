#![deny(missing_docs)]
//! Binary time trees for the arbor sampler: node arena, Newick text, hashing,
//! random construction and tree distances.

mod hash;
/// Tree distance metrics.
pub mod metric;
/// Newick reader and writer.
pub mod newick;
mod random;
mod tree;

pub use hash::{canonical_hash, topology_hash};
pub use metric::{RobinsonFoulds, RootHeightDistance, TreeMetric};
pub use random::random_coalescent;
pub use tree::{NodeIndex, Tree, TreeNode};
