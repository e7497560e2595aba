use arbor_core::errors::{ArborError, ErrorInfo};
use arbor_core::RngHandle;

use crate::tree::Tree;

/// Draws a tree from the constant-size coalescent with all tips at height 0.
///
/// Internal nodes are numbered in order of creation so the root is always the
/// last node.
pub fn random_coalescent(
    taxa: &[String],
    population_size: f64,
    rng: &mut RngHandle,
) -> Result<Tree, ArborError> {
    if taxa.len() < 2 {
        return Err(ArborError::Tree(
            ErrorInfo::new("too-few-taxa", "a tree needs at least two taxa")
                .with_context("taxa", taxa.len().to_string()),
        ));
    }
    if !(population_size > 0.0) || !population_size.is_finite() {
        return Err(ArborError::Tree(
            ErrorInfo::new("bad-population-size", "population size must be positive")
                .with_context("value", population_size.to_string()),
        ));
    }
    let leaves = taxa.len();
    let count = 2 * leaves - 1;
    let mut parents = vec![None; count];
    let mut heights = vec![0.0; count];
    let mut lineages: Vec<usize> = (0..leaves).collect();
    let mut time = 0.0;
    let mut next = leaves;
    while lineages.len() > 1 {
        let k = lineages.len() as f64;
        let rate = k * (k - 1.0) / 2.0 / population_size;
        time += -(1.0 - rng.uniform()).ln() / rate;
        let first = lineages.swap_remove(rng.index(lineages.len()));
        let second = lineages.swap_remove(rng.index(lineages.len()));
        parents[first] = Some(next);
        parents[second] = Some(next);
        heights[next] = time;
        lineages.push(next);
        next += 1;
    }
    Tree::from_parts(taxa.to_vec(), &parents, &heights)
}
