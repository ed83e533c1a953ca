//! Helpers for mapping object ranges onto chunks.

use std::ops::Range;

/// Group sorted chunk indices into runs of consecutive indices.
pub fn contiguous_runs(indices: &[u64]) -> Vec<Range<u64>> {
    let mut runs: Vec<Range<u64>> = Vec::new();
    for &i in indices {
        match runs.last_mut() {
            Some(run) if run.end == i => run.end = i + 1,
            _ => runs.push(i..i + 1),
        }
    }
    runs
}
