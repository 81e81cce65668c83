//! Cumulative Network Response Builder
//!
//! Reduces every node's energy trace to a single trace: at each sample, the
//! largest energy over all nodes, plus the node that produced it.
//!
//! Two strategies share the same fold rule:
//!
//! - [`InMemoryResponse`]: stack every node, hold all traces, fold in node order
//! - [`ScratchResponse`]: stack to scratch files, fold contiguous node batches
//!   on the pool (reading and deleting each file), then merge the partials
//!
//! Ties keep the earlier node in both, so the recorded peak node is always
//! the first argmax.

mod scratch;

pub use scratch::{ScratchError, ScratchStore};

use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

use crate::energy::{NodeEnergy, StackJob, StackPool};

#[derive(Error, Debug)]
pub enum ResponseError {
    #[error("Cannot build a network response from an empty grid")]
    NoNodes,

    #[error("Energy trace for node {node} has {found} samples, response has {expected}")]
    LengthMismatch {
        node: usize,
        expected: usize,
        found: usize,
    },

    #[error(transparent)]
    Scratch(#[from] ScratchError),
}

/// Per-sample maximum node energy and the node that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkResponse {
    pub values: Vec<u16>,
    pub peak_nodes: Vec<usize>,
}

impl NetworkResponse {
    /// All-zero response attributed to `first_node`.
    pub fn new(len: usize, first_node: usize) -> Self {
        Self {
            values: vec![0; len],
            peak_nodes: vec![first_node; len],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Take `node`'s energy wherever it is strictly larger.
    pub fn fold(&mut self, node: usize, energy: &[u16]) -> Result<(), ResponseError> {
        if energy.len() != self.values.len() {
            return Err(ResponseError::LengthMismatch {
                node,
                expected: self.values.len(),
                found: energy.len(),
            });
        }
        for ((value, peak), &e) in self.values.iter_mut().zip(&mut self.peak_nodes).zip(energy) {
            if e > *value {
                *value = e;
                *peak = node;
            }
        }
        Ok(())
    }

    /// Combine with a partial response built from later nodes.
    pub fn merge(&mut self, later: &Self) -> Result<(), ResponseError> {
        if later.len() != self.len() {
            return Err(ResponseError::LengthMismatch {
                node: later.peak_nodes.first().copied().unwrap_or(0),
                expected: self.len(),
                found: later.len(),
            });
        }
        for i in 0..self.values.len() {
            if later.values[i] > self.values[i] {
                self.values[i] = later.values[i];
                self.peak_nodes[i] = later.peak_nodes[i];
            }
        }
        Ok(())
    }

    /// Fold a node-ordered set of in-memory energy traces.
    pub fn from_energies(energies: &[NodeEnergy]) -> Result<Self, ResponseError> {
        let first = energies.first().ok_or(ResponseError::NoNodes)?;
        let mut response = Self::new(first.energy.len(), first.node);
        for ne in energies {
            response.fold(ne.node, &ne.energy)?;
        }
        Ok(response)
    }

    /// Sample index, value and node of the overall maximum (first on ties).
    pub fn peak(&self) -> Option<(usize, u16, usize)> {
        let mut best: Option<(usize, u16, usize)> = None;
        for (i, (&v, &node)) in self.values.iter().zip(&self.peak_nodes).enumerate() {
            if best.map_or(true, |(_, bv, _)| v > bv) {
                best = Some((i, v, node));
            }
        }
        best
    }

    /// Values as floating point, for threshold statistics.
    pub fn values_f64(&self) -> Vec<f64> {
        self.values.iter().map(|&v| f64::from(v)).collect()
    }
}

// ============================================================================
// Strategies
// ============================================================================

/// How node energies are produced and reduced into a [`NetworkResponse`].
pub trait ResponseStrategy {
    fn name(&self) -> &'static str;

    fn build(&self, pool: &StackPool, job: &StackJob<'_>) -> Result<NetworkResponse, ResponseError>;
}

/// Keep every node's energy trace in memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryResponse;

impl ResponseStrategy for InMemoryResponse {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    fn build(&self, pool: &StackPool, job: &StackJob<'_>) -> Result<NetworkResponse, ResponseError> {
        if job.node_count() == 0 {
            return Err(ResponseError::NoNodes);
        }
        let energies = pool.stack_all(job);
        info!(nodes = energies.len(), "Computing the cumulative network response from memory");
        NetworkResponse::from_energies(&energies)
    }
}

/// Spill node energies to instance-scoped scratch files to bound peak memory.
#[derive(Debug, Clone)]
pub struct ScratchResponse {
    pub root: PathBuf,
    pub instance: String,
}

/// Split `0..node_count` into at most `workers` contiguous batches; the last
/// batch takes the remainder.
pub fn node_batches(node_count: usize, workers: usize) -> Vec<Vec<usize>> {
    let workers = workers.clamp(1, node_count.max(1));
    let size = node_count / workers;
    (0..workers)
        .map(|w| {
            let start = w * size;
            let end = if w + 1 == workers { node_count } else { start + size };
            (start..end).collect::<Vec<usize>>()
        })
        .filter(|batch| !batch.is_empty())
        .collect()
}

impl ScratchResponse {
    fn reduce_batch(store: &ScratchStore, batch: &[usize], len: usize) -> Result<NetworkResponse, ResponseError> {
        let first = batch.first().copied().ok_or(ResponseError::NoNodes)?;
        let mut partial = NetworkResponse::new(len, first);
        for &node in batch {
            let energy = store.take(node)?;
            partial.fold(node, &energy)?;
        }
        Ok(partial)
    }

    fn run(&self, store: &ScratchStore, pool: &StackPool, job: &StackJob<'_>) -> Result<NetworkResponse, ResponseError> {
        info!(nodes = job.node_count(), dir = %store.dir().display(), "Computing energy stacks to scratch");
        let written = pool.submit(job.node_count(), |node| store.write(node, &job.stack(node)));
        for (_, result) in written {
            result?;
        }

        let batches = node_batches(job.node_count(), pool.workers());
        info!(batches = batches.len(), "Reading scratch files and computing network response");
        let len = job.trace_len();
        let partials = pool.submit(batches.len(), |b| Self::reduce_batch(store, &batches[b], len));

        let mut response: Option<NetworkResponse> = None;
        for (_, partial) in partials {
            let partial = partial?;
            match response.as_mut() {
                Some(total) => total.merge(&partial)?,
                None => response = Some(partial),
            }
        }
        response.ok_or(ResponseError::NoNodes)
    }
}

impl ResponseStrategy for ScratchResponse {
    fn name(&self) -> &'static str {
        "scratch"
    }

    fn build(&self, pool: &StackPool, job: &StackJob<'_>) -> Result<NetworkResponse, ResponseError> {
        if job.node_count() == 0 {
            return Err(ResponseError::NoNodes);
        }
        let store = ScratchStore::create(&self.root, &self.instance)?;
        let result = self.run(&store, pool, job);
        if let Err(e) = store.finish() {
            warn!(error = %e, "Failed to clean up scratch directory");
        }
        result
    }
}

/// Pick the strategy for the memory-conservation flag.
pub fn strategy_for(conserve_memory: bool, root: PathBuf, instance: String) -> Box<dyn ResponseStrategy> {
    if conserve_memory {
        Box::new(ScratchResponse { root, instance })
    } else {
        Box::new(InMemoryResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_takes_max_and_first_argmax() {
        let energies = vec![
            NodeEnergy { node: 0, energy: vec![1, 5, 3, 0] },
            NodeEnergy { node: 1, energy: vec![2, 5, 1, 0] },
            NodeEnergy { node: 2, energy: vec![2, 4, 9, 0] },
        ];
        let r = NetworkResponse::from_energies(&energies).unwrap();
        assert_eq!(r.values, vec![2, 5, 9, 0]);
        assert_eq!(r.peak_nodes, vec![1, 0, 2, 0]);
    }

    #[test]
    fn test_fold_rejects_length_mismatch() {
        let mut r = NetworkResponse::new(3, 0);
        assert!(matches!(r.fold(1, &[1, 2]), Err(ResponseError::LengthMismatch { .. })));
    }

    #[test]
    fn test_merge_prefers_earlier_on_ties() {
        let mut a = NetworkResponse { values: vec![4, 1], peak_nodes: vec![0, 1] };
        let b = NetworkResponse { values: vec![4, 7], peak_nodes: vec![5, 6] };
        a.merge(&b).unwrap();
        assert_eq!(a.values, vec![4, 7]);
        assert_eq!(a.peak_nodes, vec![0, 6]);
    }

    #[test]
    fn test_node_batches_cover_all_nodes() {
        let batches = node_batches(10, 3);
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 8, 9]]);
        assert_eq!(node_batches(2, 8), vec![vec![0], vec![1]]);
        assert!(node_batches(0, 4).is_empty());
    }

    #[test]
    fn test_peak() {
        let r = NetworkResponse { values: vec![1, 9, 9, 2], peak_nodes: vec![0, 3, 4, 0] };
        assert_eq!(r.peak(), Some((1, 9, 3)));
        assert_eq!(NetworkResponse::new(0, 0).peak(), None);
    }
}
