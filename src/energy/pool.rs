//! Bounded worker pool for per-node stacking
//!
//! Jobs are submitted one per node and each result comes back tagged with the
//! node index it belongs to. Completion order is not deterministic, so
//! [`StackPool::submit`] re-sorts by index before returning.

use rayon::prelude::*;
use std::thread;
use tracing::{debug, info, warn};

use super::{stack_node, EnergyError};
use crate::grid::LagTable;
use crate::waveform::WaveformSet;

/// Read-only inputs shared by every stacking job.
#[derive(Debug, Clone, Copy)]
pub struct StackJob<'a> {
    pub stations: &'a [String],
    pub lags: &'a LagTable,
    pub waveforms: &'a WaveformSet,
    pub clip_level: f64,
}

impl StackJob<'_> {
    pub fn node_count(&self) -> usize {
        self.lags.node_count()
    }

    /// Samples in every node's energy trace.
    pub fn trace_len(&self) -> usize {
        self.waveforms.max_len()
    }

    /// Energy stack for one node.
    ///
    /// A failure here never aborts the batch: it is logged and the node
    /// contributes an all-zero trace.
    pub fn stack(&self, node: usize) -> Vec<u16> {
        let node_lags = self.lags.node_lags(node);
        match stack_node(self.stations, &node_lags, self.waveforms, self.clip_level) {
            Ok(energy) => energy,
            Err(e) => {
                warn!(node, error = %e, "Node stack failed, using zero energy");
                vec![0; self.trace_len()]
            }
        }
    }
}

/// One node's energy held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEnergy {
    pub node: usize,
    pub energy: Vec<u16>,
}

/// Thread pool sized to `min(requested, node count, available cores)`.
pub struct StackPool {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl std::fmt::Debug for StackPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackPool").field("workers", &self.workers).finish()
    }
}

impl StackPool {
    pub fn new(requested: usize, node_count: usize) -> Result<Self, EnergyError> {
        let available = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        let workers = requested.min(node_count).min(available).max(1);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("stack-{i}"))
            .build()
            .map_err(|e| EnergyError::Pool(e.to_string()))?;

        info!(workers, requested, available, nodes = node_count, "Stacking pool ready");
        Ok(Self { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `task(i)` for every `i` in `0..count` and collect `(i, result)`
    /// pairs sorted by `i`. Blocks until every task has finished.
    pub fn submit<T, F>(&self, count: usize, task: F) -> Vec<(usize, T)>
    where
        T: Send,
        F: Fn(usize) -> T + Sync,
    {
        let mut results: Vec<(usize, T)> = self
            .pool
            .install(|| (0..count).into_par_iter().map(|index| (index, task(index))).collect());
        results.sort_by_key(|(index, _)| *index);
        debug!(tasks = results.len(), "Pool batch complete");
        results
    }

    /// Stack every node in memory, ordered by node index.
    pub fn stack_all(&self, job: &StackJob<'_>) -> Vec<NodeEnergy> {
        info!(nodes = job.node_count(), "Computing energy stacks");
        self.submit(job.node_count(), |node| job.stack(node))
            .into_iter()
            .map(|(node, energy)| NodeEnergy { node, energy })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_size_bounded_by_nodes() {
        let pool = StackPool::new(64, 2).unwrap();
        assert!(pool.workers() <= 2);
        assert!(pool.workers() >= 1);
    }

    #[test]
    fn test_pool_size_at_least_one() {
        let pool = StackPool::new(0, 0).unwrap();
        assert_eq!(pool.workers(), 1);
    }

    #[test]
    fn test_failed_node_degrades_to_zero_trace() {
        use crate::energy::MAX_STACK_CHANNELS;
        use crate::waveform::Trace;

        let stations: Vec<String> = (0..=MAX_STACK_CHANNELS).map(|i| format!("S{i}")).collect();
        let lags = LagTable::from_rows(vec![vec![0.0; 3]; stations.len()]).unwrap();
        let mut data = vec![0.0; 40];
        data[10] = 100.0;
        let waveforms = WaveformSet::new(vec![Trace {
            station: "S0".to_string(),
            channel: "HHZ".to_string(),
            sampling_rate: 10.0,
            start_time: chrono::Utc::now(),
            data,
        }]);
        let job = StackJob {
            stations: &stations,
            lags: &lags,
            waveforms: &waveforms,
            clip_level: 100.0,
        };
        assert!(stack_node(&stations, &lags.node_lags(0), &waveforms, 100.0).is_err());

        let pool = StackPool::new(2, 3).unwrap();
        let energies = pool.stack_all(&job);
        assert_eq!(energies.iter().map(|e| e.node).collect::<Vec<_>>(), vec![0, 1, 2]);
        for e in &energies {
            assert_eq!(e.energy, vec![0; 40]);
        }
    }

    #[test]
    fn test_submit_returns_sorted_by_index() {
        let pool = StackPool::new(4, 50).unwrap();
        let results = pool.submit(50, |i| {
            // Later indices finish first
            thread::sleep(std::time::Duration::from_micros((50 - i as u64) * 20));
            i * 2
        });
        let indices: Vec<usize> = results.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, (0..50).collect::<Vec<_>>());
        assert!(results.iter().all(|(i, v)| *v == i * 2));
    }
}
