//! Travel-time grid: station list, node list and the lag table tying them
//!
//! ## Layout
//!
//! - `loader`: reads per-station, per-phase grid files into a [`TravelTimeGrid`]
//! - `reducer`: optional volume cut and moveout de-duplication
//!
//! The lag table is stations × nodes. Column `j` is node `j`'s moveout: the
//! delay, in seconds, that aligns each station's waveform with a source at
//! that node.

mod loader;
mod reducer;

pub use loader::{convert_phase, grid_file_name, read_travel_times, GridRequest};
pub use reducer::{cut_volume, moveout_difference, remove_similar_lags, Polygon};

use std::path::PathBuf;
use thiserror::Error;

use crate::types::{Node, Phase};

/// Errors while loading or reshaping a travel-time grid.
#[derive(Error, Debug)]
pub enum GridError {
    #[error("No {phase} or {other} travel-time grid files found in {dir} for any requested station")]
    NoGridFiles {
        dir: PathBuf,
        phase: Phase,
        other: Phase,
    },

    #[error("Grid I/O error ({0}): {1}")]
    Io(PathBuf, std::io::Error),

    #[error("Malformed grid row in {path} line {line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Grid for station {station} does not match the node list of station {reference}: {detail}")]
    NodeMismatch {
        station: String,
        reference: String,
        detail: String,
    },

    #[error("Lag table shape mismatch: {stations} stations x {nodes} nodes needs {expected} values, got {actual}")]
    Shape {
        stations: usize,
        nodes: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid P/S ratio: {0} (must be finite and > 0)")]
    InvalidRatio(f64),

    #[error("Polygon needs at least 3 vertices, got {0}")]
    DegeneratePolygon(usize),
}

// ============================================================================
// Lag Table
// ============================================================================

/// Stations × nodes table of lag times in seconds, stored row-major by station.
#[derive(Debug, Clone, PartialEq)]
pub struct LagTable {
    stations: usize,
    nodes: usize,
    values: Vec<f64>,
}

impl LagTable {
    /// Build a table from per-station rows. Every row must have one value per node.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, GridError> {
        let stations = rows.len();
        let nodes = rows.first().map_or(0, Vec::len);
        let expected = stations * nodes;
        let values: Vec<f64> = rows.into_iter().flatten().collect();
        if values.len() != expected {
            return Err(GridError::Shape {
                stations,
                nodes,
                expected,
                actual: values.len(),
            });
        }
        Ok(Self {
            stations,
            nodes,
            values,
        })
    }

    pub fn station_count(&self) -> usize {
        self.stations
    }

    pub fn node_count(&self) -> usize {
        self.nodes
    }

    /// Lag of `station` for a source at `node`.
    pub fn get(&self, station: usize, node: usize) -> f64 {
        self.values[station * self.nodes + node]
    }

    /// One station's lags across all nodes.
    pub fn station_row(&self, station: usize) -> &[f64] {
        let start = station * self.nodes;
        &self.values[start..start + self.nodes]
    }

    /// One node's moveout: its lag at every station, in station order.
    pub fn node_lags(&self, node: usize) -> Vec<f64> {
        (0..self.stations).map(|s| self.get(s, node)).collect()
    }

    /// New table holding only the given node columns, in the given order.
    pub fn select_nodes(&self, keep: &[usize]) -> Self {
        let mut values = Vec::with_capacity(self.stations * keep.len());
        for s in 0..self.stations {
            let row = self.station_row(s);
            values.extend(keep.iter().map(|&n| row[n]));
        }
        Self {
            stations: self.stations,
            nodes: keep.len(),
            values,
        }
    }
}

// ============================================================================
// Travel-Time Grid
// ============================================================================

/// Stations actually found, the shared node list and their lag table.
#[derive(Debug, Clone, PartialEq)]
pub struct TravelTimeGrid {
    pub stations: Vec<String>,
    pub nodes: Vec<Node>,
    pub lags: LagTable,
}

impl TravelTimeGrid {
    /// Assemble a grid, checking that the lag table matches both lists.
    pub fn new(stations: Vec<String>, nodes: Vec<Node>, lags: LagTable) -> Result<Self, GridError> {
        if lags.station_count() != stations.len() || lags.node_count() != nodes.len() {
            return Err(GridError::Shape {
                stations: stations.len(),
                nodes: nodes.len(),
                expected: stations.len() * nodes.len(),
                actual: lags.station_count() * lags.node_count(),
            });
        }
        Ok(Self {
            stations,
            nodes,
            lags,
        })
    }

    /// Keep only the given node indices (order preserved as given).
    pub fn retain_nodes(&self, keep: &[usize]) -> Self {
        Self {
            stations: self.stations.clone(),
            nodes: keep.iter().map(|&i| self.nodes[i]).collect(),
            lags: self.lags.select_nodes(keep),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> LagTable {
        LagTable::from_rows(vec![vec![0.0, 1.0, 2.0], vec![2.0, 1.0, 0.0]]).unwrap()
    }

    #[test]
    fn test_lag_table_access() {
        let t = table();
        assert_eq!(t.station_count(), 2);
        assert_eq!(t.node_count(), 3);
        assert_eq!(t.get(1, 0), 2.0);
        assert_eq!(t.node_lags(2), vec![2.0, 0.0]);
        assert_eq!(t.station_row(0), &[0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let err = LagTable::from_rows(vec![vec![0.0, 1.0], vec![2.0]]).unwrap_err();
        assert!(matches!(err, GridError::Shape { .. }));
    }

    #[test]
    fn test_select_nodes() {
        let t = table().select_nodes(&[2, 0]);
        assert_eq!(t.node_count(), 2);
        assert_eq!(t.station_row(0), &[2.0, 0.0]);
        assert_eq!(t.station_row(1), &[0.0, 2.0]);
    }

    #[test]
    fn test_grid_shape_checked() {
        let nodes = vec![Node::new(0.0, 0.0, 1.0); 2];
        let err = TravelTimeGrid::new(vec!["A".into(), "B".into()], nodes, table()).unwrap_err();
        assert!(matches!(err, GridError::Shape { .. }));
    }
}
