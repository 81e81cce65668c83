//! Grid reduction: volume cutting and moveout de-duplication
//!
//! Both steps trade spatial resolution for a smaller, faster scan. Neither
//! changes the station list.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{GridError, TravelTimeGrid};

/// Closed 2-D polygon in horizontal (longitude, latitude) coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<[f64; 2]>", into = "Vec<[f64; 2]>")]
pub struct Polygon {
    vertices: Vec<[f64; 2]>,
}

impl Polygon {
    pub fn new(vertices: Vec<[f64; 2]>) -> Result<Self, GridError> {
        if vertices.len() < 3 {
            return Err(GridError::DegeneratePolygon(vertices.len()));
        }
        Ok(Self { vertices })
    }

    pub fn vertices(&self) -> &[[f64; 2]] {
        &self.vertices
    }

    /// Even-odd ray-casting test. Points exactly on an edge may fall either way.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let mut inside = false;
        let n = self.vertices.len();
        let mut j = n - 1;
        for i in 0..n {
            let [xi, yi] = self.vertices[i];
            let [xj, yj] = self.vertices[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

impl TryFrom<Vec<[f64; 2]>> for Polygon {
    type Error = GridError;

    fn try_from(vertices: Vec<[f64; 2]>) -> Result<Self, Self::Error> {
        Self::new(vertices)
    }
}

impl From<Polygon> for Vec<[f64; 2]> {
    fn from(p: Polygon) -> Self {
        p.vertices
    }
}

/// Keep nodes with `min_depth <= depth < max_depth` that fall inside `corners`.
pub fn cut_volume(
    grid: &TravelTimeGrid,
    min_depth: f64,
    max_depth: f64,
    corners: &Polygon,
) -> TravelTimeGrid {
    let keep: Vec<usize> = grid
        .nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| {
            (min_depth..max_depth).contains(&n.depth) && corners.contains(n.longitude, n.latitude)
        })
        .map(|(i, _)| i)
        .collect();

    info!(
        before = grid.nodes.len(),
        after = keep.len(),
        "Grid cut to volume"
    );
    grid.retain_nodes(&keep)
}

/// Summed absolute lag difference across stations between two nodes.
pub fn moveout_difference(grid: &TravelTimeGrid, a: usize, b: usize) -> f64 {
    (0..grid.lags.station_count())
        .map(|s| (grid.lags.get(s, a) - grid.lags.get(s, b)).abs())
        .sum()
}

/// Drop nodes whose moveout is within `threshold` seconds of a node already kept.
///
/// Nodes are scanned in grid order and compared only against nodes retained
/// so far, so which nodes survive depends on that order. The first node is
/// always kept.
pub fn remove_similar_lags(grid: &TravelTimeGrid, threshold: f64) -> TravelTimeGrid {
    let mut retained: Vec<usize> = Vec::with_capacity(grid.nodes.len());
    for candidate in 0..grid.nodes.len() {
        let distinct = retained
            .iter()
            .all(|&kept| moveout_difference(grid, candidate, kept) > threshold);
        if distinct {
            retained.push(candidate);
        }
        if candidate % 1000 == 0 {
            debug!(scanned = candidate, retained = retained.len(), "Moveout de-duplication progress");
        }
    }

    info!(
        removed = grid.nodes.len() - retained.len(),
        remaining = retained.len(),
        "Removed duplicate-moveout nodes"
    );
    grid.retain_nodes(&retained)
}
