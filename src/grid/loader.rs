//! Grid file loading
//!
//! Reads whitespace-delimited `lon lat depth travel_time` grid files, one per
//! station and phase, named `<prefix>.<PHASE>.<STATION>.time.csv` (the layout
//! Grid2Time writes). Travel times can be converted between P and S with a
//! velocity ratio, and turned into relative lags per node.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{GridError, LagTable, TravelTimeGrid};
use crate::types::{LagMode, Node, Phase};

/// What to read from a grid directory.
#[derive(Debug, Clone)]
pub struct GridRequest {
    /// Stations to look for, in the order the lag table should use
    pub stations: Vec<String>,
    /// Phase whose grid files are tried first
    pub phase: Phase,
    /// Phase the lag table should describe
    pub output_phase: Phase,
    /// Vp/Vs ratio used for P <-> S conversion
    pub ps_ratio: f64,
    pub lag_mode: LagMode,
}

/// Suffix identifying a station's grid file for one phase.
pub fn grid_file_name(prefix: &str, phase: Phase, station: &str) -> String {
    format!("{prefix}.{phase}.{station}.time.csv")
}

/// Convert travel times computed for `from` into travel times for `to`.
///
/// S waves are slower by the ratio, so S→P divides and P→S multiplies.
pub fn convert_phase(times: &[f64], from: Phase, to: Phase, ps_ratio: f64) -> Vec<f64> {
    match (from, to) {
        (Phase::S, Phase::P) => times.iter().map(|t| t / ps_ratio).collect(),
        (Phase::P, Phase::S) => times.iter().map(|t| t * ps_ratio).collect(),
        _ => times.to_vec(),
    }
}

/// Load the grid for every requested station that has a grid file.
///
/// Stations without any file are dropped from the output station list. If no
/// station has a file the run cannot detect anything and this is fatal.
pub fn read_travel_times(dir: &Path, request: &GridRequest) -> Result<TravelTimeGrid, GridError> {
    if !request.ps_ratio.is_finite() || request.ps_ratio <= 0.0 {
        return Err(GridError::InvalidRatio(request.ps_ratio));
    }

    let listing = list_grid_files(dir)?;

    let mut stations_out: Vec<String> = Vec::new();
    let mut nodes_out: Vec<Node> = Vec::new();
    let mut rows: Vec<Vec<f64>> = Vec::new();

    for station in &request.stations {
        let found = [request.phase, request.phase.other()]
            .into_iter()
            .find_map(|phase| find_station_file(&listing, phase, station).map(|p| (phase, p)));

        let Some((file_phase, path)) = found else {
            warn!(station = %station, dir = %dir.display(), "No travel-time grid for station, dropping it");
            continue;
        };

        info!(station = %station, path = %path.display(), phase = %file_phase, "Reading travel times");
        let (nodes, times) = read_grid_file(&path)?;
        let times = if file_phase == request.output_phase {
            times
        } else {
            debug!(station = %station, from = %file_phase, to = %request.output_phase, "Converting travel-time phase");
            convert_phase(&times, file_phase, request.output_phase, request.ps_ratio)
        };

        if let Some(reference) = stations_out.first() {
            check_same_nodes(&nodes_out, &nodes, station, reference)?;
        } else {
            nodes_out = nodes;
        }
        stations_out.push(station.clone());
        rows.push(times);
    }

    if stations_out.is_empty() {
        return Err(GridError::NoGridFiles {
            dir: dir.to_path_buf(),
            phase: request.phase,
            other: request.phase.other(),
        });
    }

    if request.lag_mode == LagMode::Relative {
        to_relative_lags(&mut rows);
    }

    info!(
        stations = stations_out.len(),
        nodes = nodes_out.len(),
        "Travel-time grid loaded"
    );

    let lags = LagTable::from_rows(rows)?;
    TravelTimeGrid::new(stations_out, nodes_out, lags)
}

/// Subtract, per node column, the minimum travel time across stations.
fn to_relative_lags(rows: &mut [Vec<f64>]) {
    let node_count = rows.first().map_or(0, Vec::len);
    for node in 0..node_count {
        let fastest = rows
            .iter()
            .map(|row| row[node])
            .fold(f64::INFINITY, f64::min);
        for row in rows.iter_mut() {
            row[node] -= fastest;
        }
    }
}

fn list_grid_files(dir: &Path) -> Result<Vec<PathBuf>, GridError> {
    let entries = fs::read_dir(dir).map_err(|e| GridError::Io(dir.to_path_buf(), e))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| GridError::Io(dir.to_path_buf(), e))?;
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn find_station_file(listing: &[PathBuf], phase: Phase, station: &str) -> Option<PathBuf> {
    let suffix = format!(".{phase}.{station}.time.csv");
    let mut matches = listing.iter().filter(|p| {
        p.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(&suffix))
    });
    let first = matches.next()?.clone();
    if matches.next().is_some() {
        warn!(station = %station, phase = %phase, using = %first.display(), "Several grid files match, using the first");
    }
    Some(first)
}

/// Parse one grid file into its node list and travel times.
fn read_grid_file(path: &Path) -> Result<(Vec<Node>, Vec<f64>), GridError> {
    let contents = fs::read_to_string(path).map_err(|e| GridError::Io(path.to_path_buf(), e))?;

    let mut nodes = Vec::new();
    let mut times = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 4 {
            return Err(GridError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                message: format!("expected 4 columns, found {}", fields.len()),
            });
        }
        let mut values = [0.0_f64; 4];
        for (slot, field) in values.iter_mut().zip(&fields) {
            *slot = field.parse().map_err(|e| GridError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                message: format!("'{field}': {e}"),
            })?;
        }
        nodes.push(Node::new(values[0], values[1], values[2]));
        times.push(values[3]);
    }
    Ok((nodes, times))
}

fn check_same_nodes(
    reference_nodes: &[Node],
    nodes: &[Node],
    station: &str,
    reference: &str,
) -> Result<(), GridError> {
    if reference_nodes.len() != nodes.len() {
        return Err(GridError::NodeMismatch {
            station: station.to_string(),
            reference: reference.to_string(),
            detail: format!("{} nodes vs {}", nodes.len(), reference_nodes.len()),
        });
    }
    if let Some(i) = reference_nodes.iter().zip(nodes).position(|(a, b)| a != b) {
        return Err(GridError::NodeMismatch {
            station: station.to_string(),
            reference: reference.to_string(),
            detail: format!("node {i} differs"),
        });
    }
    Ok(())
}
