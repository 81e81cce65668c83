//! Core data types shared across the detection pipeline
//!
//! Grid nodes, seismic phases, detections and picks. Everything here is plain
//! data: the modules that produce and consume these types own the behaviour.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Grid Geometry
// ============================================================================

/// A single travel-time grid node.
///
/// The node's position in the grid's ordered node list is its identity for
/// the rest of the pipeline; the coordinates are carried for reporting and
/// for volume cutting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Longitude (degrees)
    pub longitude: f64,
    /// Latitude (degrees)
    pub latitude: f64,
    /// Depth (km)
    pub depth: f64,
}

impl Node {
    pub fn new(longitude: f64, latitude: f64, depth: f64) -> Self {
        Self {
            longitude,
            latitude,
            depth,
        }
    }

    /// Name used for detections originating at this node: `lon_lat_depth`.
    pub fn label(&self) -> String {
        format!("{}_{}_{}", self.longitude, self.latitude, self.depth)
    }
}

// ============================================================================
// Phases & Lag Mode
// ============================================================================

/// Seismic phase a travel-time grid describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    P,
    S,
}

impl Phase {
    /// The phase a grid of this phase can be converted to.
    pub fn other(self) -> Self {
        match self {
            Self::P => Self::S,
            Self::S => Self::P,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::P => "P",
            Self::S => "S",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "P" | "p" => Ok(Self::P),
            "S" | "s" => Ok(Self::S),
            other => Err(format!("unknown phase '{other}' (expected P or S)")),
        }
    }
}

/// Whether lag tables hold relative delays or raw travel times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LagMode {
    /// Per node, subtract the fastest station's travel time
    #[default]
    Relative,
    /// Raw travel times
    Absolute,
}

// ============================================================================
// Detections
// ============================================================================

/// How a detection was made. Only brightness scanning produces detections in
/// this crate, but the tag is written out so downstream catalogues can mix
/// sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Brightness,
}

/// A candidate event found in the cumulative network response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Label of the originating node (`lon_lat_depth`)
    pub template_name: String,
    /// Index of the originating node in the grid
    pub node_index: usize,
    /// Seconds from the start of the data
    pub detect_time: f64,
    /// Sample index of the peak in the network response
    pub sample: usize,
    /// Number of stations that contributed to the response
    pub channel_count: usize,
    /// Network response value at the peak
    pub peak_amplitude: f64,
    /// Threshold the peak exceeded
    pub threshold: f64,
    pub method: DetectionMethod,
    /// Stations that contributed to the response
    pub stations: Vec<String>,
}

/// A phase arrival reconstructed from a detection's node lags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pick {
    pub station: String,
    pub channel: String,
    pub time: DateTime<Utc>,
}
