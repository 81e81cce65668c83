//! Synthetic Network Generator
//!
//! Writes a travel-time grid directory and a waveform JSON document for a
//! small synthetic network, with Gaussian noise on every station and one
//! event injected at a chosen grid node. The output feeds straight into
//! `brightness-scan`.
//!
//! # Usage
//! ```bash
//! ./synthetic --out-dir demo --stations 5 --event-node 17 --seed 42
//! ```

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::Parser;
use rand::prelude::*;
use rand_distr::{Distribution, Normal, Uniform};
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

use brightness_scan::grid::grid_file_name;
use brightness_scan::types::{Node, Phase};
use brightness_scan::waveform::{Trace, WaveformSet};

// ============================================================================
// Model Constants
// ============================================================================

/// Shear-wave velocity of the half-space (km/s)
const VS_KM_S: f64 = 3.5;
/// Kilometres per degree of latitude
const KM_PER_DEGREE: f64 = 111.19;
/// Reference latitude of the synthetic network (degrees)
const BASE_LAT: f64 = -43.0;
/// Reference longitude of the synthetic network (degrees)
const BASE_LON: f64 = 170.0;
/// Horizontal node spacing (degrees)
const NODE_SPACING_DEG: f64 = 0.05;
/// Depths at which grid nodes are placed (km)
const NODE_DEPTHS_KM: [f64; 3] = [2.0, 6.0, 10.0];
/// Dominant frequency of the injected wavelet (Hz)
const WAVELET_HZ: f64 = 4.0;
/// Decay time of the injected wavelet (s)
const WAVELET_DECAY_S: f64 = 0.4;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "synthetic")]
#[command(about = "Synthetic grid and waveforms for brightness-scan testing")]
#[command(version)]
struct Args {
    /// Output directory (grid/ and waveforms.json are written inside)
    #[arg(long, default_value = "synthetic")]
    out_dir: std::path::PathBuf,

    /// Number of stations
    #[arg(long, default_value = "4", value_parser = clap::value_parser!(u32).range(2..=64))]
    stations: u32,

    /// Grid nodes along each horizontal axis
    #[arg(long, default_value = "6", value_parser = clap::value_parser!(u32).range(1..=50))]
    nodes_per_axis: u32,

    /// Record length (s)
    #[arg(long, default_value = "120")]
    duration: f64,

    /// Samples per second
    #[arg(long, default_value = "50")]
    sample_rate: f64,

    /// Noise standard deviation (counts)
    #[arg(long, default_value = "20")]
    noise: f64,

    /// Peak amplitude of the injected event (counts)
    #[arg(long, default_value = "2000")]
    amplitude: f64,

    /// Grid node the event originates at
    #[arg(long, default_value = "0")]
    event_node: usize,

    /// Origin time of the event (s after the record start)
    #[arg(long, default_value = "40")]
    origin: f64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,
}

struct Station {
    name: String,
    longitude: f64,
    latitude: f64,
}

fn distance_km(node: &Node, station: &Station) -> f64 {
    let dlat = (node.latitude - station.latitude) * KM_PER_DEGREE;
    let dlon = (node.longitude - station.longitude) * KM_PER_DEGREE * BASE_LAT.to_radians().cos();
    (dlat * dlat + dlon * dlon + node.depth * node.depth).sqrt()
}

fn build_nodes(per_axis: u32) -> Vec<Node> {
    let mut nodes = Vec::new();
    for &depth in &NODE_DEPTHS_KM {
        for i in 0..per_axis {
            for j in 0..per_axis {
                let lon = BASE_LON + f64::from(i) * NODE_SPACING_DEG;
                let lat = BASE_LAT + f64::from(j) * NODE_SPACING_DEG;
                // Round so every grid file carries identical coordinates
                nodes.push(Node::new((lon * 1e4).round() / 1e4, (lat * 1e4).round() / 1e4, depth));
            }
        }
    }
    nodes
}

fn write_grid(dir: &Path, stations: &[Station], nodes: &[Node]) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("Cannot create {}", dir.display()))?;
    for station in stations {
        let mut contents = String::new();
        for node in nodes {
            let tt = distance_km(node, station) / VS_KM_S;
            writeln!(contents, "{} {} {} {tt:.4}", node.longitude, node.latitude, node.depth)?;
        }
        let path = dir.join(grid_file_name("synthetic", Phase::S, &station.name));
        std::fs::write(&path, contents).with_context(|| format!("Cannot write {}", path.display()))?;
    }
    info!(stations = stations.len(), nodes = nodes.len(), dir = %dir.display(), "Grid written");
    Ok(())
}

fn wavelet(t: f64) -> f64 {
    if t < 0.0 {
        return 0.0;
    }
    (2.0 * std::f64::consts::PI * WAVELET_HZ * t).sin() * (-t / WAVELET_DECAY_S).exp()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let nodes = build_nodes(args.nodes_per_axis);
    let event = *nodes
        .get(args.event_node)
        .with_context(|| format!("Event node {} outside the {}-node grid", args.event_node, nodes.len()))?;

    // Stations scattered over the grid footprint
    let extent = f64::from(args.nodes_per_axis) * NODE_SPACING_DEG;
    let spread = Uniform::new(-0.2 * extent, 1.2 * extent);
    let stations: Vec<Station> = (0..args.stations)
        .map(|i| Station {
            name: format!("STA{i}"),
            longitude: BASE_LON + spread.sample(&mut rng),
            latitude: BASE_LAT + spread.sample(&mut rng),
        })
        .collect();

    write_grid(&args.out_dir.join("grid"), &stations, &nodes)?;

    let noise = Normal::new(0.0, args.noise).context("Invalid noise level")?;
    let start_time = Utc
        .with_ymd_and_hms(2015, 3, 1, 0, 0, 0)
        .single()
        .context("Invalid start time")?;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let samples = (args.duration * args.sample_rate).round() as usize;

    let traces = stations
        .iter()
        .map(|station| {
            let arrival = args.origin + distance_km(&event, station) / VS_KM_S;
            let data = (0..samples)
                .map(|i| {
                    let t = i as f64 / args.sample_rate;
                    noise.sample(&mut rng) + args.amplitude * wavelet(t - arrival)
                })
                .collect();
            Trace {
                station: station.name.clone(),
                channel: "HHZ".to_string(),
                sampling_rate: args.sample_rate,
                start_time,
                data,
            }
        })
        .collect();

    let path = args.out_dir.join("waveforms.json");
    WaveformSet::new(traces)
        .save_json(&path)
        .with_context(|| format!("Cannot write {}", path.display()))?;

    let names: Vec<&str> = stations.iter().map(|s| s.name.as_str()).collect();
    info!(
        path = %path.display(),
        stations = %names.join(","),
        node = %event.label(),
        origin = args.origin,
        "Waveforms written"
    );
    Ok(())
}
