//! brightness-scan: network brightness earthquake detector
//!
//! Scans a day of continuous waveforms against a travel-time grid and writes
//! coherent detections out as waveform templates.
//!
//! # Usage
//!
//! ```bash
//! # Generate a synthetic network and scan it
//! synthetic --out-dir demo
//! brightness-scan --grid-dir demo/grid --stations STA0,STA1,STA2,STA3 \
//!     --waveforms demo/waveforms.json --templates-dir demo/templates \
//!     --response-csv demo/response.csv
//! ```
//!
//! # Environment Variables
//!
//! - `BRIGHTNESS_CONFIG`: path to a scan config TOML (default: `./scan_config.toml`)
//! - `RUST_LOG`: logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use brightness_scan::config::ScanConfig;
use brightness_scan::grid::{cut_volume, read_travel_times, remove_similar_lags, GridRequest};
use brightness_scan::pipeline::report::{write_detections_json, write_response_csv};
use brightness_scan::pipeline::BrightnessScan;
use brightness_scan::template::DirTemplateStore;
use brightness_scan::waveform::WaveformSet;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "brightness-scan")]
#[command(about = "Grid-search brightness earthquake detector")]
#[command(version)]
struct CliArgs {
    /// Scan config TOML; overrides BRIGHTNESS_CONFIG and ./scan_config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of `<prefix>.<PHASE>.<STATION>.time.csv` grid files
    #[arg(long)]
    grid_dir: PathBuf,

    /// Stations to scan, comma separated
    #[arg(long, value_delimiter = ',', required = true)]
    stations: Vec<String>,

    /// Waveform JSON document
    #[arg(long)]
    waveforms: PathBuf,

    /// Directory accepted templates are written to
    #[arg(long, default_value = "templates")]
    templates_dir: PathBuf,

    /// Where to write the detection log
    #[arg(long, default_value = "detections.json")]
    detections_out: PathBuf,

    /// Also write the network response as CSV for plotting
    #[arg(long)]
    response_csv: Option<PathBuf>,

    /// Override stack.cores
    #[arg(long)]
    cores: Option<usize>,

    /// Override memory.conserve
    #[arg(long)]
    conserve_memory: bool,

    /// Log as JSON lines
    #[arg(long, env = "BRIGHTNESS_LOG_JSON")]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).with_target(false).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }
}

fn load_config(args: &CliArgs) -> Result<ScanConfig> {
    let mut config = match &args.config {
        Some(path) => ScanConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ScanConfig::load(),
    };
    if let Some(cores) = args.cores {
        config.stack.cores = cores;
    }
    if args.conserve_memory {
        config.memory.conserve = true;
    }
    config.validate().context("Invalid configuration after CLI overrides")?;
    Ok(config)
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_json);

    let config = load_config(&args)?;

    let request = GridRequest {
        stations: args.stations.clone(),
        phase: config.grid.phase,
        output_phase: config.grid.output_phase,
        ps_ratio: config.grid.ps_ratio,
        lag_mode: config.grid.lag_mode,
    };
    let mut grid = read_travel_times(&args.grid_dir, &request)
        .with_context(|| format!("Failed to read grid from {}", args.grid_dir.display()))?;

    if let Some(volume) = &config.grid.volume {
        grid = cut_volume(&grid, volume.min_depth_km, volume.max_depth_km, &volume.polygon);
    }
    if let Some(threshold) = config.grid.dedup_threshold_s {
        grid = remove_similar_lags(&grid, threshold);
    }

    let waveforms = WaveformSet::load_json(&args.waveforms)
        .with_context(|| format!("Failed to read waveforms from {}", args.waveforms.display()))?;

    let mut store = DirTemplateStore::create(&args.templates_dir)?;
    let outcome = BrightnessScan::new(&grid, &config)
        .run(&waveforms, &mut store)
        .context("Brightness scan failed")?;

    write_detections_json(&args.detections_out, &outcome)?;
    if let Some(path) = &args.response_csv {
        write_response_csv(path, &outcome)?;
    }

    info!(
        detections = outcome.records.len(),
        templates = outcome.templates.len(),
        nodes = outcome.nodes_out.len(),
        dir = %store.dir().display(),
        "Scan complete"
    );
    Ok(())
}
