//! Brightness Scan Pipeline
//!
//! ```text
//! STAGE 1: Waveform checks (rates, lengths, stations present)
//! STAGE 2: Channel-count guard
//! STAGE 3: 16-bit template copy
//! STAGE 4: Node energy stacks -> cumulative network response
//! STAGE 5: Peak detection
//! STAGE 6: Templates + coherence filter
//! ```
//!
//! Every fatal condition is checked in stages 1-2, before any output is
//! produced. Later stages only degrade (zero-energy nodes, rejected
//! templates) and log.

pub mod report;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ScanConfig;
use crate::detection::{find_detections, DetectionError, PeakSettings};
use crate::energy::{EnergyError, StackJob, StackPool, MAX_STACK_CHANNELS};
use crate::grid::{GridError, LagTable, TravelTimeGrid};
use crate::response::{strategy_for, NetworkResponse, ResponseError};
use crate::template::{
    CoherenceRule, CoherenceWindow, CutWindow, DetectionRecord, Template, TemplateBuilder, TemplateError,
    TemplateStore,
};
use crate::types::Node;
use crate::waveform::{WaveformError, WaveformSet};

#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Grid(#[from] GridError),

    #[error(transparent)]
    Waveform(#[from] WaveformError),

    #[error(transparent)]
    Energy(#[from] EnergyError),

    #[error(transparent)]
    Response(#[from] ResponseError),

    #[error(transparent)]
    Detection(#[from] DetectionError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("None of the {0} grid stations have waveform data")]
    NoMatchingStations(usize),

    #[error(
        "Too many channels: {channels} traces, stacking supports at most {limit}. \
         Split the network into subsets or drop channels before scanning"
    )]
    TooManyChannels { channels: usize, limit: usize },
}

/// Everything a scan produces.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    /// One record per detection, in time order
    pub records: Vec<DetectionRecord>,
    /// Accepted templates, in detection order
    pub templates: Vec<Template>,
    /// Nodes with at least one accepted template, first occurrence order
    pub nodes_out: Vec<Node>,
    pub response: NetworkResponse,
    pub sampling_rate: f64,
    pub start_time: DateTime<Utc>,
    /// Stations that contributed to the response
    pub stations: Vec<String>,
}

/// A configured scan over one travel-time grid.
#[derive(Debug)]
pub struct BrightnessScan<'a> {
    grid: &'a TravelTimeGrid,
    config: &'a ScanConfig,
}

impl<'a> BrightnessScan<'a> {
    pub fn new(grid: &'a TravelTimeGrid, config: &'a ScanConfig) -> Self {
        Self { grid, config }
    }

    /// The grid restricted to stations that have data, in grid order.
    fn present_grid(&self, waveforms: &WaveformSet) -> Result<TravelTimeGrid, ScanError> {
        let present = waveforms.stations_present(&self.grid.stations);
        if present.is_empty() {
            return Err(ScanError::NoMatchingStations(self.grid.stations.len()));
        }
        for missing in self.grid.stations.iter().filter(|s| !present.contains(s)) {
            warn!(station = %missing, "Grid station has no waveform data, excluded");
        }

        let rows = self
            .grid
            .stations
            .iter()
            .enumerate()
            .filter(|(_, s)| present.contains(s))
            .map(|(i, _)| self.grid.lags.station_row(i).to_vec())
            .collect();
        Ok(TravelTimeGrid::new(present, self.grid.nodes.clone(), LagTable::from_rows(rows)?)?)
    }

    fn template_builder(&self) -> TemplateBuilder {
        let t = &self.config.template;
        TemplateBuilder {
            window: CutWindow {
                length: t.length_s,
                pre_pick: t.pre_pick_s,
            },
            rule: CoherenceRule {
                a: t.coherence_a,
                b: t.coherence_b,
            },
            coherence_window: CoherenceWindow {
                stations: t.coherence_stations.clone(),
                clip: t.coherence_clip.map(|[start, end]| (start, end)),
            },
        }
    }

    /// Run the whole scan over `waveforms`, persisting accepted templates to `store`.
    pub fn run(&self, waveforms: &WaveformSet, store: &mut dyn TemplateStore) -> Result<ScanOutcome, ScanError> {
        // Stage 1
        let mut waveforms = waveforms.clone();
        let sampling_rate = waveforms.validate()?;
        waveforms.align();
        let grid = self.present_grid(&waveforms)?;
        let start_time = waveforms
            .traces
            .iter()
            .map(|t| t.start_time)
            .min()
            .ok_or(WaveformError::Empty)?;

        // Stage 2
        if waveforms.len() > MAX_STACK_CHANNELS {
            return Err(ScanError::TooManyChannels {
                channels: waveforms.len(),
                limit: MAX_STACK_CHANNELS,
            });
        }

        info!(
            stations = grid.stations.len(),
            nodes = grid.nodes.len(),
            traces = waveforms.len(),
            samples = waveforms.max_len(),
            sampling_rate,
            "Starting brightness scan"
        );

        // Stage 3
        let template_source = waveforms.quantized();

        // Stage 4
        let pool = StackPool::new(self.config.stack.cores, grid.nodes.len())?;
        let job = StackJob {
            stations: &grid.stations,
            lags: &grid.lags,
            waveforms: &waveforms,
            clip_level: self.config.stack.clip_level,
        };
        let memory = &self.config.memory;
        let strategy = strategy_for(memory.conserve, memory.scratch_dir.clone(), memory.instance_id());
        info!(strategy = strategy.name(), "Building cumulative network response");
        let response = strategy.build(&pool, &job)?;

        // Stage 5
        let settings = PeakSettings {
            threshold: self.config.detection.threshold,
            kind: self.config.detection.threshold_kind,
            sampling_rate,
            min_separation: self.config.detection.min_separation_s,
        };
        let detections = find_detections(
            &response.values_f64(),
            &response.peak_nodes,
            &grid.nodes,
            &settings,
            &grid.stations,
        )?;

        // Stage 6
        let (records, templates) = self
            .template_builder()
            .process(detections, &grid, &template_source, store)?;

        let mut nodes_out: Vec<Node> = Vec::new();
        for t in &templates {
            if !nodes_out.contains(&t.node) {
                nodes_out.push(t.node);
            }
        }

        Ok(ScanOutcome {
            records,
            templates,
            nodes_out,
            response,
            sampling_rate,
            start_time,
            stations: grid.stations,
        })
    }
}
