//! Template Builder & Coherence Filter
//!
//! Every detection is turned into a multi-channel waveform template cut from
//! the 16-bit copy of the data around the arrival times implied by its node's
//! lags. Only templates that are coherent across the network survive; the
//! rest stay in the detection log without a template.
//!
//! Each detection walks a one-way state machine:
//!
//! ```text
//! Candidate ──► Templated ──► Accepted
//!                        └──► Rejected
//! ```

mod coherence;

pub use coherence::{coherence, normalized_xcorr, CoherenceRule, CoherenceWindow};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::grid::TravelTimeGrid;
use crate::types::{Detection, Node, Pick};
use crate::waveform::{offset_time, seconds_between, Trace, WaveformSet};

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Template I/O error ({0}): {1}")]
    Io(PathBuf, std::io::Error),

    #[error("Template serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Detection at sample {sample} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        sample: usize,
        from: DetectionState,
        to: DetectionState,
    },

    #[error("Detection references node {node} but the grid has {nodes} nodes")]
    UnknownNode { node: usize, nodes: usize },
}

// ============================================================================
// Detection State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionState {
    Candidate,
    Templated,
    Accepted,
    Rejected,
}

/// A detection together with how far it got through templating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub detection: Detection,
    state: DetectionState,
    /// Coherence of the template, once computed
    pub coherence: Option<f64>,
    /// Name of the persisted template, once accepted
    pub template_name: Option<String>,
}

impl DetectionRecord {
    pub fn new(detection: Detection) -> Self {
        Self {
            detection,
            state: DetectionState::Candidate,
            coherence: None,
            template_name: None,
        }
    }

    pub fn state(&self) -> DetectionState {
        self.state
    }

    fn transition(&mut self, to: DetectionState) -> Result<(), TemplateError> {
        let allowed = matches!(
            (self.state, to),
            (DetectionState::Candidate, DetectionState::Templated)
                | (DetectionState::Templated, DetectionState::Accepted | DetectionState::Rejected)
        );
        if !allowed {
            return Err(TemplateError::InvalidTransition {
                sample: self.detection.sample,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    pub fn mark_templated(&mut self) -> Result<(), TemplateError> {
        self.transition(DetectionState::Templated)
    }

    /// Record the coherence verdict.
    pub fn resolve(&mut self, accepted: bool, coherence: f64) -> Result<(), TemplateError> {
        let to = if accepted {
            DetectionState::Accepted
        } else {
            DetectionState::Rejected
        };
        self.transition(to)?;
        self.coherence = Some(coherence);
        Ok(())
    }
}

// ============================================================================
// Templates
// ============================================================================

/// One channel of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateChannel {
    pub station: String,
    pub channel: String,
    pub sampling_rate: f64,
    pub start_time: DateTime<Utc>,
    pub data: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    /// Start time of the earliest channel, filesystem-safe
    pub name: String,
    pub detection: Detection,
    pub node: Node,
    pub origin_time: DateTime<Utc>,
    pub picks: Vec<Pick>,
    pub channels: Vec<TemplateChannel>,
    pub coherence: f64,
    pub channel_count: usize,
}

/// Window cut around each pick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CutWindow {
    /// Template length (s)
    pub length: f64,
    /// Seconds before the pick the template starts
    pub pre_pick: f64,
}

/// Samples of `trace` from `start` spanning `length` seconds, clamped to the
/// trace. Returns the actual start time with the samples.
fn cut(trace: &Trace, start: DateTime<Utc>, length: f64) -> Option<(DateTime<Utc>, Vec<f64>)> {
    let rate = trace.sampling_rate;
    let offset = seconds_between(trace.start_time, start);
    #[allow(clippy::cast_possible_truncation)]
    let first = (offset * rate).round() as i64;
    #[allow(clippy::cast_possible_truncation)]
    let count = (length * rate).round() as i64;
    let len = i64::try_from(trace.data.len()).ok()?;

    let lo = first.clamp(0, len);
    let hi = (first + count).clamp(0, len);
    if hi <= lo {
        return None;
    }
    let (lo, hi) = (usize::try_from(lo).ok()?, usize::try_from(hi).ok()?);
    Some((trace.time_at(lo as f64 / rate), trace.data[lo..hi].to_vec()))
}

/// Template name from a start time, safe for use as a file stem.
pub fn template_name(start: DateTime<Utc>) -> String {
    start.format("%Y-%m-%dT%H-%M-%S%.6fZ").to_string()
}

/// Cut a template for `detection` from `waveforms` (normally the 16-bit copy).
///
/// The returned template has coherence 0 until [`TemplateBuilder`] scores it.
pub fn build_template(
    detection: &Detection,
    grid: &TravelTimeGrid,
    waveforms: &WaveformSet,
    window: CutWindow,
) -> Result<Template, TemplateError> {
    let node_count = grid.lags.node_count();
    let node = *grid
        .nodes
        .get(detection.node_index)
        .ok_or(TemplateError::UnknownNode {
            node: detection.node_index,
            nodes: node_count,
        })?;
    let data_start = waveforms
        .traces
        .first()
        .map_or_else(Utc::now, |t| t.start_time);
    let origin_lag = if grid.lags.station_count() > 0 {
        grid.lags.get(0, detection.node_index)
    } else {
        0.0
    };
    let origin_time = offset_time(data_start, origin_lag + detection.detect_time);

    let mut picks = Vec::new();
    let mut channels = Vec::new();
    for (s, station) in grid.stations.iter().enumerate() {
        if !detection.stations.contains(station) {
            continue;
        }
        let lag = grid.lags.get(s, detection.node_index);
        for trace in waveforms.select(station) {
            let pick_time = trace.time_at(lag + detection.detect_time);
            picks.push(Pick {
                station: station.clone(),
                channel: trace.channel.clone(),
                time: pick_time,
            });
            match cut(trace, offset_time(pick_time, -window.pre_pick), window.length) {
                Some((start_time, data)) => channels.push(TemplateChannel {
                    station: station.clone(),
                    channel: trace.channel.clone(),
                    sampling_rate: trace.sampling_rate,
                    start_time,
                    data,
                }),
                None => debug!(station = %station, channel = %trace.channel, "Pick window outside data"),
            }
        }
    }

    let start = channels.iter().map(|c| c.start_time).min().unwrap_or(origin_time);
    Ok(Template {
        name: template_name(start),
        detection: detection.clone(),
        node,
        origin_time,
        picks,
        channel_count: channels.len(),
        channels,
        coherence: 0.0,
    })
}

// ============================================================================
// Persistence
// ============================================================================

/// Where accepted templates go.
pub trait TemplateStore {
    /// Persist `template`; returns the name it was stored under.
    fn persist(&mut self, template: &Template) -> Result<String, TemplateError>;
}

/// Writes one JSON file per template into a directory.
#[derive(Debug, Clone)]
pub struct DirTemplateStore {
    dir: PathBuf,
}

impl DirTemplateStore {
    pub fn create(dir: &Path) -> Result<Self, TemplateError> {
        fs::create_dir_all(dir).map_err(|e| TemplateError::Io(dir.to_path_buf(), e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read a template previously written by this store.
    pub fn load(&self, name: &str) -> Result<Template, TemplateError> {
        let path = self.dir.join(format!("{name}.json"));
        let data = fs::read(&path).map_err(|e| TemplateError::Io(path.clone(), e))?;
        Ok(serde_json::from_slice(&data)?)
    }
}

impl TemplateStore for DirTemplateStore {
    fn persist(&mut self, template: &Template) -> Result<String, TemplateError> {
        // Two detections can share a start time; never overwrite
        let mut name = template.name.clone();
        let mut suffix = 1;
        while self.dir.join(format!("{name}.json")).exists() {
            name = format!("{}_{suffix}", template.name);
            suffix += 1;
        }
        let path = self.dir.join(format!("{name}.json"));
        let json = serde_json::to_vec_pretty(template)?;
        fs::write(&path, json).map_err(|e| TemplateError::Io(path.clone(), e))?;
        debug!(path = %path.display(), "Template written");
        Ok(name)
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Templates every detection, scores coherence and persists the survivors.
#[derive(Debug, Clone)]
pub struct TemplateBuilder {
    pub window: CutWindow,
    pub rule: CoherenceRule,
    pub coherence_window: CoherenceWindow,
}

impl TemplateBuilder {
    /// Returns one record per detection (in input order) and the accepted
    /// templates.
    pub fn process(
        &self,
        detections: Vec<Detection>,
        grid: &TravelTimeGrid,
        waveforms: &WaveformSet,
        store: &mut dyn TemplateStore,
    ) -> Result<(Vec<DetectionRecord>, Vec<Template>), TemplateError> {
        let mut records = Vec::with_capacity(detections.len());
        let mut accepted = Vec::new();

        for detection in detections {
            let mut record = DetectionRecord::new(detection);
            let mut template = build_template(&record.detection, grid, waveforms, self.window)?;
            record.mark_templated()?;

            let (coh, used) = coherence(&template.channels, &self.coherence_window);
            let threshold = self.rule.threshold(used);
            let passed = self.rule.accepts(coh, used);
            record.resolve(passed, coh)?;

            if passed {
                template.coherence = coh;
                let name = store.persist(&template)?;
                info!(
                    template = %name,
                    node = %record.detection.template_name,
                    coherence = coh,
                    threshold,
                    channels = used,
                    "Template accepted"
                );
                template.name = name.clone();
                record.template_name = Some(name);
                accepted.push(template);
            } else {
                warn!(
                    node = %record.detection.template_name,
                    time = record.detection.detect_time,
                    coherence = coh,
                    threshold,
                    channels = used,
                    "Incoherent detection, no template"
                );
            }
            records.push(record);
        }

        info!(
            detections = records.len(),
            templates = accepted.len(),
            "Template generation complete"
        );
        Ok((records, accepted))
    }
}
