//! Continuous waveform data
//!
//! The pipeline consumes single-channel traces that an external waveform
//! manager has already merged, gap-filled and trimmed to a common span. This
//! module only checks that the set is usable, lines up start times and
//! lengths, and makes the integer-scaled copy templates are cut from.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Largest magnitude representable in the 16-bit template copy.
pub const I16_LIMIT: f64 = 32767.0;

#[derive(Error, Debug)]
pub enum WaveformError {
    #[error("Waveform I/O error ({0}): {1}")]
    Io(PathBuf, std::io::Error),

    #[error("Waveform parse error ({0}): {1}")]
    Parse(PathBuf, serde_json::Error),

    #[error("Waveform set is empty")]
    Empty,

    #[error("Trace {station}.{channel} has no samples")]
    NoSamples { station: String, channel: String },

    #[error("Sampling rates differ: {station}.{channel} is {found} Hz, expected {expected} Hz")]
    SampleRateMismatch {
        station: String,
        channel: String,
        expected: f64,
        found: f64,
    },

    #[error("Invalid sampling rate {rate} Hz on {station}.{channel}")]
    InvalidSampleRate {
        station: String,
        channel: String,
        rate: f64,
    },
}

/// One channel of continuous data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub station: String,
    pub channel: String,
    /// Samples per second
    pub sampling_rate: f64,
    pub start_time: DateTime<Utc>,
    pub data: Vec<f64>,
}

impl Trace {
    /// Seconds between samples.
    pub fn delta(&self) -> f64 {
        1.0 / self.sampling_rate
    }

    /// Absolute time of `offset_secs` after the trace start.
    pub fn time_at(&self, offset_secs: f64) -> DateTime<Utc> {
        offset_time(self.start_time, offset_secs)
    }
}

/// `start + seconds`, at microsecond resolution.
pub fn offset_time(start: DateTime<Utc>, seconds: f64) -> DateTime<Utc> {
    #[allow(clippy::cast_possible_truncation)]
    let micros = (seconds * 1e6).round() as i64;
    start + Duration::microseconds(micros)
}

/// Seconds from `start` to `time` (negative if `time` is earlier).
pub fn seconds_between(start: DateTime<Utc>, time: DateTime<Utc>) -> f64 {
    let delta = time - start;
    delta.num_microseconds().map_or_else(
        || delta.num_milliseconds() as f64 / 1e3,
        |us| us as f64 / 1e6,
    )
}

/// A day (or any span) of traces for the whole network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaveformSet {
    pub traces: Vec<Trace>,
}

impl WaveformSet {
    pub fn new(traces: Vec<Trace>) -> Self {
        Self { traces }
    }

    /// Read a JSON waveform document (`{"traces": [...]}`).
    pub fn load_json(path: &Path) -> Result<Self, WaveformError> {
        let data = std::fs::read(path).map_err(|e| WaveformError::Io(path.to_path_buf(), e))?;
        serde_json::from_slice(&data).map_err(|e| WaveformError::Parse(path.to_path_buf(), e))
    }

    /// Write the set as JSON.
    pub fn save_json(&self, path: &Path) -> Result<(), WaveformError> {
        let json = serde_json::to_vec(self).map_err(|e| WaveformError::Parse(path.to_path_buf(), e))?;
        std::fs::write(path, json).map_err(|e| WaveformError::Io(path.to_path_buf(), e))
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Check the set is non-empty, every trace has data and all share one sampling rate.
    ///
    /// Returns the common sampling rate.
    pub fn validate(&self) -> Result<f64, WaveformError> {
        let first = self.traces.first().ok_or(WaveformError::Empty)?;
        let expected = first.sampling_rate;
        for tr in &self.traces {
            if !tr.sampling_rate.is_finite() || tr.sampling_rate <= 0.0 {
                return Err(WaveformError::InvalidSampleRate {
                    station: tr.station.clone(),
                    channel: tr.channel.clone(),
                    rate: tr.sampling_rate,
                });
            }
            if (tr.sampling_rate - expected).abs() > f64::EPSILON * expected {
                return Err(WaveformError::SampleRateMismatch {
                    station: tr.station.clone(),
                    channel: tr.channel.clone(),
                    expected,
                    found: tr.sampling_rate,
                });
            }
            if tr.data.is_empty() {
                return Err(WaveformError::NoSamples {
                    station: tr.station.clone(),
                    channel: tr.channel.clone(),
                });
            }
        }
        Ok(expected)
    }

    /// Number of samples in the longest trace.
    pub fn max_len(&self) -> usize {
        self.traces.iter().map(|t| t.data.len()).max().unwrap_or(0)
    }

    /// Give every trace the earliest start time and the longest length.
    ///
    /// Later-starting traces are zero-padded at the front by their offset in
    /// samples, then shorter traces are zero-padded at the end. Expects
    /// [`validate`](Self::validate) to have passed.
    pub fn align(&mut self) {
        let Some(earliest) = self.traces.iter().map(|t| t.start_time).min() else {
            return;
        };
        for tr in &mut self.traces {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let lead = (seconds_between(earliest, tr.start_time) * tr.sampling_rate).round().max(0.0) as usize;
            if lead > 0 {
                warn!(
                    station = %tr.station,
                    channel = %tr.channel,
                    samples = lead,
                    "Trace starts late, zero-padding the front"
                );
                tr.data.splice(0..0, std::iter::repeat(0.0).take(lead));
            }
            tr.start_time = earliest;
        }

        let target = self.max_len();
        for tr in &mut self.traces {
            if tr.data.len() < target {
                warn!(
                    station = %tr.station,
                    channel = %tr.channel,
                    samples = tr.data.len(),
                    target,
                    "Trace shorter than the rest, zero-padding"
                );
                tr.data.resize(target, 0.0);
            }
        }
    }

    /// Traces recorded at `station`, in input order.
    pub fn select(&self, station: &str) -> Vec<&Trace> {
        self.traces.iter().filter(|t| t.station == station).collect()
    }

    /// The requested stations that have at least one trace, in request order.
    pub fn stations_present(&self, stations: &[String]) -> Vec<String> {
        let have: HashSet<&str> = self.traces.iter().map(|t| t.station.as_str()).collect();
        stations
            .iter()
            .filter(|s| have.contains(s.as_str()))
            .cloned()
            .collect()
    }

    /// Copy with every trace forced into the 16-bit integer range.
    ///
    /// Traces whose peak exceeds the range are rescaled so the peak sits at
    /// the limit; all samples are then truncated toward zero.
    pub fn quantized(&self) -> Self {
        let traces = self
            .traces
            .iter()
            .map(|tr| {
                let peak = tr.data.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
                let scale = if peak > I16_LIMIT { I16_LIMIT / peak } else { 1.0 };
                if scale < 1.0 {
                    debug!(station = %tr.station, channel = %tr.channel, peak, "Rescaling trace into 16-bit range");
                }
                Trace {
                    data: tr.data.iter().map(|v| (v * scale).trunc()).collect(),
                    ..tr.clone()
                }
            })
            .collect();
        Self { traces }
    }
}
