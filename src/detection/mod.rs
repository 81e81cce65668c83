//! Peak Detector
//!
//! Picks candidate events from the cumulative network response: compute a
//! threshold statistic, find runs of samples above it, keep each run's
//! maximum, then decluster so no two detections are closer than the minimum
//! separation. Each surviving peak is attributed to the node that produced it.
//!
//! Threshold kinds:
//! - `MAD`: `median(|x|) × value`
//! - `RMS`: `sqrt(mean(x²)) × value`
//! - `abs`: `value` as given

use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{Detection, DetectionMethod, Node};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectionError {
    #[error("Unknown threshold type '{0}' (expected MAD, RMS or abs)")]
    UnknownThresholdKind(String),

    #[error("Network response contains {0} non-finite values after sanitising")]
    NonFiniteResponse(usize),

    #[error("Response has {response} samples but peak-node array has {peak_nodes}")]
    LengthMismatch { response: usize, peak_nodes: usize },

    #[error("Peak at sample {sample} refers to node {node}, grid has {nodes} nodes")]
    UnknownNode {
        sample: usize,
        node: usize,
        nodes: usize,
    },

    #[error("Invalid sampling rate {0} Hz")]
    InvalidSampleRate(f64),
}

/// How the detection threshold is derived from the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ThresholdKind {
    Mad,
    Abs,
    Rms,
}

impl ThresholdKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mad => "MAD",
            Self::Abs => "abs",
            Self::Rms => "RMS",
        }
    }
}

impl fmt::Display for ThresholdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThresholdKind {
    type Err = DetectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mad" => Ok(Self::Mad),
            "abs" => Ok(Self::Abs),
            "rms" => Ok(Self::Rms),
            _ => Err(DetectionError::UnknownThresholdKind(s.to_string())),
        }
    }
}

impl TryFrom<String> for ThresholdKind {
    type Error = DetectionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ThresholdKind> for String {
    fn from(kind: ThresholdKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Parameters for one detection pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakSettings {
    pub threshold: f64,
    pub kind: ThresholdKind,
    /// Samples per second of the response
    pub sampling_rate: f64,
    /// Minimum time between detections (seconds)
    pub min_separation: f64,
}

// ============================================================================
// Statistics
// ============================================================================

fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

fn median_abs(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    Data::new(values.iter().map(|v| v.abs()).collect::<Vec<f64>>()).median()
}

/// The threshold a sample must exceed to count as a peak.
pub fn threshold_value(values: &[f64], threshold: f64, kind: ThresholdKind) -> f64 {
    match kind {
        ThresholdKind::Mad => median_abs(values) * threshold,
        ThresholdKind::Rms => rms(values) * threshold,
        ThresholdKind::Abs => threshold,
    }
}

/// Replace NaN and infinities with zero, returning how many were replaced.
pub fn sanitize(values: &mut [f64]) -> usize {
    let mut replaced = 0;
    for v in values.iter_mut().filter(|v| !v.is_finite()) {
        *v = 0.0;
        replaced += 1;
    }
    replaced
}

// ============================================================================
// Peak Finding
// ============================================================================

/// `(sample, value)` of peaks above `threshold`, at least `min_gap` samples apart.
///
/// Every local maximum strictly above the threshold is a candidate; a flat top
/// counts once, at its first sample. Candidates are then accepted greedily from
/// the largest down, rejecting any within `min_gap` samples of one already
/// accepted. Output is in time order.
pub fn find_peaks(values: &[f64], threshold: f64, min_gap: usize) -> Vec<(usize, f64)> {
    let mut candidates: Vec<(usize, f64)> = Vec::new();
    let mut i = 0;
    while i < values.len() {
        let v = values[i];
        let mut end = i;
        while end + 1 < values.len() && values[end + 1] == v {
            end += 1;
        }
        let rises = i == 0 || values[i - 1] < v;
        let falls = end + 1 == values.len() || values[end + 1] < v;
        if v > threshold && rises && falls {
            candidates.push((i, v));
        }
        i = end + 1;
    }

    let mut by_height = candidates;
    by_height.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut accepted: Vec<(usize, f64)> = Vec::with_capacity(by_height.len());
    for (sample, value) in by_height {
        if accepted.iter().all(|&(s, _)| s.abs_diff(sample) >= min_gap) {
            accepted.push((sample, value));
        }
    }
    accepted.sort_by_key(|&(s, _)| s);
    accepted
}

/// Minimum separation expressed in samples, rounded up so no two accepted
/// peaks are ever closer than `seconds`.
pub fn separation_samples(seconds: f64, sampling_rate: f64) -> usize {
    let samples = (seconds * sampling_rate - 1e-9).ceil();
    if samples.is_finite() && samples > 0.0 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let n = samples as usize;
        n
    } else {
        0
    }
}

/// Turn the cumulative network response into detections.
///
/// `peak_nodes[i]` is the node that produced `response[i]`. An empty result is
/// a normal outcome.
pub fn find_detections(
    response: &[f64],
    peak_nodes: &[usize],
    nodes: &[Node],
    settings: &PeakSettings,
    stations: &[String],
) -> Result<Vec<Detection>, DetectionError> {
    if response.len() != peak_nodes.len() {
        return Err(DetectionError::LengthMismatch {
            response: response.len(),
            peak_nodes: peak_nodes.len(),
        });
    }
    if !settings.sampling_rate.is_finite() || settings.sampling_rate <= 0.0 {
        return Err(DetectionError::InvalidSampleRate(settings.sampling_rate));
    }

    let mut values = response.to_vec();
    let replaced = sanitize(&mut values);
    if replaced > 0 {
        debug!(replaced, "Replaced non-finite response samples with zero");
    }
    let residual = values.iter().filter(|v| !v.is_finite()).count();
    if residual > 0 {
        return Err(DetectionError::NonFiniteResponse(residual));
    }

    let thresh = threshold_value(&values, settings.threshold, settings.kind);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    info!(
        median = median_abs(&values),
        rms = rms(&values),
        max,
        kind = %settings.kind,
        threshold = thresh,
        "Network response statistics"
    );

    let min_gap = separation_samples(settings.min_separation, settings.sampling_rate);
    let peaks = find_peaks(&values, thresh, min_gap);

    let mut detections = Vec::with_capacity(peaks.len());
    for (sample, value) in peaks {
        let node_index = peak_nodes[sample];
        let node = nodes.get(node_index).ok_or(DetectionError::UnknownNode {
            sample,
            node: node_index,
            nodes: nodes.len(),
        })?;
        detections.push(Detection {
            template_name: node.label(),
            node_index,
            detect_time: sample as f64 / settings.sampling_rate,
            sample,
            channel_count: stations.len(),
            peak_amplitude: value,
            threshold: thresh,
            method: DetectionMethod::Brightness,
            stations: stations.to_vec(),
        });
    }

    info!(detections = detections.len(), "Possible detections found");
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(threshold: f64, kind: ThresholdKind, min_separation: f64) -> PeakSettings {
        PeakSettings {
            threshold,
            kind,
            sampling_rate: 10.0,
            min_separation,
        }
    }

    fn nodes(n: usize) -> Vec<Node> {
        (0..n).map(|i| Node::new(i as f64, 0.0, 1.0)).collect()
    }

    #[test]
    fn test_abs_threshold_single_spike() {
        let mut response = vec![10.0; 200];
        for (i, v) in response.iter_mut().enumerate() {
            *v = (i % 50) as f64;
        }
        response[120] = 150.0;
        let peak_nodes = vec![1; 200];

        let dets = find_detections(
            &response,
            &peak_nodes,
            &nodes(3),
            &settings(100.0, ThresholdKind::Abs, 1.0),
            &["A".into(), "B".into()],
        )
        .unwrap();

        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].sample, 120);
        assert_eq!(dets[0].node_index, 1);
        assert!((dets[0].detect_time - 12.0).abs() < 1e-12);
        assert_eq!(dets[0].peak_amplitude, 150.0);
        assert_eq!(dets[0].threshold, 100.0);
        assert_eq!(dets[0].channel_count, 2);
        assert_eq!(dets[0].template_name, "1_0_1");
    }

    #[test]
    fn test_empty_result_is_ok() {
        let dets = find_detections(
            &[1.0; 50],
            &[0; 50],
            &nodes(1),
            &settings(100.0, ThresholdKind::Abs, 1.0),
            &[],
        )
        .unwrap();
        assert!(dets.is_empty());
    }

    #[test]
    fn test_min_separation_respected() {
        let mut values = vec![0.0; 300];
        // Peaks at 100, 105 (too close to 100), 130 and 200
        values[100] = 80.0;
        values[105] = 90.0;
        values[130] = 70.0;
        values[200] = 60.0;
        let peaks = find_peaks(&values, 50.0, 20);
        let samples: Vec<usize> = peaks.iter().map(|p| p.0).collect();
        assert_eq!(samples, vec![105, 130, 200]);
        for pair in peaks.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= 20);
        }
    }

    #[test]
    fn test_flat_top_contributes_one_peak() {
        let values = vec![0.0, 60.0, 75.0, 75.0, 61.0, 0.0, 0.0];
        assert_eq!(find_peaks(&values, 50.0, 0), vec![(2, 75.0)]);
    }

    #[test]
    fn test_long_run_keeps_separated_maxima() {
        let mut values = vec![0.0; 120];
        for v in &mut values[10..=100] {
            *v = 60.0;
        }
        values[10] = 200.0;
        values[100] = 180.0;
        assert_eq!(find_peaks(&values, 50.0, 20), vec![(10, 200.0), (100, 180.0)]);
    }

    #[test]
    fn test_rising_shoulder_is_not_a_peak() {
        let values = vec![0.0, 60.0, 60.0, 90.0, 0.0];
        assert_eq!(find_peaks(&values, 50.0, 0), vec![(3, 90.0)]);
    }

    #[test]
    fn test_separation_rounds_up() {
        assert_eq!(separation_samples(0.24, 10.0), 3);
        assert_eq!(separation_samples(0.2, 10.0), 2);
        assert_eq!(separation_samples(2.0, 100.0), 200);
        assert_eq!(separation_samples(0.0, 100.0), 0);
    }

    #[test]
    fn test_fractional_separation_never_undershot() {
        let mut response = vec![0.0; 40];
        response[10] = 300.0;
        response[12] = 250.0;
        response[14] = 200.0;
        let dets = find_detections(
            &response,
            &[0; 40],
            &nodes(1),
            &settings(100.0, ThresholdKind::Abs, 0.24),
            &[],
        )
        .unwrap();
        let times: Vec<f64> = dets.iter().map(|d| d.detect_time).collect();
        assert_eq!(dets.iter().map(|d| d.sample).collect::<Vec<_>>(), vec![10, 14]);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= 0.24 - 1e-12);
        }
    }

    #[test]
    fn test_mad_and_rms_thresholds() {
        let values = vec![-1.0, 2.0, 3.0, -4.0, 5.0];
        assert!((threshold_value(&values, 2.0, ThresholdKind::Mad) - 6.0).abs() < 1e-12);
        let rms = (55.0_f64 / 5.0).sqrt();
        assert!((threshold_value(&values, 3.0, ThresholdKind::Rms) - 3.0 * rms).abs() < 1e-12);
        assert_eq!(threshold_value(&values, 7.5, ThresholdKind::Abs), 7.5);
    }

    #[test]
    fn test_nan_response_does_not_raise() {
        let mut response = vec![0.0; 20];
        response[3] = f64::NAN;
        response[4] = f64::INFINITY;
        response[10] = 200.0;
        let dets = find_detections(
            &response,
            &[0; 20],
            &nodes(1),
            &settings(100.0, ThresholdKind::Abs, 0.5),
            &[],
        )
        .unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].sample, 10);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let err = find_detections(
            &[0.0; 5],
            &[0; 4],
            &nodes(1),
            &settings(1.0, ThresholdKind::Abs, 0.0),
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, DetectionError::LengthMismatch { .. }));
    }

    #[test]
    fn test_threshold_kind_parsing() {
        assert_eq!("MAD".parse::<ThresholdKind>(), Ok(ThresholdKind::Mad));
        assert_eq!("rms".parse::<ThresholdKind>(), Ok(ThresholdKind::Rms));
        assert_eq!("abs".parse::<ThresholdKind>(), Ok(ThresholdKind::Abs));
        assert_eq!(
            "median".parse::<ThresholdKind>(),
            Err(DetectionError::UnknownThresholdKind("median".into()))
        );
    }
}
