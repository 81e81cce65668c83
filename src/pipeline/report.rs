//! Scan reports for external plotting and cataloguing.
//!
//! - response CSV: `time_s,response,peak_node`, one row per sample
//! - detections JSON: every detection record plus run metadata

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use super::ScanOutcome;
use crate::template::DetectionRecord;
use crate::types::Node;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Report I/O error ({0}): {1}")]
    Io(PathBuf, std::io::Error),

    #[error("Report serialization error ({0}): {1}")]
    Serialize(PathBuf, serde_json::Error),
}

/// Write the cumulative network response as CSV.
pub fn write_response_csv(path: &Path, outcome: &ScanOutcome) -> Result<(), ReportError> {
    let io_err = |e| ReportError::Io(path.to_path_buf(), e);
    let mut writer = BufWriter::new(File::create(path).map_err(io_err)?);

    writeln!(writer, "time_s,response,peak_node").map_err(io_err)?;
    let response = &outcome.response;
    for (i, (value, node)) in response.values.iter().zip(&response.peak_nodes).enumerate() {
        let time = i as f64 / outcome.sampling_rate;
        writeln!(writer, "{time},{value},{node}").map_err(io_err)?;
    }
    writer.flush().map_err(io_err)?;

    info!(path = %path.display(), samples = response.len(), "Network response written");
    Ok(())
}

#[derive(Debug, Serialize)]
struct DetectionReport<'a> {
    start_time: DateTime<Utc>,
    sampling_rate: f64,
    stations: &'a [String],
    detections: &'a [DetectionRecord],
    nodes_out: &'a [Node],
}

/// Write every detection record, accepted or not, as JSON.
pub fn write_detections_json(path: &Path, outcome: &ScanOutcome) -> Result<(), ReportError> {
    let report = DetectionReport {
        start_time: outcome.start_time,
        sampling_rate: outcome.sampling_rate,
        stations: &outcome.stations,
        detections: &outcome.records,
        nodes_out: &outcome.nodes_out,
    };
    let json = serde_json::to_vec_pretty(&report).map_err(|e| ReportError::Serialize(path.to_path_buf(), e))?;
    std::fs::write(path, json).map_err(|e| ReportError::Io(path.to_path_buf(), e))?;

    info!(path = %path.display(), detections = outcome.records.len(), "Detections written");
    Ok(())
}
