//! End-to-end scan scenarios
//!
//! Small hand-built networks whose network response can be worked out on
//! paper, run through the public `BrightnessScan` API.

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use brightness_scan::config::ScanConfig;
use brightness_scan::detection::ThresholdKind;
use brightness_scan::grid::{grid_file_name, read_travel_times, GridRequest, LagTable, TravelTimeGrid};
use brightness_scan::pipeline::{BrightnessScan, ScanError};
use brightness_scan::template::{DetectionState, DirTemplateStore};
use brightness_scan::types::{LagMode, Node, Phase};
use brightness_scan::waveform::{Trace, WaveformSet};

// ============================================================================
// Fixtures
// ============================================================================

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2015, 3, 1, 0, 0, 0).unwrap()
}

fn impulse_trace(station: &str, at: usize) -> Trace {
    let mut data = vec![0.0; 100];
    data[at] = 1000.0;
    Trace {
        station: station.to_string(),
        channel: "HHZ".to_string(),
        sampling_rate: 10.0,
        start_time: start(),
        data,
    }
}

/// Two stations, three nodes. Node 1 has equal lags, so an impulse arriving
/// simultaneously at both stations lines up only there.
fn two_station_grid() -> TravelTimeGrid {
    TravelTimeGrid::new(
        vec!["A".into(), "B".into()],
        vec![
            Node::new(176.0, -38.0, 2.0),
            Node::new(176.1, -38.0, 2.0),
            Node::new(176.2, -38.0, 2.0),
        ],
        LagTable::from_rows(vec![vec![0.0, 1.0, 2.0], vec![2.0, 1.0, 0.0]]).unwrap(),
    )
    .unwrap()
}

fn scenario_config() -> ScanConfig {
    let mut config = ScanConfig::default();
    config.stack.clip_level = 1e6;
    config.stack.cores = 2;
    config.detection.threshold = 600.0;
    config.detection.threshold_kind = ThresholdKind::Abs;
    config.detection.min_separation_s = 1.0;
    config.template.length_s = 1.0;
    config.template.pre_pick_s = 0.2;
    config
}

fn scenario_waveforms() -> WaveformSet {
    WaveformSet::new(vec![impulse_trace("A", 50), impulse_trace("B", 50)])
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn simultaneous_impulse_peaks_at_central_node() {
    let grid = two_station_grid();
    let config = scenario_config();
    let dir = TempDir::new().unwrap();
    let mut store = DirTemplateStore::create(dir.path()).unwrap();

    let outcome = BrightnessScan::new(&grid, &config)
        .run(&scenario_waveforms(), &mut store)
        .unwrap();

    assert_eq!(outcome.response.len(), 100);
    assert_eq!(outcome.response.peak(), Some((40, 1000, 1)));
    // Off-centre nodes see each station alone, 500 at 3 s and 5 s
    assert_eq!(outcome.response.values[30], 500);
    assert_eq!(outcome.response.values[50], 500);
    assert_eq!(outcome.response.peak_nodes[30], 0);

    assert_eq!(outcome.records.len(), 1);
    let det = &outcome.records[0].detection;
    assert_eq!(det.node_index, 1);
    assert_eq!(det.sample, 40);
    assert!((det.detect_time - 4.0).abs() < 1e-12);
    assert_eq!(det.template_name, "176.1_-38_2");
    assert_eq!(det.stations, vec!["A", "B"]);
    assert_eq!(det.peak_amplitude, 1000.0);
}

#[test]
fn coherent_detection_becomes_template() {
    let grid = two_station_grid();
    let config = scenario_config();
    let dir = TempDir::new().unwrap();
    let mut store = DirTemplateStore::create(dir.path()).unwrap();

    let outcome = BrightnessScan::new(&grid, &config)
        .run(&scenario_waveforms(), &mut store)
        .unwrap();

    assert_eq!(outcome.records[0].state(), DetectionState::Accepted);
    assert_eq!(outcome.templates.len(), 1);
    assert_eq!(outcome.nodes_out, vec![grid.nodes[1]]);

    let template = &outcome.templates[0];
    assert_eq!(template.channel_count, 2);
    assert!((template.coherence - 1.0).abs() < 1e-9);
    // Picks at 5.0 s, templates start 0.2 s earlier
    for channel in &template.channels {
        assert_eq!(channel.start_time, start() + chrono::Duration::milliseconds(4800));
        assert_eq!(channel.data[2], 1000.0);
    }

    let name = outcome.records[0].template_name.clone().unwrap();
    let reloaded = store.load(&name).unwrap();
    assert_eq!(reloaded.detection, outcome.records[0].detection);
}

#[test]
fn late_starting_trace_is_realigned() {
    let grid = two_station_grid();
    let config = scenario_config();
    let dir = TempDir::new().unwrap();
    let mut store = DirTemplateStore::create(dir.path()).unwrap();
    // B starts 1 s late, so its arrival at 5 s is sample 40 of its own data
    let mut late = impulse_trace("B", 40);
    late.start_time = start() + chrono::Duration::seconds(1);
    let waveforms = WaveformSet::new(vec![impulse_trace("A", 50), late]);

    let outcome = BrightnessScan::new(&grid, &config).run(&waveforms, &mut store).unwrap();

    assert_eq!(outcome.start_time, start());
    assert_eq!(outcome.response.len(), 110);
    assert_eq!(outcome.response.peak(), Some((40, 1000, 1)));
    assert_eq!(outcome.records.len(), 1);
}

#[test]
fn scratch_response_matches_in_memory() {
    let grid = two_station_grid();
    let waveforms = scenario_waveforms();
    let templates = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();

    let in_memory = scenario_config();
    let mut conserving = scenario_config();
    conserving.memory.conserve = true;
    conserving.memory.scratch_dir = scratch.path().to_path_buf();
    conserving.memory.instance = Some("it".into());

    let mut store = DirTemplateStore::create(&templates.path().join("a")).unwrap();
    let a = BrightnessScan::new(&grid, &in_memory).run(&waveforms, &mut store).unwrap();
    let mut store = DirTemplateStore::create(&templates.path().join("b")).unwrap();
    let b = BrightnessScan::new(&grid, &conserving).run(&waveforms, &mut store).unwrap();

    assert_eq!(a.response, b.response);
    assert_eq!(a.records, b.records);
    assert!(!scratch.path().join("brightness-it").exists());
}

#[test]
fn quiet_data_yields_no_detections() {
    let grid = two_station_grid();
    let config = scenario_config();
    let dir = TempDir::new().unwrap();
    let mut store = DirTemplateStore::create(dir.path()).unwrap();
    let mut waveforms = scenario_waveforms();
    for tr in &mut waveforms.traces {
        tr.data.fill(0.0);
    }

    let outcome = BrightnessScan::new(&grid, &config).run(&waveforms, &mut store).unwrap();
    assert!(outcome.response.values.iter().all(|&v| v == 0));
    assert!(outcome.records.is_empty());
    assert!(outcome.templates.is_empty());
}

#[test]
fn missing_station_is_excluded_not_fatal() {
    let grid = two_station_grid();
    let config = scenario_config();
    let dir = TempDir::new().unwrap();
    let mut store = DirTemplateStore::create(dir.path()).unwrap();
    let waveforms = WaveformSet::new(vec![impulse_trace("A", 50)]);

    let outcome = BrightnessScan::new(&grid, &config).run(&waveforms, &mut store).unwrap();
    assert_eq!(outcome.stations, vec!["A"]);
    // A single station peaks at 500, below the threshold
    assert!(outcome.records.is_empty());
}

#[test]
fn no_matching_stations_is_fatal() {
    let grid = two_station_grid();
    let config = scenario_config();
    let dir = TempDir::new().unwrap();
    let mut store = DirTemplateStore::create(dir.path()).unwrap();
    let waveforms = WaveformSet::new(vec![impulse_trace("Z", 50)]);

    let err = BrightnessScan::new(&grid, &config).run(&waveforms, &mut store);
    assert!(matches!(err, Err(ScanError::NoMatchingStations(2))));
}

#[test]
fn too_many_channels_is_fatal() {
    let grid = two_station_grid();
    let config = scenario_config();
    let dir = TempDir::new().unwrap();
    let mut store = DirTemplateStore::create(dir.path()).unwrap();
    let waveforms = WaveformSet::new((0..132).map(|_| impulse_trace("A", 50)).collect());

    let err = BrightnessScan::new(&grid, &config).run(&waveforms, &mut store);
    assert!(matches!(
        err,
        Err(ScanError::TooManyChannels {
            channels: 132,
            limit: 131
        })
    ));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn scan_from_grid_files() {
    let dir = TempDir::new().unwrap();
    let nodes = ["176 -38 2", "176.1 -38 2", "176.2 -38 2"];
    // Absolute S times; relative mode subtracts the per-node minimum (3 s)
    for (station, times) in [("A", [3.0, 4.0, 5.0]), ("B", [5.0, 4.0, 3.0])] {
        let rows: Vec<String> = nodes.iter().zip(times).map(|(n, t)| format!("{n} {t}")).collect();
        std::fs::write(
            dir.path().join(grid_file_name("test", Phase::S, station)),
            rows.join("\n"),
        )
        .unwrap();
    }

    let request = GridRequest {
        stations: vec!["A".into(), "B".into()],
        phase: Phase::S,
        output_phase: Phase::S,
        ps_ratio: 1.68,
        lag_mode: LagMode::Relative,
    };
    let grid = read_travel_times(dir.path(), &request).unwrap();
    assert_eq!(grid.lags.node_lags(0), vec![0.0, 2.0]);
    assert_eq!(grid.lags.node_lags(1), vec![0.0, 0.0]);

    let config = scenario_config();
    let templates = TempDir::new().unwrap();
    let mut store = DirTemplateStore::create(templates.path()).unwrap();
    let outcome = BrightnessScan::new(&grid, &config)
        .run(&scenario_waveforms(), &mut store)
        .unwrap();
    // Node 1 has zero relative lag, so the stack lines up at the arrival itself
    assert_eq!(outcome.response.peak(), Some((50, 1000, 1)));
}
