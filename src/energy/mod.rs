//! Node Energy Stacker
//!
//! For one grid node: shift every station's waveform by the node's lag, square
//! it, clip spikes, normalise, and sum across stations into a single `u16`
//! energy trace.
//!
//! ## Quantisation
//!
//! Each station's contribution is rescaled so its peak is [`ENERGY_CEILING`]
//! and held as `i16`. The cross-station sum goes through an
//! [`EnergyAccumulator`], whose precondition is that at most
//! [`MAX_STACK_CHANNELS`] contributions are added. Under that bound the sum
//! cannot exceed `u16::MAX`; the accumulator still saturates rather than wraps.

mod pool;

pub use pool::{NodeEnergy, StackJob, StackPool};

use thiserror::Error;
use tracing::warn;

use crate::waveform::WaveformSet;

/// Peak value of a single station's normalised energy.
pub const ENERGY_CEILING: i16 = 500;

/// Most contributions an [`EnergyAccumulator`] accepts without risking `u16` overflow.
#[allow(clippy::cast_sign_loss)]
pub const MAX_STACK_CHANNELS: usize = u16::MAX as usize / ENERGY_CEILING as usize;

#[derive(Error, Debug)]
pub enum EnergyError {
    #[error(
        "Too many channels to stack: {channels} (limit {limit}). Reduce the channel count, \
         or accept reduced precision by lowering the per-channel energy ceiling"
    )]
    TooManyChannels { channels: usize, limit: usize },

    #[error("Energy contribution has {found} samples, accumulator expects {expected}")]
    LengthMismatch { expected: usize, found: usize },

    #[error("Failed to build stacking worker pool: {0}")]
    Pool(String),
}

// ============================================================================
// Bounded Accumulator
// ============================================================================

/// Sample-wise sum of per-station energy contributions.
///
/// Construction fixes the number of contributions it may receive; asking for
/// more than [`MAX_STACK_CHANNELS`] is refused up front instead of silently
/// overflowing later.
#[derive(Debug, Clone)]
pub struct EnergyAccumulator {
    sums: Vec<u32>,
    capacity: usize,
    added: usize,
}

impl EnergyAccumulator {
    pub fn new(len: usize, channels: usize) -> Result<Self, EnergyError> {
        if channels > MAX_STACK_CHANNELS {
            return Err(EnergyError::TooManyChannels {
                channels,
                limit: MAX_STACK_CHANNELS,
            });
        }
        Ok(Self {
            sums: vec![0; len],
            capacity: channels,
            added: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.sums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }

    /// Contributions added so far.
    pub fn added(&self) -> usize {
        self.added
    }

    /// Add one station's energy. Negative samples count as zero.
    pub fn add(&mut self, contribution: &[i16]) -> Result<(), EnergyError> {
        if contribution.len() != self.sums.len() {
            return Err(EnergyError::LengthMismatch {
                expected: self.sums.len(),
                found: contribution.len(),
            });
        }
        if self.added >= self.capacity {
            return Err(EnergyError::TooManyChannels {
                channels: self.added + 1,
                limit: self.capacity,
            });
        }
        for (sum, &v) in self.sums.iter_mut().zip(contribution) {
            *sum += u32::from(v.max(0).unsigned_abs());
        }
        self.added += 1;
        Ok(())
    }

    /// The stacked energy, clipped to the `u16` range.
    pub fn finish(self) -> Vec<u16> {
        self.sums
            .into_iter()
            .map(|v| u16::try_from(v).unwrap_or(u16::MAX))
            .collect()
    }
}

// ============================================================================
// Per-station Energy
// ============================================================================

fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

/// Lag-shifted, clipped, normalised energy of one station's samples.
///
/// The trace is shifted `lag_samples` earlier (zero-padded at the end), squared,
/// clipped at `clip_level × mean energy`, divided by its RMS and rescaled so
/// the peak equals [`ENERGY_CEILING`]. Degenerate input (all zeros, NaN)
/// yields zeros.
pub fn station_energy(samples: &[f64], lag_samples: usize, clip_level: f64) -> Vec<i16> {
    let n = samples.len();
    let mut energy: Vec<f64> = samples
        .iter()
        .skip(lag_samples)
        .map(|v| v * v)
        .chain(std::iter::repeat(0.0))
        .take(n)
        .collect();

    if n == 0 {
        return Vec::new();
    }

    let mean = energy.iter().sum::<f64>() / n as f64;
    let ceiling = clip_level * mean;
    for e in &mut energy {
        *e = e.clamp(0.0, ceiling.max(0.0));
    }

    let norm = rms(&energy);
    for e in &mut energy {
        let v = *e / norm;
        *e = if v.is_finite() { v } else { 0.0 };
    }

    let peak = energy.iter().copied().fold(0.0_f64, f64::max);
    if peak <= 0.0 {
        return vec![0; n];
    }

    let ceiling = f64::from(ENERGY_CEILING);
    #[allow(clippy::cast_possible_truncation)]
    let scaled: Vec<i16> = energy
        .iter()
        .map(|e| (ceiling * (e / peak)) as i16)
        .collect();
    scaled
}

/// Samples corresponding to a lag in seconds.
pub fn lag_to_samples(lag: f64, sampling_rate: f64) -> usize {
    let samples = (lag * sampling_rate).round();
    if samples.is_finite() && samples > 0.0 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let n = samples as usize;
        n
    } else {
        0
    }
}

// ============================================================================
// Node Stack
// ============================================================================

/// Energy stack for one node.
///
/// `node_lags[i]` is the lag for `stations[i]`. A station with no trace is
/// skipped with a warning; a station with several traces uses the first.
/// If nothing matches, the result is all zeros.
pub fn stack_node(
    stations: &[String],
    node_lags: &[f64],
    waveforms: &WaveformSet,
    clip_level: f64,
) -> Result<Vec<u16>, EnergyError> {
    let len = waveforms.max_len();
    let mut acc = EnergyAccumulator::new(len, stations.len())?;

    for (station, &lag) in stations.iter().zip(node_lags) {
        let matches = waveforms.select(station);
        let Some(trace) = matches.first() else {
            warn!(station = %station, "No station match, skipping");
            continue;
        };
        if matches.len() > 1 {
            warn!(station = %station, channels = matches.len(), "Too many channels for station, using the first");
        }

        let shift = lag_to_samples(lag, trace.sampling_rate);
        let mut contribution = station_energy(&trace.data, shift, clip_level);
        contribution.resize(len, 0);
        acc.add(&contribution)?;
    }

    Ok(acc.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::Trace;
    use chrono::Utc;

    fn impulse(len: usize, at: usize, amp: f64) -> Vec<f64> {
        let mut v = vec![0.0; len];
        v[at] = amp;
        v
    }

    fn trace(station: &str, data: Vec<f64>) -> Trace {
        Trace {
            station: station.to_string(),
            channel: "HHZ".to_string(),
            sampling_rate: 10.0,
            start_time: Utc::now(),
            data,
        }
    }

    #[test]
    fn test_max_channels_bound() {
        assert_eq!(MAX_STACK_CHANNELS, 131);
        assert!(MAX_STACK_CHANNELS * ENERGY_CEILING as usize <= u16::MAX as usize);
    }

    #[test]
    fn test_accumulator_refuses_too_many_channels() {
        assert!(matches!(
            EnergyAccumulator::new(10, MAX_STACK_CHANNELS + 1),
            Err(EnergyError::TooManyChannels { .. })
        ));
        assert!(EnergyAccumulator::new(10, MAX_STACK_CHANNELS).is_ok());
    }

    #[test]
    fn test_accumulator_enforces_capacity_and_length() {
        let mut acc = EnergyAccumulator::new(2, 1).unwrap();
        assert!(matches!(acc.add(&[1]), Err(EnergyError::LengthMismatch { .. })));
        acc.add(&[500, 3]).unwrap();
        assert!(matches!(acc.add(&[1, 1]), Err(EnergyError::TooManyChannels { .. })));
        assert_eq!(acc.finish(), vec![500, 3]);
    }

    #[test]
    fn test_full_stack_fits_u16() {
        let mut acc = EnergyAccumulator::new(1, MAX_STACK_CHANNELS).unwrap();
        for _ in 0..MAX_STACK_CHANNELS {
            acc.add(&[ENERGY_CEILING]).unwrap();
        }
        assert_eq!(acc.finish(), vec![65500]);
    }

    #[test]
    fn test_station_energy_peak_is_ceiling() {
        let e = station_energy(&impulse(100, 50, 3.0), 0, 1e6);
        assert_eq!(e[50], ENERGY_CEILING);
        assert_eq!(e.iter().filter(|&&v| v != 0).count(), 1);
    }

    #[test]
    fn test_station_energy_shifts_earlier() {
        let e = station_energy(&impulse(100, 50, 3.0), 10, 1e6);
        assert_eq!(e.len(), 100);
        assert_eq!(e[40], ENERGY_CEILING);
        assert!(e[90..].iter().all(|&v| v == 0));
    }

    #[test]
    fn test_station_energy_lag_beyond_trace() {
        let e = station_energy(&impulse(20, 5, 1.0), 50, 100.0);
        assert_eq!(e, vec![0; 20]);
    }

    #[test]
    fn test_all_zero_signal_gives_zero_energy() {
        let e = station_energy(&[0.0; 64], 3, 100.0);
        assert_eq!(e, vec![0; 64]);
    }

    #[test]
    fn test_clip_suppresses_spike() {
        // Steady signal with one large spike; with a low clip level the spike is
        // capped, so the steady samples carry a sizeable share of the ceiling.
        let mut data = vec![1.0; 100];
        data[10] = 100.0;
        let clipped = station_energy(&data, 0, 2.0);
        let unclipped = station_energy(&data, 0, 1e9);
        assert!(clipped[50] > unclipped[50]);
        assert_eq!(clipped[10], ENERGY_CEILING);
        assert_eq!(unclipped[50], 0);
    }

    #[test]
    fn test_stack_node_zero_station_contributes_nothing() {
        let set = WaveformSet::new(vec![
            trace("A", impulse(50, 20, 2.0)),
            trace("B", vec![0.0; 50]),
        ]);
        let stack = stack_node(&["A".into(), "B".into()], &[0.0, 0.0], &set, 1e6).unwrap();
        assert_eq!(stack[20], 500);
        assert_eq!(stack.iter().map(|&v| u32::from(v)).sum::<u32>(), 500);
    }

    #[test]
    fn test_stack_node_missing_station_degrades() {
        let set = WaveformSet::new(vec![trace("A", impulse(30, 10, 1.0))]);
        let stack = stack_node(&["X".into(), "Y".into()], &[0.0, 1.0], &set, 100.0).unwrap();
        assert_eq!(stack, vec![0; 30]);
    }

    #[test]
    fn test_stack_node_duplicate_channels_uses_first() {
        let mut second = trace("A", impulse(30, 25, 1.0));
        second.channel = "HHN".into();
        let set = WaveformSet::new(vec![trace("A", impulse(30, 10, 1.0)), second]);
        let stack = stack_node(&["A".into()], &[0.0], &set, 1e6).unwrap();
        assert_eq!(stack[10], 500);
        assert_eq!(stack[25], 0);
    }

    #[test]
    fn test_lag_to_samples_rounds() {
        assert_eq!(lag_to_samples(1.04, 10.0), 10);
        assert_eq!(lag_to_samples(1.06, 10.0), 11);
        assert_eq!(lag_to_samples(-1.0, 10.0), 0);
        assert_eq!(lag_to_samples(f64::NAN, 10.0), 0);
    }
}
