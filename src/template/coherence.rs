//! Network coherence of a template
//!
//! Mean absolute zero-lag normalised cross-correlation over every unique
//! channel pair. Noise is incoherent across stations, so a real event scores
//! noticeably higher than a spurious stack peak.

use tracing::warn;

use super::TemplateChannel;

/// Which part of a template the coherence is computed on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoherenceWindow {
    /// Stations to include; empty means all
    pub stations: Vec<String>,
    /// Start and end, in seconds from each channel's start
    pub clip: Option<(f64, f64)>,
}

/// Acceptance rule: coherence must exceed `a - channels / b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoherenceRule {
    pub a: f64,
    pub b: f64,
}

impl CoherenceRule {
    pub fn threshold(&self, channels: usize) -> f64 {
        self.a - channels as f64 / self.b
    }

    /// Fewer than two channels never pass: coherence is undefined for them.
    pub fn accepts(&self, coherence: f64, channels: usize) -> bool {
        channels >= 2 && coherence > self.threshold(channels)
    }
}

/// Zero-lag normalised cross-correlation of two equal-length series.
///
/// Zero-variance input has no defined correlation and scores 0.
pub fn normalized_xcorr(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n == 0 {
        return 0.0;
    }
    let (x, y) = (&x[..n], &y[..n]);
    let mean_x = x.iter().sum::<f64>() / n as f64;
    let mean_y = y.iter().sum::<f64>() / n as f64;

    let mut num = 0.0;
    let mut den_x = 0.0;
    let mut den_y = 0.0;
    for (a, b) in x.iter().zip(y) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        num += dx * dy;
        den_x += dx * dx;
        den_y += dy * dy;
    }

    let den = (den_x * den_y).sqrt();
    if den == 0.0 || !den.is_finite() {
        0.0
    } else {
        num / den
    }
}

fn window_bounds(clip: Option<(f64, f64)>, sampling_rate: f64, len: usize) -> (usize, usize) {
    let Some((start, end)) = clip else {
        return (0, len);
    };
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let to_index = |secs: f64| ((secs * sampling_rate).round().max(0.0) as usize).min(len);
    let (s, e) = (to_index(start), to_index(end));
    (s, e.max(s))
}

/// Coherence of a set of template channels and the number of channels used.
///
/// Channels shorter than the longest are zero-padded at the end. With fewer
/// than two channels the coherence is 0.
pub fn coherence(channels: &[TemplateChannel], window: &CoherenceWindow) -> (f64, usize) {
    let selected: Vec<&TemplateChannel> = channels
        .iter()
        .filter(|c| window.stations.is_empty() || window.stations.contains(&c.station))
        .collect();
    let used = selected.len();

    let max_len = selected.iter().map(|c| c.data.len()).max().unwrap_or(0);
    if max_len == 0 {
        warn!("Template without data");
        return (0.0, used);
    }
    if used < 2 {
        return (0.0, used);
    }

    let series: Vec<Vec<f64>> = selected
        .iter()
        .map(|c| {
            let mut data = c.data.clone();
            if data.len() < max_len {
                warn!(
                    station = %c.station,
                    channel = %c.channel,
                    samples = data.len(),
                    "Template channel is not the same length, padding"
                );
                data.resize(max_len, 0.0);
            }
            let (s, e) = window_bounds(window.clip, c.sampling_rate, max_len);
            data[s..e].to_vec()
        })
        .collect();

    let mut total = 0.0;
    for i in 0..used {
        for j in (i + 1)..used {
            total += normalized_xcorr(&series[i], &series[j]).abs();
        }
    }
    let pairs = (used * (used - 1)) as f64 / 2.0;
    (total / pairs, used)
}
