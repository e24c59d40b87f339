//! Descriptive statistics over a window of samples

use super::ring::Sample;
use serde::Serialize;

/// Summary of a non-empty window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Statistics {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Population standard deviation
    pub std_dev: f64,
    pub rms: f64,
}

impl Statistics {
    /// Compute statistics, or None for an empty window
    pub fn compute(samples: &[Sample]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let count = samples.len();
        let n = count as f64;
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for s in samples {
            sum += s.value;
            sum_sq += s.value * s.value;
            min = min.min(s.value);
            max = max.max(s.value);
        }
        let mean = sum / n;

        // Two-pass variance keeps precision for large offsets
        let variance = samples
            .iter()
            .map(|s| (s.value - mean).powi(2))
            .sum::<f64>()
            / n;

        Some(Self {
            count,
            mean,
            min,
            max,
            std_dev: variance.sqrt(),
            rms: (sum_sq / n).sqrt(),
        })
    }
}

/// Average sample rate in Hz, or None if the window spans no time
pub fn average_sample_rate(samples: &[Sample]) -> Option<f64> {
    let first = samples.first()?;
    let last = samples.last()?;
    if samples.len() < 2 || last.timestamp_ns <= first.timestamp_ns {
        return None;
    }
    let span_secs = (last.timestamp_ns - first.timestamp_ns) as f64 / 1e9;
    Some((samples.len() - 1) as f64 / span_secs)
}
