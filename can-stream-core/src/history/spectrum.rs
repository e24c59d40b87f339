//! Frequency-domain analysis of irregularly sampled signals
//!
//! CAN delivery is not periodic, so samples are first resampled onto a uniform
//! grid by linear interpolation, then transformed with a forward FFT.

use super::ring::Sample;
use rustfft::{num_complex::Complex64, FftPlanner};
use serde::Serialize;

/// One-sided magnitude spectrum
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Spectrum {
    /// Sample rate of the uniform grid the transform ran on (Hz)
    pub sample_rate_hz: f64,
    /// Bin centre frequencies, `k * fs / n` for `k = 0..=n/2`
    pub frequencies_hz: Vec<f64>,
    /// `|X[k]|` for each bin
    pub magnitudes: Vec<f64>,
}

impl Spectrum {
    pub fn is_empty(&self) -> bool {
        self.magnitudes.is_empty()
    }

    /// Frequency of the strongest non-DC bin
    pub fn peak_frequency(&self) -> Option<f64> {
        self.magnitudes
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, _)| self.frequencies_hz[k])
    }

    /// Compute the spectrum of a window
    ///
    /// Fewer than two samples, or a window spanning no time, yields an empty
    /// spectrum.
    pub fn compute(samples: &[Sample]) -> Self {
        let Some(values) = resample_uniform(samples) else {
            return Self::default();
        };
        let n = values.len();
        let span_secs = (samples[samples.len() - 1].timestamp_ns - samples[0].timestamp_ns) as f64 / 1e9;
        let sample_rate_hz = (n - 1) as f64 / span_secs;

        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(n);
        let mut buffer: Vec<Complex64> = values.iter().map(|&v| Complex64::new(v, 0.0)).collect();
        fft.process(&mut buffer);

        let bins = n / 2 + 1;
        let frequencies_hz = (0..bins)
            .map(|k| k as f64 * sample_rate_hz / n as f64)
            .collect();
        let magnitudes = buffer.iter().take(bins).map(|c| c.norm()).collect();

        Self {
            sample_rate_hz,
            frequencies_hz,
            magnitudes,
        }
    }
}

/// Resample onto `samples.len()` evenly spaced points spanning the window
///
/// Returns None when there is nothing to transform.
pub fn resample_uniform(samples: &[Sample]) -> Option<Vec<f64>> {
    let n = samples.len();
    if n < 2 {
        return None;
    }
    let t0 = samples[0].timestamp_ns as f64;
    let t1 = samples[n - 1].timestamp_ns as f64;
    if t1 <= t0 {
        return None;
    }

    let step = (t1 - t0) / (n - 1) as f64;
    let mut out = Vec::with_capacity(n);
    let mut seg = 0;
    for i in 0..n {
        let t = t0 + step * i as f64;
        while seg + 2 < n && (samples[seg + 1].timestamp_ns as f64) < t {
            seg += 1;
        }
        let a = samples[seg];
        let b = samples[seg + 1];
        let (ta, tb) = (a.timestamp_ns as f64, b.timestamp_ns as f64);
        let value = if tb > ta {
            let frac = ((t - ta) / (tb - ta)).clamp(0.0, 1.0);
            a.value + (b.value - a.value) * frac
        } else {
            b.value
        };
        out.push(value);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn test_too_few_samples() {
        assert!(Spectrum::compute(&[]).is_empty());
        assert!(Spectrum::compute(&[Sample::new(0, 1.0)]).is_empty());
        assert!(Spectrum::compute(&[Sample::new(5, 1.0), Sample::new(5, 2.0)]).is_empty());
    }

    #[test]
    fn test_resample_irregular() {
        // Linear ramp with jittered timestamps stays a linear ramp
        let samples = vec![
            Sample::new(0, 0.0),
            Sample::new(7, 7.0),
            Sample::new(10, 10.0),
            Sample::new(30, 30.0),
        ];
        let values = resample_uniform(&samples).unwrap();
        assert_eq!(values.len(), 4);
        for (i, v) in values.iter().enumerate() {
            assert!((v - 10.0 * i as f64).abs() < 1e-9);
        }
    }

    #[test]
    fn test_sine_peak() {
        // 5 Hz sine sampled at 100 Hz for ~1.28 s
        let samples: Vec<Sample> = (0..128)
            .map(|i| {
                let t = i as f64 / 100.0;
                Sample::new((t * 1e9).round() as u64, (2.0 * PI * 5.0 * t).sin())
            })
            .collect();
        let spectrum = Spectrum::compute(&samples);
        assert_eq!(spectrum.magnitudes.len(), 65);
        assert_eq!(spectrum.frequencies_hz.len(), 65);
        assert!((spectrum.sample_rate_hz - 100.0).abs() < 1e-6);

        let peak = spectrum.peak_frequency().unwrap();
        let resolution = spectrum.sample_rate_hz / 128.0;
        assert!((peak - 5.0).abs() <= resolution);
    }

    #[test]
    fn test_dc_signal() {
        let samples: Vec<Sample> = (0..16).map(|i| Sample::new(i * 1_000_000, 2.0)).collect();
        let spectrum = Spectrum::compute(&samples);
        assert!((spectrum.magnitudes[0] - 32.0).abs() < 1e-9);
        assert!(spectrum.magnitudes[1..].iter().all(|m| m.abs() < 1e-9));
    }
}
