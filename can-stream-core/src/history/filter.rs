//! Causal IIR filtering of signal history
//!
//! Filters are cascades of second-order sections (biquads) in Direct Form II
//! Transposed. Lowpass and highpass use the two sections of a 4th-order
//! Butterworth response; bandpass cascades two constant-gain bandpass sections
//! centred on the cutoff.

use crate::types::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

/// Q of the two sections of a 4th-order Butterworth filter
const BUTTERWORTH_Q: [f64; 2] = [0.541_196_100_146_197, 1.306_562_964_876_376_5];

/// Filter response kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    #[default]
    Lowpass,
    Highpass,
    Bandpass,
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterKind::Lowpass => write!(f, "lowpass"),
            FilterKind::Highpass => write!(f, "highpass"),
            FilterKind::Bandpass => write!(f, "bandpass"),
        }
    }
}

/// A single biquad section
///
/// Transfer function: H(z) = (b0 + b1*z^-1 + b2*z^-2) / (1 + a1*z^-1 + a2*z^-2)
#[derive(Debug, Clone)]
struct Biquad {
    b: [f64; 3],
    a: [f64; 2],
    state: [f64; 2],
}

impl Biquad {
    /// Design one section from the audio-EQ cookbook formulas
    fn design(kind: FilterKind, cutoff_hz: f64, sample_rate: f64, q: f64) -> Self {
        let w0 = 2.0 * PI * cutoff_hz / sample_rate;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let alpha = sin_w0 / (2.0 * q);

        let b = match kind {
            FilterKind::Lowpass => [(1.0 - cos_w0) / 2.0, 1.0 - cos_w0, (1.0 - cos_w0) / 2.0],
            FilterKind::Highpass => [(1.0 + cos_w0) / 2.0, -(1.0 + cos_w0), (1.0 + cos_w0) / 2.0],
            FilterKind::Bandpass => [alpha, 0.0, -alpha],
        };
        let a0 = 1.0 + alpha;

        Self {
            b: [b[0] / a0, b[1] / a0, b[2] / a0],
            a: [-2.0 * cos_w0 / a0, (1.0 - alpha) / a0],
            state: [0.0; 2],
        }
    }

    fn process(&mut self, input: f64) -> f64 {
        let output = self.b[0] * input + self.state[0];
        self.state[0] = self.b[1] * input - self.a[0] * output + self.state[1];
        self.state[1] = self.b[2] * input - self.a[1] * output;
        output
    }
}

/// Cascade of biquad sections
#[derive(Debug, Clone)]
pub struct IirFilter {
    sections: Vec<Biquad>,
}

impl IirFilter {
    /// Design a filter for the given kind, cutoff and reference sample rate
    ///
    /// The cutoff must lie strictly between 0 and the Nyquist frequency.
    pub fn design(kind: FilterKind, cutoff_hz: f64, sample_rate: f64) -> Result<Self> {
        let nyquist = sample_rate / 2.0;
        if !(cutoff_hz > 0.0 && cutoff_hz < nyquist) {
            return Err(PipelineError::InvalidFilter(format!(
                "{} cutoff {} Hz must be inside (0, {:.3}) Hz for a {:.3} Hz sample rate",
                kind, cutoff_hz, nyquist, sample_rate
            )));
        }

        let qs = match kind {
            FilterKind::Lowpass | FilterKind::Highpass => BUTTERWORTH_Q,
            FilterKind::Bandpass => [std::f64::consts::FRAC_1_SQRT_2; 2],
        };
        let sections = qs
            .iter()
            .map(|&q| Biquad::design(kind, cutoff_hz, sample_rate, q))
            .collect();
        Ok(Self { sections })
    }

    /// Run one sample through the cascade
    pub fn process(&mut self, input: f64) -> f64 {
        self.sections
            .iter_mut()
            .fold(input, |x, section| section.process(x))
    }

    /// Filter a block; output length equals input length
    pub fn process_block(&mut self, input: &[f64]) -> Vec<f64> {
        input.iter().map(|&x| self.process(x)).collect()
    }
}

/// Causal trailing moving average; output length equals input length
///
/// The first `width - 1` outputs average over the samples seen so far.
pub fn moving_average(values: &[f64], width: usize) -> Vec<f64> {
    let width = width.max(1);
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for (i, &v) in values.iter().enumerate() {
        sum += v;
        if i >= width {
            sum -= values[i - width];
        }
        out.push(sum / (i + 1).min(width) as f64);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, fs: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f64 / fs).sin())
            .collect()
    }

    fn tail_amplitude(values: &[f64]) -> f64 {
        values[values.len() / 2..]
            .iter()
            .fold(0.0f64, |m, v| m.max(v.abs()))
    }

    #[test]
    fn test_invalid_cutoff() {
        assert!(IirFilter::design(FilterKind::Lowpass, 0.0, 100.0).is_err());
        assert!(IirFilter::design(FilterKind::Lowpass, 50.0, 100.0).is_err());
        assert!(IirFilter::design(FilterKind::Highpass, f64::NAN, 100.0).is_err());
        assert!(IirFilter::design(FilterKind::Bandpass, 10.0, 100.0).is_ok());
    }

    #[test]
    fn test_lowpass_passes_dc_and_blocks_high() {
        let mut lp = IirFilter::design(FilterKind::Lowpass, 5.0, 100.0).unwrap();
        let out = lp.process_block(&[1.0; 400]);
        assert_eq!(out.len(), 400);
        assert!((out[399] - 1.0).abs() < 1e-6);

        let mut lp = IirFilter::design(FilterKind::Lowpass, 5.0, 100.0).unwrap();
        let out = lp.process_block(&sine(40.0, 100.0, 400));
        assert!(tail_amplitude(&out) < 0.01);
    }

    #[test]
    fn test_highpass_blocks_dc() {
        let mut hp = IirFilter::design(FilterKind::Highpass, 5.0, 100.0).unwrap();
        let out = hp.process_block(&[1.0; 400]);
        assert!(out[399].abs() < 1e-6);

        let mut hp = IirFilter::design(FilterKind::Highpass, 5.0, 100.0).unwrap();
        let out = hp.process_block(&sine(30.0, 100.0, 400));
        assert!(tail_amplitude(&out) > 0.9);
    }

    #[test]
    fn test_bandpass_centre_gain() {
        let mut bp = IirFilter::design(FilterKind::Bandpass, 10.0, 1000.0).unwrap();
        let out = bp.process_block(&sine(10.0, 1000.0, 2000));
        assert!((tail_amplitude(&out) - 1.0).abs() < 0.02);

        let mut bp = IirFilter::design(FilterKind::Bandpass, 10.0, 1000.0).unwrap();
        let out = bp.process_block(&[1.0; 2000]);
        assert!(out[1999].abs() < 1e-6);
    }

    #[test]
    fn test_moving_average() {
        let out = moving_average(&[1.0, 2.0, 3.0, 4.0, 5.0], 2);
        assert_eq!(out, vec![1.0, 1.5, 2.5, 3.5, 4.5]);
        assert_eq!(moving_average(&[], 3), Vec::<f64>::new());
        assert_eq!(moving_average(&[2.0, 4.0], 0), vec![2.0, 4.0]);
    }
}
