//! Bounded per-signal sample buffer

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// One stored (timestamp, value) pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub timestamp_ns: u64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp_ns: u64, value: f64) -> Self {
        Self { timestamp_ns, value }
    }
}

/// Which part of a signal's history an operation looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Window {
    /// Everything currently buffered
    #[default]
    All,
    /// The newest `k` samples
    LastSamples(usize),
    /// Samples no older than this, measured back from the newest sample
    LastDuration(Duration),
}

/// Ring buffer of samples with non-decreasing timestamps
///
/// When full, pushing evicts the oldest sample.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest when full
    ///
    /// Returns the newest stored timestamp instead if `sample` is older than it.
    pub fn push(&mut self, sample: Sample) -> Result<(), u64> {
        if let Some(newest) = self.samples.back() {
            if sample.timestamp_ns < newest.timestamp_ns {
                return Err(newest.timestamp_ns);
            }
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        Ok(())
    }

    /// Copy out the samples selected by `window`, oldest first
    pub fn snapshot(&self, window: Window) -> Vec<Sample> {
        let start = match window {
            Window::All => 0,
            Window::LastSamples(k) => self.samples.len().saturating_sub(k),
            Window::LastDuration(span) => match self.samples.back() {
                None => 0,
                Some(newest) => {
                    let span_ns = u64::try_from(span.as_nanos()).unwrap_or(u64::MAX);
                    let cutoff = newest.timestamp_ns.saturating_sub(span_ns);
                    self.samples.partition_point(|s| s.timestamp_ns < cutoff)
                }
            },
        };
        self.samples.range(start..).copied().collect()
    }

    pub fn latest(&self) -> Option<Sample> {
        self.samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize, count: u64) -> RingBuffer {
        let mut ring = RingBuffer::new(capacity);
        for i in 0..count {
            ring.push(Sample::new(i * 1_000_000, i as f64)).unwrap();
        }
        ring
    }

    #[test]
    fn test_eviction_at_capacity() {
        let ring = filled(4, 5);
        assert_eq!(ring.len(), 4);
        let values: Vec<f64> = ring.snapshot(Window::All).iter().map(|s| s.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_rejects_older_timestamp() {
        let mut ring = filled(4, 2);
        assert_eq!(ring.push(Sample::new(0, 9.0)), Err(1_000_000));
        assert_eq!(ring.len(), 2);
        // Equal timestamps are allowed
        assert!(ring.push(Sample::new(1_000_000, 9.0)).is_ok());
    }

    #[test]
    fn test_windows() {
        let ring = filled(100, 10);
        assert_eq!(ring.snapshot(Window::LastSamples(3)).len(), 3);
        assert_eq!(ring.snapshot(Window::LastSamples(50)).len(), 10);
        assert_eq!(ring.snapshot(Window::LastSamples(0)).len(), 0);

        // Newest at 9 ms: a 2 ms window keeps 7, 8, 9 ms
        let recent = ring.snapshot(Window::LastDuration(Duration::from_millis(2)));
        let values: Vec<f64> = recent.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![7.0, 8.0, 9.0]);

        assert_eq!(ring.snapshot(Window::LastDuration(Duration::from_secs(60))).len(), 10);
        assert_eq!(ring.latest().unwrap().value, 9.0);
    }
}
