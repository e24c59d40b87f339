//! Signal history store
//!
//! Owns one bounded ring buffer per signal name, created lazily on the first
//! sample. Writes come from the ingestion thread; reads (windows, statistics,
//! spectra, filters) come from the presentation thread.
//!
//! Each buffer sits behind its own `RwLock`, so a slow analytical read of one
//! signal never stalls ingestion of another. The outer map is write-locked only
//! to insert a newly seen signal. Readers copy a snapshot under the read lock
//! and run the analysis after releasing it.

pub mod filter;
pub mod ring;
pub mod spectrum;
pub mod stats;

pub use filter::{FilterKind, IirFilter};
pub use ring::{RingBuffer, Sample, Window};
pub use spectrum::Spectrum;
pub use stats::Statistics;

use crate::types::{PipelineError, Result};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Default per-signal capacity
pub const DEFAULT_HISTORY_CAPACITY: usize = 10_000;

type SharedBuffer = Arc<RwLock<RingBuffer>>;

/// Per-signal rolling history
#[derive(Debug)]
pub struct SignalHistoryStore {
    buffers: RwLock<HashMap<String, SharedBuffer>>,
    capacity: usize,
}

// A panic while holding a lock cannot leave a ring buffer half-written
// (push is a pop_front + push_back), so poisoned locks are recovered.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl SignalHistoryStore {
    /// Create a store whose buffers each hold `capacity` samples
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Per-signal capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn buffer(&self, signal: &str) -> Option<SharedBuffer> {
        read(&self.buffers).get(signal).cloned()
    }

    fn buffer_or_create(&self, signal: &str) -> SharedBuffer {
        if let Some(buffer) = self.buffer(signal) {
            return buffer;
        }
        let mut buffers = write(&self.buffers);
        buffers
            .entry(signal.to_string())
            .or_insert_with(|| {
                log::debug!("Creating history buffer for '{}'", signal);
                Arc::new(RwLock::new(RingBuffer::new(self.capacity)))
            })
            .clone()
    }

    /// Append a sample, creating the signal's buffer on first use
    ///
    /// A sample older than the newest stored one is dropped with
    /// `NonMonotonicTimestamp`.
    pub fn record(&self, signal: &str, timestamp_ns: u64, value: f64) -> Result<()> {
        let buffer = self.buffer_or_create(signal);
        let mut ring = write(&buffer);
        ring.push(Sample::new(timestamp_ns, value))
            .map_err(|newest_ns| PipelineError::NonMonotonicTimestamp {
                signal: signal.to_string(),
                timestamp_ns,
                newest_ns,
            })
    }

    /// Copy of the selected samples, oldest first; None if the signal was never seen
    pub fn window(&self, signal: &str, window: Window) -> Option<Vec<Sample>> {
        let buffer = self.buffer(signal)?;
        let samples = read(&buffer).snapshot(window);
        Some(samples)
    }

    /// Newest sample of a signal
    pub fn latest(&self, signal: &str) -> Option<Sample> {
        let buffer = self.buffer(signal)?;
        let latest = read(&buffer).latest();
        latest
    }

    /// Descriptive statistics; None for an unknown signal or an empty window
    pub fn statistics(&self, signal: &str, window: Window) -> Option<Statistics> {
        Statistics::compute(&self.window(signal, window)?)
    }

    /// Magnitude spectrum; None for an unknown signal, empty for < 2 samples
    pub fn spectrum(&self, signal: &str, window: Window) -> Option<Spectrum> {
        Some(Spectrum::compute(&self.window(signal, window)?))
    }

    /// Causal filter over the window, using its average sample rate
    ///
    /// Output has the same length and timestamps as the input. With fewer than
    /// two samples (or a window spanning no time) the input is returned as is.
    pub fn filtered(
        &self,
        signal: &str,
        window: Window,
        kind: FilterKind,
        cutoff_hz: f64,
    ) -> Result<Option<Vec<Sample>>> {
        let Some(samples) = self.window(signal, window) else {
            return Ok(None);
        };
        let Some(sample_rate) = stats::average_sample_rate(&samples) else {
            return Ok(Some(samples));
        };

        let mut filter = IirFilter::design(kind, cutoff_hz, sample_rate)?;
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        let filtered = samples
            .iter()
            .zip(filter.process_block(&values))
            .map(|(s, v)| Sample::new(s.timestamp_ns, v))
            .collect();
        Ok(Some(filtered))
    }

    /// Trailing moving average over the window
    pub fn moving_average(&self, signal: &str, window: Window, width: usize) -> Option<Vec<Sample>> {
        let samples = self.window(signal, window)?;
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        let averaged = filter::moving_average(&values, width);
        Some(
            samples
                .iter()
                .zip(averaged)
                .map(|(s, v)| Sample::new(s.timestamp_ns, v))
                .collect(),
        )
    }

    /// Number of buffered samples (0 for an unknown signal)
    pub fn sample_count(&self, signal: &str) -> usize {
        self.buffer(signal).map(|b| read(&b).len()).unwrap_or(0)
    }

    /// Names of all signals seen so far, sorted
    pub fn signal_names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.buffers).keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop all samples of one signal (the buffer itself is kept)
    pub fn clear_signal(&self, signal: &str) {
        if let Some(buffer) = self.buffer(signal) {
            write(&buffer).clear();
        }
    }

    /// Forget every signal
    pub fn clear_all(&self) {
        write(&self.buffers).clear();
    }
}

impl Default for SignalHistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
