//! Pipeline configuration types
//!
//! Everything here has a default, so an empty TOML `[pipeline]` table (or no
//! table at all) yields a working pipeline.

use crate::history::{FilterKind, Window, DEFAULT_HISTORY_CAPACITY};
use crate::events::{DEFAULT_EVENT_LOG_CAPACITY, DEFAULT_SUBSCRIBER_CAPACITY};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Window selection as written in configuration files
///
/// `"all"`, `{ count = 1024 }` or `{ seconds = 2.0 }`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowConfig {
    All,
    Count(usize),
    Seconds(f64),
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig::Count(1024)
    }
}

impl WindowConfig {
    pub fn to_window(self) -> Window {
        match self {
            WindowConfig::All => Window::All,
            WindowConfig::Count(n) => Window::LastSamples(n),
            WindowConfig::Seconds(secs) => {
                Window::LastDuration(Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX))
            }
        }
    }
}

/// Configuration for the streaming pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Samples kept per signal
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Window used for spectra and filtered views
    #[serde(default)]
    pub spectrum_window: WindowConfig,

    #[serde(default)]
    pub filter_kind: FilterKind,

    #[serde(default = "default_filter_cutoff")]
    pub filter_cutoff_hz: f64,

    /// Bounded wait per hardware read; also bounds stop latency
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Recent trigger events kept for polling consumers
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,

    /// Queue depth of each event subscriber and frame tap
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,

    /// Optional: only decode these CAN message IDs
    #[serde(default)]
    pub message_filter: Option<Vec<u32>>,
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

fn default_filter_cutoff() -> f64 {
    10.0
}

fn default_read_timeout() -> u64 {
    100
}

fn default_event_log_capacity() -> usize {
    DEFAULT_EVENT_LOG_CAPACITY
}

fn default_subscriber_capacity() -> usize {
    DEFAULT_SUBSCRIBER_CAPACITY
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            spectrum_window: WindowConfig::default(),
            filter_kind: FilterKind::default(),
            filter_cutoff_hz: default_filter_cutoff(),
            read_timeout_ms: default_read_timeout(),
            event_log_capacity: default_event_log_capacity(),
            subscriber_capacity: default_subscriber_capacity(),
            message_filter: None,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set per-signal history capacity
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Builder method: set the analysis window
    pub fn with_spectrum_window(mut self, window: WindowConfig) -> Self {
        self.spectrum_window = window;
        self
    }

    /// Builder method: set the filter applied to filtered views
    pub fn with_filter(mut self, kind: FilterKind, cutoff_hz: f64) -> Self {
        self.filter_kind = kind;
        self.filter_cutoff_hz = cutoff_hz;
        self
    }

    /// Builder method: set the hardware read timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Builder method: set the event log capacity
    pub fn with_event_log_capacity(mut self, capacity: usize) -> Self {
        self.event_log_capacity = capacity;
        self
    }

    /// Builder method: set the queue depth of subscribers and frame taps
    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }

    /// Builder method: set message filter
    pub fn with_message_filter(mut self, messages: Vec<u32>) -> Self {
        self.message_filter = Some(messages);
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn analysis_window(&self) -> Window {
        self.spectrum_window.to_window()
    }

    /// Check if a message ID should be decoded
    pub fn should_process_message(&self, can_id: u32) -> bool {
        match &self.message_filter {
            Some(messages) => messages.contains(&can_id),
            None => true,
        }
    }
}
