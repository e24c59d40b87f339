//! Core types for the CAN stream pipeline
//!
//! This module defines the frames the pipeline consumes, the samples the decoder
//! emits, and the single error type shared by every stage.

use serde::{Deserialize, Serialize};

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Raw CAN frame as delivered by a hardware source
///
/// Immutable once received. The timestamp is monotonic, not wall-clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    /// Monotonic arrival timestamp in nanoseconds
    pub timestamp_ns: u64,
    /// CAN message ID (11-bit or 29-bit)
    pub can_id: u32,
    /// Frame data bytes (0-8 bytes for classic CAN)
    pub data: Vec<u8>,
    /// True if this is an extended (29-bit) CAN ID
    pub is_extended: bool,
    /// True if this is an error frame
    pub is_error_frame: bool,
}

/// Largest classic CAN payload in bytes
pub const MAX_DATA_LEN: usize = 8;

impl CanFrame {
    /// Create a standard data frame
    pub fn new(timestamp_ns: u64, can_id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp_ns,
            can_id,
            data: data.into(),
            is_extended: can_id > 0x7FF,
            is_error_frame: false,
        }
    }

    /// Create an error frame
    pub fn error(timestamp_ns: u64) -> Self {
        Self {
            timestamp_ns,
            can_id: 0,
            data: Vec::new(),
            is_extended: false,
            is_error_frame: true,
        }
    }

    /// Get the data length code (DLC) - number of data bytes
    pub fn dlc(&self) -> usize {
        self.data.len()
    }

    /// Timestamp in seconds
    pub fn timestamp_secs(&self) -> f64 {
        ns_to_secs(self.timestamp_ns)
    }
}

/// Convert a nanosecond timestamp to fractional seconds
pub fn ns_to_secs(timestamp_ns: u64) -> f64 {
    timestamp_ns as f64 / 1_000_000_000.0
}

/// One decoded signal value, produced by the decoder and copied into the
/// history store and trigger engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedSample {
    /// Signal name from the frame database
    pub name: String,
    /// Physical value (`raw * factor + offset`)
    pub value: f64,
    /// Raw integer value before scaling
    pub raw_value: i64,
    /// Timestamp of the frame that carried the signal
    pub timestamp_ns: u64,
    /// Value table label matching the raw value, if any
    pub label: Option<String>,
    /// Engineering unit (e.g., "km/h", "°C", "V")
    pub unit: Option<String>,
}

/// A signal that could not be decoded because the payload was too short
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedSignal {
    pub name: String,
    pub required_bytes: usize,
    pub actual_bytes: usize,
}

/// Everything the decoder produced for one frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedFrame {
    pub timestamp_ns: u64,
    pub can_id: u32,
    /// Frame name from the database (None for error frames)
    pub frame_name: Option<String>,
    /// Successfully decoded signals, in database order
    pub samples: Vec<DecodedSample>,
    /// Signals skipped because the payload was too short
    pub skipped: Vec<SkippedSignal>,
}

impl DecodedFrame {
    /// The `MalformedFrame` indication for this frame, if any signal was skipped
    pub fn malformed(&self) -> Option<PipelineError> {
        let first = self.skipped.first()?;
        Some(PipelineError::MalformedFrame {
            can_id: self.can_id,
            signal: first.name.clone(),
            required: first.required_bytes,
            actual: first.actual_bytes,
        })
    }

    /// Look up a decoded sample by signal name
    pub fn sample(&self, name: &str) -> Option<&DecodedSample> {
        self.samples.iter().find(|s| s.name == name)
    }
}

/// Errors that can occur anywhere in the pipeline
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Unknown frame: CAN ID 0x{0:X}")]
    UnknownFrame(u32),

    #[error("Malformed frame 0x{can_id:X}: signal '{signal}' needs {required} bytes, payload has {actual}")]
    MalformedFrame {
        can_id: u32,
        signal: String,
        required: usize,
        actual: usize,
    },

    #[error("Hardware read timed out")]
    HardwareReadTimeout,

    #[error("Hardware disconnected: {0}")]
    HardwareDisconnected(String),

    #[error("Invalid trigger configuration: {0}")]
    InvalidTriggerConfiguration(String),

    #[error("Trigger not found: {0}")]
    TriggerNotFound(String),

    #[error("Invalid signal definition: {0}")]
    InvalidSignalDefinition(String),

    #[error("Failed to parse DBC file: {0}")]
    DbcParseError(String),

    #[error("Sample for '{signal}' at {timestamp_ns} ns is older than newest stored sample at {newest_ns} ns")]
    NonMonotonicTimestamp {
        signal: String,
        timestamp_ns: u64,
        newest_ns: u64,
    },

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Operation not allowed while ingestion is running")]
    IngestionActive,

    #[error("Recorder error: {0}")]
    RecorderError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether the ingestion loop can keep going after this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, PipelineError::HardwareDisconnected(_))
    }
}
