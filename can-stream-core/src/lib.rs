//! CAN Stream Core Library
//!
//! Real-time decoding, buffering, analysis and triggering of CAN bus traffic.
//!
//! # Architecture
//!
//! Frames flow through a single ingestion thread:
//! - A [`HardwareSource`] delivers raw frames with a bounded read timeout
//! - The decoder turns each frame into physical signal samples using a
//!   [`FrameDatabase`] (built in code or loaded from DBC)
//! - Every sample is appended to the [`SignalHistoryStore`], then fed to the
//!   [`TriggerEngine`]
//! - Fired triggers are published on the [`EventBus`]
//!
//! Presentation code reads history snapshots, statistics, spectra and filtered
//! views from any thread while ingestion continues.
//!
//! # Example Usage
//!
//! ```no_run
//! use can_stream_core::signals::dbc::load_dbc_file;
//! use can_stream_core::{ConditionKind, Pipeline, PipelineConfig, TriggerConfig, VirtualBus, Window};
//! use std::path::Path;
//!
//! let database = load_dbc_file(Path::new("vehicle.dbc")).unwrap();
//! let pipeline = Pipeline::new(database, PipelineConfig::default());
//! pipeline
//!     .add_trigger(
//!         TriggerConfig::new("overspeed")
//!             .with_condition("VehicleSpeed", ConditionKind::RisingEdge, Some(120.0)),
//!     )
//!     .unwrap();
//!
//! let events = pipeline.subscribe_events();
//! let (bus, source) = VirtualBus::new();
//! let handle = pipeline.start(source).unwrap();
//!
//! bus.send_now(0x100, &[0x10, 0x27, 0, 0, 0, 0, 0, 0]).unwrap();
//!
//! for event in events.try_iter() {
//!     println!("{} fired at {} ns", event.trigger_name, event.fired_at_ns);
//! }
//! if let Some(stats) = pipeline.statistics("VehicleSpeed", Window::All) {
//!     println!("mean speed {:.1}", stats.mean);
//! }
//!
//! let report = handle.stop();
//! println!("{} frames", report.counters.frames);
//! ```

// Public modules
pub mod config;
pub mod decoder;
pub mod events;
pub mod history;
pub mod ingest;
pub mod recorder;
pub mod signals;
pub mod source;
pub mod triggers;
pub mod types;

// Internal modules (not exposed in public API)
mod message_decoder;

// Re-export main types for convenience
pub use config::{PipelineConfig, WindowConfig};
pub use decoder::{decode, encode, Decoder};
pub use events::{EventBus, EventLog, TriggerFiredEvent};
pub use history::{FilterKind, Sample, SignalHistoryStore, Spectrum, Statistics, Window};
pub use ingest::{
    CounterSnapshot, FrameRecord, IngestCounters, IngestionHandle, IngestionLoop, Pipeline,
    SessionEnd, SessionReport,
};
pub use recorder::{read_raw_csv, CsvRecorder, RawCsvReader, RecorderStatus, RecordingMode};
pub use signals::{DatabaseStats, FrameDatabase, FrameDefinition, SignalDescriptor};
pub use source::{HardwareSource, VirtualBus, VirtualSource};
pub use triggers::{
    ConditionConfig, ConditionKind, Logic, TriggerAction, TriggerConfig, TriggerEngine,
    TriggerMode, TriggerState, TriggerStatus,
};
pub use types::{CanFrame, DecodedFrame, DecodedSample, PipelineError, Result, MAX_DATA_LEN};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
