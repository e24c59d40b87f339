//! Ingestion loop and the pipeline that owns the shared state
//!
//! One dedicated thread reads frames from a `HardwareSource`, decodes them,
//! records every sample in the history store, feeds it to the trigger engine,
//! and publishes fired events. Everything else (display, recording, analysis)
//! reads the shared state from other threads.
//!
//! The per-frame order is fixed: decode, then for each sample `record`
//! followed by `evaluate`. A trigger therefore always sees a history that
//! already contains the sample that fired it.

use crate::config::PipelineConfig;
use crate::decoder;
use crate::events::{offer, Delivery, EventBus, TriggerFiredEvent};
use crate::history::{Sample, SignalHistoryStore, Spectrum, Statistics, Window};
use crate::signals::FrameDatabase;
use crate::source::HardwareSource;
use crate::triggers::{TriggerConfig, TriggerEngine, TriggerStatus};
use crate::types::{CanFrame, DecodedFrame, PipelineError, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Running totals for the current session
#[derive(Debug, Default)]
pub struct IngestCounters {
    frames: AtomicU64,
    samples: AtomicU64,
    unknown_frames: AtomicU64,
    malformed_frames: AtomicU64,
    error_frames: AtomicU64,
    filtered_frames: AtomicU64,
    timeouts: AtomicU64,
    read_errors: AtomicU64,
    rejected_samples: AtomicU64,
    events_fired: AtomicU64,
    dropped_deliveries: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl IngestCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            frames: get(&self.frames),
            samples: get(&self.samples),
            unknown_frames: get(&self.unknown_frames),
            malformed_frames: get(&self.malformed_frames),
            error_frames: get(&self.error_frames),
            filtered_frames: get(&self.filtered_frames),
            timeouts: get(&self.timeouts),
            read_errors: get(&self.read_errors),
            rejected_samples: get(&self.rejected_samples),
            events_fired: get(&self.events_fired),
            dropped_deliveries: get(&self.dropped_deliveries),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.frames,
            &self.samples,
            &self.unknown_frames,
            &self.malformed_frames,
            &self.error_frames,
            &self.filtered_frames,
            &self.timeouts,
            &self.read_errors,
            &self.rejected_samples,
            &self.events_fired,
            &self.dropped_deliveries,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time copy of `IngestCounters`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    /// Frames read from the source, including error and filtered frames
    pub frames: u64,
    /// Samples accepted into the history store
    pub samples: u64,
    pub unknown_frames: u64,
    /// Frames with at least one signal skipped for a short payload
    pub malformed_frames: u64,
    pub error_frames: u64,
    /// Frames dropped by the message filter
    pub filtered_frames: u64,
    pub timeouts: u64,
    pub read_errors: u64,
    /// Samples refused for a non-monotonic timestamp
    pub rejected_samples: u64,
    pub events_fired: u64,
    /// Frame records and events skipped because a subscriber was full
    pub dropped_deliveries: u64,
}

/// Raw frame plus its decode result, forwarded to frame taps (recorders)
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub frame: CanFrame,
    /// None for error frames and frames unknown to the database
    pub decoded: Option<DecodedFrame>,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionEnd {
    /// A stop was requested
    Stopped,
    /// The source reported it is gone
    Disconnected(String),
    /// The ingestion thread panicked
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub counters: CounterSnapshot,
    pub duration: Duration,
}

#[derive(Debug)]
struct Shared {
    database: RwLock<Arc<FrameDatabase>>,
    history: Arc<SignalHistoryStore>,
    triggers: Mutex<TriggerEngine>,
    events: Arc<EventBus>,
    counters: IngestCounters,
    frame_taps: Mutex<Vec<SyncSender<FrameRecord>>>,
    running: AtomicBool,
}

impl Shared {
    fn database(&self) -> Arc<FrameDatabase> {
        self.database
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Clears the running flag when the ingestion thread exits, even by panic
struct RunningGuard(Arc<Shared>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

/// The streaming pipeline: shared state plus session control
#[derive(Debug)]
pub struct Pipeline {
    shared: Arc<Shared>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(database: FrameDatabase, config: PipelineConfig) -> Self {
        let shared = Shared {
            database: RwLock::new(Arc::new(database)),
            history: Arc::new(SignalHistoryStore::new(config.history_capacity)),
            triggers: Mutex::new(TriggerEngine::new()),
            events: Arc::new(
                EventBus::new(config.event_log_capacity)
                    .with_subscriber_capacity(config.subscriber_capacity),
            ),
            counters: IngestCounters::default(),
            frame_taps: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        };
        Self {
            shared: Arc::new(shared),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Database used by the next (or current) session
    pub fn database(&self) -> Arc<FrameDatabase> {
        self.shared.database()
    }

    /// Swap the frame database; refused while a session is running
    pub fn replace_database(&self, database: FrameDatabase) -> Result<()> {
        let mut current = self
            .shared
            .database
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_running() {
            return Err(PipelineError::IngestionActive);
        }
        log::info!(
            "Replaced frame database ({} frames)",
            database.stats().num_frames
        );
        *current = Arc::new(database);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn history(&self) -> &Arc<SignalHistoryStore> {
        &self.shared.history
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.shared.events
    }

    pub fn subscribe_events(&self) -> Receiver<TriggerFiredEvent> {
        self.shared.events.subscribe()
    }

    /// Receive every frame read from now on, with its decode result
    ///
    /// A tap holding `subscriber_capacity` undrained records misses new ones;
    /// the misses show up in `dropped_deliveries`.
    pub fn subscribe_frames(&self) -> Receiver<FrameRecord> {
        let (tx, rx) = mpsc::sync_channel(self.config.subscriber_capacity.max(1));
        lock(&self.shared.frame_taps).push(tx);
        rx
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.shared.counters.snapshot()
    }

    /// Run a closure with exclusive access to the trigger engine
    pub fn with_triggers<R>(&self, f: impl FnOnce(&mut TriggerEngine) -> R) -> R {
        f(&mut lock(&self.shared.triggers))
    }

    pub fn add_trigger(&self, config: TriggerConfig) -> Result<()> {
        self.with_triggers(|engine| engine.add_trigger(config))
    }

    /// Reject triggers referencing signals the current database does not define
    pub fn validate_triggers(&self) -> Result<()> {
        let database = self.database();
        self.with_triggers(|engine| engine.validate_signals(&database))
    }

    pub fn trigger_status(&self) -> Vec<TriggerStatus> {
        self.with_triggers(|engine| engine.status())
    }

    pub fn statistics(&self, signal: &str, window: Window) -> Option<Statistics> {
        self.shared.history.statistics(signal, window)
    }

    /// Spectrum over the configured analysis window
    pub fn spectrum(&self, signal: &str) -> Option<Spectrum> {
        self.shared
            .history
            .spectrum(signal, self.config.analysis_window())
    }

    /// Configured filter over the configured analysis window
    pub fn filtered(&self, signal: &str) -> Result<Option<Vec<Sample>>> {
        self.shared.history.filtered(
            signal,
            self.config.analysis_window(),
            self.config.filter_kind,
            self.config.filter_cutoff_hz,
        )
    }

    /// Start a session on a dedicated thread
    ///
    /// Counters are reset; history, triggers and subscriptions carry over.
    pub fn start<S>(&self, mut source: S) -> Result<IngestionHandle>
    where
        S: HardwareSource + 'static,
    {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PipelineError::IngestionActive);
        }

        self.shared.counters.reset();
        let ingest = IngestionLoop::new(self);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let guard = RunningGuard(Arc::clone(&self.shared));

        let spawned = thread::Builder::new()
            .name("can-ingest".to_string())
            .spawn(move || {
                let _guard = guard;
                log::info!("Ingestion started on {}", source.describe());
                let end = ingest.run(&mut source, &thread_stop);
                log::info!("Ingestion ended: {:?}", end);
                end
            });

        // A failed spawn drops the closure, and the guard with it
        let thread = spawned?;
        Ok(IngestionHandle {
            shared: Arc::clone(&self.shared),
            stop,
            thread: Some(thread),
            started: Instant::now(),
        })
    }
}

/// The body of the ingestion thread
///
/// Public so that callers can drive a source on a thread of their own, or
/// feed frames one at a time with `process_frame`.
#[derive(Debug)]
pub struct IngestionLoop {
    shared: Arc<Shared>,
    database: Arc<FrameDatabase>,
    config: PipelineConfig,
}

impl IngestionLoop {
    /// Bind to a pipeline, capturing its current database
    pub fn new(pipeline: &Pipeline) -> Self {
        Self {
            shared: Arc::clone(&pipeline.shared),
            database: pipeline.database(),
            config: pipeline.config.clone(),
        }
    }

    /// Read until `stop` is set or the source disconnects
    ///
    /// `stop` is checked between reads, so a stop takes effect within one read
    /// timeout.
    pub fn run<S>(&self, source: &mut S, stop: &AtomicBool) -> SessionEnd
    where
        S: HardwareSource + ?Sized,
    {
        let timeout = self.config.read_timeout();
        let counters = &self.shared.counters;

        while !stop.load(Ordering::Acquire) {
            match source.read(timeout) {
                Ok(frame) => self.process_frame(frame),
                Err(PipelineError::HardwareReadTimeout) => bump(&counters.timeouts),
                Err(PipelineError::HardwareDisconnected(reason)) => {
                    log::warn!("{} disconnected: {}", source.describe(), reason);
                    return SessionEnd::Disconnected(reason);
                }
                Err(e) => {
                    bump(&counters.read_errors);
                    log::warn!("Read error on {}: {}", source.describe(), e);
                }
            }
        }
        SessionEnd::Stopped
    }

    /// Decode one frame and push its samples through history and triggers
    pub fn process_frame(&self, frame: CanFrame) {
        let counters = &self.shared.counters;
        bump(&counters.frames);

        if frame.is_error_frame {
            bump(&counters.error_frames);
            log::trace!("Error frame at {} ns", frame.timestamp_ns);
            self.forward(FrameRecord { frame, decoded: None });
            return;
        }
        if !self.config.should_process_message(frame.can_id) {
            bump(&counters.filtered_frames);
            return;
        }

        let decoded = match decoder::decode(&frame, &self.database) {
            Ok(decoded) => decoded,
            Err(e) => {
                bump(&counters.unknown_frames);
                log::trace!("{}", e);
                self.forward(FrameRecord { frame, decoded: None });
                return;
            }
        };
        log::trace!(
            "Frame 0x{:X} at {} ns: {} signal(s)",
            frame.can_id,
            frame.timestamp_ns,
            decoded.samples.len()
        );
        if !decoded.skipped.is_empty() {
            bump(&counters.malformed_frames);
        }

        {
            let mut triggers = lock(&self.shared.triggers);
            for sample in &decoded.samples {
                if let Err(e) = self
                    .shared
                    .history
                    .record(&sample.name, sample.timestamp_ns, sample.value)
                {
                    bump(&counters.rejected_samples);
                    log::warn!("{}", e);
                    continue;
                }
                bump(&counters.samples);

                for event in triggers.evaluate(sample) {
                    bump(&counters.events_fired);
                    let dropped = self.shared.events.publish(event);
                    counters.dropped_deliveries.fetch_add(dropped, Ordering::Relaxed);
                }
            }
        }

        self.forward(FrameRecord {
            frame,
            decoded: Some(decoded),
        });
    }

    fn forward(&self, record: FrameRecord) {
        let mut taps = lock(&self.shared.frame_taps);
        taps.retain(|tx| match offer(tx, record.clone()) {
            Delivery::Sent => true,
            Delivery::Dropped => {
                bump(&self.shared.counters.dropped_deliveries);
                true
            }
            Delivery::Closed => false,
        });
    }
}

/// Control handle for a running session
///
/// Dropping the handle stops the session and waits for the thread.
#[derive(Debug)]
pub struct IngestionHandle {
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<SessionEnd>>,
    started: Instant,
}

impl IngestionHandle {
    /// Ask the loop to stop without waiting
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// True once the ingestion thread has exited
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.shared.counters.snapshot()
    }

    /// Stop the session and wait for the thread
    pub fn stop(mut self) -> SessionReport {
        self.request_stop();
        self.wait()
    }

    /// Wait for the session to end on its own (disconnect)
    pub fn join(mut self) -> SessionReport {
        self.wait()
    }

    fn wait(&mut self) -> SessionReport {
        let end = match self.thread.take() {
            Some(thread) => thread
                .join()
                .unwrap_or_else(|_| SessionEnd::Aborted("ingestion thread panicked".to_string())),
            None => SessionEnd::Stopped,
        };
        SessionReport {
            end,
            counters: self.shared.counters.snapshot(),
            duration: self.started.elapsed(),
        }
    }
}

impl Drop for IngestionHandle {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{FrameDefinition, SignalDescriptor};
    use crate::source::VirtualBus;
    use crate::triggers::ConditionKind;

    fn database() -> FrameDatabase {
        let mut db = FrameDatabase::new();
        db.add_frame(
            FrameDefinition::new(0x100, "Vehicle", 4)
                .with_signal(SignalDescriptor::new("Speed", 0, 16).with_scaling(0.1, 0.0))
                .with_signal(SignalDescriptor::new("Gear", 16, 8)),
        )
        .unwrap();
        db
    }

    fn frame(ts: u64, speed_raw: u16, gear: u8) -> CanFrame {
        let [lo, hi] = speed_raw.to_le_bytes();
        CanFrame::new(ts, 0x100, vec![lo, hi, gear, 0])
    }

    #[test]
    fn test_process_frame_records_then_evaluates() {
        let pipeline = Pipeline::new(database(), PipelineConfig::default());
        pipeline
            .add_trigger(TriggerConfig::new("fast").with_condition("Speed", ConditionKind::GreaterThan, Some(50.0)))
            .unwrap();
        let events = pipeline.subscribe_events();
        let ingest = IngestionLoop::new(&pipeline);

        ingest.process_frame(frame(1_000, 400, 2));
        ingest.process_frame(frame(2_000, 600, 3));

        let event = events.try_recv().unwrap();
        assert_eq!(event.trigger_name, "fast");
        assert_eq!(event.fired_at_ns, 2_000);
        assert!(events.try_recv().is_err());

        let history = pipeline.history();
        assert_eq!(history.sample_count("Speed"), 2);
        assert_eq!(history.latest("Gear").unwrap().value, 3.0);

        let counters = pipeline.counters();
        assert_eq!(counters.frames, 2);
        assert_eq!(counters.samples, 4);
        assert_eq!(counters.events_fired, 1);
    }

    #[test]
    fn test_unknown_malformed_and_error_frames_are_counted() {
        let pipeline = Pipeline::new(database(), PipelineConfig::default());
        let ingest = IngestionLoop::new(&pipeline);

        ingest.process_frame(CanFrame::new(1, 0x555, vec![0; 8]));
        ingest.process_frame(CanFrame::new(2, 0x100, vec![0x10, 0x00]));
        ingest.process_frame(CanFrame::error(3));
        ingest.process_frame(frame(4, 100, 1));

        let counters = pipeline.counters();
        assert_eq!(counters.frames, 4);
        assert_eq!(counters.unknown_frames, 1);
        assert_eq!(counters.malformed_frames, 1);
        assert_eq!(counters.error_frames, 1);
        // Speed from the short frame, then Speed and Gear
        assert_eq!(counters.samples, 3);
        assert_eq!(pipeline.history().sample_count("Gear"), 1);
    }

    #[test]
    fn test_non_monotonic_sample_skips_triggers() {
        let pipeline = Pipeline::new(database(), PipelineConfig::default());
        pipeline
            .add_trigger(TriggerConfig::new("any").with_condition("Gear", ConditionKind::ValueChanged, None))
            .unwrap();
        let ingest = IngestionLoop::new(&pipeline);

        ingest.process_frame(frame(10, 0, 1));
        ingest.process_frame(frame(5, 0, 2));

        let counters = pipeline.counters();
        assert_eq!(counters.rejected_samples, 2);
        assert_eq!(counters.events_fired, 0);
        assert_eq!(pipeline.with_triggers(|t| t.latest_value("Gear")), Some(1.0));
    }

    #[test]
    fn test_message_filter() {
        let config = PipelineConfig::default().with_message_filter(vec![0x200]);
        let pipeline = Pipeline::new(database(), config);
        IngestionLoop::new(&pipeline).process_frame(frame(1, 1, 1));
        assert_eq!(pipeline.counters().filtered_frames, 1);
        assert!(pipeline.history().signal_names().is_empty());
    }

    #[test]
    fn test_frame_tap_receives_records() {
        let pipeline = Pipeline::new(database(), PipelineConfig::default());
        let taps = pipeline.subscribe_frames();
        let ingest = IngestionLoop::new(&pipeline);
        ingest.process_frame(frame(1, 10, 1));
        ingest.process_frame(CanFrame::new(2, 0x7FF, vec![]));

        let known = taps.try_recv().unwrap();
        assert_eq!(known.decoded.unwrap().samples.len(), 2);
        let unknown = taps.try_recv().unwrap();
        assert!(unknown.decoded.is_none());
    }

    #[test]
    fn test_undrained_subscribers_are_bounded() {
        let config = PipelineConfig::default().with_subscriber_capacity(2);
        let pipeline = Pipeline::new(database(), config);
        pipeline
            .add_trigger(TriggerConfig::new("any").with_condition("Gear", ConditionKind::GreaterThan, Some(0.0)))
            .unwrap();
        let taps = pipeline.subscribe_frames();
        let events = pipeline.subscribe_events();
        let ingest = IngestionLoop::new(&pipeline);

        for ts in 1..=5 {
            ingest.process_frame(frame(ts, 10, 1));
        }

        // 3 frame records and 3 events missed their full receivers
        let counters = pipeline.counters();
        assert_eq!(counters.frames, 5);
        assert_eq!(counters.events_fired, 5);
        assert_eq!(counters.dropped_deliveries, 6);
        assert_eq!(pipeline.events().dropped(), 3);

        let kept: Vec<u64> = taps.try_iter().map(|r| r.frame.timestamp_ns).collect();
        assert_eq!(kept, vec![1, 2]);
        assert_eq!(events.try_iter().count(), 2);

        // Draining makes room again
        ingest.process_frame(frame(6, 10, 1));
        assert_eq!(taps.try_recv().unwrap().frame.timestamp_ns, 6);
        assert_eq!(pipeline.history().sample_count("Gear"), 6);
    }

    #[test]
    fn test_single_session_and_database_lock() {
        let config = PipelineConfig::default().with_read_timeout(Duration::from_millis(10));
        let pipeline = Pipeline::new(database(), config);
        let (_bus, source) = VirtualBus::new();
        let (_bus2, source2) = VirtualBus::new();

        let handle = pipeline.start(source).unwrap();
        assert!(pipeline.is_running());
        assert!(matches!(pipeline.start(source2), Err(PipelineError::IngestionActive)));
        assert!(matches!(
            pipeline.replace_database(FrameDatabase::new()),
            Err(PipelineError::IngestionActive)
        ));

        let report = handle.stop();
        assert_eq!(report.end, SessionEnd::Stopped);
        assert!(!pipeline.is_running());
        pipeline.replace_database(FrameDatabase::new()).unwrap();
        assert!(pipeline.database().is_empty());
    }

    #[test]
    fn test_disconnect_ends_session() {
        let config = PipelineConfig::default().with_read_timeout(Duration::from_millis(10));
        let pipeline = Pipeline::new(database(), config);
        let (bus, source) = VirtualBus::new();
        bus.send(frame(1, 10, 1)).unwrap();
        drop(bus);

        let report = pipeline.start(source).unwrap().join();
        assert!(matches!(report.end, SessionEnd::Disconnected(_)));
        assert_eq!(report.counters.frames, 1);
    }
}
