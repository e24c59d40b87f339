//! Presentation loop
//!
//! Runs on the main thread while ingestion runs on its own. At every refresh it
//! drains frame taps into the recorder and traffic counters, and acts on fired
//! triggers.

use crate::config::{RecordingConfig, SignalSelection};
use crate::traffic::{TrafficStats, TrafficSummary};
use anyhow::{Context, Result};
use can_stream_core::recorder::default_file_name;
use can_stream_core::{
    CsvRecorder, FrameRecord, IngestionHandle, Pipeline, Sample, SessionReport, Statistics,
    TriggerAction, TriggerFiredEvent, TriggerStatus, Window,
};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::{Duration, Instant};

/// How many identifiers the traffic summary lists
const BUSIEST_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub refresh: Duration,
    /// Stop the session after this long; otherwise run until the source ends
    pub duration: Option<Duration>,
    pub recording: Option<RecordingConfig>,
    pub display_signals: Vec<String>,
    pub bitrate: u32,
}

#[derive(Debug, Serialize)]
pub struct SignalSummary {
    pub name: String,
    pub statistics: Option<Statistics>,
    /// Statistics of the configured filter's output over the analysis window
    pub filtered: Option<Statistics>,
    pub peak_frequency_hz: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct Summary {
    pub session: SessionReport,
    pub traffic: TrafficSummary,
    pub signals: Vec<SignalSummary>,
    pub triggers: Vec<TriggerStatus>,
    pub events: usize,
    pub recordings: Vec<PathBuf>,
    pub snapshots: Vec<PathBuf>,
}

#[derive(Serialize)]
struct Snapshot<'a> {
    trigger: &'a str,
    fired_at_ns: u64,
    fire_count: u64,
    signal_values: &'a BTreeMap<String, f64>,
    windows: BTreeMap<String, Vec<Sample>>,
    filtered: BTreeMap<String, Vec<Sample>>,
}

pub struct Monitor<'a> {
    pipeline: &'a Pipeline,
    options: MonitorOptions,
    events: Receiver<TriggerFiredEvent>,
    frames: Receiver<FrameRecord>,
    pending: VecDeque<TriggerFiredEvent>,
    recorder: CsvRecorder,
    traffic: TrafficStats,
    events_seen: usize,
    recordings: Vec<PathBuf>,
    snapshots: Vec<PathBuf>,
}

impl<'a> Monitor<'a> {
    /// Subscribe to the pipeline; call before starting the session
    pub fn new(pipeline: &'a Pipeline, options: MonitorOptions) -> Self {
        Self {
            pipeline,
            events: pipeline.subscribe_events(),
            frames: pipeline.subscribe_frames(),
            pending: VecDeque::new(),
            recorder: CsvRecorder::new(),
            traffic: TrafficStats::new(options.bitrate),
            options,
            events_seen: 0,
            recordings: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    /// Drive the session until it ends or the duration elapses
    pub fn run(&mut self, handle: IngestionHandle) -> Result<Summary> {
        if self.options.recording.as_ref().is_some_and(|r| r.auto_start) {
            self.start_recording()?;
        }

        let started = Instant::now();
        let report = loop {
            thread::sleep(self.options.refresh);
            self.poll()?;

            if handle.is_finished() {
                break handle.join();
            }
            if self.options.duration.is_some_and(|d| started.elapsed() >= d) {
                log::info!("Session duration reached, stopping");
                break handle.stop();
            }
        };

        // Frames processed between the last refresh and the stop
        self.poll()?;
        if report.counters.dropped_deliveries > 0 {
            log::warn!(
                "{} frame record(s) or event(s) were dropped; raise pipeline.subscriber_capacity",
                report.counters.dropped_deliveries
            );
        }
        self.flush_events()?;
        self.stop_recording()?;
        Ok(self.summary(report))
    }

    /// One refresh: forward frames and act on fired triggers in timestamp order
    ///
    /// Events are published before their frame reaches the tap, so an event
    /// newer than every frame drained so far waits for the next refresh.
    pub fn poll(&mut self) -> Result<()> {
        let records: Vec<FrameRecord> = self.frames.try_iter().collect();
        self.pending.extend(self.events.try_iter());

        for record in &records {
            self.traffic.record(&record.frame);
            if self.recorder.is_recording() {
                if let Err(e) = self.recorder.record(record) {
                    log::warn!("Recording failed, stopping: {}", e);
                    self.stop_recording()?;
                }
            }
            while let Some(event) = self
                .pending
                .front()
                .filter(|e| e.fired_at_ns <= record.frame.timestamp_ns)
                .cloned()
            {
                self.pending.pop_front();
                self.handle_event(&event)?;
            }
        }
        Ok(())
    }

    /// Act on every event still waiting for its frame
    fn flush_events(&mut self) -> Result<()> {
        while let Some(event) = self.pending.pop_front() {
            self.handle_event(&event)?;
        }
        Ok(())
    }

    fn handle_event(&mut self, event: &TriggerFiredEvent) -> Result<()> {
        self.events_seen += 1;
        log::info!(
            "Trigger '{}' fired at {:.6}s (#{})",
            event.trigger_name,
            event.fired_at_ns as f64 / 1e9,
            event.fire_count
        );

        for action in &event.actions {
            match action {
                TriggerAction::StartRecording => {
                    if !self.recorder.is_recording() {
                        self.start_recording()?;
                    }
                }
                TriggerAction::StopRecording => self.stop_recording()?,
                TriggerAction::CaptureSnapshot => {
                    let path = self.write_snapshot(event)?;
                    log::info!("Snapshot written to {}", path.display());
                    self.snapshots.push(path);
                }
                TriggerAction::Emit => {
                    let values: Vec<String> = event
                        .signal_values
                        .iter()
                        .map(|(name, value)| format!("{}={}", name, value))
                        .collect();
                    log::info!("[{}] {}", event.trigger_name, values.join(" "));
                }
            }
        }
        Ok(())
    }

    fn output_dir(&self) -> PathBuf {
        self.options
            .recording
            .as_ref()
            .map_or_else(|| PathBuf::from("recordings"), |r| r.output_dir.clone())
    }

    fn start_recording(&mut self) -> Result<()> {
        let Some(recording) = self.options.recording.as_ref() else {
            log::warn!("Recording requested but no [recording] section is configured");
            return Ok(());
        };
        let columns = match &recording.signals {
            SignalSelection::All(_) => CsvRecorder::all_columns(&self.pipeline.database()),
            SignalSelection::List(list) => list.clone(),
        };
        // Default names have one-second resolution
        let file_name = match self.recordings.len() {
            0 => default_file_name(),
            n => default_file_name().replace(".csv", &format!("_{}.csv", n)),
        };
        let path = self
            .recorder
            .start(&recording.output_dir, Some(&file_name), recording.mode, columns)
            .context("Failed to start recording")?;
        self.recordings.push(path);
        Ok(())
    }

    fn stop_recording(&mut self) -> Result<()> {
        if self.recorder.is_recording() {
            self.recorder.stop().context("Failed to finish recording")?;
        }
        Ok(())
    }

    /// Write the configured window of every signal the trigger references
    fn write_snapshot(&self, event: &TriggerFiredEvent) -> Result<PathBuf> {
        let window = self.pipeline.config().analysis_window();
        let windows = event
            .signal_values
            .keys()
            .filter_map(|name| {
                self.pipeline
                    .history()
                    .window(name, window)
                    .map(|samples| (name.clone(), samples))
            })
            .collect();
        let filtered = event
            .signal_values
            .keys()
            .filter_map(|name| self.filtered(name).map(|samples| (name.clone(), samples)))
            .collect();
        let snapshot = Snapshot {
            trigger: &event.trigger_name,
            fired_at_ns: event.fired_at_ns,
            fire_count: event.fire_count,
            signal_values: &event.signal_values,
            windows,
            filtered,
        };

        let dir = self.output_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create snapshot directory {:?}", dir))?;
        let path = dir.join(format!(
            "snapshot_{}_{}.json",
            sanitize(&event.trigger_name),
            event.fired_at_ns
        ));
        fs::write(&path, serde_json::to_string_pretty(&snapshot)?)
            .with_context(|| format!("Failed to write snapshot {:?}", path))?;
        Ok(path)
    }

    /// Configured filter view; a window too short or too slow for the cutoff yields None
    fn filtered(&self, signal: &str) -> Option<Vec<Sample>> {
        match self.pipeline.filtered(signal) {
            Ok(samples) => samples,
            Err(e) => {
                log::debug!("No filtered view of {}: {}", signal, e);
                None
            }
        }
    }

    pub fn summary(&self, session: SessionReport) -> Summary {
        let names = if self.options.display_signals.is_empty() {
            self.pipeline.history().signal_names()
        } else {
            self.options.display_signals.clone()
        };
        let signals = names
            .into_iter()
            .map(|name| SignalSummary {
                statistics: self.pipeline.statistics(&name, Window::All),
                filtered: self.filtered(&name).and_then(|s| Statistics::compute(&s)),
                peak_frequency_hz: self.pipeline.spectrum(&name).and_then(|s| s.peak_frequency()),
                name,
            })
            .collect();

        Summary {
            session,
            traffic: self.traffic.summary(BUSIEST_LIMIT),
            signals,
            triggers: self.pipeline.trigger_status(),
            events: self.events_seen,
            recordings: self.recordings.clone(),
            snapshots: self.snapshots.clone(),
        }
    }

    pub fn traffic(&self) -> &TrafficStats {
        &self.traffic
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.*}", precision, v))
}

/// Human-readable end-of-session report
pub fn print_summary(summary: &Summary) {
    let counters = &summary.session.counters;

    println!("═══════════════════════════════════════════════");
    println!("  CAN Stream - Session Summary");
    println!("═══════════════════════════════════════════════\n");
    println!("Ended:    {:?} after {:.1}s", summary.session.end, summary.session.duration.as_secs_f64());
    println!(
        "Frames:   {} ({} unknown, {} malformed, {} error, {} filtered)",
        counters.frames,
        counters.unknown_frames,
        counters.malformed_frames,
        counters.error_frames,
        counters.filtered_frames
    );
    println!(
        "Samples:  {} ({} rejected), {} trigger event(s)",
        counters.samples, counters.rejected_samples, counters.events_fired
    );
    if counters.dropped_deliveries > 0 {
        println!(
            "Dropped:  {} frame record(s) or event(s) for slow consumers",
            counters.dropped_deliveries
        );
    }
    println!(
        "Bus:      {} Hz, load {}%",
        fmt_opt(summary.traffic.frame_rate_hz, 1),
        fmt_opt(summary.traffic.bus_load_percent, 1)
    );

    if !summary.traffic.busiest.is_empty() {
        println!("\nBusiest identifiers:");
        for id in &summary.traffic.busiest {
            println!(
                "  0x{:03X}  {:>8} frame(s)  {:>8} Hz",
                id.can_id,
                id.count,
                fmt_opt(id.rate_hz(), 1)
            );
        }
    }

    if !summary.signals.is_empty() {
        println!("\nSignals:");
        println!(
            "  {:<24} {:>8} {:>12} {:>12} {:>12} {:>12} {:>12} {:>10}",
            "name", "count", "mean", "min", "max", "std", "filt std", "peak Hz"
        );
        for signal in &summary.signals {
            match &signal.statistics {
                Some(stats) => println!(
                    "  {:<24} {:>8} {:>12.3} {:>12.3} {:>12.3} {:>12.3} {:>12} {:>10}",
                    signal.name,
                    stats.count,
                    stats.mean,
                    stats.min,
                    stats.max,
                    stats.std_dev,
                    fmt_opt(signal.filtered.map(|f| f.std_dev), 3),
                    fmt_opt(signal.peak_frequency_hz, 2)
                ),
                None => println!("  {:<24} {:>8}", signal.name, "no data"),
            }
        }
    }

    if !summary.triggers.is_empty() {
        println!("\nTriggers:");
        for trigger in &summary.triggers {
            println!(
                "  {:<24} {:<8} fired {} time(s)  [{:?} {}]",
                trigger.name,
                trigger.state.to_string(),
                trigger.fire_count,
                trigger.logic,
                trigger.conditions.join(", ")
            );
        }
    }

    for path in &summary.recordings {
        println!("\nRecording: {}", path.display());
    }
    for path in &summary.snapshots {
        println!("Snapshot:  {}", path.display());
    }
}
