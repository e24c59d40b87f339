//! Per-identifier traffic counters and a bus load estimate

use can_stream_core::CanFrame;
use serde::Serialize;
use std::collections::HashMap;

/// Frame overhead in bits without stuffing (SOF, arbitration, control, CRC, ACK, EOF, IFS)
const STANDARD_OVERHEAD_BITS: u64 = 47;
const EXTENDED_OVERHEAD_BITS: u64 = 67;

/// Approximate on-wire size of a frame
pub fn frame_bits(frame: &CanFrame) -> u64 {
    let overhead = if frame.is_extended {
        EXTENDED_OVERHEAD_BITS
    } else {
        STANDARD_OVERHEAD_BITS
    };
    overhead + 8 * frame.dlc() as u64
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IdStats {
    pub can_id: u32,
    pub count: u64,
    pub bytes: u64,
    pub first_ns: u64,
    pub last_ns: u64,
}

impl IdStats {
    /// Average rate over the span between the first and last frame
    pub fn rate_hz(&self) -> Option<f64> {
        if self.count < 2 || self.last_ns <= self.first_ns {
            return None;
        }
        let span = (self.last_ns - self.first_ns) as f64 / 1e9;
        Some((self.count - 1) as f64 / span)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrafficSummary {
    pub frames: u64,
    pub error_frames: u64,
    pub bytes: u64,
    pub frame_rate_hz: Option<f64>,
    pub bus_load_percent: Option<f64>,
    pub busiest: Vec<IdStats>,
}

#[derive(Debug)]
pub struct TrafficStats {
    bitrate: u32,
    per_id: HashMap<u32, IdStats>,
    frames: u64,
    error_frames: u64,
    bits: u64,
    first_ns: Option<u64>,
    last_ns: u64,
}

impl TrafficStats {
    pub fn new(bitrate: u32) -> Self {
        Self {
            bitrate,
            per_id: HashMap::new(),
            frames: 0,
            error_frames: 0,
            bits: 0,
            first_ns: None,
            last_ns: 0,
        }
    }

    pub fn record(&mut self, frame: &CanFrame) {
        self.frames += 1;
        self.first_ns.get_or_insert(frame.timestamp_ns);
        self.last_ns = self.last_ns.max(frame.timestamp_ns);
        self.bits += frame_bits(frame);

        if frame.is_error_frame {
            self.error_frames += 1;
            return;
        }

        let entry = self.per_id.entry(frame.can_id).or_insert_with(|| IdStats {
            can_id: frame.can_id,
            first_ns: frame.timestamp_ns,
            ..IdStats::default()
        });
        entry.count += 1;
        entry.bytes += frame.dlc() as u64;
        entry.last_ns = frame.timestamp_ns;
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn id_stats(&self, can_id: u32) -> Option<&IdStats> {
        self.per_id.get(&can_id)
    }

    fn span_secs(&self) -> Option<f64> {
        let first = self.first_ns?;
        (self.last_ns > first).then(|| (self.last_ns - first) as f64 / 1e9)
    }

    /// Share of the nominal bitrate used over the observed span, capped at 100
    pub fn bus_load_percent(&self) -> Option<f64> {
        if self.bitrate == 0 {
            return None;
        }
        let span = self.span_secs()?;
        let load = self.bits as f64 / span / self.bitrate as f64 * 100.0;
        Some(load.min(100.0))
    }

    /// Identifiers ordered by frame count, highest first
    pub fn busiest(&self, limit: usize) -> Vec<IdStats> {
        let mut ids: Vec<IdStats> = self.per_id.values().cloned().collect();
        ids.sort_by(|a, b| b.count.cmp(&a.count).then(a.can_id.cmp(&b.can_id)));
        ids.truncate(limit);
        ids
    }

    pub fn summary(&self, limit: usize) -> TrafficSummary {
        TrafficSummary {
            frames: self.frames,
            error_frames: self.error_frames,
            bytes: self.per_id.values().map(|s| s.bytes).sum(),
            frame_rate_hz: self.span_secs().map(|span| self.frames.saturating_sub(1) as f64 / span),
            bus_load_percent: self.bus_load_percent(),
            busiest: self.busiest(limit),
        }
    }
}
