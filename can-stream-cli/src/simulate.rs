//! Synthetic traffic for running without hardware
//!
//! Every frame of the database is sent round-robin. Each signal follows its own
//! slow sine wave across its declared range, or the range its raw bits cover.

use anyhow::{bail, Result};
use can_stream_core::{
    encode, CanFrame, FrameDatabase, FrameDefinition, HardwareSource, PipelineError,
    SignalDescriptor,
};
use can_stream_core::signals::ValueType;
use std::f64::consts::PI;
use std::thread;
use std::time::{Duration, Instant};

pub struct SimulatedSource {
    frames: Vec<FrameDefinition>,
    period: Duration,
    started: Instant,
    next_due: Instant,
    cursor: usize,
}

impl SimulatedSource {
    /// `rate_hz` is the total frame rate across all frames
    pub fn new(database: &FrameDatabase, rate_hz: f64) -> Result<Self> {
        let frames: Vec<FrameDefinition> = database.frames().cloned().collect();
        if frames.is_empty() {
            bail!("cannot simulate traffic without a frame database");
        }
        if !rate_hz.is_finite() || rate_hz <= 0.0 {
            bail!("simulation rate must be positive, got {}", rate_hz);
        }
        let Ok(period) = Duration::try_from_secs_f64(1.0 / rate_hz) else {
            bail!("simulation rate {} Hz is too low", rate_hz);
        };
        let now = Instant::now();
        Ok(Self {
            frames,
            period,
            started: now,
            next_due: now,
            cursor: 0,
        })
    }

    /// Physical range to sweep: the declared one, else what the raw bits can hold
    fn signal_range(signal: &SignalDescriptor) -> (f64, f64) {
        if signal.max > signal.min {
            return (signal.min, signal.max);
        }
        let bits = u32::from(signal.length.clamp(1, 63));
        let (raw_lo, raw_hi) = match signal.value_type {
            ValueType::Unsigned => (0i64, (1i64 << bits) - 1),
            ValueType::Signed => (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1),
        };
        let (a, b) = (signal.physical_from_raw(raw_lo), signal.physical_from_raw(raw_hi));
        (a.min(b), a.max(b))
    }

    /// Physical value of the `index`-th signal at `t` seconds
    fn signal_value(signal: &SignalDescriptor, index: usize, t: f64) -> f64 {
        let (lo, hi) = Self::signal_range(signal);
        let freq = 0.2 + 0.1 * index as f64;
        let unit = 0.5 + 0.5 * (2.0 * PI * freq * t).sin();
        lo + (hi - lo) * unit
    }

    fn build_frame(&self, timestamp_ns: u64) -> can_stream_core::Result<CanFrame> {
        let def = &self.frames[self.cursor];
        let t = timestamp_ns as f64 / 1e9;
        // Multiplexed signals are left at zero; only the base layout is driven
        let values: Vec<(&str, f64)> = def
            .signals
            .iter()
            .enumerate()
            .filter(|(_, s)| s.multiplexer.is_none() && def.multiplexer_signal.as_deref() != Some(s.name.as_str()))
            .map(|(i, s)| (s.name.as_str(), Self::signal_value(s, i, t)))
            .collect();
        let data = encode(def, &values)?;
        Ok(CanFrame::new(timestamp_ns, def.id, data))
    }
}

impl HardwareSource for SimulatedSource {
    fn read(&mut self, timeout: Duration) -> can_stream_core::Result<CanFrame> {
        let now = Instant::now();
        if self.next_due > now + timeout {
            thread::sleep(timeout);
            return Err(PipelineError::HardwareReadTimeout);
        }
        if self.next_due > now {
            thread::sleep(self.next_due - now);
        }

        let timestamp_ns =
            u64::try_from((self.next_due - self.started).as_nanos()).unwrap_or(u64::MAX);
        let frame = self.build_frame(timestamp_ns)?;
        self.cursor = (self.cursor + 1) % self.frames.len();
        self.next_due += self.period;
        Ok(frame)
    }

    fn describe(&self) -> String {
        format!("simulation of {} frame(s)", self.frames.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_stream_core::decode;

    fn database() -> FrameDatabase {
        let mut db = FrameDatabase::new();
        db.add_frame(
            FrameDefinition::new(0x100, "Engine", 8)
                .with_signal(SignalDescriptor::new("Rpm", 0, 16).with_range(0.0, 8000.0))
                .with_signal(SignalDescriptor::new("Load", 16, 8)),
        )
        .unwrap();
        db.add_frame(FrameDefinition::new(0x200, "Body", 8).with_signal(SignalDescriptor::new("Door", 0, 1)))
            .unwrap();
        db
    }

    #[test]
    fn test_round_robin_frames_decode() {
        let db = database();
        let mut sim = SimulatedSource::new(&db, 1000.0).unwrap();
        let timeout = Duration::from_millis(50);

        let frames: Vec<CanFrame> = (0..4).map(|_| sim.read(timeout).unwrap()).collect();
        let ids: Vec<u32> = frames.iter().map(|f| f.can_id).collect();
        assert_eq!(ids, vec![0x100, 0x200, 0x100, 0x200]);
        assert!(frames.windows(2).all(|w| w[0].timestamp_ns < w[1].timestamp_ns));

        let decoded = decode(&frames[0], &db).unwrap();
        let rpm = decoded.sample("Rpm").unwrap().value;
        assert!((0.0..=8000.0).contains(&rpm));
    }

    #[test]
    fn test_slow_rate_times_out() {
        let db = database();
        let mut sim = SimulatedSource::new(&db, 1.0).unwrap();
        let timeout = Duration::from_millis(5);
        assert!(sim.read(timeout).is_ok());
        assert!(matches!(sim.read(timeout), Err(PipelineError::HardwareReadTimeout)));
    }

    #[test]
    fn test_signal_range_fallback() {
        let declared = SignalDescriptor::new("Rpm", 0, 16).with_range(0.0, 8000.0);
        assert_eq!(SimulatedSource::signal_range(&declared), (0.0, 8000.0));

        let flag = SignalDescriptor::new("Door", 0, 1);
        assert_eq!(SimulatedSource::signal_range(&flag), (0.0, 1.0));

        let temp = SignalDescriptor::new("Temp", 0, 8).signed().with_scaling(0.5, 10.0);
        assert_eq!(SimulatedSource::signal_range(&temp), (-54.0, 73.5));
    }

    #[test]
    fn test_rejects_empty_database_and_bad_rate() {
        assert!(SimulatedSource::new(&FrameDatabase::new(), 10.0).is_err());
        assert!(SimulatedSource::new(&database(), 0.0).is_err());
        assert!(SimulatedSource::new(&database(), 1e-320).is_err());
    }
}
