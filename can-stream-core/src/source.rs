//! Hardware sources
//!
//! A source yields raw frames one at a time with a bounded wait, so the
//! ingestion loop can notice a stop request between reads.

use crate::types::{CanFrame, PipelineError, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::time::{Duration, Instant};

/// Anything that can deliver CAN frames to the ingestion loop
pub trait HardwareSource: Send {
    /// Wait up to `timeout` for the next frame
    ///
    /// Returns `HardwareReadTimeout` when nothing arrived and
    /// `HardwareDisconnected` when the source is gone for good.
    fn read(&mut self, timeout: Duration) -> Result<CanFrame>;

    /// Human-readable description for logs
    fn describe(&self) -> String {
        "hardware source".to_string()
    }
}

impl<S: HardwareSource + ?Sized> HardwareSource for Box<S> {
    fn read(&mut self, timeout: Duration) -> Result<CanFrame> {
        (**self).read(timeout)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// In-process bus: the sending half of a `VirtualSource`
///
/// Cloneable; the source disconnects once every bus handle is dropped.
#[derive(Debug, Clone)]
pub struct VirtualBus {
    tx: BusSender,
    epoch: Instant,
}

#[derive(Debug, Clone)]
enum BusSender {
    Unbounded(Sender<CanFrame>),
    Bounded(SyncSender<CanFrame>),
}

impl VirtualBus {
    /// Unbounded bus and its source
    pub fn new() -> (Self, VirtualSource) {
        let (tx, rx) = mpsc::channel();
        Self::from_parts(BusSender::Unbounded(tx), rx)
    }

    /// Bus that blocks the sender once `capacity` frames are queued
    pub fn bounded(capacity: usize) -> (Self, VirtualSource) {
        let (tx, rx) = mpsc::sync_channel(capacity);
        Self::from_parts(BusSender::Bounded(tx), rx)
    }

    fn from_parts(tx: BusSender, rx: Receiver<CanFrame>) -> (Self, VirtualSource) {
        let bus = Self {
            tx,
            epoch: Instant::now(),
        };
        (bus, VirtualSource { rx })
    }

    /// Queue a frame; fails with `HardwareDisconnected` if the source was dropped
    pub fn send(&self, frame: CanFrame) -> Result<()> {
        let sent = match &self.tx {
            BusSender::Unbounded(tx) => tx.send(frame).is_ok(),
            BusSender::Bounded(tx) => tx.send(frame).is_ok(),
        };
        if sent {
            Ok(())
        } else {
            Err(PipelineError::HardwareDisconnected(
                "virtual source dropped".to_string(),
            ))
        }
    }

    /// Queue a data frame stamped with the time since the bus was created
    pub fn send_now(&self, can_id: u32, data: &[u8]) -> Result<()> {
        let timestamp_ns = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.send(CanFrame::new(timestamp_ns, can_id, data.to_vec()))
    }
}

/// Receiving half of a `VirtualBus`
#[derive(Debug)]
pub struct VirtualSource {
    rx: Receiver<CanFrame>,
}

impl HardwareSource for VirtualSource {
    fn read(&mut self, timeout: Duration) -> Result<CanFrame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(PipelineError::HardwareReadTimeout),
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::HardwareDisconnected(
                "virtual bus closed".to_string(),
            )),
        }
    }

    fn describe(&self) -> String {
        "virtual bus".to_string()
    }
}
