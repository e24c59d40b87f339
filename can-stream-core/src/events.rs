//! Trigger event fan-out
//!
//! The ingestion thread publishes `TriggerFiredEvent`s; any number of consumers
//! subscribe with their own bounded `mpsc` receiver. Publishing never blocks:
//! an event for a full receiver is dropped and counted, and receivers that are
//! gone are pruned. A bounded log keeps the most recent events for consumers
//! that poll instead of subscribing.

use crate::triggers::TriggerAction;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 1000;

/// Queued items per subscriber before new ones are dropped
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 65_536;

/// Outcome of offering one item to a bounded subscriber
pub(crate) enum Delivery {
    Sent,
    Dropped,
    Closed,
}

pub(crate) fn offer<T>(tx: &SyncSender<T>, item: T) -> Delivery {
    match tx.try_send(item) {
        Ok(()) => Delivery::Sent,
        Err(TrySendError::Full(_)) => Delivery::Dropped,
        Err(TrySendError::Disconnected(_)) => Delivery::Closed,
    }
}

/// Emitted each time a trigger fires
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerFiredEvent {
    pub trigger_name: String,
    /// Timestamp of the sample that caused the fire
    pub fired_at_ns: u64,
    /// Fire count including this one
    pub fire_count: u64,
    /// Latest value of every signal the trigger references
    pub signal_values: BTreeMap<String, f64>,
    pub actions: Vec<TriggerAction>,
}

/// Bounded log of recent events, oldest evicted first
#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<TriggerFiredEvent>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, event: TriggerFiredEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn snapshot(&self) -> Vec<TriggerFiredEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn drain(&mut self) -> Vec<TriggerFiredEvent> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct EventBus {
    subscribers: Mutex<Vec<SyncSender<TriggerFiredEvent>>>,
    subscriber_capacity: usize,
    log: Mutex<EventLog>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            log: Mutex::new(EventLog::new(log_capacity)),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Builder method: queue depth of receivers created by `subscribe`
    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity.max(1);
        self
    }

    /// New receiver that gets every event published from now on
    ///
    /// Events that arrive while the receiver already holds
    /// `subscriber_capacity` undrained events are dropped for it.
    pub fn subscribe(&self) -> Receiver<TriggerFiredEvent> {
        let (tx, rx) = mpsc::sync_channel(self.subscriber_capacity);
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Deliver to every subscriber; returns how many full receivers missed it
    pub fn publish(&self, event: TriggerFiredEvent) -> u64 {
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut dropped = 0;
        {
            let mut subscribers = lock(&self.subscribers);
            let before = subscribers.len();
            subscribers.retain(|tx| match offer(tx, event.clone()) {
                Delivery::Sent => true,
                Delivery::Dropped => {
                    dropped += 1;
                    true
                }
                Delivery::Closed => false,
            });
            if subscribers.len() < before {
                log::trace!("Pruned {} closed event subscriber(s)", before - subscribers.len());
            }
        }
        if dropped > 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
            log::warn!(
                "Event '{}' dropped for {} full subscriber(s)",
                event.trigger_name,
                dropped
            );
        }
        lock(&self.log).push(event);
        dropped
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Total events published since creation
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Deliveries skipped because a subscriber was full, since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Copy of the recent-event log, oldest first
    pub fn recent(&self) -> Vec<TriggerFiredEvent> {
        lock(&self.log).snapshot()
    }

    /// Take and clear the recent-event log
    pub fn drain_log(&self) -> Vec<TriggerFiredEvent> {
        lock(&self.log).drain()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_LOG_CAPACITY)
    }
}
