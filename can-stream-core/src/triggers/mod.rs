//! Trigger evaluation engine
//!
//! Triggers are indexed by the signals their conditions reference, so each
//! decoded sample only touches the triggers that could change because of it.
//! The engine also keeps the latest value of every signal it has seen; a
//! multi-signal trigger evaluates its other conditions against those values.

pub mod condition;
pub mod trigger;

pub use condition::{Condition, ConditionConfig, ConditionKind, EQUALITY_TOLERANCE};
pub use trigger::{Logic, Trigger, TriggerAction, TriggerConfig, TriggerMode, TriggerState, TriggerStatus};

use crate::events::TriggerFiredEvent;
use crate::signals::FrameDatabase;
use crate::types::{DecodedSample, PipelineError, Result};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct TriggerEngine {
    triggers: HashMap<String, Trigger>,
    /// Insertion order, used for status listings and evaluation order
    order: Vec<String>,
    /// Signal name -> names of triggers referencing it
    index: HashMap<String, Vec<String>>,
    latest: HashMap<String, f64>,
}

impl TriggerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an engine from a list of configs, failing on the first invalid one
    pub fn from_configs(configs: impl IntoIterator<Item = TriggerConfig>) -> Result<Self> {
        let mut engine = Self::new();
        for config in configs {
            engine.add_trigger(config)?;
        }
        Ok(engine)
    }

    pub fn add_trigger(&mut self, config: TriggerConfig) -> Result<()> {
        if self.triggers.contains_key(&config.name) {
            return Err(PipelineError::InvalidTriggerConfiguration(format!(
                "duplicate trigger name '{}'",
                config.name
            )));
        }
        let trigger = Trigger::from_config(config)?;
        let name = trigger.name().to_string();

        for signal in trigger.referenced_signals() {
            self.index.entry(signal.clone()).or_default().push(name.clone());
        }
        log::debug!(
            "Added trigger '{}' on {:?}",
            name,
            trigger.referenced_signals()
        );
        self.order.push(name.clone());
        self.triggers.insert(name, trigger);
        Ok(())
    }

    /// Reject triggers that reference signals missing from the database
    pub fn validate_signals(&self, database: &FrameDatabase) -> Result<()> {
        for name in &self.order {
            let Some(trigger) = self.triggers.get(name) else {
                continue;
            };
            if let Some(missing) = trigger
                .referenced_signals()
                .iter()
                .find(|s| !database.contains_signal(s))
            {
                return Err(PipelineError::InvalidTriggerConfiguration(format!(
                    "trigger '{}' references unknown signal '{}'",
                    name, missing
                )));
            }
        }
        Ok(())
    }

    pub fn remove_trigger(&mut self, name: &str) -> Result<TriggerConfig> {
        let trigger = self
            .triggers
            .remove(name)
            .ok_or_else(|| PipelineError::TriggerNotFound(name.to_string()))?;
        self.order.retain(|n| n != name);
        for signal in trigger.referenced_signals() {
            if let Some(names) = self.index.get_mut(signal) {
                names.retain(|n| n != name);
                if names.is_empty() {
                    self.index.remove(signal);
                }
            }
        }
        Ok(trigger.config().clone())
    }

    fn trigger_mut(&mut self, name: &str) -> Result<&mut Trigger> {
        self.triggers
            .get_mut(name)
            .ok_or_else(|| PipelineError::TriggerNotFound(name.to_string()))
    }

    pub fn enable(&mut self, name: &str) -> Result<()> {
        self.trigger_mut(name)?.enable();
        Ok(())
    }

    pub fn disable(&mut self, name: &str) -> Result<()> {
        self.trigger_mut(name)?.disable();
        Ok(())
    }

    pub fn reset(&mut self, name: &str) -> Result<()> {
        self.trigger_mut(name)?.reset();
        Ok(())
    }

    pub fn reset_all(&mut self) {
        for trigger in self.triggers.values_mut() {
            trigger.reset();
        }
    }

    pub fn get(&self, name: &str) -> Option<&Trigger> {
        self.triggers.get(name)
    }

    /// Feed one decoded sample; returns the events of every trigger that fired
    pub fn evaluate(&mut self, sample: &DecodedSample) -> Vec<TriggerFiredEvent> {
        self.latest.insert(sample.name.clone(), sample.value);

        let Some(names) = self.index.get(&sample.name) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        for name in names {
            if let Some(trigger) = self.triggers.get_mut(name) {
                if let Some(event) = trigger.evaluate(&self.latest, sample.timestamp_ns) {
                    events.push(event);
                }
            }
        }
        events
    }

    /// Latest value seen for a signal
    pub fn latest_value(&self, signal: &str) -> Option<f64> {
        self.latest.get(signal).copied()
    }

    /// Snapshot of every trigger, in insertion order
    pub fn status(&self) -> Vec<TriggerStatus> {
        self.order
            .iter()
            .filter_map(|name| self.triggers.get(name))
            .map(Trigger::status)
            .collect()
    }

    pub fn trigger_names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}
