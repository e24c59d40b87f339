//! A single trigger: conditions, combination logic, and its state machine

use super::condition::{Condition, ConditionConfig, ConditionKind};
use crate::events::TriggerFiredEvent;
use crate::types::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// How a trigger combines its conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Logic {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

/// What happens to a trigger after it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Fire once, then disable until re-enabled or reset
    SingleShot,
    /// Re-arm after every fire
    #[default]
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    Disabled,
    Armed,
    Fired,
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerState::Disabled => write!(f, "disabled"),
            TriggerState::Armed => write!(f, "armed"),
            TriggerState::Fired => write!(f, "fired"),
        }
    }
}

/// Action a consumer should take when the trigger fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerAction {
    StartRecording,
    StopRecording,
    CaptureSnapshot,
    Emit,
}

/// Declarative trigger definition (TOML `[[triggers]]` entries)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub name: String,
    #[serde(default)]
    pub logic: Logic,
    #[serde(default)]
    pub mode: TriggerMode,
    pub conditions: Vec<ConditionConfig>,
    #[serde(default)]
    pub actions: Vec<TriggerAction>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl TriggerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            logic: Logic::And,
            mode: TriggerMode::Continuous,
            conditions: Vec::new(),
            actions: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_logic(mut self, logic: Logic) -> Self {
        self.logic = logic;
        self
    }

    pub fn single_shot(mut self) -> Self {
        self.mode = TriggerMode::SingleShot;
        self
    }

    pub fn with_condition(mut self, signal: &str, kind: ConditionKind, threshold: Option<f64>) -> Self {
        self.conditions.push(ConditionConfig::new(signal, kind, threshold));
        self
    }

    pub fn with_action(mut self, action: TriggerAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::InvalidTriggerConfiguration(
                "trigger name is empty".to_string(),
            ));
        }
        if self.conditions.is_empty() {
            return Err(PipelineError::InvalidTriggerConfiguration(format!(
                "trigger '{}' has no conditions",
                self.name
            )));
        }
        for condition in &self.conditions {
            condition.validate().map_err(|e| match e {
                PipelineError::InvalidTriggerConfiguration(msg) => {
                    PipelineError::InvalidTriggerConfiguration(format!("trigger '{}': {}", self.name, msg))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    /// Distinct signal names, in first-use order
    pub fn referenced_signals(&self) -> Vec<String> {
        let mut signals: Vec<String> = Vec::new();
        for condition in &self.conditions {
            if !signals.contains(&condition.signal) {
                signals.push(condition.signal.clone());
            }
        }
        signals
    }
}

/// Read-only snapshot of a trigger for display
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerStatus {
    pub name: String,
    pub state: TriggerState,
    pub mode: TriggerMode,
    pub logic: Logic,
    pub fire_count: u64,
    pub last_fired_ns: Option<u64>,
    pub conditions: Vec<String>,
}

/// Runtime trigger
#[derive(Debug, Clone)]
pub struct Trigger {
    config: TriggerConfig,
    conditions: Vec<Condition>,
    signals: Vec<String>,
    state: TriggerState,
    fire_count: u64,
    last_fired_ns: Option<u64>,
}

impl Trigger {
    pub fn from_config(config: TriggerConfig) -> Result<Self> {
        config.validate()?;
        let conditions = config
            .conditions
            .iter()
            .map(Condition::from_config)
            .collect::<Result<Vec<_>>>()?;
        let signals = config.referenced_signals();
        let state = if config.enabled {
            TriggerState::Armed
        } else {
            TriggerState::Disabled
        };
        Ok(Self {
            config,
            conditions,
            signals,
            state,
            fire_count: 0,
            last_fired_ns: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn fire_count(&self) -> u64 {
        self.fire_count
    }

    pub fn referenced_signals(&self) -> &[String] {
        &self.signals
    }

    /// Evaluate against the latest value of every signal
    ///
    /// Only armed triggers are evaluated. All conditions run so each keeps its
    /// previous-value memory current; a condition whose signal has no value
    /// yet is false and leaves its memory alone.
    pub fn evaluate(&mut self, latest: &HashMap<String, f64>, timestamp_ns: u64) -> Option<TriggerFiredEvent> {
        if self.state != TriggerState::Armed {
            return None;
        }

        let results: Vec<bool> = self
            .conditions
            .iter_mut()
            .map(|condition| match latest.get(condition.signal()) {
                Some(&value) => condition.evaluate(value),
                None => false,
            })
            .collect();

        let fired = match self.config.logic {
            Logic::And => results.iter().all(|&r| r),
            Logic::Or => results.iter().any(|&r| r),
        };
        if !fired {
            return None;
        }

        self.state = TriggerState::Fired;
        self.fire_count += 1;
        self.last_fired_ns = Some(timestamp_ns);

        let signal_values: BTreeMap<String, f64> = self
            .signals
            .iter()
            .filter_map(|s| latest.get(s).map(|&v| (s.clone(), v)))
            .collect();
        log::debug!(
            "Trigger '{}' fired (#{}) at {} ns",
            self.config.name,
            self.fire_count,
            timestamp_ns
        );

        self.state = match self.config.mode {
            TriggerMode::SingleShot => TriggerState::Disabled,
            TriggerMode::Continuous => TriggerState::Armed,
        };

        Some(TriggerFiredEvent {
            trigger_name: self.config.name.clone(),
            fired_at_ns: timestamp_ns,
            fire_count: self.fire_count,
            signal_values,
            actions: self.config.actions.clone(),
        })
    }

    /// Arm and clear condition memory
    pub fn enable(&mut self) {
        self.clear_memory();
        self.state = TriggerState::Armed;
    }

    pub fn disable(&mut self) {
        self.state = TriggerState::Disabled;
    }

    /// Re-arm, clearing condition memory and the fire counter
    pub fn reset(&mut self) {
        self.clear_memory();
        self.fire_count = 0;
        self.last_fired_ns = None;
        self.state = TriggerState::Armed;
    }

    fn clear_memory(&mut self) {
        for condition in &mut self.conditions {
            condition.reset();
        }
    }

    pub fn status(&self) -> TriggerStatus {
        TriggerStatus {
            name: self.config.name.clone(),
            state: self.state,
            mode: self.config.mode,
            logic: self.config.logic,
            fire_count: self.fire_count,
            last_fired_ns: self.last_fired_ns,
            conditions: self.conditions.iter().map(|c| c.to_string()).collect(),
        }
    }
}
