//! Trigger conditions
//!
//! A condition compares one signal against a threshold, or against its own
//! previous value for the edge and change kinds. The previous value lives on
//! the condition itself, so edge detection does not depend on how much history
//! the store keeps.

use crate::types::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tolerance used by `Equal` / `NotEqual`
pub const EQUALITY_TOLERANCE: f64 = 1e-6;

/// Comparison performed by a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    #[serde(alias = ">")]
    GreaterThan,
    #[serde(alias = "<")]
    LessThan,
    #[serde(alias = "==")]
    Equal,
    #[serde(alias = "!=")]
    NotEqual,
    #[serde(alias = ">=")]
    GreaterOrEqual,
    #[serde(alias = "<=")]
    LessOrEqual,
    #[serde(alias = "rising")]
    RisingEdge,
    #[serde(alias = "falling")]
    FallingEdge,
    #[serde(alias = "change", alias = "changed")]
    ValueChanged,
}

impl ConditionKind {
    /// Every kind except `ValueChanged` compares against a threshold
    pub fn needs_threshold(self) -> bool {
        !matches!(self, ConditionKind::ValueChanged)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            ConditionKind::GreaterThan => ">",
            ConditionKind::LessThan => "<",
            ConditionKind::Equal => "==",
            ConditionKind::NotEqual => "!=",
            ConditionKind::GreaterOrEqual => ">=",
            ConditionKind::LessOrEqual => "<=",
            ConditionKind::RisingEdge => "rising",
            ConditionKind::FallingEdge => "falling",
            ConditionKind::ValueChanged => "changed",
        }
    }
}

/// Configured form of a condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub signal: String,
    pub kind: ConditionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl ConditionConfig {
    pub fn new(signal: impl Into<String>, kind: ConditionKind, threshold: Option<f64>) -> Self {
        Self {
            signal: signal.into(),
            kind,
            threshold,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.signal.trim().is_empty() {
            return Err(PipelineError::InvalidTriggerConfiguration(
                "condition references no signal".to_string(),
            ));
        }
        match (self.kind.needs_threshold(), self.threshold) {
            (true, None) => Err(PipelineError::InvalidTriggerConfiguration(format!(
                "condition '{} {}' needs a threshold",
                self.signal,
                self.kind.symbol()
            ))),
            (true, Some(t)) if !t.is_finite() => Err(PipelineError::InvalidTriggerConfiguration(
                format!("condition on '{}' has non-finite threshold {}", self.signal, t),
            )),
            _ => Ok(()),
        }
    }
}

/// Runtime condition with its previous-value memory
#[derive(Debug, Clone)]
pub struct Condition {
    signal: String,
    kind: ConditionKind,
    threshold: f64,
    previous: Option<f64>,
}

impl Condition {
    /// Build from a validated config
    pub fn from_config(config: &ConditionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            signal: config.signal.clone(),
            kind: config.kind,
            threshold: config.threshold.unwrap_or(0.0),
            previous: None,
        })
    }

    pub fn signal(&self) -> &str {
        &self.signal
    }

    pub fn kind(&self) -> ConditionKind {
        self.kind
    }

    /// The value seen on the previous evaluation, if any
    pub fn previous(&self) -> Option<f64> {
        self.previous
    }

    /// Evaluate against the signal's current value and remember it
    pub fn evaluate(&mut self, current: f64) -> bool {
        let t = self.threshold;
        let result = match self.kind {
            ConditionKind::GreaterThan => current > t,
            ConditionKind::LessThan => current < t,
            ConditionKind::Equal => (current - t).abs() < EQUALITY_TOLERANCE,
            ConditionKind::NotEqual => (current - t).abs() >= EQUALITY_TOLERANCE,
            ConditionKind::GreaterOrEqual => current >= t,
            ConditionKind::LessOrEqual => current <= t,
            ConditionKind::RisingEdge => {
                matches!(self.previous, Some(prev) if prev <= t && current > t)
            }
            ConditionKind::FallingEdge => {
                matches!(self.previous, Some(prev) if prev >= t && current < t)
            }
            ConditionKind::ValueChanged => {
                matches!(self.previous, Some(prev) if prev.to_bits() != current.to_bits())
            }
        };
        self.previous = Some(current);
        result
    }

    /// Forget the previous value
    pub fn reset(&mut self) {
        self.previous = None;
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind.needs_threshold() {
            write!(f, "{} {} {}", self.signal, self.kind.symbol(), self.threshold)
        } else {
            write!(f, "{} {}", self.signal, self.kind.symbol())
        }
    }
}
