//! Configuration loading and parsing

use anyhow::{Context, Result};
use can_stream_core::{PipelineConfig, RecordingMode, TriggerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub recording: Option<RecordingConfig>,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputConfig {
    #[serde(default)]
    pub dbc_files: Vec<PathBuf>,
    /// Raw CSV recording to replay instead of live traffic
    pub replay: Option<PathBuf>,
    /// Pace replayed frames by their timestamps
    #[serde(default)]
    pub realtime: bool,
    /// Nominal bus bitrate, used for the load estimate
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
}

fn default_bitrate() -> u32 {
    500_000
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            dbc_files: Vec::new(),
            replay: None,
            realtime: false,
            bitrate: default_bitrate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecordingConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub mode: RecordingMode,
    #[serde(default = "default_signals")]
    pub signals: SignalSelection,
    /// Start recording with the session rather than on a trigger action
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("recordings")
}

fn default_signals() -> SignalSelection {
    SignalSelection::All("all".to_string())
}

fn default_true() -> bool {
    true
}

impl RecordingConfig {
    pub fn new(output_dir: impl Into<PathBuf>, mode: RecordingMode) -> Self {
        Self {
            output_dir: output_dir.into(),
            mode,
            signals: default_signals(),
            auto_start: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SignalSelection {
    All(String), // "all"
    List(Vec<String>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DisplayConfig {
    /// Presentation refresh rate
    #[serde(default = "default_refresh_hz")]
    pub refresh_hz: f64,
    /// Signals shown in the summary (empty = every signal seen)
    #[serde(default)]
    pub signals: Vec<String>,
}

fn default_refresh_hz() -> f64 {
    20.0
}

impl DisplayConfig {
    /// Time between refreshes, or None if the rate is not usable
    pub fn refresh_interval(&self) -> Option<Duration> {
        if !self.refresh_hz.is_finite() || self.refresh_hz <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(1.0 / self.refresh_hz).ok()
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            refresh_hz: default_refresh_hz(),
            signals: Vec::new(),
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    config.validate()?;
    Ok(config)
}

impl AppConfig {
    /// Checks that do not need the frame database
    pub fn validate(&self) -> Result<()> {
        for trigger in &self.triggers {
            trigger
                .validate()
                .with_context(|| format!("Invalid trigger '{}'", trigger.name))?;
        }
        if let Some(SignalSelection::All(word)) = self.recording.as_ref().map(|r| &r.signals) {
            if word != "all" {
                anyhow::bail!("recording.signals must be \"all\" or a list, got \"{}\"", word);
            }
        }
        if self.display.refresh_interval().is_none() {
            anyhow::bail!(
                "display.refresh_hz must be a positive rate, got {}",
                self.display.refresh_hz
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_stream_core::{ConditionKind, FilterKind, Logic, TriggerAction, WindowConfig};

    #[test]
    fn test_config_deserialization() {
        let toml_content = r#"
            [input]
            dbc_files = ["powertrain.dbc"]
            replay = "session.csv"

            [pipeline]
            history_capacity = 5000
            spectrum_window = { seconds = 2.0 }
            filter_kind = "bandpass"

            [recording]
            output_dir = "out"
            mode = "decoded"
            signals = ["EngineSpeed", "VehicleSpeed"]

            [[triggers]]
            name = "overspeed"
            logic = "OR"
            actions = ["start_recording"]
            conditions = [
                { signal = "VehicleSpeed", kind = ">", threshold = 120.0 },
                { signal = "EngineSpeed", kind = "rising_edge", threshold = 6000.0 },
            ]
        "#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        config.validate().unwrap();
        assert_eq!(config.input.dbc_files.len(), 1);
        assert_eq!(config.input.bitrate, 500_000);
        assert_eq!(config.pipeline.history_capacity, 5000);
        assert_eq!(config.pipeline.spectrum_window, WindowConfig::Seconds(2.0));
        assert_eq!(config.pipeline.filter_kind, FilterKind::Bandpass);
        assert_eq!(config.pipeline.read_timeout_ms, 100);

        let recording = config.recording.unwrap();
        assert_eq!(recording.mode, RecordingMode::Decoded);
        assert!(recording.auto_start);
        assert_eq!(
            recording.signals,
            SignalSelection::List(vec!["EngineSpeed".into(), "VehicleSpeed".into()])
        );

        let trigger = &config.triggers[0];
        assert_eq!(trigger.logic, Logic::Or);
        assert_eq!(trigger.actions, vec![TriggerAction::StartRecording]);
        assert_eq!(trigger.conditions[1].kind, ConditionKind::RisingEdge);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert!(config.recording.is_none());
        assert_eq!(config.display.refresh_hz, 20.0);
        assert_eq!(config.input.bitrate, 500_000);
        assert_eq!(config.pipeline, PipelineConfig::default());
    }

    #[test]
    fn test_refresh_rate_bounds() {
        let mut config = AppConfig::default();
        assert_eq!(config.display.refresh_interval(), Some(Duration::from_millis(50)));

        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e-320] {
            config.display.refresh_hz = bad;
            assert!(config.display.refresh_interval().is_none(), "{}", bad);
            assert!(config.validate().is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_invalid_trigger_rejected() {
        let toml_content = r#"
            [[triggers]]
            name = "broken"
            conditions = [{ signal = "X", kind = "less_than" }]
        "#;
        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[recording]\nmode = \"raw\"\nsignals = \"everything\"\n").unwrap();
        assert!(load_config(&path).is_err());

        fs::write(&path, "[recording]\nmode = \"raw\"\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.recording.unwrap().output_dir, PathBuf::from("recordings"));

        assert!(load_config(&dir.path().join("missing.toml")).is_err());
    }
}
