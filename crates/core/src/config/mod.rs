use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::device::{validate_devices, Device};
use crate::{Result, VisualiserError};

mod store;

pub use store::{ConfigProvider, ConfigStore, DeviceSnapshot};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(alias = "mqtt")]
    pub broker: BrokerConfig,
    pub audio: AudioConfig,
    #[serde(rename = "app")]
    pub runtime: RuntimeConfig,
    pub devices: Vec<Device>,
}

impl AppConfig {
    /// Parses YAML without applying environment overrides or validation.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Loads `path` (defaults when it does not exist), applies environment
    /// overrides and validates the result.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::from_yaml_str(&std::fs::read_to_string(path)?)?
        } else {
            tracing::info!(?path, "config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Applies the `MQTT_*` / `AUDIO_*` variables. `lookup` is injectable so
    /// tests do not have to mutate the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| VisualiserError::config(format!("{key}='{value}' is not valid")))
        }

        if let Some(host) = lookup("MQTT_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.broker.port = parsed("MQTT_PORT", port)?;
        }
        if let Some(username) = lookup("MQTT_USERNAME") {
            self.broker.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.broker.password = Some(password);
        }
        if let Some(value) = lookup("AUDIO_BUFFER_SIZE") {
            self.audio.buffer_size = parsed("AUDIO_BUFFER_SIZE", value)?;
        }
        if let Some(value) = lookup("AUDIO_SAMPLE_RATE") {
            self.audio.sample_rate = parsed("AUDIO_SAMPLE_RATE", value)?;
        }
        if let Some(value) = lookup("AUDIO_CHANNELS") {
            self.audio.channels = parsed("AUDIO_CHANNELS", value)?;
        }
        if let Some(value) = lookup("AUDIO_MIN_VOLUME") {
            self.runtime.min_volume = parsed("AUDIO_MIN_VOLUME", value)?;
        }
        if let Some(value) = lookup("AUDIO_BEAT_THRESHOLD") {
            self.runtime.beat_threshold = parsed("AUDIO_BEAT_THRESHOLD", value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.broker.validate()?;
        self.audio.validate()?;
        self.runtime.validate()?;
        validate_devices(&self.devices)
    }
}

/// Longest reconnect delay accepted from configuration.
pub const MAX_RECONNECT_SECS: f64 = 3_600.0;

/// Connection settings for the MQTT broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive_secs: u16,
    /// First reconnect delay; doubles per consecutive failure.
    pub reconnect_base_secs: f64,
    pub reconnect_max_secs: f64,
    /// Fraction of the nominal delay added or removed at random.
    pub reconnect_jitter: f64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "music_viz".to_string(),
            keep_alive_secs: 60,
            reconnect_base_secs: 1.0,
            reconnect_max_secs: 60.0,
            reconnect_jitter: 0.1,
        }
    }
}

impl BrokerConfig {
    /// `host:port` as dialled.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(VisualiserError::config(
                "broker host must be set in config or MQTT_HOST",
            ));
        }
        if self.port == 0 {
            return Err(VisualiserError::config("broker port must be a valid TCP port"));
        }
        if self.client_id.is_empty() || self.client_id.len() > 23 {
            return Err(VisualiserError::config(
                "client_id must be between 1 and 23 characters",
            ));
        }
        if !(self.reconnect_base_secs > 0.0
            && self.reconnect_base_secs <= self.reconnect_max_secs
            && self.reconnect_max_secs <= MAX_RECONNECT_SECS)
        {
            return Err(VisualiserError::config(format!(
                "reconnect delays must satisfy 0 < base <= max <= {MAX_RECONNECT_SECS}"
            )));
        }
        if !(0.0..1.0).contains(&self.reconnect_jitter) {
            return Err(VisualiserError::config("reconnect_jitter must be in [0, 1)"));
        }
        Ok(())
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Samples per analysed frame.
    pub buffer_size: usize,
    pub channels: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            buffer_size: 2048,
            channels: 1,
        }
    }
}

impl AudioConfig {
    /// Wall-clock length of one frame.
    pub fn frame_seconds(&self) -> f64 {
        self.buffer_size as f64 / self.sample_rate as f64
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size < 2 {
            return Err(VisualiserError::config("audio buffer_size must be at least 2"));
        }
        if self.sample_rate == 0 {
            return Err(VisualiserError::config("audio sample_rate must be positive"));
        }
        if self.channels == 0 {
            return Err(VisualiserError::config("audio channels must be positive"));
        }
        Ok(())
    }
}

/// Scalars read by every stage once per cycle. Swapped as a whole, never
/// field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub debug: bool,
    /// Seconds that must separate two publishes to the same device.
    pub min_publish_interval: f64,
    /// Multiple of the rolling average energy a frame must exceed to be a beat.
    pub beat_threshold: f32,
    /// RMS below which a frame counts as silence.
    pub min_volume: f32,
    /// Seconds a flash stays lit before reverting.
    pub flash_duration: f64,
    /// Caps strobe rate during sustained loud passages.
    pub flash_guard: bool,
    /// Band intensity a reactive device needs to light up.
    pub activation_threshold: f32,
    /// Refractory period of the beat detector in seconds.
    pub min_beat_gap: f64,
    /// Frames in the fallback detector's rolling energy window.
    pub beat_history: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            debug: false,
            min_publish_interval: 0.1,
            beat_threshold: 1.5,
            min_volume: 0.005,
            flash_duration: 0.3,
            flash_guard: true,
            activation_threshold: 0.35,
            min_beat_gap: 0.25,
            beat_history: 43,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.min_publish_interval.is_finite() || self.min_publish_interval < 0.0 {
            return Err(VisualiserError::config(
                "min_publish_interval must be a non-negative number of seconds",
            ));
        }
        if self.beat_threshold.is_nan() || self.beat_threshold < 1.0 {
            return Err(VisualiserError::config("beat_threshold must be at least 1.0"));
        }
        if !self.min_volume.is_finite() || self.min_volume < 0.0 {
            return Err(VisualiserError::config("min_volume must be non-negative"));
        }
        if !self.flash_duration.is_finite() || self.flash_duration <= 0.0 {
            return Err(VisualiserError::config("flash_duration must be positive"));
        }
        if self.flash_duration < self.min_publish_interval {
            return Err(VisualiserError::config(
                "flash_duration must not be shorter than min_publish_interval",
            ));
        }
        if !(0.0..=1.0).contains(&self.activation_threshold) {
            return Err(VisualiserError::config(
                "activation_threshold must be within [0, 1]",
            ));
        }
        if !self.min_beat_gap.is_finite() || self.min_beat_gap < 0.0 {
            return Err(VisualiserError::config("min_beat_gap must be non-negative"));
        }
        if self.beat_history < 2 {
            return Err(VisualiserError::config("beat_history must be at least 2 frames"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::device::{DeviceMode, FlashColour};

    const SAMPLE: &str = r#"
mqtt:
  host: 10.0.100.153
  port: 1883
audio:
  buffer_size: 1024
app:
  debug: true
  min_publish_interval: 0.2
  flash_duration: 0.4
devices:
  - id: lounge
    name: Lounge
    topic: cmnd/lounge
    type: tasmota
    mode: flash
    flash_colour: random
    flash_cooldown: 1.5
  - id: strip
    name: LED Strip
    topic: zigbee2mqtt/strip
    freq_ranges:
      - { min: 60, max: 250 }
"#;

    #[test]
    fn parses_partial_yaml_with_defaults() {
        let config = AppConfig::from_yaml_str(SAMPLE).unwrap();

        assert_eq!(config.broker.host, "10.0.100.153");
        assert_eq!(config.broker.client_id, "music_viz");
        assert_eq!(config.audio.buffer_size, 1024);
        assert_eq!(config.audio.sample_rate, 44_100);
        assert!(config.runtime.debug);
        assert_eq!(config.runtime.min_publish_interval, 0.2);
        assert_eq!(config.runtime.beat_threshold, 1.5);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].mode, DeviceMode::Flash);
        assert_eq!(config.devices[0].flash_colour, FlashColour::Random);
        config.validate().unwrap();
    }

    #[test]
    fn empty_document_yields_defaults() {
        assert_eq!(AppConfig::from_yaml_str("  \n").unwrap(), AppConfig::default());
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = AppConfig::from_yaml_str(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = [
            ("MQTT_HOST", "broker.local"),
            ("MQTT_PORT", "8883"),
            ("AUDIO_MIN_VOLUME", "0.02"),
        ]
        .into_iter()
        .collect();

        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.broker.host, "broker.local");
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.runtime.min_volume, 0.02);

        let bad = |key: &str| (key == "MQTT_PORT").then(|| "not-a-port".to_string());
        assert!(config.apply_env_overrides(bad).is_err());
    }

    #[test]
    fn validation_rejects_bad_scalars() {
        let mut config = AppConfig::default();
        config.broker.host.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.runtime.beat_threshold = 0.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.runtime.flash_duration = 0.05;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.broker.reconnect_max_secs = 0.5;
        assert!(config.validate().is_err());

        for max in [1e30, f64::INFINITY, f64::NAN] {
            let mut config = AppConfig::default();
            config.broker.reconnect_max_secs = max;
            assert!(config.validate().is_err(), "max delay {max} accepted");
        }
    }

    #[test]
    fn infinite_reconnect_delay_in_yaml_is_rejected() {
        let yaml = "broker:\n  reconnect_max_secs: .inf\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.broker.reconnect_max_secs.is_infinite());
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_file_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        let reparsed = AppConfig::from_yaml_str(&loaded.to_yaml_string().unwrap()).unwrap();
        assert_eq!(reparsed.devices, loaded.devices);
        assert_eq!(reparsed.runtime, loaded.runtime);

        let missing = AppConfig::load(dir.path().join("absent.yaml")).unwrap();
        assert!(missing.devices.is_empty());
    }
}
