//! Device descriptions as handed to the core by the configuration layer.
//!
//! Devices are validated once, when they enter the [`ConfigStore`]; the
//! per-cycle code assumes every range and scalar here is already sane.
//!
//! [`ConfigStore`]: crate::ConfigStore

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::colour::{Rgb, MAX_AUDIBLE_HZ, MIN_AUDIBLE_HZ};
use crate::{Result, VisualiserError};

/// Inclusive frequency band in Hz a device reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyRange {
    pub min: f32,
    pub max: f32,
}

impl FrequencyRange {
    pub const FULL: FrequencyRange = FrequencyRange {
        min: MIN_AUDIBLE_HZ,
        max: MAX_AUDIBLE_HZ,
    };

    /// Builds a validated range.
    pub fn new(min: f32, max: f32) -> Result<Self> {
        let range = Self { min, max };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(VisualiserError::config(format!("frequency range {self} is not finite")));
        }
        if self.min < MIN_AUDIBLE_HZ || self.max > MAX_AUDIBLE_HZ {
            return Err(VisualiserError::config(format!(
                "frequency range {self} must lie within {MIN_AUDIBLE_HZ}-{MAX_AUDIBLE_HZ} Hz"
            )));
        }
        if self.min >= self.max {
            return Err(VisualiserError::config(format!(
                "frequency range {self} must have min < max"
            )));
        }
        Ok(())
    }

    /// Inclusive at both ends.
    pub fn contains(&self, freq_hz: f32) -> bool {
        self.min <= freq_hz && freq_hz <= self.max
    }

    /// Geometric centre, which is where the range sits on a log axis.
    pub fn centre_hz(&self) -> f32 {
        (self.min * self.max).sqrt()
    }

    /// Bitwise identity used to deduplicate ranges shared by several devices.
    pub(crate) fn key(&self) -> (u32, u32) {
        (self.min.to_bits(), self.max.to_bits())
    }
}

impl Default for FrequencyRange {
    fn default() -> Self {
        Self::FULL
    }
}

impl fmt::Display for FrequencyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{} Hz", self.min, self.max)
    }
}

/// Named bands offered to users when configuring a device.
pub const FREQUENCY_PRESETS: [(&str, &str, FrequencyRange); 8] = [
    ("sub_bass", "Sub Bass", FrequencyRange { min: 20.0, max: 60.0 }),
    ("bass", "Bass", FrequencyRange { min: 60.0, max: 250.0 }),
    ("low_mid", "Low Midrange", FrequencyRange { min: 250.0, max: 500.0 }),
    ("mid", "Midrange", FrequencyRange { min: 500.0, max: 2_000.0 }),
    ("high_mid", "High Midrange", FrequencyRange { min: 2_000.0, max: 4_000.0 }),
    ("presence", "Presence", FrequencyRange { min: 4_000.0, max: 6_000.0 }),
    ("brilliance", "Brilliance", FrequencyRange { min: 6_000.0, max: 20_000.0 }),
    ("full", "Full Spectrum", FrequencyRange::FULL),
];

/// Looks up a preset by its key, e.g. `"bass"`.
pub fn preset(key: &str) -> Option<FrequencyRange> {
    FREQUENCY_PRESETS
        .iter()
        .find(|(name, _, _)| *name == key)
        .map(|(_, _, range)| *range)
}

/// How a device responds to the music.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    /// Continuous colour that follows the band intensity.
    #[default]
    Reactive,
    /// Short strobe on each qualifying beat.
    Flash,
}

/// Command encoding understood by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// JSON body on `<topic>/set` (Zigbee2MQTT style).
    #[default]
    #[serde(alias = "zigbee")]
    Json,
    /// One scalar topic per attribute (Tasmota style).
    #[serde(alias = "tasmota")]
    Scalar,
}

/// Colour used when a flash-mode device fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FlashColour {
    Fixed(Rgb),
    Random,
}

impl Default for FlashColour {
    fn default() -> Self {
        Self::Fixed(Rgb::new(255, 0, 0))
    }
}

impl TryFrom<String> for FlashColour {
    type Error = VisualiserError;

    fn try_from(value: String) -> Result<Self> {
        if value.trim().eq_ignore_ascii_case("random") {
            Ok(Self::Random)
        } else {
            value.parse().map(Self::Fixed)
        }
    }
}

impl From<FlashColour> for String {
    fn from(value: FlashColour) -> Self {
        match value {
            FlashColour::Fixed(rgb) => rgb.to_string(),
            FlashColour::Random => "random".to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_brightness() -> u8 {
    255
}

fn default_ranges() -> Vec<FrequencyRange> {
    vec![FrequencyRange::FULL]
}

/// A controllable light published to over MQTT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "DeviceEntry")]
pub struct Device {
    pub id: String,
    pub name: String,
    pub topic: String,
    #[serde(rename = "type")]
    pub protocol: Protocol,
    pub enabled: bool,
    pub mode: DeviceMode,
    pub brightness: u8,
    pub flash_colour: FlashColour,
    /// Seconds that must pass between two flashes of this device.
    pub flash_cooldown: f32,
    pub freq_ranges: Vec<FrequencyRange>,
}

/// On-disk form of a [`Device`]. Older files select random flashes with a
/// separate `flash_random: true` next to `flash_colour`.
#[derive(Deserialize)]
struct DeviceEntry {
    id: String,
    #[serde(default)]
    name: String,
    topic: String,
    #[serde(default, rename = "type")]
    protocol: Protocol,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    mode: DeviceMode,
    #[serde(default = "default_brightness")]
    brightness: u8,
    #[serde(default)]
    flash_colour: FlashColour,
    #[serde(default)]
    flash_random: bool,
    #[serde(default)]
    flash_cooldown: f32,
    #[serde(default = "default_ranges")]
    freq_ranges: Vec<FrequencyRange>,
}

impl From<DeviceEntry> for Device {
    fn from(entry: DeviceEntry) -> Self {
        Self {
            id: entry.id,
            name: entry.name,
            topic: entry.topic,
            protocol: entry.protocol,
            enabled: entry.enabled,
            mode: entry.mode,
            brightness: entry.brightness,
            flash_colour: if entry.flash_random {
                FlashColour::Random
            } else {
                entry.flash_colour
            },
            flash_cooldown: entry.flash_cooldown,
            freq_ranges: entry.freq_ranges,
        }
    }
}

impl Device {
    /// Enabled reactive device covering the whole spectrum.
    pub fn new(id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            topic: topic.into(),
            protocol: Protocol::default(),
            enabled: true,
            mode: DeviceMode::default(),
            brightness: default_brightness(),
            flash_colour: FlashColour::default(),
            flash_cooldown: 0.0,
            freq_ranges: default_ranges(),
        }
    }

    pub fn with_mode(mut self, mode: DeviceMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_ranges(mut self, ranges: Vec<FrequencyRange>) -> Self {
        self.freq_ranges = ranges;
        self
    }

    pub fn with_flash(mut self, colour: FlashColour, cooldown: f32) -> Self {
        self.flash_colour = colour;
        self.flash_cooldown = cooldown;
        self
    }

    /// Human-readable label for logs, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Rejects anything the trigger engine must never see.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(VisualiserError::config("device id must not be empty"));
        }
        if self.topic.trim().is_empty() {
            return Err(VisualiserError::config(format!(
                "device '{}' has an empty topic",
                self.id
            )));
        }
        if self.topic.contains(['+', '#']) {
            return Err(VisualiserError::config(format!(
                "device '{}' topic must not contain MQTT wildcards",
                self.id
            )));
        }
        if !self.flash_cooldown.is_finite() || self.flash_cooldown < 0.0 {
            return Err(VisualiserError::config(format!(
                "device '{}' flash_cooldown must be a non-negative number of seconds",
                self.id
            )));
        }
        if self.freq_ranges.is_empty() {
            return Err(VisualiserError::config(format!(
                "device '{}' needs at least one frequency range",
                self.id
            )));
        }
        for range in &self.freq_ranges {
            range.validate().map_err(|err| {
                VisualiserError::config(format!("device '{}': {err}", self.id))
            })?;
        }
        Ok(())
    }
}

/// Validates a whole device list, including id uniqueness.
pub fn validate_devices(devices: &[Device]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for device in devices {
        device.validate()?;
        if !seen.insert(device.id.as_str()) {
            return Err(VisualiserError::config(format!(
                "duplicate device id '{}'",
                device.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_band_ranges() {
        assert!(FrequencyRange::new(60.0, 250.0).is_ok());
        assert!(FrequencyRange::new(10.0, 250.0).is_err());
        assert!(FrequencyRange::new(60.0, 25_000.0).is_err());
        assert!(FrequencyRange::new(250.0, 60.0).is_err());
        assert!(FrequencyRange::new(100.0, 100.0).is_err());
        assert!(FrequencyRange::new(f32::NAN, 100.0).is_err());
    }

    #[test]
    fn deserializes_legacy_device_entries() {
        let yaml = r#"
id: strip
name: LED Strip
topic: zigbee2mqtt/LED Strip
type: zigbee
mode: flash
flash_colour: "0,255,0"
flash_cooldown: 2.0
freq_ranges:
  - { min: 60, max: 250 }
"#;
        let device: Device = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(device.protocol, Protocol::Json);
        assert_eq!(device.mode, DeviceMode::Flash);
        assert_eq!(device.flash_colour, FlashColour::Fixed(Rgb::new(0, 255, 0)));
        assert_eq!(device.brightness, 255);
        assert!(device.enabled);
        assert_eq!(device.freq_ranges, vec![FrequencyRange { min: 60.0, max: 250.0 }]);
        device.validate().unwrap();
    }

    #[test]
    fn legacy_flash_random_flag_selects_random_colours() {
        let yaml = r#"
id: strobe
topic: cmnd/strobe
type: tasmota
mode: flash
flash_colour: "255,0,0"
flash_random: true
"#;
        let device: Device = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(device.flash_colour, FlashColour::Random);

        let fixed: Device =
            serde_yaml::from_str("{ id: a, topic: t, flash_colour: \"0,0,255\", flash_random: false }")
                .unwrap();
        assert_eq!(fixed.flash_colour, FlashColour::Fixed(Rgb::new(0, 0, 255)));
    }

    #[test]
    fn random_flash_colour_round_trips_through_yaml() {
        let device = Device::new("lamp", "cmnd/lamp")
            .with_protocol(Protocol::Scalar)
            .with_flash(FlashColour::Random, 1.0);
        let yaml = serde_yaml::to_string(&device).unwrap();

        assert!(yaml.contains("random"));
        assert!(yaml.contains("scalar"));
        assert_eq!(serde_yaml::from_str::<Device>(&yaml).unwrap(), device);
    }

    #[test]
    fn display_name_falls_back_to_the_id() {
        let mut device = Device::new("strip", "lights/strip");
        assert_eq!(device.display_name(), "strip");
        device.name = "LED Strip".into();
        assert_eq!(device.display_name(), "LED Strip");
    }

    #[test]
    fn device_validation_catches_bad_fields() {
        assert!(Device::new("", "t").validate().is_err());
        assert!(Device::new("a", " ").validate().is_err());
        assert!(Device::new("a", "lights/#").validate().is_err());
        assert!(Device::new("a", "t").with_ranges(vec![]).validate().is_err());
        assert!(Device::new("a", "t")
            .with_flash(FlashColour::Random, -1.0)
            .validate()
            .is_err());
        assert!(Device::new("a", "t")
            .with_ranges(vec![FrequencyRange { min: 5.0, max: 50.0 }])
            .validate()
            .is_err());

        let dupes = vec![Device::new("a", "t1"), Device::new("a", "t2")];
        assert!(validate_devices(&dupes).is_err());
    }

    #[test]
    fn presets_are_valid() {
        for (_, _, range) in FREQUENCY_PRESETS {
            range.validate().unwrap();
        }
        assert_eq!(preset("bass"), Some(FrequencyRange { min: 60.0, max: 250.0 }));
        assert_eq!(preset("nope"), None);
    }
}
