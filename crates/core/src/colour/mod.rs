//! Colour helpers shared by the trigger engine and the wire encoders.
//!
//! Everything in here is a pure function. Reactive colours are derived from a
//! log-frequency position so that bass sits at the warm end of the hue wheel
//! and treble at the cool end; the same input always yields the same output.

use std::{fmt, str::FromStr};

use palette::{FromColor, Hsv, Srgb};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Result, VisualiserError};

/// Lowest frequency the hue mapping distinguishes.
pub const MIN_AUDIBLE_HZ: f32 = 20.0;
/// Highest frequency the hue mapping distinguishes.
pub const MAX_AUDIBLE_HZ: f32 = 20_000.0;

/// Hue reached at [`MAX_AUDIBLE_HZ`]. Stops short of wrapping back to red.
const MAX_HUE_DEGREES: f32 = 270.0;
/// Random flash colours must have at least one channel this bright.
const MIN_FLASH_CHANNEL: u8 = 128;

/// 8-bit RGB triple as sent to the actuators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn max_channel(&self) -> u8 {
        self.r.max(self.g).max(self.b)
    }

    /// `#rrggbb`, lower case.
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    /// Parses `#rrggbb` or `rrggbb`.
    pub fn from_hex(value: &str) -> Result<Self> {
        let hex = value.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(VisualiserError::config(format!("invalid hex colour '{value}'")));
        }

        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&hex[range], 16)
                .map_err(|_| VisualiserError::config(format!("invalid hex colour '{value}'")))
        };

        Ok(Self::new(channel(0..2)?, channel(2..4)?, channel(4..6)?))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.r, self.g, self.b)
    }
}

impl FromStr for Rgb {
    type Err = VisualiserError;

    /// Accepts the `r,g,b` form used in device configs as well as hex.
    fn from_str(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed.starts_with('#') {
            return Self::from_hex(trimmed);
        }

        let parts: Vec<&str> = trimmed.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(VisualiserError::config(format!(
                "colour '{value}' must be 'r,g,b' or '#rrggbb'"
            )));
        }

        let mut channels = [0u8; 3];
        for (slot, part) in channels.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| {
                VisualiserError::config(format!("colour channel '{part}' is not in 0..=255"))
            })?;
        }

        Ok(Self::new(channels[0], channels[1], channels[2]))
    }
}

/// Maps a frequency onto a hue in degrees. Monotonic: a higher frequency never
/// yields a lower hue.
pub fn frequency_to_hue(freq_hz: f32) -> f32 {
    let clamped = if freq_hz.is_finite() {
        freq_hz.clamp(MIN_AUDIBLE_HZ, MAX_AUDIBLE_HZ)
    } else {
        MIN_AUDIBLE_HZ
    };
    let position = (clamped / MIN_AUDIBLE_HZ).ln() / (MAX_AUDIBLE_HZ / MIN_AUDIBLE_HZ).ln();
    position * MAX_HUE_DEGREES
}

/// Fully saturated colour for the given hue.
pub fn hue_to_rgb(hue_degrees: f32) -> Rgb {
    let hsv = Hsv::new(hue_degrees, 1.0, 1.0);
    let rgb: Srgb = Srgb::from_color(hsv);
    let rgb: Srgb<u8> = rgb.into_format();
    Rgb::new(rgb.red, rgb.green, rgb.blue)
}

/// Scales a device's configured brightness by a [0, 1] intensity. Any
/// non-zero intensity stays at least at brightness 1 so the light is on.
pub fn intensity_to_brightness(intensity: f32, max_brightness: u8) -> u8 {
    if intensity.is_nan() || intensity <= 0.0 || max_brightness == 0 {
        return 0;
    }

    let scaled = (intensity.min(1.0) * max_brightness as f32).round() as u8;
    scaled.max(1)
}

/// Colour and brightness for a reactive device whose dominant range is
/// centred at `centre_hz`.
pub fn reactive_colour(centre_hz: f32, intensity: f32, max_brightness: u8) -> (Rgb, u8) {
    (
        hue_to_rgb(frequency_to_hue(centre_hz)),
        intensity_to_brightness(intensity, max_brightness),
    )
}

/// Uniformly sampled colour that is visibly distinguishable from "off".
pub fn random_flash_colour<R: Rng + ?Sized>(rng: &mut R, exclude: Option<Rgb>) -> Rgb {
    loop {
        let candidate = Rgb::new(rng.random(), rng.random(), rng.random());
        if candidate.max_channel() >= MIN_FLASH_CHANNEL && Some(candidate) != exclude {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hue_follows_frequency_order() {
        let freqs = [20.0, 60.0, 250.0, 1_000.0, 4_000.0, 12_000.0, 20_000.0];
        let hues: Vec<f32> = freqs.iter().map(|f| frequency_to_hue(*f)).collect();

        assert!(hues.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(hues[0], 0.0);
        assert!((hues[6] - MAX_HUE_DEGREES).abs() < 1e-3);
    }

    #[test]
    fn bass_is_warm_and_treble_is_cool() {
        let bass = hue_to_rgb(frequency_to_hue(40.0));
        let treble = hue_to_rgb(frequency_to_hue(15_000.0));

        assert!(bass.r > bass.b);
        assert!(treble.b > treble.r);
    }

    #[test]
    fn reactive_colour_is_repeatable() {
        assert_eq!(reactive_colour(150.0, 0.7, 200), reactive_colour(150.0, 0.7, 200));
    }

    #[test]
    fn brightness_scales_with_intensity() {
        assert_eq!(intensity_to_brightness(0.0, 255), 0);
        assert_eq!(intensity_to_brightness(1.0, 200), 200);
        assert_eq!(intensity_to_brightness(0.5, 200), 100);
        assert_eq!(intensity_to_brightness(0.0001, 255), 1);
        assert_eq!(intensity_to_brightness(f32::NAN, 255), 0);
    }

    #[test]
    fn random_flash_colours_are_never_dark() {
        let mut rng = rand::rng();
        let mut previous = None;
        for _ in 0..500 {
            let colour = random_flash_colour(&mut rng, previous);
            assert!(colour.max_channel() >= MIN_FLASH_CHANNEL);
            assert_ne!(Some(colour), previous);
            previous = Some(colour);
        }
    }

    #[test]
    fn parses_both_colour_notations() {
        assert_eq!("255,102,0".parse::<Rgb>().unwrap(), Rgb::new(255, 102, 0));
        assert_eq!("#ff6600".parse::<Rgb>().unwrap(), Rgb::new(255, 102, 0));
        assert_eq!(Rgb::new(174, 0, 0).to_hex(), "#ae0000");
        assert!("300,0,0".parse::<Rgb>().is_err());
        assert!("1,2".parse::<Rgb>().is_err());
        assert!(Rgb::from_hex("#zzzzzz").is_err());
    }
}
