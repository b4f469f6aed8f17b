use std::collections::HashSet;

use crate::analysis::SpectrumSnapshot;
use crate::device::{Device, FrequencyRange};

/// Intensity per configured range for one frame, in [0, 1].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BandIntensities {
    entries: Vec<(FrequencyRange, f32)>,
}

impl BandIntensities {
    pub fn from_entries(entries: Vec<(FrequencyRange, f32)>) -> Self {
        Self { entries }
    }

    /// Zero for ranges the router was not configured with.
    pub fn get(&self, range: &FrequencyRange) -> f32 {
        self.entries
            .iter()
            .find(|(candidate, _)| candidate.key() == range.key())
            .map(|(_, intensity)| *intensity)
            .unwrap_or(0.0)
    }

    /// Strongest of the given ranges, ties resolved in favour of the first.
    pub fn dominant<'a>(
        &self,
        ranges: impl IntoIterator<Item = &'a FrequencyRange>,
    ) -> Option<(FrequencyRange, f32)> {
        ranges
            .into_iter()
            .map(|range| (*range, self.get(range)))
            .fold(None, |best, candidate| match best {
                Some((_, best_value)) if best_value >= candidate.1 => best,
                _ => Some(candidate),
            })
    }

    /// Ranges with their intensity, in routing order.
    pub fn iter(&self) -> impl Iterator<Item = &(FrequencyRange, f32)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Aggregates spectrum bins into per-range intensities.
///
/// Ranges shared by several devices are evaluated once. The router holds no
/// per-frame state; it is rebuilt when the device list changes.
#[derive(Debug, Clone, Default)]
pub struct BandRouter {
    ranges: Vec<FrequencyRange>,
}

impl BandRouter {
    /// Router over the distinct ranges in `ranges`.
    pub fn new<'a>(ranges: impl IntoIterator<Item = &'a FrequencyRange>) -> Self {
        let mut seen = HashSet::new();
        let ranges = ranges
            .into_iter()
            .filter(|range| seen.insert(range.key()))
            .copied()
            .collect();
        Self { ranges }
    }

    /// Router over every range of every enabled device.
    pub fn for_devices<'a>(devices: impl IntoIterator<Item = &'a Device>) -> Self {
        Self::new(
            devices
                .into_iter()
                .filter(|device| device.enabled)
                .flat_map(|device| device.freq_ranges.iter()),
        )
    }

    pub fn ranges(&self) -> &[FrequencyRange] {
        &self.ranges
    }

    /// Silent frames route to zero everywhere so nothing downstream fires.
    pub fn route(&self, spectrum: &SpectrumSnapshot) -> BandIntensities {
        let entries = self
            .ranges
            .iter()
            .map(|range| {
                let intensity = if spectrum.is_silent() {
                    0.0
                } else {
                    band_intensity(spectrum, range)
                };
                (*range, intensity)
            })
            .collect();
        BandIntensities { entries }
    }
}

/// Energy-weighted mean magnitude of the bins inside `range`.
///
/// Weighting each bin by its own energy keeps a narrow tone from being
/// diluted by the empty bins of a wide band. A range narrower than the bin
/// spacing falls back to the single nearest bin.
pub fn band_intensity(spectrum: &SpectrumSnapshot, range: &FrequencyRange) -> f32 {
    let mut weighted = 0.0_f32;
    let mut total = 0.0_f32;
    let mut any = false;

    for bin in spectrum.bins().iter().filter(|bin| range.contains(bin.freq_hz)) {
        any = true;
        weighted += bin.magnitude * bin.magnitude;
        total += bin.magnitude;
    }

    if !any {
        return spectrum
            .nearest_bin(range.centre_hz())
            .map(|bin| bin.magnitude.clamp(0.0, 1.0))
            .unwrap_or(0.0);
    }
    if total <= f32::EPSILON {
        return 0.0;
    }
    (weighted / total).clamp(0.0, 1.0)
}
