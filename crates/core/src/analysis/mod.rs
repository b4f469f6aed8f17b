use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::audio::AudioFrame;
use crate::colour::{MAX_AUDIBLE_HZ, MIN_AUDIBLE_HZ};
use crate::{Result, VisualiserError};

/// Per-frame decay of the normalisation peak (fast attack, slow release).
const PEAK_DECAY: f32 = 0.995;
/// The peak never drops below this, so background hiss is not blown up to 1.0.
const PEAK_FLOOR: f32 = 0.05;

/// Magnitude of one FFT bin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectrumBin {
    pub freq_hz: f32,
    /// Normalised to [0, 1].
    pub magnitude: f32,
}

/// Spectrum of a single frame plus its overall volume. Never mutated after
/// the analyzer hands it out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumSnapshot {
    timestamp: f64,
    bins: Vec<SpectrumBin>,
    volume: f32,
    silent: bool,
}

impl SpectrumSnapshot {
    /// Builds a snapshot from precomputed bins; bins must be sorted by
    /// frequency.
    pub fn from_bins(bins: Vec<SpectrumBin>, volume: f32, min_volume: f32, timestamp: f64) -> Self {
        Self {
            timestamp,
            bins,
            volume,
            silent: volume < min_volume,
        }
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Bins in ascending frequency order.
    pub fn bins(&self) -> &[SpectrumBin] {
        &self.bins
    }

    /// RMS of the raw samples.
    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// True when the frame fell under the volume gate. Downstream stages must
    /// not fire anything for a silent frame.
    pub fn is_silent(&self) -> bool {
        self.silent
    }

    /// Bin whose centre is closest to `freq_hz`.
    pub fn nearest_bin(&self, freq_hz: f32) -> Option<&SpectrumBin> {
        let index = self
            .bins
            .partition_point(|bin| bin.freq_hz < freq_hz)
            .min(self.bins.len().saturating_sub(1));
        let candidates = [index.checked_sub(1), Some(index)];

        candidates
            .into_iter()
            .flatten()
            .filter_map(|i| self.bins.get(i))
            .min_by(|a, b| {
                (a.freq_hz - freq_hz)
                    .abs()
                    .total_cmp(&(b.freq_hz - freq_hz).abs())
            })
    }

    /// Frequency of the strongest bin, if any bin carries energy.
    pub fn dominant_frequency(&self) -> Option<f32> {
        self.bins
            .iter()
            .filter(|bin| bin.magnitude > 0.0)
            .max_by(|a, b| a.magnitude.total_cmp(&b.magnitude))
            .map(|bin| bin.freq_hz)
    }

    /// Condenses the spectrum into `count` log-spaced bands for display.
    pub fn display_bands(&self, count: usize) -> Vec<f32> {
        if count == 0 || self.bins.is_empty() {
            return vec![0.0; count];
        }

        let top = self
            .bins
            .last()
            .map(|bin| bin.freq_hz)
            .unwrap_or(MAX_AUDIBLE_HZ)
            .clamp(MIN_AUDIBLE_HZ * 2.0, MAX_AUDIBLE_HZ);
        let ratio = (top / MIN_AUDIBLE_HZ).powf(1.0 / count as f32);

        (0..count)
            .map(|band| {
                let low = MIN_AUDIBLE_HZ * ratio.powi(band as i32);
                let high = low * ratio;
                let peak = self
                    .bins
                    .iter()
                    .filter(|bin| bin.freq_hz >= low && bin.freq_hz < high)
                    .map(|bin| bin.magnitude)
                    .fold(None, |acc: Option<f32>, m| Some(acc.map_or(m, |a| a.max(m))));
                peak.or_else(|| {
                    self.nearest_bin((low * high).sqrt())
                        .map(|bin| bin.magnitude)
                })
                .unwrap_or(0.0)
            })
            .collect()
    }
}

/// Windowed FFT over each frame with running-peak normalisation.
///
/// The only state carried between frames is the FFT plan cache and the
/// normalisation peak.
pub struct SpectralAnalyzer {
    fft_planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
    peak: f32,
}

impl SpectralAnalyzer {
    pub fn new() -> Self {
        Self {
            fft_planner: RealFftPlanner::new(),
            fft: None,
            peak: PEAK_FLOOR,
        }
    }

    /// Current normalisation reference.
    pub fn peak(&self) -> f32 {
        self.peak
    }

    /// Windowed FFT of one frame. Frames under `min_volume` RMS are flagged silent but still analysed.
    pub fn analyze(&mut self, frame: &AudioFrame, min_volume: f32) -> Result<SpectrumSnapshot> {
        let samples = frame.samples();
        if samples.len() < 2 {
            return Err(VisualiserError::InvalidInput(
                "analysis requires blocks with at least two samples",
            ));
        }

        let volume = frame.rms();
        let len = samples.len();
        let bin_hz = frame.sample_rate() as f32 / len as f32;
        let fft = self.prepare_fft(len);

        for (index, value) in samples.iter().enumerate() {
            fft.input[index] = *value * fft.window[index];
        }
        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        // Amplitude-correct scaling: a full-scale sine lands near 1.0.
        let scale = 2.0 / fft.window_sum.max(f32::EPSILON);
        let mut bins: Vec<SpectrumBin> = fft
            .spectrum
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, bin)| SpectrumBin {
                freq_hz: i as f32 * bin_hz,
                magnitude: bin.norm() * scale,
            })
            .collect();

        let frame_peak = bins.iter().map(|bin| bin.magnitude).fold(0.0_f32, f32::max);
        self.peak = frame_peak.max(self.peak * PEAK_DECAY).max(PEAK_FLOOR);
        for bin in &mut bins {
            bin.magnitude = (bin.magnitude / self.peak).clamp(0.0, 1.0);
        }

        Ok(SpectrumSnapshot::from_bins(bins, volume, min_volume, frame.timestamp()))
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        let rebuild = self
            .fft
            .as_ref()
            .map(|fft| fft.size != size)
            .unwrap_or(true);

        if rebuild {
            self.fft = None;
        }

        let planner = &mut self.fft_planner;
        self.fft
            .get_or_insert_with(|| FftResources::new(planner, size))
    }
}

impl Default for SpectralAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
    window: Vec<f32>,
    window_sum: f32,
}

impl FftResources {
    fn new(planner: &mut RealFftPlanner<f32>, size: usize) -> Self {
        let plan = planner.plan_fft_forward(size);
        let window: Vec<f32> = (0..size).map(|i| hann_value(i, size)).collect();
        Self {
            size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            window_sum: window.iter().sum(),
            window,
            plan,
        }
    }
}

impl fmt::Debug for SpectralAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralAnalyzer")
            .field("fft_size", &self.fft.as_ref().map(|fft| fft.size))
            .field("peak", &self.peak)
            .finish()
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}
