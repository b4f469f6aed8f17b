use std::collections::VecDeque;

use super::{BeatDetector, BeatEvent};
use crate::analysis::SpectrumSnapshot;
use crate::audio::AudioFrame;
use crate::config::RuntimeConfig;
use crate::{Result, VisualiserError};

/// Frames of flux history needed before any beat is reported.
const MIN_HISTORY: usize = 8;
/// Flux below this is treated as noise however quiet the history was.
const FLUX_FLOOR: f32 = 1e-3;

/// Spectral-flux onset tracker.
///
/// Bin magnitudes come out of the analyzer peak-normalised, so each bin is
/// weighted by the frame volume before differencing. Only rising energy
/// counts towards the flux. A beat is reported when the flux exceeds
/// `beat_threshold` times its trailing mean. The volume gate and the
/// refractory period match [`EnergyBeatDetector`](super::EnergyBeatDetector).
#[derive(Debug)]
pub struct OnsetBeatDetector {
    frame_size: usize,
    previous: Vec<f32>,
    history: VecDeque<f32>,
    last_beat: Option<f64>,
}

impl OnsetBeatDetector {
    pub fn new(frame_size: usize, sample_rate: u32) -> Result<Self> {
        if frame_size < 2 {
            return Err(VisualiserError::msg(format!(
                "onset detection needs frames of at least 2 samples, got {frame_size}"
            )));
        }
        if sample_rate == 0 {
            return Err(VisualiserError::msg("onset detection needs a non-zero sample rate"));
        }

        Ok(Self {
            frame_size,
            previous: Vec::with_capacity(frame_size / 2 + 1),
            history: VecDeque::new(),
            last_beat: None,
        })
    }

    /// Half-wave rectified flux against the previous frame. `None` when there
    /// is nothing comparable yet.
    fn flux(&mut self, spectrum: &SpectrumSnapshot) -> Option<f32> {
        let volume = spectrum.volume();
        let current: Vec<f32> = spectrum
            .bins()
            .iter()
            .map(|bin| bin.magnitude * volume)
            .collect();

        let flux = (self.previous.len() == current.len()).then(|| {
            current
                .iter()
                .zip(&self.previous)
                .map(|(now, before)| (now - before).max(0.0))
                .sum::<f32>()
        });
        self.previous = current;
        flux
    }

    fn mean_flux(&self) -> f32 {
        if self.history.is_empty() {
            return 0.0;
        }
        self.history.iter().sum::<f32>() / self.history.len() as f32
    }
}

impl BeatDetector for OnsetBeatDetector {
    fn detect(
        &mut self,
        frame: &AudioFrame,
        spectrum: &SpectrumSnapshot,
        config: &RuntimeConfig,
    ) -> Option<BeatEvent> {
        let flux = self.flux(spectrum)?;
        let mean = self.mean_flux();
        let warm = self.history.len() >= MIN_HISTORY.min(config.beat_history);

        self.history.push_back(flux);
        while self.history.len() > config.beat_history.max(1) {
            self.history.pop_front();
        }

        if spectrum.is_silent() || !warm {
            return None;
        }

        let timestamp = frame.timestamp();
        if let Some(last) = self.last_beat {
            if timestamp - last < config.min_beat_gap {
                return None;
            }
        }

        let base = mean.max(FLUX_FLOOR);
        if flux <= config.beat_threshold * base {
            return None;
        }

        self.last_beat = Some(timestamp);
        let strength = flux / base;
        tracing::trace!(timestamp, strength, frame_size = self.frame_size, "onset");
        Some(BeatEvent {
            timestamp,
            strength,
        })
    }

    fn name(&self) -> &'static str {
        "flux"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::tests::sine;
    use crate::analysis::SpectralAnalyzer;

    const RATE: u32 = 8_000;
    const FRAME: usize = 400;

    struct Harness {
        analyzer: SpectralAnalyzer,
        detector: OnsetBeatDetector,
        config: RuntimeConfig,
        frames: u32,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                analyzer: SpectralAnalyzer::new(),
                detector: OnsetBeatDetector::new(FRAME, RATE).unwrap(),
                config: RuntimeConfig::default(),
                frames: 0,
            }
        }

        /// Feeds one 50 ms frame of a 200 Hz tone.
        fn feed(&mut self, amplitude: f32) -> Option<BeatEvent> {
            let timestamp = self.frames as f64 * FRAME as f64 / RATE as f64;
            self.frames += 1;

            let frame = AudioFrame::new(sine(200.0, amplitude, RATE, FRAME), 1, RATE, timestamp);
            let spectrum = self.analyzer.analyze(&frame, self.config.min_volume).unwrap();
            self.detector.detect(&frame, &spectrum, &self.config)
        }
    }

    #[test]
    fn rejects_degenerate_frames() {
        assert!(OnsetBeatDetector::new(1, RATE).is_err());
        assert!(OnsetBeatDetector::new(FRAME, 0).is_err());
    }

    #[test]
    fn attack_emits_one_beat_per_refractory_window() {
        let mut harness = Harness::new();
        for _ in 0..20 {
            assert!(harness.feed(0.05).is_none());
        }

        assert!(harness.feed(0.6).is_some());
        for _ in 0..4 {
            assert!(harness.feed(0.6).is_none());
        }
    }

    #[test]
    fn steady_tone_is_not_a_beat() {
        let mut harness = Harness::new();
        let beats = (0..60).filter_map(|_| harness.feed(0.3)).count();
        assert_eq!(beats, 0);
    }

    #[test]
    fn gated_frames_never_beat() {
        let mut harness = Harness::new();
        for _ in 0..20 {
            harness.feed(0.0);
        }
        assert!(harness.feed(0.004).is_none());
    }
}
