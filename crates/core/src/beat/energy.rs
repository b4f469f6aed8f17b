use std::collections::VecDeque;

use super::{BeatDetector, BeatEvent};
use crate::analysis::SpectrumSnapshot;
use crate::audio::AudioFrame;
use crate::config::RuntimeConfig;

/// Frames of history needed before any beat is reported.
const MIN_HISTORY: usize = 8;

/// Onset detector comparing short-term energy with a trailing average.
///
/// A beat needs all of: a warm history, energy above `beat_threshold` times
/// the rolling mean, a frame louder than the volume gate, and at least
/// `min_beat_gap` seconds since the previous beat.
#[derive(Debug, Default)]
pub struct EnergyBeatDetector {
    history: VecDeque<f32>,
    last_beat: Option<f64>,
}

impl EnergyBeatDetector {
    pub fn new() -> Self {
        Self::default()
    }

    fn rolling_average(&self) -> f32 {
        if self.history.is_empty() {
            return 0.0;
        }
        self.history.iter().sum::<f32>() / self.history.len() as f32
    }

    fn remember(&mut self, energy: f32, capacity: usize) {
        self.history.push_back(energy);
        while self.history.len() > capacity {
            self.history.pop_front();
        }
    }
}

impl BeatDetector for EnergyBeatDetector {
    fn detect(
        &mut self,
        frame: &AudioFrame,
        spectrum: &SpectrumSnapshot,
        config: &RuntimeConfig,
    ) -> Option<BeatEvent> {
        let volume = spectrum.volume();
        let energy = volume * volume;
        let timestamp = frame.timestamp();

        let average = self.rolling_average();
        let warm = self.history.len() >= MIN_HISTORY.min(config.beat_history);
        self.remember(energy, config.beat_history);

        if spectrum.is_silent() || !warm {
            return None;
        }

        let refractory = self
            .last_beat
            .map(|last| timestamp - last < config.min_beat_gap)
            .unwrap_or(false);
        if refractory {
            return None;
        }

        let floor = average.max(f32::EPSILON);
        if energy <= config.beat_threshold * floor {
            return None;
        }

        self.last_beat = Some(timestamp);
        let strength = energy / floor;
        tracing::trace!(timestamp, strength, "beat");
        Some(BeatEvent {
            timestamp,
            strength,
        })
    }

    fn name(&self) -> &'static str {
        "energy"
    }
}
