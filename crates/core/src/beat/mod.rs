//! Beat detection behind a single capability trait.
//!
//! The implementation is chosen once in [`select_detector`]; the control loop
//! never asks which one it got.

use serde::{Deserialize, Serialize};

use crate::analysis::SpectrumSnapshot;
use crate::audio::{AudioFrame, AudioSource};
use crate::config::RuntimeConfig;

mod energy;
#[cfg(feature = "onset")]
mod onset;

pub use energy::EnergyBeatDetector;
#[cfg(feature = "onset")]
pub use onset::OnsetBeatDetector;

/// A detected beat. Emitted at most once per frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatEvent {
    /// Stream time of the frame the beat was detected in.
    pub timestamp: f64,
    /// Instantaneous energy relative to the recent average (1.0 = average).
    pub strength: f32,
}

/// Turns frames into beat events. Not detecting a beat is the common case,
/// not an error.
pub trait BeatDetector {
    fn detect(
        &mut self,
        frame: &AudioFrame,
        spectrum: &SpectrumSnapshot,
        config: &RuntimeConfig,
    ) -> Option<BeatEvent>;

    fn name(&self) -> &'static str;
}

/// Picks the spectral-flux detector when it is compiled in and initialises,
/// otherwise the energy-envelope fallback.
pub fn select_detector(source: &dyn AudioSource, frame_size: usize) -> Box<dyn BeatDetector> {
    #[cfg(feature = "onset")]
    match OnsetBeatDetector::new(frame_size, source.sample_rate()) {
        Ok(detector) => {
            tracing::info!("spectral-flux beat detection enabled");
            return Box::new(detector);
        }
        Err(err) => tracing::warn!("onset detector unavailable ({err}), using fallback beat detection"),
    }

    #[cfg(not(feature = "onset"))]
    {
        let _ = (source, frame_size);
        tracing::warn!("onset detection not compiled in, using fallback beat detection");
    }

    Box::new(EnergyBeatDetector::new())
}
