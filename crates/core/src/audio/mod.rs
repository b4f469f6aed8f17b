//! Audio sources feeding the control loop.
//!
//! A source hands out fixed-size mono [`AudioFrame`]s. Its timestamps are the
//! stream position in seconds, and every later stage uses them as its clock,
//! so replaying the same samples always produces the same lighting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{Result, VisualiserError};

#[cfg(feature = "capture")]
mod capture;
mod clip;

#[cfg(feature = "capture")]
pub use capture::CaptureSource;
pub use clip::ClipSource;

/// One block of mono samples. Immutable once captured.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    /// Channel count of the stream the samples were mixed down from.
    channels: u16,
    sample_rate: u32,
    /// Stream position of the first sample, in seconds.
    timestamp: f64,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32, timestamp: f64) -> Self {
        Self {
            samples: samples.into(),
            channels,
            sample_rate,
            timestamp,
        }
    }

    /// Mono samples in [-1, 1].
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Channel count of the source before downmixing.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Stream position of the first sample, in seconds.
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Seconds covered by this frame.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate.max(1) as f64
    }

    /// Root mean square of the raw samples.
    pub fn rms(&self) -> f32 {
        compute_rms(&self.samples)
    }
}

/// Anything the control loop can pull frames from.
///
/// `read_frame` may block while waiting for audio but must return promptly
/// once `shutdown` is set. `Ok(None)` means the stream is over.
pub trait AudioSource {
    fn read_frame(&mut self, shutdown: &AtomicBool) -> Result<Option<AudioFrame>>;

    fn sample_rate(&self) -> u32;
}

/// Collects mono samples of arbitrary chunk size and cuts them into frames.
#[derive(Debug)]
pub struct FrameBuffer {
    frame_size: usize,
    channels: u16,
    sample_rate: u32,
    pending: Vec<f32>,
    emitted_samples: u64,
}

impl FrameBuffer {
    pub fn new(frame_size: usize, channels: u16, sample_rate: u32) -> Result<Self> {
        if frame_size < 2 {
            return Err(VisualiserError::InvalidInput(
                "frames need at least two samples",
            ));
        }
        if sample_rate == 0 {
            return Err(VisualiserError::InvalidInput("sample rate must be positive"));
        }

        Ok(Self {
            frame_size,
            channels,
            sample_rate,
            pending: Vec::with_capacity(frame_size * 2),
            emitted_samples: 0,
        })
    }

    /// Appends mono samples; complete frames become available to [`pop_frame`](Self::pop_frame).
    pub fn push(&mut self, mono: &[f32]) {
        self.pending.extend_from_slice(mono);
    }

    /// Next complete frame, if enough samples are buffered.
    pub fn pop_frame(&mut self) -> Option<AudioFrame> {
        if self.pending.len() < self.frame_size {
            return None;
        }

        let rest = self.pending.split_off(self.frame_size);
        let samples = std::mem::replace(&mut self.pending, rest);
        let timestamp = self.emitted_samples as f64 / self.sample_rate as f64;
        self.emitted_samples += self.frame_size as u64;

        Some(AudioFrame::new(samples, self.channels, self.sample_rate, timestamp))
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// Averages interleaved channels into mono.
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

pub(crate) fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

pub(crate) fn is_shutdown(flag: &AtomicBool) -> bool {
    flag.load(Ordering::Acquire)
}
