use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use super::{downmix, is_shutdown, AudioFrame, AudioSource, FrameBuffer};
use crate::{Result, VisualiserError};

/// Longest single sleep while pacing, so shutdown is noticed quickly.
const PACING_SLICE: Duration = Duration::from_millis(20);

/// Plays back a preloaded clip as frames, optionally at real-time cadence.
///
/// Used for `replay` from a WAV file and for driving the loop in tests.
#[derive(Debug)]
pub struct ClipSource {
    samples: Vec<f32>,
    position: usize,
    buffer: FrameBuffer,
    sample_rate: u32,
    realtime: bool,
    started: Option<Instant>,
}

impl ClipSource {
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32, frame_size: usize) -> Result<Self> {
        Self::with_channels(samples, 1, sample_rate, frame_size)
    }

    fn with_channels(
        samples: Vec<f32>,
        channels: u16,
        sample_rate: u32,
        frame_size: usize,
    ) -> Result<Self> {
        Ok(Self {
            samples,
            position: 0,
            buffer: FrameBuffer::new(frame_size, channels, sample_rate)?,
            sample_rate,
            realtime: false,
            started: None,
        })
    }

    /// Decodes a WAV file and mixes it down to mono.
    pub fn open_wav(path: impl AsRef<Path>, frame_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = hound::WavReader::open(path).map_err(|err| {
            VisualiserError::AudioUnavailable(format!("{}: {err}", path.display()))
        })?;
        let spec = reader.spec();

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .map_err(|err| VisualiserError::AudioUnavailable(err.to_string()))?,
            hound::SampleFormat::Int => {
                let scale = (1u64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|sample| sample.map(|value| value as f32 / scale))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|err| VisualiserError::AudioUnavailable(err.to_string()))?
            }
        };

        tracing::info!(
            path = %path.display(),
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            seconds = interleaved.len() as f64
                / spec.channels.max(1) as f64
                / spec.sample_rate.max(1) as f64,
            "loaded clip"
        );

        Self::with_channels(
            downmix(&interleaved, spec.channels),
            spec.channels,
            spec.sample_rate,
            frame_size,
        )
    }

    /// When enabled, frames are released no faster than they would arrive
    /// from a live input.
    pub fn realtime(mut self, enabled: bool) -> Self {
        self.realtime = enabled;
        self
    }

    fn pace(&mut self, frame: &AudioFrame, shutdown: &AtomicBool) -> bool {
        let started = *self.started.get_or_insert_with(Instant::now);
        let due = started + Duration::from_secs_f64(frame.timestamp() + frame.duration());

        loop {
            if is_shutdown(shutdown) {
                return false;
            }
            let now = Instant::now();
            if now >= due {
                return true;
            }
            std::thread::sleep((due - now).min(PACING_SLICE));
        }
    }
}

impl AudioSource for ClipSource {
    fn read_frame(&mut self, shutdown: &AtomicBool) -> Result<Option<AudioFrame>> {
        if is_shutdown(shutdown) {
            return Ok(None);
        }

        let frame = loop {
            if let Some(frame) = self.buffer.pop_frame() {
                break frame;
            }
            if self.position >= self.samples.len() {
                return Ok(None);
            }
            let end = (self.position + 4096).min(self.samples.len());
            self.buffer.push(&self.samples[self.position..end]);
            self.position = end;
        };

        if self.realtime && !self.pace(&frame, shutdown) {
            return Ok(None);
        }
        Ok(Some(frame))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
