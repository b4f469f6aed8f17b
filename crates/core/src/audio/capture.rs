use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample, Stream, StreamConfig};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use super::{downmix, is_shutdown, AudioFrame, AudioSource, FrameBuffer};
use crate::config::AudioConfig;
use crate::{Result, VisualiserError};

/// Callback chunks buffered between the audio thread and the control loop.
const CHUNK_QUEUE: usize = 64;
/// How long a read waits before re-checking the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Live input from the host's default capture device.
///
/// The cpal callback only down-mixes and forwards; framing happens on the
/// reading side. Drop the source to stop the stream.
pub struct CaptureSource {
    _stream: Stream,
    chunks: Receiver<Vec<f32>>,
    buffer: FrameBuffer,
    sample_rate: u32,
    overruns: Arc<AtomicU64>,
}

impl CaptureSource {
    /// Opens the default input device. Failure here is fatal for the caller.
    pub fn open(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| VisualiserError::AudioUnavailable("no input device available".into()))?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let supported = device
            .supported_input_configs()
            .map_err(unavailable)?
            .find(|range| {
                range.min_sample_rate().0 <= config.sample_rate
                    && config.sample_rate <= range.max_sample_rate().0
            })
            .map(|range| range.with_sample_rate(cpal::SampleRate(config.sample_rate)));
        let supported = match supported {
            Some(supported) => supported,
            None => {
                let fallback = device.default_input_config().map_err(unavailable)?;
                tracing::warn!(
                    requested = config.sample_rate,
                    using = fallback.sample_rate().0,
                    "input device does not support the configured sample rate"
                );
                fallback
            }
        };

        let stream_config: StreamConfig = supported.config();
        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels;
        let (sender, chunks) = bounded(CHUNK_QUEUE);
        let overruns = Arc::new(AtomicU64::new(0));

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, sender, overruns.clone()),
            SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, sender, overruns.clone()),
            SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, sender, overruns.clone()),
            other => Err(VisualiserError::AudioUnavailable(format!(
                "unsupported sample format: {other}"
            ))),
        }?;
        stream.play().map_err(unavailable)?;

        tracing::info!(
            device = %device_name,
            sample_rate,
            channels,
            buffer_size = config.buffer_size,
            "audio capture started"
        );

        Ok(Self {
            _stream: stream,
            chunks,
            buffer: FrameBuffer::new(config.buffer_size, channels, sample_rate)?,
            sample_rate,
            overruns,
        })
    }

    /// Callback chunks dropped because the control loop fell behind.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

impl AudioSource for CaptureSource {
    fn read_frame(&mut self, shutdown: &AtomicBool) -> Result<Option<AudioFrame>> {
        loop {
            if is_shutdown(shutdown) {
                return Ok(None);
            }
            if let Some(frame) = self.buffer.pop_frame() {
                return Ok(Some(frame));
            }
            match self.chunks.recv_timeout(POLL_INTERVAL) {
                Ok(chunk) => self.buffer.push(&chunk),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(VisualiserError::AudioUnavailable(
                        "audio stream closed".into(),
                    ))
                }
            }
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    sender: Sender<Vec<f32>>,
    overruns: Arc<AtomicU64>,
) -> Result<Stream>
where
    T: SizedSample,
    f32: cpal::FromSample<T>,
{
    use cpal::Sample;

    let channels = config.channels;
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let converted: Vec<f32> = data.iter().map(|s| s.to_sample::<f32>()).collect();
                match sender.try_send(downmix(&converted, channels)) {
                    Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                    Err(TrySendError::Full(_)) => {
                        overruns.fetch_add(1, Ordering::Relaxed);
                    }
                }
            },
            |err| tracing::error!("audio stream error: {}", err),
            None,
        )
        .map_err(unavailable)
}

fn unavailable(err: impl std::fmt::Display) -> VisualiserError {
    VisualiserError::AudioUnavailable(err.to_string())
}

impl std::fmt::Debug for CaptureSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSource")
            .field("sample_rate", &self.sample_rate)
            .field("buffered", &self.buffer.buffered())
            .field("overruns", &self.overruns())
            .finish()
    }
}
