//! The per-frame control loop.
//!
//! Each step runs analysis, beat detection, routing and triggering in order on
//! the calling thread, against one configuration snapshot fetched at the start
//! of the step. Intents leave through a non-blocking [`IntentSink`].

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::analysis::{SpectralAnalyzer, SpectrumSnapshot};
use crate::audio::{AudioFrame, AudioSource};
use crate::beat::{BeatDetector, BeatEvent};
use crate::config::ConfigProvider;
use crate::publish::PublisherHandle;
use crate::routing::BandRouter;
use crate::telemetry::{TelemetryEvent, TelemetryQueue};
use crate::trigger::{CommandIntent, DeviceTriggerEngine, TriggerInput};
use crate::Result;

/// Display bands sent with each spectrum telemetry event.
pub const TELEMETRY_BANDS: usize = 32;

/// Where released intents go. Must never block.
pub trait IntentSink: Send {
    /// False when the intent could not be queued.
    fn offer(&self, intent: CommandIntent) -> bool;
}

impl IntentSink for PublisherHandle {
    fn offer(&self, intent: CommandIntent) -> bool {
        self.try_publish(intent)
    }
}

impl IntentSink for mpsc::Sender<CommandIntent> {
    fn offer(&self, intent: CommandIntent) -> bool {
        self.try_send(intent).is_ok()
    }
}

/// Running totals for one control loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub frames: u64,
    pub beats: u64,
    pub intents_sent: u64,
    pub intents_dropped: u64,
}

/// What one step produced.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub spectrum: SpectrumSnapshot,
    pub beat: Option<BeatEvent>,
    pub intents: Vec<CommandIntent>,
}

/// Drives one audio source through every stage up to the intent sink.
pub struct ControlLoop {
    source: Box<dyn AudioSource>,
    analyzer: SpectralAnalyzer,
    detector: Box<dyn BeatDetector>,
    router: BandRouter,
    engine: DeviceTriggerEngine,
    config: Arc<dyn ConfigProvider>,
    sink: Box<dyn IntentSink>,
    telemetry: Option<TelemetryQueue>,
    stats: LoopStats,
}

impl ControlLoop {
    pub fn new(
        source: Box<dyn AudioSource>,
        detector: Box<dyn BeatDetector>,
        config: Arc<dyn ConfigProvider>,
        sink: Box<dyn IntentSink>,
    ) -> Self {
        Self {
            source,
            analyzer: SpectralAnalyzer::new(),
            detector,
            router: BandRouter::default(),
            engine: DeviceTriggerEngine::new(),
            config,
            sink,
            telemetry: None,
            stats: LoopStats::default(),
        }
    }

    pub fn with_telemetry(mut self, queue: TelemetryQueue) -> Self {
        self.telemetry = Some(queue);
        self
    }

    /// Replaces the trigger engine, e.g. with a seeded one.
    pub fn with_engine(mut self, engine: DeviceTriggerEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn engine(&self) -> &DeviceTriggerEngine {
        &self.engine
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }

    /// Processes one frame.
    pub fn step(&mut self, frame: &AudioFrame) -> Result<StepOutcome> {
        let runtime = self.config.runtime();
        let devices = self.config.devices();
        if self.engine.sync_devices(&devices) {
            self.router = BandRouter::for_devices(self.engine.devices());
            tracing::info!(
                version = devices.version,
                devices = self.engine.devices().count(),
                ranges = self.router.ranges().len(),
                "device list refreshed"
            );
        }

        let spectrum = self.analyzer.analyze(frame, runtime.min_volume)?;
        let beat = self
            .detector
            .detect(frame, &spectrum, &runtime)
            .filter(|_| !spectrum.is_silent());
        let intensities = self.router.route(&spectrum);
        let intents = self.engine.process(
            TriggerInput {
                now: frame.timestamp(),
                silent: spectrum.is_silent(),
                intensities: &intensities,
                beat: beat.as_ref(),
            },
            &runtime,
        );

        self.stats.frames += 1;
        if let Some(beat) = &beat {
            self.stats.beats += 1;
            tracing::debug!(timestamp = beat.timestamp, strength = beat.strength, "beat");
        }
        for intent in &intents {
            if self.sink.offer(intent.clone()) {
                self.stats.intents_sent += 1;
            } else {
                self.stats.intents_dropped += 1;
            }
        }

        if let Some(queue) = &self.telemetry {
            queue.publish(TelemetryEvent::spectrum(&spectrum, TELEMETRY_BANDS));
            if let Some(beat) = &beat {
                queue.publish(TelemetryEvent::beat(beat, self.stats.beats));
            }
            for intent in &intents {
                queue.publish(TelemetryEvent::device_state(intent));
            }
        }

        Ok(StepOutcome {
            spectrum,
            beat,
            intents,
        })
    }

    /// Pulls frames until the source ends or `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<LoopStats> {
        tracing::info!(detector = self.detector.name(), "control loop started");
        while let Some(frame) = self.source.read_frame(shutdown)? {
            self.step(&frame)?;
        }

        let stats = self.stats;
        tracing::info!(
            frames = stats.frames,
            beats = stats.beats,
            intents_sent = stats.intents_sent,
            intents_dropped = stats.intents_dropped,
            "control loop stopped"
        );
        Ok(stats)
    }
}

impl std::fmt::Debug for ControlLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLoop")
            .field("detector", &self.detector.name())
            .field("engine", &self.engine)
            .field("stats", &self.stats)
            .finish()
    }
}
