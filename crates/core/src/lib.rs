//! Core library for the MQTT Music Visualiser.
//!
//! Audio frames flow through spectral analysis, beat detection and band
//! routing into per-device trigger state machines. The resulting light
//! commands are handed to an MQTT publisher that runs independently of the
//! audio loop. Each module owns one of those stages.

pub mod analysis;
pub mod audio;
pub mod beat;
pub mod colour;
pub mod config;
pub mod device;
pub mod error;
pub mod pipeline;
pub mod publish;
pub mod routing;
pub mod telemetry;
pub mod trigger;

pub use analysis::{SpectralAnalyzer, SpectrumBin, SpectrumSnapshot};
pub use audio::{AudioFrame, AudioSource, ClipSource};
pub use beat::{select_detector, BeatDetector, BeatEvent, EnergyBeatDetector};
pub use colour::Rgb;
pub use config::{AppConfig, AudioConfig, BrokerConfig, ConfigProvider, ConfigStore, RuntimeConfig};
pub use device::{Device, DeviceMode, FlashColour, FrequencyRange, Protocol};
pub use error::{Result, VisualiserError};
pub use pipeline::{ControlLoop, IntentSink, LoopStats};
pub use publish::{ActuatorPublisher, Backoff, ConnectionState, PublisherHandle, TcpConnector};
pub use routing::{BandIntensities, BandRouter};
pub use telemetry::{TelemetryEvent, TelemetryQueue};
pub use trigger::{CommandIntent, DeviceTriggerEngine, LightCommand};
