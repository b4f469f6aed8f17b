use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;

use crate::analysis::SpectrumSnapshot;
use crate::beat::BeatEvent;
use crate::colour::Rgb;
use crate::trigger::{CommandIntent, PowerState};

/// Upper bound on bands carried by a spectrum event.
pub const MAX_DISPLAY_BANDS: usize = 64;
/// Events held before the oldest is discarded.
pub const DEFAULT_CAPACITY: usize = 128;

/// Fire-and-forget observations for an external dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Spectrum {
        timestamp: f64,
        volume: f32,
        bands: Vec<f32>,
    },
    Beat {
        timestamp: f64,
        strength: f32,
        /// Beats seen since the loop started.
        total: u64,
    },
    DeviceState {
        device_id: String,
        state: PowerState,
        colour: Rgb,
        brightness: u8,
        timestamp: f64,
    },
}

impl TelemetryEvent {
    /// Spectrum summary folded into at most `bands` display bands.
    pub fn spectrum(snapshot: &SpectrumSnapshot, bands: usize) -> Self {
        Self::Spectrum {
            timestamp: snapshot.timestamp(),
            volume: snapshot.volume(),
            bands: snapshot.display_bands(bands.min(MAX_DISPLAY_BANDS)),
        }
    }

    pub fn beat(beat: &BeatEvent, total: u64) -> Self {
        Self::Beat {
            timestamp: beat.timestamp,
            strength: beat.strength,
            total,
        }
    }

    /// What a device was just told to do.
    pub fn device_state(intent: &CommandIntent) -> Self {
        Self::DeviceState {
            device_id: intent.device_id.clone(),
            state: intent.command.power,
            colour: intent.command.colour,
            brightness: intent.command.brightness,
            timestamp: intent.issued_at,
        }
    }
}

/// Bounded queue that discards its oldest event instead of blocking.
#[derive(Debug, Clone)]
pub struct TelemetryQueue {
    sender: Sender<TelemetryEvent>,
    receiver: Receiver<TelemetryEvent>,
    discarded: Arc<AtomicU64>,
}

impl TelemetryQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self {
            sender,
            receiver,
            discarded: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queues `event`, discarding the oldest one when full. Never blocks.
    pub fn publish(&self, event: TelemetryEvent) {
        let mut event = event;
        loop {
            match self.sender.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if self.receiver.try_recv().is_ok() {
                        self.discarded.fetch_add(1, Ordering::Relaxed);
                    }
                    event = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Receiving end for the sink.
    pub fn subscribe(&self) -> Receiver<TelemetryEvent> {
        self.receiver.clone()
    }

    /// Events dropped to make room so far.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Default for TelemetryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beat(total: u64) -> TelemetryEvent {
        TelemetryEvent::Beat {
            timestamp: total as f64,
            strength: 2.0,
            total,
        }
    }

    #[test]
    fn full_queue_discards_the_oldest_event() {
        let queue = TelemetryQueue::new(3);
        for total in 0..5 {
            queue.publish(beat(total));
        }

        let received: Vec<TelemetryEvent> = queue.subscribe().try_iter().collect();
        assert_eq!(received, vec![beat(2), beat(3), beat(4)]);
        assert_eq!(queue.discarded(), 2);
    }

    #[test]
    fn spectrum_events_are_bounded() {
        let snapshot = SpectrumSnapshot::from_bins(Vec::new(), 0.1, 0.005, 1.5);
        let TelemetryEvent::Spectrum { bands, timestamp, .. } = TelemetryEvent::spectrum(&snapshot, 500)
        else {
            panic!("expected a spectrum event");
        };
        assert_eq!(bands.len(), MAX_DISPLAY_BANDS);
        assert_eq!(timestamp, 1.5);
    }

    #[test]
    fn events_serialise_with_a_type_tag() {
        let json = serde_json::to_value(beat(7)).unwrap();
        assert_eq!(json["type"], "beat");
        assert_eq!(json["total"], 7);
    }
}
