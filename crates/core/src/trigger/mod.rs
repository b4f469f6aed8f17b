//! Per-device light state machines.
//!
//! The engine owns a private copy of the enabled devices, refreshed from a
//! versioned [`DeviceSnapshot`], and one [`DeviceRuntimeState`] per device.
//! Every publish goes through a per-device [`Coalescer`], so a device is never
//! addressed twice within `min_publish_interval`.

use std::fmt;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::beat::BeatEvent;
use crate::colour::{random_flash_colour, reactive_colour, Rgb};
use crate::config::{DeviceSnapshot, RuntimeConfig};
use crate::device::{Device, DeviceMode, FlashColour, Protocol};
use crate::routing::BandIntensities;

mod rate_limit;

pub use rate_limit::Coalescer;

/// Shortest gap between two flashes of one device while the flash guard is on
/// (at most three flashes per second).
pub const FLASH_GUARD_MIN_GAP: f64 = 1.0 / 3.0;

/// Power field of a light command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PowerState {
    On,
    Off,
}

/// What a light should look like after a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightCommand {
    pub power: PowerState,
    pub colour: Rgb,
    pub brightness: u8,
}

impl LightCommand {
    /// Light on with the given colour and brightness.
    pub fn on(colour: Rgb, brightness: u8) -> Self {
        Self {
            power: PowerState::On,
            colour,
            brightness,
        }
    }

    /// Light off. Colour and brightness are zeroed.
    pub fn off() -> Self {
        Self {
            power: PowerState::Off,
            colour: Rgb::BLACK,
            brightness: 0,
        }
    }

    pub fn is_on(&self) -> bool {
        self.power == PowerState::On
    }
}

/// A command addressed to one device, ready for encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandIntent {
    pub device_id: String,
    pub topic: String,
    pub protocol: Protocol,
    pub command: LightCommand,
    /// Stream time at which the rate limiter released the command.
    pub issued_at: f64,
}

/// Where a device is in its trigger cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePhase {
    #[default]
    Idle,
    Active,
    Flashing,
}

impl fmt::Display for DevicePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Flashing => "flashing",
        };
        f.write_str(name)
    }
}

/// Mutable per-device state, owned by the engine.
#[derive(Debug, Clone, Default)]
pub struct DeviceRuntimeState {
    pub phase: DevicePhase,
    pub last_published_at: Option<f64>,
    pub last_flash_at: Option<f64>,
    pub last_colour: Option<Rgb>,
    flash_until: Option<f64>,
    last_staged: Option<LightCommand>,
    outbox: Coalescer<LightCommand>,
}

impl DeviceRuntimeState {
    /// Command waiting for its rate-limit window to close.
    pub fn pending(&self) -> Option<&LightCommand> {
        self.outbox.pending()
    }

    fn stage(&mut self, now: f64, interval: f64, command: LightCommand) {
        if self.last_staged == Some(command) {
            return;
        }
        self.last_staged = Some(command);
        self.outbox.offer(now, interval, command);
    }
}

/// Everything the engine needs from one analysis step.
#[derive(Debug, Clone, Copy)]
pub struct TriggerInput<'a> {
    pub now: f64,
    pub silent: bool,
    pub intensities: &'a BandIntensities,
    pub beat: Option<&'a BeatEvent>,
}

struct DeviceSlot {
    device: Device,
    state: DeviceRuntimeState,
}

/// Turns routed band intensities and beats into rate-limited light commands.
pub struct DeviceTriggerEngine {
    slots: Vec<DeviceSlot>,
    version: Option<u64>,
    rng: StdRng,
}

impl DeviceTriggerEngine {
    /// Engine with an OS-seeded colour generator.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Deterministic random flash colours.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            slots: Vec::new(),
            version: None,
            rng,
        }
    }

    /// Version of the device snapshot currently in use.
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.slots.iter().map(|slot| &slot.device)
    }

    /// Runtime state of an enabled device.
    pub fn state(&self, device_id: &str) -> Option<&DeviceRuntimeState> {
        self.slots
            .iter()
            .find(|slot| slot.device.id == device_id)
            .map(|slot| &slot.state)
    }

    /// Adopts a new device snapshot. Returns false when the version is the one
    /// already in use.
    ///
    /// Devices that stay enabled keep their runtime state; disabled or removed
    /// devices lose it, newly enabled ones start idle.
    pub fn sync_devices(&mut self, snapshot: &DeviceSnapshot) -> bool {
        if self.version == Some(snapshot.version) {
            return false;
        }

        let mut previous = std::mem::take(&mut self.slots);
        self.slots = snapshot
            .enabled()
            .map(|device| {
                let state = previous
                    .iter()
                    .position(|slot| slot.device.id == device.id)
                    .map(|index| previous.swap_remove(index).state)
                    .unwrap_or_default();
                DeviceSlot {
                    device: device.clone(),
                    state,
                }
            })
            .collect();

        for dropped in &previous {
            tracing::debug!(device = %dropped.device.id, "device runtime state released");
        }
        tracing::debug!(
            version = snapshot.version,
            devices = self.slots.len(),
            "device snapshot applied"
        );
        self.version = Some(snapshot.version);
        true
    }

    /// Advances every device by one step and returns the commands whose
    /// rate-limit window closed.
    ///
    /// Due commands are released before any transition is evaluated, so a
    /// command staged in this step waits for the next window.
    pub fn process(&mut self, input: TriggerInput<'_>, config: &RuntimeConfig) -> Vec<CommandIntent> {
        let interval = config.min_publish_interval;
        let released = self.flush(input.now);

        for slot in &mut self.slots {
            let DeviceSlot { device, state } = slot;

            if state.phase == DevicePhase::Flashing
                && state.flash_until.is_some_and(|until| input.now >= until)
            {
                state.phase = DevicePhase::Idle;
                state.flash_until = None;
                state.stage(input.now, interval, LightCommand::off());
            }

            let dominant = input.intensities.dominant(&device.freq_ranges);
            let above = !input.silent
                && dominant.is_some_and(|(_, intensity)| intensity >= config.activation_threshold);

            match device.mode {
                DeviceMode::Flash => {
                    // Left over from reactive mode before a reload.
                    if state.phase == DevicePhase::Active {
                        tracing::debug!(device = %device.id, "reactive state cleared");
                        state.phase = DevicePhase::Idle;
                        state.stage(input.now, interval, LightCommand::off());
                    }
                    let Some(beat) = input.beat else {
                        continue;
                    };
                    if above && flash_allowed(device, state, input.now, config) {
                        let colour = match device.flash_colour {
                            FlashColour::Fixed(colour) => colour,
                            FlashColour::Random => {
                                random_flash_colour(&mut self.rng, state.last_colour)
                            }
                        };
                        tracing::debug!(
                            device = %device.id,
                            name = device.display_name(),
                            strength = beat.strength,
                            colour = %colour,
                            "flash"
                        );
                        state.phase = DevicePhase::Flashing;
                        state.last_flash_at = Some(input.now);
                        state.flash_until = Some(input.now + config.flash_duration);
                        state.stage(input.now, interval, LightCommand::on(colour, device.brightness));
                    }
                }
                DeviceMode::Reactive => match dominant {
                    Some((range, intensity)) if above => {
                        let (colour, brightness) =
                            reactive_colour(range.centre_hz(), intensity, device.brightness);
                        if state.phase == DevicePhase::Idle {
                            tracing::debug!(
                                device = %device.id,
                                name = device.display_name(),
                                range = %range,
                                "activated"
                            );
                        }
                        state.phase = DevicePhase::Active;
                        state.stage(input.now, interval, LightCommand::on(colour, brightness));
                    }
                    _ if state.phase == DevicePhase::Active => {
                        tracing::debug!(device = %device.id, "deactivated");
                        state.phase = DevicePhase::Idle;
                        state.stage(input.now, interval, LightCommand::off());
                    }
                    _ => {}
                },
            }
        }

        released
    }

    fn flush(&mut self, now: f64) -> Vec<CommandIntent> {
        let mut intents = Vec::new();
        for slot in &mut self.slots {
            let Some(command) = slot.state.outbox.poll(now) else {
                continue;
            };
            slot.state.last_published_at = Some(now);
            slot.state.last_colour = command.is_on().then_some(command.colour);
            intents.push(CommandIntent {
                device_id: slot.device.id.clone(),
                topic: slot.device.topic.clone(),
                protocol: slot.device.protocol,
                command,
                issued_at: now,
            });
        }
        intents
    }
}

impl Default for DeviceTriggerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DeviceTriggerEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTriggerEngine")
            .field("version", &self.version)
            .field("devices", &self.slots.len())
            .finish()
    }
}

fn flash_allowed(device: &Device, state: &DeviceRuntimeState, now: f64, config: &RuntimeConfig) -> bool {
    let since_last = state.last_flash_at.map(|last| now - last);
    if since_last.is_some_and(|gap| gap < device.flash_cooldown as f64) {
        return false;
    }
    if config.flash_guard {
        if state.phase == DevicePhase::Flashing {
            return false;
        }
        if since_last.is_some_and(|gap| gap < FLASH_GUARD_MIN_GAP) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FrequencyRange;

    const STEP: f64 = 0.05;

    fn bass() -> FrequencyRange {
        FrequencyRange::new(60.0, 250.0).unwrap()
    }

    fn snapshot(version: u64, devices: Vec<Device>) -> DeviceSnapshot {
        DeviceSnapshot { version, devices }
    }

    fn bands(intensity: f32) -> BandIntensities {
        BandIntensities::from_entries(vec![(bass(), intensity)])
    }

    fn engine_with(devices: Vec<Device>) -> DeviceTriggerEngine {
        let mut engine = DeviceTriggerEngine::with_seed(7);
        engine.sync_devices(&snapshot(1, devices));
        engine
    }

    /// Runs `steps` frames at a fixed cadence and collects every intent.
    fn drive(
        engine: &mut DeviceTriggerEngine,
        config: &RuntimeConfig,
        steps: usize,
        frame: impl Fn(f64) -> (bool, f32, bool),
    ) -> Vec<CommandIntent> {
        drive_from(engine, config, 0.0, steps, frame)
    }

    fn drive_from(
        engine: &mut DeviceTriggerEngine,
        config: &RuntimeConfig,
        start: f64,
        steps: usize,
        frame: impl Fn(f64) -> (bool, f32, bool),
    ) -> Vec<CommandIntent> {
        let mut intents = Vec::new();
        for step in 0..steps {
            let now = start + step as f64 * STEP;
            let (silent, intensity, beat) = frame(now);
            let intensities = bands(intensity);
            let beat = beat.then_some(BeatEvent {
                timestamp: now,
                strength: 2.0,
            });
            intents.extend(engine.process(
                TriggerInput {
                    now,
                    silent,
                    intensities: &intensities,
                    beat: beat.as_ref(),
                },
                config,
            ));
        }
        intents
    }

    fn near(now: f64, at: f64) -> bool {
        (now - at).abs() < 1e-6
    }

    #[test]
    fn silent_frames_never_activate_or_flash() {
        let devices = vec![
            Device::new("reactive", "lights/a").with_ranges(vec![bass()]),
            Device::new("flash", "lights/b")
                .with_ranges(vec![bass()])
                .with_mode(DeviceMode::Flash)
                .with_flash(FlashColour::Random, 0.0),
        ];
        let mut engine = engine_with(devices);
        let config = RuntimeConfig::default();

        let intents = drive(&mut engine, &config, 40, |_| (true, 1.0, true));

        assert!(intents.is_empty());
        assert_eq!(engine.state("reactive").unwrap().phase, DevicePhase::Idle);
        assert_eq!(engine.state("flash").unwrap().phase, DevicePhase::Idle);
    }

    #[test]
    fn flash_cooldown_suppresses_the_second_beat() {
        let red = Rgb::new(255, 0, 0);
        let device = Device::new("strobe", "lights/strobe")
            .with_ranges(vec![bass()])
            .with_mode(DeviceMode::Flash)
            .with_flash(FlashColour::Fixed(red), 2.0);
        let mut engine = engine_with(vec![device]);
        let config = RuntimeConfig::default();

        let beat_at = |now: f64| [0.0, 1.0, 2.1].iter().any(|at| near(now, *at));
        let flashes = |intents: &[CommandIntent]| {
            intents
                .iter()
                .filter(|intent| intent.command == LightCommand::on(red, 255))
                .count()
        };

        let first_two = drive(&mut engine, &config, 41, |now| (false, 0.9, beat_at(now)));
        assert_eq!(flashes(&first_two), 1);

        let mut engine = engine_with(vec![Device::new("strobe", "lights/strobe")
            .with_ranges(vec![bass()])
            .with_mode(DeviceMode::Flash)
            .with_flash(FlashColour::Fixed(red), 2.0)]);
        let all = drive(&mut engine, &config, 60, |now| (false, 0.9, beat_at(now)));
        assert_eq!(flashes(&all), 2);
    }

    #[test]
    fn flash_reverts_to_off_after_its_duration() {
        let device = Device::new("strobe", "lights/strobe")
            .with_ranges(vec![bass()])
            .with_mode(DeviceMode::Flash);
        let mut engine = engine_with(vec![device]);
        let config = RuntimeConfig::default();

        let intents = drive(&mut engine, &config, 20, |now| (false, 0.9, near(now, 0.0)));

        let powers: Vec<PowerState> = intents.iter().map(|i| i.command.power).collect();
        assert_eq!(powers, vec![PowerState::On, PowerState::Off]);
        assert!(intents[1].issued_at - intents[0].issued_at >= config.flash_duration - 1e-9);
        assert_eq!(engine.state("strobe").unwrap().phase, DevicePhase::Idle);
    }

    #[test]
    fn flash_guard_limits_strobe_rate() {
        let device = Device::new("strobe", "lights/strobe")
            .with_ranges(vec![bass()])
            .with_mode(DeviceMode::Flash)
            .with_flash(FlashColour::Random, 0.0);
        let mut config = RuntimeConfig::default();
        config.flash_duration = 0.1;

        let every_frame = |_: f64| (false, 0.9, true);

        let mut guarded = engine_with(vec![device.clone()]);
        let guarded_flashes = drive(&mut guarded, &config, 40, every_frame)
            .iter()
            .filter(|intent| intent.command.is_on())
            .count();

        config.flash_guard = false;
        let mut unguarded = engine_with(vec![device]);
        let unguarded_flashes = drive(&mut unguarded, &config, 40, every_frame)
            .iter()
            .filter(|intent| intent.command.is_on())
            .count();

        // Two seconds of beats: at most three flashes per second with the guard.
        assert!(guarded_flashes <= 6, "guarded run flashed {guarded_flashes} times");
        assert!(unguarded_flashes > guarded_flashes);
    }

    #[test]
    fn flash_needs_energy_in_the_device_band() {
        let device = Device::new("strobe", "lights/strobe")
            .with_ranges(vec![bass()])
            .with_mode(DeviceMode::Flash);
        let mut engine = engine_with(vec![device]);

        let intents = drive(&mut engine, &RuntimeConfig::default(), 20, |_| (false, 0.1, true));
        assert!(intents.is_empty());
    }

    #[test]
    fn burst_of_intents_is_coalesced_into_the_last_value() {
        let device = Device::new("lamp", "lights/lamp").with_ranges(vec![bass()]);
        let mut engine = engine_with(vec![device]);
        let config = RuntimeConfig::default();

        let mut published = Vec::new();
        for (now, intensity) in [(0.0, 0.5), (0.05, 0.7), (0.08, 0.9), (0.1, 0.9)] {
            let intensities = bands(intensity);
            published.extend(engine.process(
                TriggerInput {
                    now,
                    silent: false,
                    intensities: &intensities,
                    beat: None,
                },
                &config,
            ));
        }

        let (_, expected) = reactive_colour(bass().centre_hz(), 0.9, 255);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].command.brightness, expected);
        assert!(near(published[0].issued_at, 0.1));
    }

    #[test]
    fn publishes_to_one_device_respect_the_interval() {
        let device = Device::new("lamp", "lights/lamp").with_ranges(vec![bass()]);
        let mut engine = engine_with(vec![device]);
        let config = RuntimeConfig::default();

        let intents = drive(&mut engine, &config, 100, |now| {
            (false, 0.4 + 0.5 * (now * 7.0).sin().abs() as f32, false)
        });

        assert!(intents.len() > 5);
        assert!(intents
            .windows(2)
            .all(|pair| pair[1].issued_at - pair[0].issued_at >= config.min_publish_interval - 1e-9));
    }

    #[test]
    fn reactive_device_turns_off_when_band_drops() {
        let device = Device::new("lamp", "lights/lamp").with_ranges(vec![bass()]);
        let mut engine = engine_with(vec![device]);
        let config = RuntimeConfig::default();

        let intents = drive(&mut engine, &config, 20, |now| (false, if now < 0.4 { 0.8 } else { 0.1 }, false));

        let last = intents.last().unwrap();
        assert_eq!(last.command, LightCommand::off());
        assert_eq!(engine.state("lamp").unwrap().phase, DevicePhase::Idle);
        assert_eq!(engine.state("lamp").unwrap().last_colour, None);
    }

    #[test]
    fn identical_inputs_give_identical_colours() {
        let device = Device::new("lamp", "lights/lamp").with_ranges(vec![bass()]);
        let config = RuntimeConfig::default();

        let first = drive(&mut engine_with(vec![device.clone()]), &config, 10, |_| (false, 0.6, false));
        let second = drive(&mut engine_with(vec![device]), &config, 10, |_| (false, 0.6, false));

        assert_eq!(first, second);
    }

    #[test]
    fn runtime_state_tracks_enabled_devices() {
        let mut engine = DeviceTriggerEngine::with_seed(1);
        let mut disabled = Device::new("b", "lights/b");
        disabled.enabled = false;

        assert!(engine.sync_devices(&snapshot(1, vec![Device::new("a", "lights/a"), disabled.clone()])));
        assert!(engine.state("a").is_some());
        assert!(engine.state("b").is_none());

        assert!(!engine.sync_devices(&snapshot(1, Vec::new())));
        assert!(engine.state("a").is_some());

        disabled.enabled = true;
        assert!(engine.sync_devices(&snapshot(2, vec![disabled])));
        assert!(engine.state("a").is_none());
        assert!(engine.state("b").is_some());
        assert_eq!(engine.devices().count(), 1);
    }

    #[test]
    fn state_survives_a_snapshot_refresh() {
        let device = Device::new("lamp", "lights/lamp").with_ranges(vec![bass()]);
        let mut engine = engine_with(vec![device.clone()]);
        let config = RuntimeConfig::default();
        drive(&mut engine, &config, 5, |_| (false, 0.8, false));

        engine.sync_devices(&snapshot(2, vec![device]));
        assert_eq!(engine.state("lamp").unwrap().phase, DevicePhase::Active);
    }

    #[test]
    fn switching_an_active_device_to_flash_turns_it_off() {
        let device = Device::new("lamp", "lights/lamp").with_ranges(vec![bass()]);
        let mut engine = engine_with(vec![device.clone()]);
        let config = RuntimeConfig::default();
        let lit = drive(&mut engine, &config, 10, |_| (false, 0.9, false));
        assert!(lit.last().unwrap().command.is_on());

        engine.sync_devices(&snapshot(2, vec![device.with_mode(DeviceMode::Flash)]));
        let after = drive_from(&mut engine, &config, 10.0 * STEP, 200, |_| (true, 0.0, false));

        let state = engine.state("lamp").unwrap();
        assert_eq!(state.phase, DevicePhase::Idle);
        assert_eq!(after.last().unwrap().command, LightCommand::off());
        assert_eq!(state.last_colour, None);
    }
}
