use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;

use super::{AppConfig, RuntimeConfig};
use crate::device::{validate_devices, Device};
use crate::{Result, VisualiserError};

/// What the control loop needs from whoever owns the configuration.
///
/// Both accessors return immutable snapshots. Callers fetch them once per
/// cycle so a concurrent update is observed either entirely or not at all.
pub trait ConfigProvider: Send + Sync {
    fn runtime(&self) -> Arc<RuntimeConfig>;

    /// Current device list. A changed [`DeviceSnapshot::version`] is the
    /// change notification.
    fn devices(&self) -> Arc<DeviceSnapshot>;
}

/// Versioned, immutable copy of the device list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSnapshot {
    pub version: u64,
    pub devices: Vec<Device>,
}

impl DeviceSnapshot {
    /// Devices the engine should drive.
    pub fn enabled(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().filter(|device| device.enabled)
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|device| device.id == id)
    }
}

/// Lock-free for readers, serialised for writers. Everything written is
/// validated first, so malformed data never reaches the pipeline.
pub struct ConfigStore {
    runtime: ArcSwap<RuntimeConfig>,
    devices: ArcSwap<DeviceSnapshot>,
    writer: Mutex<()>,
}

impl ConfigStore {
    /// Validates everything up front; an invalid device list is never stored.
    pub fn new(runtime: RuntimeConfig, devices: Vec<Device>) -> Result<Self> {
        runtime.validate()?;
        validate_devices(&devices)?;

        Ok(Self {
            runtime: ArcSwap::from_pointee(runtime),
            devices: ArcSwap::from_pointee(DeviceSnapshot {
                version: 1,
                devices,
            }),
            writer: Mutex::new(()),
        })
    }

    pub fn from_app_config(config: &AppConfig) -> Result<Self> {
        Self::new(config.runtime.clone(), config.devices.clone())
    }

    /// Swaps in new runtime scalars and the device list from a reloaded file.
    pub fn apply(&self, config: &AppConfig) -> Result<u64> {
        config.runtime.validate()?;
        validate_devices(&config.devices)?;

        let _guard = self.lock_writer()?;
        self.runtime.store(Arc::new(config.runtime.clone()));
        Ok(self.publish_devices(config.devices.clone()))
    }

    pub fn update_runtime(&self, runtime: RuntimeConfig) -> Result<()> {
        runtime.validate()?;
        let _guard = self.lock_writer()?;
        self.runtime.store(Arc::new(runtime));
        Ok(())
    }

    /// Replaces the whole device list. Returns the new snapshot version.
    pub fn replace_devices(&self, devices: Vec<Device>) -> Result<u64> {
        validate_devices(&devices)?;
        let _guard = self.lock_writer()?;
        Ok(self.publish_devices(devices))
    }

    /// Inserts or replaces the device with the same id.
    pub fn upsert_device(&self, device: Device) -> Result<u64> {
        device.validate()?;
        let _guard = self.lock_writer()?;

        let mut devices = self.devices.load().devices.clone();
        match devices.iter_mut().find(|existing| existing.id == device.id) {
            Some(slot) => *slot = device,
            None => devices.push(device),
        }
        Ok(self.publish_devices(devices))
    }

    /// Returns `false` when no device had that id.
    pub fn remove_device(&self, id: &str) -> Result<bool> {
        let _guard = self.lock_writer()?;

        let mut devices = self.devices.load().devices.clone();
        let before = devices.len();
        devices.retain(|device| device.id != id);
        if devices.len() == before {
            return Ok(false);
        }
        self.publish_devices(devices);
        Ok(true)
    }

    /// Toggles one device. Returns false for an unknown id.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let _guard = self.lock_writer()?;

        let mut devices = self.devices.load().devices.clone();
        let Some(device) = devices.iter_mut().find(|device| device.id == id) else {
            return Ok(false);
        };
        if device.enabled == enabled {
            return Ok(true);
        }
        device.enabled = enabled;
        self.publish_devices(devices);
        Ok(true)
    }

    /// Caller must hold the writer lock.
    fn publish_devices(&self, devices: Vec<Device>) -> u64 {
        let version = self.devices.load().version + 1;
        self.devices.store(Arc::new(DeviceSnapshot { version, devices }));
        tracing::debug!(version, "device snapshot updated");
        version
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, ()>> {
        self.writer
            .lock()
            .map_err(|_| VisualiserError::msg("config store writer has been poisoned"))
    }
}

impl ConfigProvider for ConfigStore {
    fn runtime(&self) -> Arc<RuntimeConfig> {
        self.runtime.load_full()
    }

    fn devices(&self) -> Arc<DeviceSnapshot> {
        self.devices.load_full()
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("runtime", &self.runtime.load())
            .field("devices_version", &self.devices.load().version)
            .finish()
    }
}
