use std::fs;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{debug, warn};

use crate::util::discovery::DeviceRecord;

/// Known devices persisted as a JSON array. The file is always rewritten as a whole.
#[derive(Debug, Clone)]
pub struct DeviceCache {
    path: PathBuf,
}

impl DeviceCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DeviceCache { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the cached devices. A missing or unreadable file yields an empty list.
    pub fn load(&self) -> Vec<DeviceRecord> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No device cache at {}", self.path.display());
                return Vec::new();
            }
            Err(e) => {
                warn!("Failed to read device cache {}: {}", self.path.display(), e);
                return Vec::new();
            }
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("Ignoring corrupt device cache {}: {}", self.path.display(), e);
            Vec::new()
        })
    }

    pub fn save(&self, devices: &[DeviceRecord]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(devices).context("Failed to serialize devices")?;
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write device cache {}", self.path.display()))
    }

    /// Inserts the device, replacing any cached device with the same ip.
    pub fn upsert(&self, device: DeviceRecord) -> anyhow::Result<()> {
        let mut devices = self.load();
        match devices.iter_mut().find(|cached| cached.ip == device.ip) {
            Some(cached) => *cached = device,
            None => devices.push(device),
        }
        self.save(&devices)
    }

    /// Removes the device with `ip`. Returns whether it was cached.
    pub fn remove(&self, ip: Ipv4Addr) -> anyhow::Result<bool> {
        let mut devices = self.load();
        let before = devices.len();
        devices.retain(|cached| cached.ip != ip);
        if devices.len() == before {
            return Ok(false);
        }
        self.save(&devices)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_interface::PowerState;

    fn sample_devices() -> Vec<DeviceRecord> {
        let mut bulb = DeviceRecord::new(Ipv4Addr::new(192, 168, 1, 20), 55443);
        bulb.id = Some("0x000000000015243f".to_string());
        bulb.model = Some("color".to_string());
        bulb.name = Some("living room".to_string());
        bulb.firmware = Some("18".to_string());
        bulb.capabilities = Some(["set_power", "toggle"].map(String::from).into());
        bulb.power = Some(PowerState::Off);
        vec![bulb, DeviceRecord::new(Ipv4Addr::new(192, 168, 1, 21), 55443)]
    }

    #[test]
    fn test_save_then_load_returns_same_devices() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DeviceCache::new(dir.path().join("nested").join("devices.json"));
        cache.save(&sample_devices()).unwrap();
        assert_eq!(cache.load(), sample_devices());
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DeviceCache::new(dir.path().join("absent.json"));
        assert!(cache.load().is_empty());
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(DeviceCache::new(path).load().is_empty());
    }

    #[test]
    fn test_save_overwrites_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DeviceCache::new(dir.path().join("devices.json"));
        cache.save(&sample_devices()).unwrap();
        let last = sample_devices().pop().unwrap();
        cache.save(std::slice::from_ref(&last)).unwrap();
        assert_eq!(cache.load(), vec![last]);
    }

    #[test]
    fn test_upsert_replaces_by_ip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DeviceCache::new(dir.path().join("devices.json"));
        cache.save(&sample_devices()).unwrap();

        let mut renamed = DeviceRecord::new(Ipv4Addr::new(192, 168, 1, 20), 55443);
        renamed.name = Some("kitchen".to_string());
        cache.upsert(renamed.clone()).unwrap();

        let devices = cache.load();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0], renamed);
    }
}
