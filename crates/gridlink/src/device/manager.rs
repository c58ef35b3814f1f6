// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Process-context device table.
//!
//! One manager per runtime context holds every device built by the adapter
//! factory and the plug-and-play sessions. Algorithm modules on the broker
//! loop and adapter threads both consult it, so the table is a concurrent
//! map.

use std::sync::Arc;

use dashmap::DashMap;

use crate::device::Device;
use crate::error::{Error, Result};

/// Table of live devices, keyed by device id.
#[derive(Default)]
pub struct DeviceManager {
    devices: DashMap<String, Arc<Device>>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a device; the id must be unused.
    pub fn add_device(&self, device: Arc<Device>) -> Result<()> {
        let id = device.id().to_string();
        if self.devices.contains_key(&id) {
            return Err(Error::DuplicateAdapter(id));
        }
        log::info!("[devices] added {}", id);
        self.devices.insert(id, device);
        Ok(())
    }

    /// Remove a device by id (adapter teardown path).
    pub fn remove_device(&self, id: &str) {
        if self.devices.remove(id).is_some() {
            log::info!("[devices] removed {}", id);
        }
    }

    /// Fetch a device by id.
    pub fn device(&self, id: &str) -> Result<Arc<Device>> {
        self.devices
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::UnknownDevice(id.to_string()))
    }

    /// True when a device with the id exists.
    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Every device whose type closure contains `device_type`.
    pub fn devices_of_type(&self, device_type: &str) -> Vec<Arc<Device>> {
        let mut matches: Vec<Arc<Device>> = self
            .devices
            .iter()
            .filter(|entry| entry.value().has_type(device_type))
            .map(|entry| entry.value().clone())
            .collect();
        matches.sort_by(|a, b| a.id().cmp(b.id()));
        matches
    }

    /// Number of devices in the table.
    pub fn count(&self) -> usize {
        self.devices.len()
    }

    /// Sorted ids of every device.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .devices
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::*;

    fn device(id: &str, t: &str) -> Arc<Device> {
        let adapter = loopback_adapter(id, "gateway");
        Arc::new(Device::new(
            id.to_string(),
            simple_info(t, "gateway", "gateway"),
            adapter,
        ))
    }

    #[test]
    fn test_add_and_fetch() {
        let manager = DeviceManager::new();
        manager.add_device(device("sst1", "sst")).expect("adds");
        assert!(manager.contains("sst1"));
        assert_eq!(manager.device("sst1").expect("fetch").id(), "sst1");
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let manager = DeviceManager::new();
        manager.add_device(device("sst1", "sst")).expect("adds");
        assert!(manager.add_device(device("sst1", "sst")).is_err());
    }

    #[test]
    fn test_unknown_device_errors() {
        let manager = DeviceManager::new();
        assert!(matches!(
            manager.device("ghost"),
            Err(Error::UnknownDevice(_))
        ));
    }

    #[test]
    fn test_devices_of_type_sorted() {
        let manager = DeviceManager::new();
        manager.add_device(device("b", "sst")).expect("adds");
        manager.add_device(device("a", "sst")).expect("adds");
        manager.add_device(device("c", "drer")).expect("adds");
        let ssts = manager.devices_of_type("sst");
        let ids: Vec<&str> = ssts.iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_remove_device() {
        let manager = DeviceManager::new();
        manager.add_device(device("sst1", "sst")).expect("adds");
        manager.remove_device("sst1");
        assert!(!manager.contains("sst1"));
        assert_eq!(manager.count(), 0);
    }
}
