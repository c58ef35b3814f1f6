// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Typed device objects over a shared signal table.
//!
//! A device is one struct carrying its [`DeviceInfo`] (the type, state and
//! command sets computed by the [`DeviceBuilder`]) and a reference to the
//! adapter that backs its signals. Type membership is data-driven from the
//! device-class XML; there is no type hierarchy in code.

mod builder;
mod manager;

pub use builder::DeviceBuilder;
pub use manager::DeviceManager;

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::adapter::Adapter;
use crate::error::{Error, Result};

/// Scalar carried by device signals. 32-bit for RTDS compatibility; NaN
/// means uninitialized.
pub type SignalValue = f32;

/// SignalValue marking a slot that has never been filled.
pub const NO_VALUE: SignalValue = SignalValue::NAN;

/// A `(device id, signal name)` pair addressing one table slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceSignal {
    pub device: String,
    pub signal: String,
}

impl DeviceSignal {
    pub fn new<D: Into<String>, S: Into<String>>(device: D, signal: S) -> Self {
        Self {
            device: device.into(),
            signal: signal.into(),
        }
    }
}

impl std::fmt::Display for DeviceSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.device, self.signal)
    }
}

/// The capability sets of one device type, closed over `extends`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Every type in the closure, the device's own type included.
    pub types: BTreeSet<String>,
    /// State signals the device exposes.
    pub states: BTreeSet<String>,
    /// Command signals the device accepts.
    pub commands: BTreeSet<String>,
}

/// One physical or simulated device.
pub struct Device {
    id: String,
    info: DeviceInfo,
    adapter: Arc<dyn Adapter>,
}

impl Device {
    pub fn new(id: String, info: DeviceInfo, adapter: Arc<dyn Adapter>) -> Self {
        Self { id, info, adapter }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// True when the device's type closure contains `t`.
    pub fn has_type(&self, t: &str) -> bool {
        self.info.types.contains(t)
    }

    /// True when the device exposes the state signal.
    pub fn has_state(&self, signal: &str) -> bool {
        self.info.states.contains(signal)
    }

    /// True when the device accepts the command signal.
    pub fn has_command(&self, signal: &str) -> bool {
        self.info.commands.contains(signal)
    }

    /// Read a state signal from the adapter.
    pub fn state(&self, signal: &str) -> Result<SignalValue> {
        if !self.has_state(signal) {
            return Err(Error::BadSignal {
                device: self.id.clone(),
                signal: signal.to_string(),
            });
        }
        self.adapter.state(&self.id, signal)
    }

    /// Write a command signal through the adapter.
    pub fn set_command(&self, signal: &str, value: SignalValue) -> Result<()> {
        if !self.has_command(signal) {
            return Err(Error::BadSignal {
                device: self.id.clone(),
                signal: signal.to_string(),
            });
        }
        self.adapter.set_command(&self.id, signal, value)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("types", &self.info.types)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixtures for device and adapter tests.

    use super::*;
    use crate::adapter::BufferAdapter;

    /// An info with one type, one state and one command.
    pub fn simple_info(t: &str, state: &str, command: &str) -> DeviceInfo {
        let mut info = DeviceInfo::default();
        info.types.insert(t.to_string());
        info.states.insert(state.to_string());
        info.commands.insert(command.to_string());
        info
    }

    /// A started loopback adapter with `(id, signal)` at index 0 in both
    /// directions.
    pub fn loopback_adapter(id: &str, signal: &str) -> Arc<BufferAdapter> {
        let adapter = Arc::new(BufferAdapter::new("loop".to_string()));
        adapter
            .register_state(DeviceSignal::new(id, signal), 0)
            .expect("state registers");
        adapter
            .register_command(DeviceSignal::new(id, signal), 0)
            .expect("command registers");
        adapter.finalize();
        adapter
    }
}
