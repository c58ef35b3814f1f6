// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Buffer adapter: the shared signal tables every adapter flavor builds on.
//!
//! Two float vectors (rx for states, tx for commands) behind reader-writer
//! locks, plus the index maps tying each `(device, signal)` pair to its
//! slot. Values start as NaN and stay NaN until the first successful fill.
//! Neither lock is ever held across I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::device::{DeviceSignal, SignalValue, NO_VALUE};
use crate::error::{Error, Result};

/// Shared rx/tx signal tables with index registration.
pub struct BufferAdapter {
    name: String,
    rx: RwLock<Vec<SignalValue>>,
    tx: RwLock<Vec<SignalValue>>,
    state_index: RwLock<HashMap<DeviceSignal, usize>>,
    command_index: RwLock<HashMap<DeviceSignal, usize>>,
    started: AtomicBool,
    degraded: AtomicBool,
}

impl BufferAdapter {
    pub fn new(name: String) -> Self {
        Self {
            name,
            rx: RwLock::new(Vec::new()),
            tx: RwLock::new(Vec::new()),
            state_index: RwLock::new(HashMap::new()),
            command_index: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
        }
    }

    /// Seal registration. Idempotent; called by `start()` of every flavor.
    pub fn finalize(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// True once `start()`/`finalize()` sealed the index maps.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Flag the adapter degraded: reads keep returning the last valid
    /// values, command writes are dropped with a warning.
    pub fn mark_degraded(&self) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            log::warn!("[adapter {}] entering degraded state", self.name);
        }
    }

    /// Clear the degraded flag after a successful reconnect.
    pub fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            log::info!("[adapter {}] recovered from degraded state", self.name);
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Number of registered state slots.
    pub fn rx_len(&self) -> usize {
        self.rx.read().len()
    }

    /// Number of registered command slots.
    pub fn tx_len(&self) -> usize {
        self.tx.read().len()
    }

    /// Copy of the command buffer (shared lock).
    pub fn snapshot_tx(&self) -> Vec<SignalValue> {
        self.tx.read().clone()
    }

    /// Registered state slots, ordered by index.
    pub fn state_entries(&self) -> Vec<(DeviceSignal, usize)> {
        let mut entries: Vec<(DeviceSignal, usize)> = self
            .state_index
            .read()
            .iter()
            .map(|(signal, &index)| (signal.clone(), index))
            .collect();
        entries.sort_by_key(|(_, index)| *index);
        entries
    }

    /// Registered command slots, ordered by index.
    pub fn command_entries(&self) -> Vec<(DeviceSignal, usize)> {
        let mut entries: Vec<(DeviceSignal, usize)> = self
            .command_index
            .read()
            .iter()
            .map(|(signal, &index)| (signal.clone(), index))
            .collect();
        entries.sort_by_key(|(_, index)| *index);
        entries
    }

    /// Write one rx slot by index (line-framed adapters fill piecewise).
    pub fn fill_rx_slot(&self, index: usize, value: SignalValue) {
        let mut rx = self.rx.write();
        if index < rx.len() {
            rx[index] = value;
        }
    }

    /// Overwrite the state buffer from received data (unique lock). Short
    /// input leaves the tail untouched.
    pub fn fill_rx(&self, data: &[SignalValue]) {
        let mut rx = self.rx.write();
        let n = data.len().min(rx.len());
        rx[..n].copy_from_slice(&data[..n]);
    }

    /// Loopback tick: copy the command buffer into the state buffer, index
    /// for index. This is the whole I/O cycle of a standalone buffer
    /// adapter.
    pub fn tick_loopback(&self) {
        let snapshot = self.snapshot_tx();
        self.fill_rx(&snapshot);
    }

    fn register(
        &self,
        map: &RwLock<HashMap<DeviceSignal, usize>>,
        buffer: &RwLock<Vec<SignalValue>>,
        signal: DeviceSignal,
        index: usize,
    ) -> Result<()> {
        if self.is_started() {
            return Err(Error::AdapterStarted(self.name.clone()));
        }
        let mut map = map.write();
        if map.values().any(|&used| used == index) {
            return Err(Error::DuplicateIndex(index));
        }
        if map.contains_key(&signal) {
            return Err(Error::DuplicateEntry {
                device_type: self.name.clone(),
                entry: signal.to_string(),
            });
        }
        let mut buffer = buffer.write();
        if buffer.len() <= index {
            buffer.resize(index + 1, NO_VALUE);
        }
        map.insert(signal, index);
        Ok(())
    }

    fn index_of(
        &self,
        map: &RwLock<HashMap<DeviceSignal, usize>>,
        device: &str,
        signal: &str,
    ) -> Result<usize> {
        map.read()
            .get(&DeviceSignal::new(device, signal))
            .copied()
            .ok_or_else(|| Error::UnregisteredSignal {
                device: device.to_string(),
                signal: signal.to_string(),
            })
    }
}

impl super::Adapter for BufferAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self, device: &str, signal: &str) -> Result<SignalValue> {
        let index = self.index_of(&self.state_index, device, signal)?;
        Ok(self.rx.read()[index])
    }

    fn set_command(&self, device: &str, signal: &str, value: SignalValue) -> Result<()> {
        let index = self.index_of(&self.command_index, device, signal)?;
        if self.is_degraded() {
            log::warn!(
                "[adapter {}] degraded; dropping command ({},{})={}",
                self.name,
                device,
                signal,
                value
            );
            return Ok(());
        }
        self.tx.write()[index] = value;
        Ok(())
    }

    fn register_state(&self, signal: DeviceSignal, index: usize) -> Result<()> {
        self.register(&self.state_index, &self.rx, signal, index)
    }

    fn register_command(&self, signal: DeviceSignal, index: usize) -> Result<()> {
        self.register(&self.command_index, &self.tx, signal, index)
    }

    fn start(&self) -> Result<()> {
        self.finalize();
        Ok(())
    }

    fn stop(&self) {}
}

impl std::fmt::Debug for BufferAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferAdapter")
            .field("name", &self.name)
            .field("rx_len", &self.rx_len())
            .field("tx_len", &self.tx_len())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}
