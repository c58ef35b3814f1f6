// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Device adapters: backing stores and I/O drivers for device signals.
//!
//! An adapter owns the rx (state) and tx (command) buffers its devices
//! read and write, plus whatever I/O pump keeps those buffers in step with
//! the external world:
//!
//! | Adapter | Transport |
//! |---------|-----------|
//! | [`BufferAdapter`] | none (in-process tables; loopback for tests) |
//! | [`RtdsAdapter`] | TCP, lock-step binary frames, network byte order |
//! | [`PscadAdapter`] | TCP, ASCII line frames |
//!
//! Adapter I/O runs on its own thread; it touches the rest of the system
//! only through the reader-writer-locked signal buffers.

mod buffer;
mod factory;
mod pscad;
mod rtds;
mod session;

pub use buffer::BufferAdapter;
pub use factory::AdapterFactory;
pub use pscad::PscadAdapter;
pub use rtds::RtdsAdapter;
pub use session::SessionServer;

use crate::device::{DeviceSignal, SignalValue};
use crate::error::Result;

/// Capability interface every adapter provides.
pub trait Adapter: Send + Sync {
    /// The adapter's configured name.
    fn name(&self) -> &str;

    /// Most recent value of a state signal. Before the first successful
    /// fill this is the uninitialized value (NaN for buffer adapters); in
    /// a degraded adapter it is the last valid value.
    fn state(&self, device: &str, signal: &str) -> Result<SignalValue>;

    /// Update a command signal in the tx buffer.
    fn set_command(&self, device: &str, signal: &str, value: SignalValue) -> Result<()>;

    /// Bind a state signal to an rx buffer index. Only before `start()`;
    /// indexes are unique per direction.
    fn register_state(&self, signal: DeviceSignal, index: usize) -> Result<()>;

    /// Bind a command signal to a tx buffer index. Only before `start()`;
    /// indexes are unique per direction.
    fn register_command(&self, signal: DeviceSignal, index: usize) -> Result<()>;

    /// Seal registration and begin I/O.
    fn start(&self) -> Result<()>;

    /// Stop I/O and close any connection.
    fn stop(&self);
}
