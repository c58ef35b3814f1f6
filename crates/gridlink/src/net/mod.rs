// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Networking: the UDP listener, per-peer channels and the registry.
//!
//! ```text
//! inbound datagram -> Listener -> envelope parse -> peer Protocol -> Dispatcher
//! module job -> Channel::send -> Protocol -> UdpWire -> socket
//! ```
//!
//! Ownership: the [`ConnectionRegistry`] owns channels; each [`Channel`]
//! owns its protocol state machine and wire; the broker holds the registry.
//! Retransmit deadlines travel by value through a [`RetransmitScheduler`]
//! handle instead of back-pointers.

mod channel;
mod listener;
mod registry;
mod wire;

pub use channel::{Channel, RetransmitRequest, RetransmitScheduler};
pub use listener::Listener;
pub use registry::ConnectionRegistry;
pub use wire::{UdpWire, Wire};

#[cfg(test)]
pub use wire::test_wire;
