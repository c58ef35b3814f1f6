// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! # gridlink - distributed smart-grid control broker
//!
//! The cyber control plane of a distributed smart-grid controller. Peer
//! processes cooperate over a lossy datagram network to manage physical
//! power devices attached through simulation or hardware adapters.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Algorithm Modules                           |
//! |        (group management, load balancing, ... - external)          |
//! +--------------------------------------------------------------------+
//! |                          Broker Layer                              |
//! |   Phase Scheduler | Dispatcher | ClockSynchronizer | Timers        |
//! +--------------------------------------------------------------------+
//! |                         Network Layer                              |
//! |   Listener | ConnectionRegistry | Channels | SUC/SRC Protocols     |
//! +--------------------------------------------------------------------+
//! |                         Device Layer                               |
//! |   DeviceManager | Adapters (buffer/rtds/pscad) | SimulationBridge  |
//! +--------------------------------------------------------------------+
//! ```
//!
//! Inbound flow: UDP datagram -> [`net::Listener`] -> envelope parse ->
//! per-peer protocol -> [`dispatch::Dispatcher`] -> module handlers.
//! Outbound: a module job runs in its phase, builds a [`message::Message`],
//! and hands it to the peer's channel; the protocol assigns a sequence,
//! windows it and drives retransmission.
//!
//! ## Concurrency model
//!
//! One event loop per process runs every module job, dispatcher handler,
//! protocol transition and timer callback; nothing in that set ever runs
//! concurrently. Adapter I/O and the external TCP servers run on their own
//! threads and touch the rest of the system only through reader-writer
//! locked signal buffers.
//!
//! ## Key types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`runtime::Runtime`] | Per-process context wiring the whole stack |
//! | [`broker::Broker`] | Cooperative phase scheduler and event loop |
//! | [`message::Message`] | Typed envelope with key/value submessages |
//! | [`net::ConnectionRegistry`] | Peer uuid to endpoint/channel mapping |
//! | [`device::Device`] | Typed device over a shared signal table |
//! | [`bridge::SimulationBridge`] | RST/GET/SET server for the simulator |

/// Device adapters: signal buffers and their I/O pumps.
pub mod adapter;
/// Simulation bridge server and its value tables.
pub mod bridge;
/// Cooperative phase scheduler, timers and signal handling.
pub mod broker;
/// Pairwise clock synchronization.
pub mod clock;
/// Constants and the broker's key=value configuration.
pub mod config;
/// Typed devices, the class builder and the device manager.
pub mod device;
/// Submessage-tag dispatch of inbound and outbound messages.
pub mod dispatch;
/// Crate-wide error taxonomy.
pub mod error;
/// Logger backend for the `log` facade.
pub mod logging;
/// Message envelope, key/value trees and the wire codec.
pub mod message;
/// UDP listener, channels and the connection registry.
pub mod net;
/// Reliable sequenced delivery protocols (SUC, SRC).
pub mod protocol;
/// Per-process runtime context.
pub mod runtime;

pub use config::BrokerConfig;
pub use error::{Error, Result};
pub use message::{KvTree, Message, ProtocolKind, StatusCode};
pub use runtime::Runtime;

/// gridlink version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
