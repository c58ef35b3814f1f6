// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Reliable sequenced delivery over lossy datagrams.
//!
//! Two protocol flavors share one contract and differ in retransmission
//! policy:
//!
//! | Flavor | Behavior |
//! |--------|----------|
//! | [`SucProtocol`] | Sliding window (8), bounded retries (100), adaptive accept window |
//! | [`SrcProtocol`] | SYN synchronization, unbounded resends, kill hashes for stale heads |
//!
//! ```text
//! Sender                                    Receiver
//!   |--- DATA (seq=0) ------------------------>|  in_seq 0 -> 1
//!   |--- DATA (seq=1) ----------X (lost)       |
//!   |<-- ACK  (seq=0) --------------------------|
//!   |--- DATA (seq=1) [retransmit] ----------->|  in_seq 1 -> 2
//!   |<-- ACK  (seq=1) --------------------------|  window empty
//! ```
//!
//! Protocol failures (retransmit exhaustion, expiry, out-of-window) are
//! logged and dropped; they are never surfaced as errors to algorithm
//! modules. Modules reason about peer health through their own timeouts.

mod seq;
mod sr;
mod suc;

pub use seq::{acked_by, distance, next};
pub use sr::SrcProtocol;
pub use suc::SucProtocol;

use std::time::Duration;

use crate::message::{Message, ProtocolKind, RemoteHost, StatusCode};
use crate::net::Wire;

/// Identity stamped onto every outbound message.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Local peer uuid.
    pub uuid: String,
    /// Local hostname and listen port as peers address them.
    pub host: RemoteHost,
}

/// What the caller must do with the channel's retransmit timer after a
/// protocol operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Leave the timer as it is.
    Keep,
    /// Arm (or re-arm) the retransmit timer after the given delay.
    Arm(Duration),
}

/// Closed sum of the protocol variants carried by a channel.
///
/// The listener maps a wire tag to a variant; nothing else implements the
/// contract.
#[derive(Debug)]
pub enum PeerProtocol {
    Suc(SucProtocol),
    Src(SrcProtocol),
}

impl PeerProtocol {
    /// Construct the variant for a wire protocol tag.
    pub fn new(kind: ProtocolKind, identity: Identity, resend_delay: Duration) -> Self {
        match kind {
            ProtocolKind::Suc => Self::Suc(SucProtocol::new(identity, resend_delay)),
            ProtocolKind::Src => Self::Src(SrcProtocol::new(identity, resend_delay)),
        }
    }

    /// The wire tag of this variant.
    pub fn kind(&self) -> ProtocolKind {
        match self {
            Self::Suc(_) => ProtocolKind::Suc,
            Self::Src(_) => ProtocolKind::Src,
        }
    }

    /// Queue a message for delivery. Expired messages are dropped at this
    /// decision point.
    pub fn send(&mut self, msg: Message, wire: &dyn Wire) -> TimerAction {
        match self {
            Self::Suc(p) => p.send(msg, wire),
            Self::Src(p) => p.send(msg, wire),
        }
    }

    /// Process an inbound data message. Returns true when the message must
    /// be handed to the dispatcher.
    pub fn receive(&mut self, msg: &Message, wire: &dyn Wire) -> bool {
        match self {
            Self::Suc(p) => p.receive(msg, wire),
            Self::Src(p) => p.receive(msg, wire),
        }
    }

    /// Process an inbound acknowledgement.
    pub fn receive_ack(&mut self, msg: &Message, wire: &dyn Wire) {
        match self {
            Self::Suc(p) => p.receive_ack(msg),
            Self::Src(p) => p.receive_ack(msg, wire),
        }
    }

    /// Retransmit tick driven by the channel's timer.
    pub fn handle_resend(&mut self, wire: &dyn Wire) -> TimerAction {
        match self {
            Self::Suc(p) => p.handle_resend(wire),
            Self::Src(p) => p.handle_resend(wire),
        }
    }

    /// Advisory phase-change hook from the scheduler.
    pub fn on_phase_change(&mut self, new_round: bool) {
        match self {
            Self::Suc(p) => p.on_phase_change(new_round),
            Self::Src(p) => p.on_phase_change(new_round),
        }
    }

    /// True unless retransmit exhaustion flagged the peer unreachable for
    /// the current round.
    pub fn peer_reachable(&self) -> bool {
        match self {
            Self::Suc(p) => p.peer_reachable(),
            Self::Src(_) => true,
        }
    }

    /// Drop all protocol state on shutdown.
    pub fn stop(&mut self) {
        match self {
            Self::Suc(p) => p.stop(),
            Self::Src(p) => p.stop(),
        }
    }
}

/// Build the acknowledgement for `sequence` in the given protocol flavor.
pub(crate) fn make_ack(identity: &Identity, kind: ProtocolKind, sequence: u32) -> Message {
    let mut ack = Message::new(StatusCode::Accepted);
    ack.set_source(identity.uuid.clone());
    ack.set_host(identity.host.clone());
    ack.set_protocol(kind);
    ack.set_sequence(sequence);
    ack.stamp_send_time();
    ack
}

/// Write an acknowledgement, logging (not propagating) wire failures.
pub(crate) fn write_ack(ack: &Message, wire: &dyn Wire, tag: &str) {
    match ack.to_datagram(true) {
        Ok(datagram) => {
            if let Err(err) = wire.write(&datagram) {
                log::warn!("[{}] ack send failed: {}", tag, err);
            }
        }
        Err(err) => log::warn!("[{}] ack encode failed: {}", tag, err),
    }
}

/// Write a data message, logging (not propagating) wire failures.
pub(crate) fn write_data(msg: &Message, wire: &dyn Wire, tag: &str) {
    match msg.to_datagram(false) {
        Ok(datagram) => {
            if let Err(err) = wire.write(&datagram) {
                log::warn!("[{}] send failed for seq {}: {}", tag, msg.sequence(), err);
            }
        }
        Err(err) => log::warn!("[{}] encode failed for seq {}: {}", tag, msg.sequence(), err),
    }
}
