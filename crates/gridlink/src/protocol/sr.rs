// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Synchronized sequenced channel with kill hashes.

use std::collections::VecDeque;
use std::time::Duration;

use crate::config::KILL_WINDOW_SIZE;
use crate::message::{now_micros, Message, ProtocolKind, StatusCode};
use crate::net::Wire;
use crate::protocol::{make_ack, seq, write_ack, write_data, Identity, TimerAction};

/// Synchronized Reliable Channel (wire tag `SRC`).
///
/// Differences from [`SucProtocol`](crate::protocol::SucProtocol):
///
/// - An initial SYN (status 201, property `syn`) establishes each direction.
///   Data from a previously silent peer is dropped until its SYN is
///   observed; a fresh SYN resynchronizes the inbound sequence space.
/// - The window head is re-sent without a retry bound. When a phase change
///   marks the head killable and it expires, the sender retires it and
///   announces its content hash and sequence (`kill` / `killseq`
///   properties) on subsequent transmissions; the receiver advances past
///   the killed sequence without delivering it and acknowledges it. The
///   receiver remembers the last [`KILL_WINDOW_SIZE`] kill hashes so a
///   retransmitted announcement is idempotent.
/// - Inbound delivery is strictly next-expected; anything else is dropped
///   (and re-acknowledged so the sender can advance).
pub struct SrcProtocol {
    identity: Identity,
    resend_delay: Duration,
    /// Next sequence to assign outbound.
    out_seq: u32,
    /// Next expected inbound sequence.
    in_seq: u32,
    /// Inbound direction has observed a SYN.
    in_sync: bool,
    /// Number of times the inbound side resynchronized.
    in_resyncs: u32,
    /// Wall time of the last accepted SYN (microseconds, for introspection).
    #[allow(dead_code)]
    in_sync_time: i64,
    /// Outbound SYN has been queued.
    out_sync: bool,
    /// Window head may be retired when it expires.
    killable: bool,
    /// Kill announcement attached to outbound traffic until acknowledged.
    pending_kill: Option<(u64, u32)>,
    window: VecDeque<Message>,
    /// Recently observed kill hashes on the inbound side.
    kill_window: VecDeque<u64>,
    stopped: bool,
}

impl std::fmt::Debug for SrcProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrcProtocol")
            .field("out_seq", &self.out_seq)
            .field("in_seq", &self.in_seq)
            .field("in_sync", &self.in_sync)
            .field("out_sync", &self.out_sync)
            .field("window", &self.window.len())
            .finish()
    }
}

impl SrcProtocol {
    pub fn new(identity: Identity, resend_delay: Duration) -> Self {
        Self {
            identity,
            resend_delay,
            out_seq: 0,
            in_seq: 0,
            in_sync: false,
            in_resyncs: 0,
            in_sync_time: 0,
            out_sync: false,
            killable: false,
            pending_kill: None,
            window: VecDeque::new(),
            kill_window: VecDeque::new(),
            stopped: false,
        }
    }

    pub fn send(&mut self, mut msg: Message, wire: &dyn Wire) -> TimerAction {
        if self.stopped {
            return TimerAction::Keep;
        }
        if msg.is_expired() {
            log::warn!(
                "[src] dropping expired message at send decision (status {})",
                msg.status().code()
            );
            return TimerAction::Keep;
        }

        let was_empty = self.window.is_empty();

        if !self.out_sync {
            let syn = self.make_syn();
            self.window.push_back(syn);
            self.out_sync = true;
        }

        self.stamp(&mut msg);
        self.window.push_back(msg);

        if was_empty {
            self.write_head(wire);
            TimerAction::Arm(self.resend_delay)
        } else {
            TimerAction::Keep
        }
    }

    pub fn receive(&mut self, msg: &Message, wire: &dyn Wire) -> bool {
        if self.stopped {
            return false;
        }

        // Kill announcements are processed before the sequence check so a
        // dead head cannot wedge the stream.
        self.observe_kill(msg, wire);

        if msg.status() == StatusCode::Created && msg.properties.contains("syn") {
            self.in_sync = true;
            self.in_resyncs += 1;
            self.in_sync_time = now_micros();
            self.in_seq = seq::next(msg.sequence());
            log::info!(
                "[src] synchronized with {} (resync #{})",
                msg.source(),
                self.in_resyncs
            );
            let ack = make_ack(&self.identity, ProtocolKind::Src, msg.sequence());
            write_ack(&ack, wire, "src");
            return false;
        }

        if !self.in_sync {
            log::debug!(
                "[src] data from {} before SYN; dropped",
                msg.source()
            );
            return false;
        }

        let sequence = msg.sequence();
        let accepted = seq::distance(self.in_seq, sequence) == 0;
        if accepted {
            self.in_seq = seq::next(sequence);
            let ack = make_ack(&self.identity, ProtocolKind::Src, sequence);
            write_ack(&ack, wire, "src");
        } else {
            // Duplicate or future: re-acknowledge the last in-order
            // sequence so a sender stuck on a delivered head advances.
            let last = (self.in_seq + crate::config::SEQUENCE_MODULO - 1)
                % crate::config::SEQUENCE_MODULO;
            let ack = make_ack(&self.identity, ProtocolKind::Src, last);
            write_ack(&ack, wire, "src");
            log::debug!(
                "[src] seq {} does not match expected {}; dropped",
                sequence,
                self.in_seq
            );
        }
        accepted
    }

    pub fn receive_ack(&mut self, msg: &Message, wire: &dyn Wire) {
        if self.stopped {
            return;
        }
        let ack = msg.sequence();
        let mut advanced = false;
        while let Some(head) = self.window.front() {
            if seq::acked_by(head.sequence(), ack) {
                self.window.pop_front();
                advanced = true;
            } else {
                break;
            }
        }
        if let Some((_, killseq)) = self.pending_kill {
            if seq::acked_by(killseq, ack) {
                self.pending_kill = None;
            }
        }
        if advanced && !self.window.is_empty() {
            self.write_head(wire);
        }
    }

    /// Retransmit tick: retire an expired killable head, then re-send the
    /// current head.
    pub fn handle_resend(&mut self, wire: &dyn Wire) -> TimerAction {
        if self.stopped {
            return TimerAction::Keep;
        }
        while let Some(head) = self.window.front() {
            if self.killable && head.is_expired() {
                let hash = head.hash();
                let killseq = head.sequence();
                log::warn!(
                    "[src] head seq {} expired; announcing kill of hash {:#018x}",
                    killseq,
                    hash
                );
                self.pending_kill = Some((hash, killseq));
                self.window.pop_front();
                continue;
            }
            break;
        }

        if self.window.is_empty() {
            if let Some((hash, killseq)) = self.pending_kill {
                // Nothing left to piggyback on: carry the announcement on a
                // bare no-content message.
                let mut msg = Message::new(StatusCode::NoContent);
                self.stamp(&mut msg);
                self.window.push_back(msg);
                log::debug!(
                    "[src] bare kill carrier for hash {:#018x} seq {}",
                    hash,
                    killseq
                );
            } else {
                return TimerAction::Keep;
            }
        }

        self.write_head(wire);
        TimerAction::Arm(self.resend_delay)
    }

    /// A new round marks the window head killable.
    pub fn on_phase_change(&mut self, new_round: bool) {
        if new_round {
            self.killable = true;
        }
    }

    pub fn stop(&mut self) {
        self.stopped = true;
        self.window.clear();
        self.kill_window.clear();
    }

    fn stamp(&mut self, msg: &mut Message) {
        msg.set_source(self.identity.uuid.clone());
        msg.set_host(self.identity.host.clone());
        msg.set_protocol(ProtocolKind::Src);
        msg.set_sequence(self.out_seq);
        msg.stamp_send_time();
        self.out_seq = seq::next(self.out_seq);
    }

    fn make_syn(&mut self) -> Message {
        let mut syn = Message::new(StatusCode::Created);
        syn.properties.put("syn", "1");
        self.stamp(&mut syn);
        syn
    }

    /// Write the window head, attaching any pending kill announcement.
    fn write_head(&mut self, wire: &dyn Wire) {
        let pending = self.pending_kill;
        if let Some(head) = self.window.front_mut() {
            if let Some((hash, killseq)) = pending {
                head.properties.put("kill", hash.to_string());
                head.properties.put("killseq", killseq.to_string());
            }
            write_data(head, wire, "src");
        }
    }

    /// Apply an inbound kill announcement, if any.
    fn observe_kill(&mut self, msg: &Message, wire: &dyn Wire) {
        let (Some(hash), Some(killseq)) = (msg.properties.get("kill"), msg.properties.get("killseq"))
        else {
            return;
        };
        let (Ok(hash), Ok(killseq)) = (hash.parse::<u64>(), killseq.parse::<u32>()) else {
            log::warn!("[src] malformed kill announcement from {}", msg.source());
            return;
        };

        if self.kill_window.contains(&hash) {
            return;
        }
        if self.kill_window.len() == KILL_WINDOW_SIZE {
            self.kill_window.pop_front();
        }
        self.kill_window.push_back(hash);

        // Advance past the killed sequence when it is still ahead of us.
        if self.in_sync && seq::distance(self.in_seq, killseq) < crate::config::SEQUENCE_MODULO / 2
        {
            log::info!(
                "[src] advancing past killed seq {} (hash {:#018x})",
                killseq,
                hash
            );
            self.in_seq = seq::next(killseq);
        }
        let ack = make_ack(&self.identity, ProtocolKind::Src, killseq);
        write_ack(&ack, wire, "src");
    }

    #[cfg(test)]
    pub(crate) fn window_len(&self) -> usize {
        self.window.len()
    }

    #[cfg(test)]
    pub(crate) fn resyncs(&self) -> u32 {
        self.in_resyncs
    }
}
