// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Sliding-window sequenced channel with bounded retransmit.

use std::collections::VecDeque;
use std::time::Duration;

use crate::config::{MAX_RETRIES, WINDOW_SIZE};
use crate::message::{Message, ProtocolKind};
use crate::net::Wire;
use crate::protocol::{make_ack, seq, write_ack, write_data, Identity, TimerAction};

/// Upper bound for the widened accept window.
///
/// Keeps `in_seq + WINDOW_SIZE + accept_mod` well inside half the sequence
/// modulo so the wrap tie-break stays unambiguous.
const MAX_ACCEPT_MOD: u32 = 128;

struct QueueItem {
    /// Retransmissions remaining before the message is dropped.
    retries: u32,
    msg: Message,
}

/// Sequenced Unreliable Channel with retransmit (wire tag `SUC`).
///
/// Outbound: a FIFO window of at most [`WINDOW_SIZE`] unacknowledged
/// messages; the retransmit tick walks the window front-to-back, re-sending
/// and decrementing each entry's retry budget. Exhausted entries are dropped
/// and the peer is flagged unreachable for the round.
///
/// Inbound: accepts any sequence within `[in_seq, in_seq + WINDOW_SIZE +
/// accept_mod)` and advances past it without reorder buffering; sequences
/// skipped by a gap are dropped as old when they eventually arrive. The
/// accept window widens by one on each observed gap and shrinks by one on
/// each clean in-order delivery.
pub struct SucProtocol {
    identity: Identity,
    resend_delay: Duration,
    max_retries: u32,
    /// Next sequence to assign outbound.
    out_seq: u32,
    /// Next expected inbound sequence.
    in_seq: u32,
    /// Widening applied to the inbound accept window after observed loss.
    accept_mod: u32,
    /// Highest in-order sequence observed, once anything was accepted.
    last_in_order: Option<u32>,
    window: VecDeque<QueueItem>,
    /// Stamped messages waiting for a window slot.
    pending: VecDeque<Message>,
    reachable: bool,
    stopped: bool,
}

impl std::fmt::Debug for SucProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SucProtocol")
            .field("out_seq", &self.out_seq)
            .field("in_seq", &self.in_seq)
            .field("accept_mod", &self.accept_mod)
            .field("window", &self.window.len())
            .field("reachable", &self.reachable)
            .finish()
    }
}

impl SucProtocol {
    pub fn new(identity: Identity, resend_delay: Duration) -> Self {
        Self::with_retries(identity, resend_delay, MAX_RETRIES)
    }

    /// Constructor with an explicit retry budget.
    pub fn with_retries(identity: Identity, resend_delay: Duration, max_retries: u32) -> Self {
        Self {
            identity,
            resend_delay,
            max_retries,
            out_seq: 0,
            in_seq: 0,
            accept_mod: 0,
            last_in_order: None,
            window: VecDeque::new(),
            pending: VecDeque::new(),
            reachable: true,
            stopped: false,
        }
    }

    /// Move stamped messages into free window slots, keeping the window at
    /// most [`WINDOW_SIZE`] deep.
    fn promote_pending(&mut self) {
        while self.window.len() < WINDOW_SIZE {
            let Some(msg) = self.pending.pop_front() else {
                return;
            };
            self.window.push_back(QueueItem {
                retries: self.max_retries,
                msg,
            });
        }
    }

    pub fn send(&mut self, mut msg: Message, wire: &dyn Wire) -> TimerAction {
        if self.stopped {
            return TimerAction::Keep;
        }
        if msg.is_expired() {
            log::warn!(
                "[suc] dropping expired message at send decision (status {})",
                msg.status().code()
            );
            return TimerAction::Keep;
        }

        msg.set_source(self.identity.uuid.clone());
        msg.set_host(self.identity.host.clone());
        msg.set_protocol(ProtocolKind::Suc);
        msg.set_sequence(self.out_seq);
        msg.stamp_send_time();
        self.out_seq = seq::next(self.out_seq);

        let was_empty = self.window.is_empty();
        self.pending.push_back(msg);
        self.promote_pending();

        if was_empty {
            // Fire the first transmission now; later entries ride the tick.
            write_data(&self.window[0].msg, wire, "suc");
            TimerAction::Arm(self.resend_delay)
        } else {
            TimerAction::Keep
        }
    }

    pub fn receive(&mut self, msg: &Message, wire: &dyn Wire) -> bool {
        if self.stopped {
            return false;
        }
        let sequence = msg.sequence();
        let gap = seq::distance(self.in_seq, sequence);
        let accepted = gap < WINDOW_SIZE as u32 + self.accept_mod;

        if accepted {
            if gap > 0 {
                self.accept_mod = (self.accept_mod + 1).min(MAX_ACCEPT_MOD);
                log::debug!(
                    "[suc] gap of {} before seq {}; accept window widened to {}",
                    gap,
                    sequence,
                    WINDOW_SIZE as u32 + self.accept_mod
                );
            } else {
                self.accept_mod = self.accept_mod.saturating_sub(1);
            }
            self.in_seq = seq::next(sequence);
            self.last_in_order = Some(sequence);
        } else {
            log::debug!(
                "[suc] seq {} outside accept window at in_seq {}; dropped",
                sequence,
                self.in_seq
            );
        }

        // Always acknowledge the highest in-order sequence observed so far.
        if let Some(last) = self.last_in_order {
            let ack = make_ack(&self.identity, ProtocolKind::Suc, last);
            write_ack(&ack, wire, "suc");
        }

        accepted
    }

    pub fn receive_ack(&mut self, msg: &Message) {
        if self.stopped {
            return;
        }
        let ack = msg.sequence();
        while let Some(head) = self.window.front() {
            if seq::acked_by(head.msg.sequence(), ack) {
                self.window.pop_front();
            } else {
                break;
            }
        }
        self.promote_pending();
    }

    /// Retransmit tick: walk the window, re-send every entry, decrement its
    /// retry budget, drop exhausted or expired entries.
    pub fn handle_resend(&mut self, wire: &dyn Wire) -> TimerAction {
        if self.stopped {
            return TimerAction::Keep;
        }
        let mut keep = VecDeque::with_capacity(self.window.len());
        for mut item in self.window.drain(..) {
            if item.msg.is_expired() {
                log::warn!(
                    "[suc] message seq {} expired in window; dropped",
                    item.msg.sequence()
                );
                continue;
            }
            item.retries -= 1;
            write_data(&item.msg, wire, "suc");
            if item.retries == 0 {
                log::warn!(
                    "[suc] retransmit exhausted for seq {}; peer unreachable this round",
                    item.msg.sequence()
                );
                self.reachable = false;
                continue;
            }
            keep.push_back(item);
        }
        self.window = keep;
        self.promote_pending();

        if self.window.is_empty() {
            TimerAction::Keep
        } else {
            TimerAction::Arm(self.resend_delay)
        }
    }

    /// Phase changes clear the unreachable flag for the new round.
    pub fn on_phase_change(&mut self, new_round: bool) {
        if new_round {
            self.reachable = true;
        }
    }

    pub fn peer_reachable(&self) -> bool {
        self.reachable
    }

    pub fn stop(&mut self) {
        self.stopped = true;
        self.window.clear();
        self.pending.clear();
    }

    #[cfg(test)]
    pub(crate) fn window_len(&self) -> usize {
        self.window.len()
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn next_out_seq(&self) -> u32 {
        self.out_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SEQUENCE_MODULO;
    use crate::message::{RemoteHost, StatusCode};
    use crate::net::test_wire::CaptureWire;

    fn identity() -> Identity {
        Identity {
            uuid: "sender".to_string(),
            host: RemoteHost {
                hostname: "h".to_string(),
                port: "0".to_string(),
            },
        }
    }

    fn proto() -> SucProtocol {
        SucProtocol::new(identity(), Duration::from_millis(10))
    }

    fn data_msg(tag: &str) -> Message {
        let mut msg = Message::new(StatusCode::Ok);
        msg.submessages.put(tag, "1");
        msg
    }

    fn inbound(sequence: u32) -> Message {
        let mut msg = Message::new(StatusCode::Ok);
        msg.set_source("peer".to_string());
        msg.set_protocol(ProtocolKind::Suc);
        msg.set_sequence(sequence);
        msg.stamp_send_time();
        msg
    }

    #[test]
    fn test_send_assigns_monotone_sequences() {
        let wire = CaptureWire::new();
        let mut p = proto();
        for expected in 0..4u32 {
            p.send(data_msg("m"), &wire);
            assert_eq!(p.next_out_seq(), expected + 1);
        }
        assert_eq!(p.window_len(), 4);
    }

    #[test]
    fn test_window_bounded_with_overflow_queue() {
        let wire = CaptureWire::new();
        let mut p = proto();
        for _ in 0..20 {
            p.send(data_msg("m"), &wire);
        }
        assert_eq!(p.window_len(), WINDOW_SIZE);
        assert_eq!(p.pending_len(), 20 - WINDOW_SIZE);

        // A cumulative ack frees slots; queued messages move up.
        let mut ack = Message::new(StatusCode::Accepted);
        ack.set_sequence(4);
        p.receive_ack(&ack);
        assert_eq!(p.window_len(), WINDOW_SIZE);
        assert_eq!(p.pending_len(), 20 - WINDOW_SIZE - 5);
    }

    #[test]
    fn test_first_send_writes_immediately_and_arms_timer() {
        let wire = CaptureWire::new();
        let mut p = proto();
        let action = p.send(data_msg("m"), &wire);
        assert_eq!(action, TimerAction::Arm(Duration::from_millis(10)));
        assert_eq!(wire.sent().len(), 1);

        // Second message waits for the tick.
        let action = p.send(data_msg("m"), &wire);
        assert_eq!(action, TimerAction::Keep);
        assert_eq!(wire.sent().len(), 1);
    }

    #[test]
    fn test_expired_message_dropped_at_send() {
        let wire = CaptureWire::new();
        let mut p = proto();
        let mut msg = data_msg("m");
        msg.set_expire_time(0);
        assert_eq!(p.send(msg, &wire), TimerAction::Keep);
        assert_eq!(p.window_len(), 0);
        assert!(wire.sent().is_empty());
    }

    #[test]
    fn test_in_order_receive_accepts_and_acks() {
        let wire = CaptureWire::new();
        let mut p = proto();
        assert!(p.receive(&inbound(0), &wire));
        assert!(p.receive(&inbound(1), &wire));
        // Two acks, the last for sequence 1.
        let sent = wire.sent();
        assert_eq!(sent.len(), 2);
        let (envelope, ack) = Message::from_datagram(&sent[1]).expect("decodes");
        assert!(envelope.ack);
        assert_eq!(ack.sequence(), 1);
    }

    #[test]
    fn test_gap_accepted_late_arrival_dropped() {
        // Sequence 1 arrives before sequence 0.
        let wire = CaptureWire::new();
        let mut p = proto();
        assert!(p.receive(&inbound(1), &wire), "in-window gap accepted");
        assert!(
            !p.receive(&inbound(0), &wire),
            "skipped sequence dropped when it finally arrives"
        );
        assert!(p.receive(&inbound(2), &wire));
    }

    #[test]
    fn test_out_of_window_dropped_without_state_change() {
        let wire = CaptureWire::new();
        let mut p = proto();
        assert!(p.receive(&inbound(0), &wire));
        assert!(!p.receive(&inbound(500), &wire));
        // Next expected is still 1.
        assert!(p.receive(&inbound(1), &wire));
    }

    #[test]
    fn test_old_wrap_sequence_dropped() {
        let wire = CaptureWire::new();
        let mut p = proto();
        assert!(p.receive(&inbound(0), &wire));
        assert!(!p.receive(&inbound(SEQUENCE_MODULO - 1), &wire));
    }

    #[test]
    fn test_accept_mod_widens_and_shrinks() {
        let wire = CaptureWire::new();
        let mut p = proto();
        assert!(p.receive(&inbound(2), &wire), "gap widens window");
        // Window is now [3, 3+8+1); seq 11 sits inside it.
        assert!(p.receive(&inbound(11), &wire));
        // Clean run shrinks the widening back down.
        assert!(p.receive(&inbound(12), &wire));
        assert!(p.receive(&inbound(13), &wire));
        // Back at accept_mod 0: 8 past in_seq is out of window again.
        assert!(!p.receive(&inbound(14 + WINDOW_SIZE as u32), &wire));
    }

    #[test]
    fn test_ack_pops_window_prefix() {
        let wire = CaptureWire::new();
        let mut p = proto();
        for _ in 0..5 {
            p.send(data_msg("m"), &wire);
        }
        let mut ack = Message::new(StatusCode::Accepted);
        ack.set_sequence(2);
        p.receive_ack(&ack);
        assert_eq!(p.window_len(), 2);
    }

    #[test]
    fn test_stale_ack_pops_nothing() {
        let wire = CaptureWire::new();
        let mut p = proto();
        p.send(data_msg("m"), &wire);
        // An ack from far in the past (wrap distance >= 512).
        let mut ack = Message::new(StatusCode::Accepted);
        ack.set_sequence(SEQUENCE_MODULO - 100);
        p.receive_ack(&ack);
        assert_eq!(p.window_len(), 1);
    }

    #[test]
    fn test_retransmit_exhaustion_drops_and_flags() {
        // Three retries into a black hole.
        let wire = CaptureWire::new();
        let mut p = SucProtocol::with_retries(identity(), Duration::from_millis(10), 3);
        p.send(data_msg("m"), &wire);
        assert_eq!(wire.sent().len(), 1);

        assert_eq!(p.handle_resend(&wire), TimerAction::Arm(Duration::from_millis(10)));
        assert_eq!(p.handle_resend(&wire), TimerAction::Arm(Duration::from_millis(10)));
        // Third retransmit exhausts the budget.
        assert_eq!(p.handle_resend(&wire), TimerAction::Keep);
        assert_eq!(wire.sent().len(), 4);
        assert_eq!(p.window_len(), 0);
        assert!(!p.peer_reachable());

        // The next send uses the next sequence, not the dead one.
        p.send(data_msg("m"), &wire);
        let sent = wire.sent();
        let (envelope, _) = Message::from_datagram(sent.last().expect("sent")).expect("decodes");
        assert_eq!(envelope.sequence, 1);

        // A new round restores reachability.
        p.on_phase_change(true);
        assert!(p.peer_reachable());
    }

    #[test]
    fn test_resend_walks_whole_window() {
        let wire = CaptureWire::new();
        let mut p = proto();
        p.send(data_msg("a"), &wire);
        p.send(data_msg("b"), &wire);
        p.send(data_msg("c"), &wire);
        assert_eq!(wire.sent().len(), 1);
        p.handle_resend(&wire);
        // All three entries re-sent in order.
        assert_eq!(wire.sent().len(), 4);
        let sequences: Vec<u32> = wire.sent()[1..]
            .iter()
            .map(|d| Message::from_datagram(d).expect("decodes").0.sequence)
            .collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn test_expired_window_entry_dropped_on_tick() {
        let wire = CaptureWire::new();
        let mut p = proto();
        let mut msg = data_msg("m");
        msg.set_expire_from_now(Duration::from_micros(1));
        p.send(msg, &wire);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(p.handle_resend(&wire), TimerAction::Keep);
        assert_eq!(p.window_len(), 0);
    }

    #[test]
    fn test_stop_clears_window() {
        let wire = CaptureWire::new();
        let mut p = proto();
        p.send(data_msg("m"), &wire);
        p.stop();
        assert_eq!(p.window_len(), 0);
        assert_eq!(p.send(data_msg("m"), &wire), TimerAction::Keep);
    }
}
