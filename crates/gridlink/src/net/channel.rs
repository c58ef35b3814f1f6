// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Per-peer outbound channel.
//!
//! A channel owns exactly one protocol state machine and the wire it writes
//! through. The registry owns channels; protocols borrow from their channel;
//! the broker holds the registry. Retransmit deadlines flow to the broker
//! loop through a cloneable [`RetransmitScheduler`] handle so no component
//! holds a back-pointer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use mio::Waker;
use parking_lot::Mutex;

use crate::dispatch::Dispatcher;
use crate::message::Message;
use crate::net::Wire;
use crate::protocol::{PeerProtocol, TimerAction};

/// A request to (re-)arm a channel's retransmit timer.
#[derive(Debug, Clone)]
pub struct RetransmitRequest {
    pub peer: String,
    pub deadline: Instant,
}

/// Handle through which channels post retransmit deadlines to the loop.
///
/// A disconnected scheduler (registry running without a broker, as in unit
/// tests) drops requests; callers drive retransmission manually.
#[derive(Clone, Default)]
pub struct RetransmitScheduler {
    inner: Option<(Sender<RetransmitRequest>, Arc<Waker>)>,
}

impl RetransmitScheduler {
    /// Scheduler that discards every request.
    pub fn disconnected() -> Self {
        Self { inner: None }
    }

    /// Scheduler feeding the broker loop.
    pub fn new(tx: Sender<RetransmitRequest>, waker: Arc<Waker>) -> Self {
        Self {
            inner: Some((tx, waker)),
        }
    }

    fn arm(&self, peer: &str, delay: Duration) {
        let Some((tx, waker)) = &self.inner else {
            return;
        };
        let request = RetransmitRequest {
            peer: peer.to_string(),
            deadline: Instant::now() + delay,
        };
        if tx.send(request).is_ok() {
            if let Err(err) = waker.wake() {
                log::warn!("[channel] loop wake failed: {}", err);
            }
        }
    }
}

/// Outbound path to one remote peer.
pub struct Channel {
    peer: String,
    wire: Arc<dyn Wire>,
    protocol: Mutex<PeerProtocol>,
    scheduler: RetransmitScheduler,
    hooks: Option<Arc<Dispatcher>>,
}

impl Channel {
    pub fn new(
        peer: String,
        wire: Arc<dyn Wire>,
        protocol: PeerProtocol,
        scheduler: RetransmitScheduler,
    ) -> Self {
        Self {
            peer,
            wire,
            protocol: Mutex::new(protocol),
            scheduler,
            hooks: None,
        }
    }

    /// Attach the dispatcher whose write hooks stamp outbound messages.
    pub fn with_hooks(mut self, hooks: Option<Arc<Dispatcher>>) -> Self {
        self.hooks = hooks;
        self
    }

    /// The remote peer's uuid.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue a message for reliable delivery. Registered write hooks run
    /// over the submessage tree first, in registration order.
    pub fn send(&self, mut msg: Message) {
        if let Some(hooks) = &self.hooks {
            hooks.handle_outbound(&mut msg.submessages);
        }
        let action = self.protocol.lock().send(msg, self.wire.as_ref());
        self.apply(action);
    }

    /// Feed an inbound data message through the protocol; true when the
    /// message must be dispatched.
    pub fn receive(&self, msg: &Message) -> bool {
        self.protocol.lock().receive(msg, self.wire.as_ref())
    }

    /// Feed an inbound acknowledgement through the protocol.
    pub fn receive_ack(&self, msg: &Message) {
        self.protocol
            .lock()
            .receive_ack(msg, self.wire.as_ref());
    }

    /// Retransmit tick; returns the delay until the next tick while the
    /// window stays occupied.
    pub fn handle_resend(&self) -> Option<Duration> {
        match self.protocol.lock().handle_resend(self.wire.as_ref()) {
            TimerAction::Arm(delay) => Some(delay),
            TimerAction::Keep => None,
        }
    }

    /// Advisory phase-change hook.
    pub fn on_phase_change(&self, new_round: bool) {
        self.protocol.lock().on_phase_change(new_round);
    }

    /// False when retransmit exhaustion flagged the peer for this round.
    pub fn peer_reachable(&self) -> bool {
        self.protocol.lock().peer_reachable()
    }

    /// Tear down protocol state.
    pub fn stop(&self) {
        self.protocol.lock().stop();
    }

    fn apply(&self, action: TimerAction) {
        if let TimerAction::Arm(delay) = action {
            self.scheduler.arm(&self.peer, delay);
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("peer", &self.peer).finish()
    }
}
