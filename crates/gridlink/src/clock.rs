// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Pairwise clock synchronization.
//!
//! Every beacon period each peer sends an Exchange (status 800) carrying a
//! freshness counter `k`. The receiver answers with a Reading (status 801)
//! holding its receive time and reply send time. The originator combines
//! the two remote stamps with the reply's arrival time into an NTP-style
//! pairwise offset estimate:
//!
//! ```text
//! offset = ((t_recv_peer - t_sent) + (t_sent_peer - t_arrived)) / 2
//! ```
//!
//! Each peer's estimate is smoothed with an exponentially decaying weight
//! (decay driven by wall time since the previous observation); the process
//! offset published by [`synchronized_micros`](ClockSynchronizer::synchronized_micros)
//! is the weighted average over all live peers. Peers silent for
//! [`STALE_EXCHANGES`] beacons are dropped from the weight maps. No node is
//! authoritative.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::broker::BrokerHandle;
use crate::config::STALE_EXCHANGES;
use crate::dispatch::Dispatcher;
use crate::message::{now_micros, KvTree, Message, StatusCode};
use crate::net::ConnectionRegistry;

/// Submessage tag of clock-exchange traffic.
pub const CLOCK_TAG: &str = "clk";

/// Decay constant for observation weights (seconds).
const WEIGHT_TAU_SECS: f64 = 10.0;

/// Response history kept per peer.
const HISTORY_DEPTH: usize = 8;

struct DecayingWeight {
    weight: f64,
    updated_us: i64,
}

impl DecayingWeight {
    fn decayed(&self, now_us: i64) -> f64 {
        let age_secs = (now_us - self.updated_us).max(0) as f64 / 1e6;
        self.weight * (-age_secs / WEIGHT_TAU_SECS).exp()
    }
}

#[derive(Default)]
struct ClockState {
    /// Smoothed pairwise offset per peer (microseconds).
    offsets: HashMap<String, f64>,
    /// Pairwise skew estimate per peer (microseconds of drift per second).
    skews: HashMap<String, f64>,
    weights: HashMap<String, DecayingWeight>,
    /// Outstanding query per peer: (k, local send time).
    queries: HashMap<String, (u32, i64)>,
    /// Recent (arrival time, offset sample) pairs per peer.
    responses: HashMap<String, VecDeque<(i64, f64)>>,
    /// Highest k each peer has answered.
    last_response: HashMap<String, u32>,
    k: u32,
}

/// Per-process clock synchronizer module.
pub struct ClockSynchronizer {
    uuid: String,
    skew: Duration,
    beacon: Duration,
    handle: BrokerHandle,
    registry: Arc<ConnectionRegistry>,
    offset_us: ArcSwap<i64>,
    state: Mutex<ClockState>,
}

impl ClockSynchronizer {
    pub fn new(
        uuid: String,
        skew: Duration,
        beacon: Duration,
        handle: BrokerHandle,
        registry: Arc<ConnectionRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            uuid,
            skew,
            beacon,
            handle,
            registry,
            offset_us: ArcSwap::from_pointee(0),
            state: Mutex::new(ClockState::default()),
        })
    }

    /// Register the exchange handler with the dispatcher.
    pub fn register(self: Arc<Self>, dispatcher: &Dispatcher) {
        let this = self;
        dispatcher.register_read_handler(CLOCK_TAG, move |msg, source| {
            match msg.status() {
                StatusCode::ReadClock => this.handle_exchange(msg, source),
                StatusCode::ClockReading => this.handle_exchange_response(msg, source),
                other => log::debug!(
                    "[clock] ignoring {} submessage with status {}",
                    CLOCK_TAG,
                    other.code()
                ),
            }
        });
    }

    /// Begin the beacon cycle on the broker's system timers.
    pub fn start(self: Arc<Self>) {
        let handle = self.handle.clone();
        let beacon = self.beacon;
        handle.schedule_system(beacon, move || {
            self.beacon_tick();
        });
    }

    fn beacon_tick(self: Arc<Self>) {
        if self.handle.stopping() {
            return;
        }
        self.exchange();
        let handle = self.handle.clone();
        let beacon = self.beacon;
        handle.schedule_system(beacon, move || {
            self.beacon_tick();
        });
    }

    /// Send one exchange round to every registered peer, dropping stale
    /// peers first.
    pub fn exchange(&self) {
        let k = {
            let mut state = self.state.lock();
            state.k += 1;
            let k = state.k;

            let stale: Vec<String> = state
                .last_response
                .iter()
                .filter(|(_, &answered)| k.saturating_sub(answered) > STALE_EXCHANGES)
                .map(|(peer, _)| peer.clone())
                .collect();
            for peer in stale {
                log::info!("[clock] peer {} stale; dropping observations", peer);
                state.offsets.remove(&peer);
                state.skews.remove(&peer);
                state.weights.remove(&peer);
                state.responses.remove(&peer);
                state.last_response.remove(&peer);
                state.queries.remove(&peer);
            }
            k
        };

        for peer in self.registry.peers() {
            let channel = match self.registry.get_or_open(&peer) {
                Ok(channel) => channel,
                Err(err) => {
                    log::debug!("[clock] no channel to {}: {}", peer, err);
                    continue;
                }
            };
            let sent = now_micros();
            self.state.lock().queries.insert(peer.clone(), (k, sent));
            channel.send(self.exchange_message(k, sent));
        }
        self.recompute();
    }

    /// Build the query carried to each peer.
    fn exchange_message(&self, k: u32, sent: i64) -> Message {
        let mut msg = Message::new(StatusCode::ReadClock);
        let mut clk = KvTree::new();
        clk.put("k", k.to_string());
        clk.put("query-send", sent.to_string());
        msg.submessages.put_child(CLOCK_TAG, clk);
        msg.set_never_expires();
        msg
    }

    /// Answer a peer's exchange with our receive and send stamps.
    fn handle_exchange(&self, msg: &Message, source: &str) {
        let received = now_micros();
        let Some(clk) = msg.submessages.get_child(CLOCK_TAG) else {
            return;
        };
        let (Some(k), Some(query_send)) = (clk.get("k"), clk.get("query-send")) else {
            log::debug!("[clock] malformed exchange from {}", source);
            return;
        };

        let channel = match self.registry.get_or_open(source) {
            Ok(channel) => channel,
            Err(err) => {
                log::debug!("[clock] cannot answer {}: {}", source, err);
                return;
            }
        };

        let mut reply = Message::new(StatusCode::ClockReading);
        let mut clk = KvTree::new();
        clk.put("k", k);
        clk.put("query-send", query_send);
        clk.put("recv", received.to_string());
        clk.put("resp-send", now_micros().to_string());
        reply.submessages.put_child(CLOCK_TAG, clk);
        reply.set_never_expires();
        channel.send(reply);
    }

    /// Fold a peer's reading into the offset and skew estimates.
    fn handle_exchange_response(&self, msg: &Message, source: &str) {
        let arrived = now_micros();
        let Some(clk) = msg.submessages.get_child(CLOCK_TAG) else {
            return;
        };
        let (Some(k), Some(recv), Some(resp_send)) =
            (clk.get("k"), clk.get("recv"), clk.get("resp-send"))
        else {
            log::debug!("[clock] malformed reading from {}", source);
            return;
        };
        let (Ok(k), Ok(t1), Ok(t2)) = (
            k.parse::<u32>(),
            recv.parse::<i64>(),
            resp_send.parse::<i64>(),
        ) else {
            log::debug!("[clock] non-numeric reading from {}", source);
            return;
        };

        let mut state = self.state.lock();
        let Some(&(expected_k, t0)) = state.queries.get(source) else {
            log::debug!("[clock] unsolicited reading from {}", source);
            return;
        };
        if expected_k != k {
            log::debug!(
                "[clock] reading from {} answers k={}, outstanding is {}",
                source,
                k,
                expected_k
            );
            return;
        }
        state.queries.remove(source);
        state.last_response.insert(source.to_string(), k);

        let sample = ((t1 - t0) as f64 + (t2 - arrived) as f64) / 2.0;

        // Exponentially decayed blend with the previous estimate.
        let prior_weight = state
            .weights
            .get(source)
            .map(|w| w.decayed(arrived))
            .unwrap_or(0.0);
        let prior_offset = state.offsets.get(source).copied().unwrap_or(0.0);
        let blended = (prior_offset * prior_weight + sample) / (prior_weight + 1.0);
        state.offsets.insert(source.to_string(), blended);
        state.weights.insert(
            source.to_string(),
            DecayingWeight {
                weight: prior_weight + 1.0,
                updated_us: arrived,
            },
        );

        let history = state.responses.entry(source.to_string()).or_default();
        history.push_back((arrived, sample));
        if history.len() > HISTORY_DEPTH {
            history.pop_front();
        }
        if let (Some(&(t_first, o_first)), Some(&(t_last, o_last))) =
            (history.front(), history.back())
        {
            if t_last > t_first {
                let span_secs = (t_last - t_first) as f64 / 1e6;
                state
                    .skews
                    .insert(source.to_string(), (o_last - o_first) / span_secs);
            }
        }
        drop(state);

        self.recompute();
        log::debug!(
            "[clock] {} offset sample {:.0}us (k={})",
            source,
            sample,
            k
        );
    }

    /// Publish the weighted average of all live pairwise offsets.
    fn recompute(&self) {
        let now = now_micros();
        let state = self.state.lock();
        let mut weighted = 0.0;
        let mut total = 0.0;
        for (peer, offset) in &state.offsets {
            let Some(weight) = state.weights.get(peer).map(|w| w.decayed(now)) else {
                continue;
            };
            weighted += offset * weight;
            total += weight;
        }
        let offset = if total > f64::EPSILON {
            (weighted / total) as i64
        } else {
            0
        };
        self.offset_us.store(Arc::new(offset));
    }

    /// Best-estimate synchronized wall time, in microseconds since the Unix
    /// epoch. Monotone per process between adjustments.
    pub fn synchronized_micros(&self) -> i64 {
        now_micros() + self.skew.as_micros() as i64 + **self.offset_us.load()
    }

    /// The currently published process offset (microseconds).
    pub fn offset_micros(&self) -> i64 {
        **self.offset_us.load()
    }

    /// Pairwise skew estimate for one peer, if known (microseconds per
    /// second of drift).
    pub fn skew_of(&self, peer: &str) -> Option<f64> {
        self.state.lock().skews.get(peer).copied()
    }

    /// This node's uuid (the `i` of every (i, j) pair).
    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}
