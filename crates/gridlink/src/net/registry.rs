// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Process-wide connection registry.
//!
//! Maps peer uuid to resolved endpoint and to the live outbound channel.
//! All mutations are serialized by one mutex; lookups hand out
//! reference-counted channel handles, so a caller may keep using a channel
//! after the registry has dropped its strong reference. Inbound traffic
//! never mutates the peer set.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use mio::net::UdpSocket;
use parking_lot::Mutex;

use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::message::{ProtocolKind, RemoteHost};
use crate::net::{Channel, RetransmitScheduler, UdpWire};
use crate::protocol::{Identity, PeerProtocol};

struct RegistryState {
    hostnames: HashMap<String, RemoteHost>,
    endpoints: HashMap<String, SocketAddr>,
    channels: HashMap<String, Arc<Channel>>,
}

/// Registry of peers and their outbound channels.
pub struct ConnectionRegistry {
    identity: Identity,
    protocol: ProtocolKind,
    resend_delay: Duration,
    socket: Arc<UdpSocket>,
    scheduler: RetransmitScheduler,
    hooks: Mutex<Option<Arc<Dispatcher>>>,
    state: Mutex<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new(
        identity: Identity,
        protocol: ProtocolKind,
        resend_delay: Duration,
        socket: Arc<UdpSocket>,
        scheduler: RetransmitScheduler,
    ) -> Self {
        Self {
            identity,
            protocol,
            resend_delay,
            socket,
            scheduler,
            hooks: Mutex::new(None),
            state: Mutex::new(RegistryState {
                hostnames: HashMap::new(),
                endpoints: HashMap::new(),
                channels: HashMap::new(),
            }),
        }
    }

    /// Attach the dispatcher whose write hooks stamp every outbound
    /// message. Applies to channels opened afterwards.
    pub fn set_dispatcher(&self, dispatcher: Arc<Dispatcher>) {
        *self.hooks.lock() = Some(dispatcher);
    }

    /// This node's uuid.
    pub fn uuid(&self) -> &str {
        &self.identity.uuid
    }

    /// This node's hostname entry.
    pub fn hostname(&self) -> &RemoteHost {
        &self.identity.host
    }

    /// Register a peer, resolving its endpoint once. Idempotent; a changed
    /// host or port updates the stored endpoint (the live channel, if any,
    /// keeps the endpoint it was opened with until reopened).
    pub fn register_peer(&self, uuid: &str, host: &str, port: &str) -> Result<()> {
        let endpoint = (host, parse_port(port)?)
            .to_socket_addrs()
            .map_err(|e| Error::BindFailed(format!("resolve {}:{}: {}", host, port, e)))?
            .next()
            .ok_or_else(|| Error::BindFailed(format!("no address for {}:{}", host, port)))?;

        let mut state = self.state.lock();
        state.hostnames.insert(
            uuid.to_string(),
            RemoteHost {
                hostname: host.to_string(),
                port: port.to_string(),
            },
        );
        let previous = state.endpoints.insert(uuid.to_string(), endpoint);
        if previous != Some(endpoint) {
            log::info!("[registry] peer {} at {}", uuid, endpoint);
        }
        Ok(())
    }

    /// Fetch the channel for a registered peer, opening it on first use.
    pub fn get_or_open(&self, uuid: &str) -> Result<Arc<Channel>> {
        let mut state = self.state.lock();
        if let Some(channel) = state.channels.get(uuid) {
            return Ok(channel.clone());
        }
        let endpoint = *state
            .endpoints
            .get(uuid)
            .ok_or_else(|| Error::UnknownPeer(uuid.to_string()))?;

        let wire = Arc::new(UdpWire::new(self.socket.clone(), endpoint));
        let protocol =
            PeerProtocol::new(self.protocol, self.identity.clone(), self.resend_delay);
        let channel = Arc::new(
            Channel::new(uuid.to_string(), wire, protocol, self.scheduler.clone())
                .with_hooks(self.hooks.lock().clone()),
        );
        state.channels.insert(uuid.to_string(), channel.clone());
        log::debug!("[registry] opened channel to {}", uuid);
        Ok(channel)
    }

    /// Channel lookup without opening.
    pub fn get(&self, uuid: &str) -> Option<Arc<Channel>> {
        self.state.lock().channels.get(uuid).cloned()
    }

    /// True when the peer has been registered.
    pub fn knows(&self, uuid: &str) -> bool {
        self.state.lock().endpoints.contains_key(uuid)
    }

    /// Hostname entry for a registered peer.
    pub fn hostname_of(&self, uuid: &str) -> Option<RemoteHost> {
        self.state.lock().hostnames.get(uuid).cloned()
    }

    /// Uuids of every registered peer, excluding this node.
    pub fn peers(&self) -> Vec<String> {
        self.state
            .lock()
            .endpoints
            .keys()
            .filter(|uuid| uuid.as_str() != self.identity.uuid)
            .cloned()
            .collect()
    }

    /// Forward the scheduler's phase-change hook to every open channel.
    pub fn on_phase_change(&self, new_round: bool) {
        for channel in self.state.lock().channels.values() {
            channel.on_phase_change(new_round);
        }
    }

    /// Stop every channel and drop the registry's strong references.
    pub fn stop_all(&self) {
        let mut state = self.state.lock();
        for channel in state.channels.values() {
            channel.stop();
        }
        state.channels.clear();
        log::info!("[registry] all channels stopped");
    }
}

fn parse_port(port: &str) -> Result<u16> {
    port.parse::<u16>().map_err(|_| Error::ConfigBadValue {
        key: "port".to_string(),
        value: port.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ConnectionRegistry {
        let socket = UdpSocket::bind("127.0.0.1:0".parse().expect("addr")).expect("bind");
        ConnectionRegistry::new(
            Identity {
                uuid: "self".to_string(),
                host: RemoteHost {
                    hostname: "localhost".to_string(),
                    port: "0".to_string(),
                },
            },
            ProtocolKind::Suc,
            Duration::from_millis(100),
            Arc::new(socket),
            RetransmitScheduler::disconnected(),
        )
    }

    #[test]
    fn test_register_resolves_endpoint() {
        let reg = registry();
        reg.register_peer("p1", "127.0.0.1", "40001").expect("registers");
        assert!(reg.knows("p1"));
        assert_eq!(
            reg.hostname_of("p1").expect("hostname").hostname,
            "127.0.0.1"
        );
    }

    #[test]
    fn test_register_is_idempotent() {
        let reg = registry();
        reg.register_peer("p1", "127.0.0.1", "40001").expect("registers");
        reg.register_peer("p1", "127.0.0.1", "40002").expect("updates");
        assert_eq!(reg.hostname_of("p1").expect("hostname").port, "40002");
    }

    #[test]
    fn test_get_or_open_returns_same_channel() {
        let reg = registry();
        reg.register_peer("p1", "127.0.0.1", "40001").expect("registers");
        let a = reg.get_or_open("p1").expect("opens");
        let b = reg.get_or_open("p1").expect("opens");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_open_unknown_peer_fails() {
        let reg = registry();
        assert!(reg.get_or_open("ghost").is_err());
    }

    #[test]
    fn test_bad_port_rejected() {
        let reg = registry();
        assert!(reg.register_peer("p1", "127.0.0.1", "nope").is_err());
    }

    #[test]
    fn test_peers_excludes_self() {
        let reg = registry();
        reg.register_peer("self", "127.0.0.1", "40000").expect("registers");
        reg.register_peer("p1", "127.0.0.1", "40001").expect("registers");
        assert_eq!(reg.peers(), vec!["p1".to_string()]);
    }

    #[test]
    fn test_channel_survives_stop_all() {
        let reg = registry();
        reg.register_peer("p1", "127.0.0.1", "40001").expect("registers");
        let channel = reg.get_or_open("p1").expect("opens");
        reg.stop_all();
        assert!(reg.get("p1").is_none());
        // The held handle is still valid, just stopped.
        assert_eq!(channel.peer(), "p1");
    }
}
