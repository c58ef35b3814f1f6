// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Inbound UDP demultiplexer.
//!
//! One socket, bound once at startup, shared with every outbound channel.
//! Datagrams are attributed to peers by the `source` uuid inside the body,
//! not by the UDP source address, so peers behind address translation are
//! handled the same as anyone else. Unknown peers are dropped with a log
//! entry; inbound traffic never mutates the registry's peer set.

use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::UdpSocket;

use crate::config::MAX_DATAGRAM_SIZE;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::net::ConnectionRegistry;

/// The broker's single inbound socket.
pub struct Listener {
    socket: Arc<UdpSocket>,
    buffer: Box<[u8]>,
}

impl Listener {
    /// Bind the listen socket. Failure here is fatal at startup.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .map_err(|e| Error::BindFailed(format!("udp {}: {}", addr, e)))?;
        log::info!("[listener] bound {}", addr);
        Ok(Self {
            socket: Arc::new(socket),
            buffer: vec![0u8; MAX_DATAGRAM_SIZE].into_boxed_slice(),
        })
    }

    /// Register the socket with the broker's poll. Must happen before the
    /// socket handle is shared with the registry.
    pub fn register(&mut self, registry: &mio::Registry, token: mio::Token) -> Result<()> {
        let socket = Arc::get_mut(&mut self.socket).ok_or_else(|| {
            Error::BindFailed("listener socket already shared".to_string())
        })?;
        registry.register(socket, token, mio::Interest::READABLE)?;
        Ok(())
    }

    /// Shared handle to the socket, for outbound wires and poll
    /// registration.
    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Drain every readable datagram, routing each through its peer's
    /// protocol and on to the dispatcher. Parse failures and unknown peers
    /// drop the packet and continue; the loop never aborts on a bad
    /// datagram.
    pub fn drain(&mut self, registry: &ConnectionRegistry, dispatcher: &Dispatcher) {
        loop {
            match self.socket.recv_from(&mut self.buffer) {
                Ok((len, from)) => self.handle_datagram(len, from, registry, dispatcher),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    log::warn!("[listener] receive failed: {}", err);
                    return;
                }
            }
        }
    }

    fn handle_datagram(
        &self,
        len: usize,
        from: SocketAddr,
        registry: &ConnectionRegistry,
        dispatcher: &Dispatcher,
    ) {
        let (envelope, message) = match Message::from_datagram(&self.buffer[..len]) {
            Ok(parsed) => parsed,
            Err(err) => {
                log::warn!("[listener] bad datagram from {}: {}", from, err);
                return;
            }
        };

        let source = message.source().to_string();
        if !registry.knows(&source) {
            log::warn!("[listener] datagram from unknown peer {}; dropped", source);
            return;
        }
        let channel = match registry.get_or_open(&source) {
            Ok(channel) => channel,
            Err(err) => {
                log::warn!("[listener] no channel for {}: {}", source, err);
                return;
            }
        };

        if envelope.ack {
            channel.receive_ack(&message);
            return;
        }
        if channel.receive(&message) {
            dispatcher.handle_inbound(&message, &source);
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.socket.local_addr().ok())
            .finish()
    }
}
