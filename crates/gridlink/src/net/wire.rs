// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Datagram sink abstraction for outbound traffic.
//!
//! Protocols write through [`Wire`] so the same state machines run over the
//! broker's UDP socket in production and over an in-memory channel in the
//! test suite.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::UdpSocket;

/// Outbound datagram sink for one remote endpoint.
pub trait Wire: Send + Sync {
    /// Write one datagram. Implementations must not block.
    fn write(&self, datagram: &[u8]) -> io::Result<()>;
}

/// Production wire: the broker's shared UDP socket plus one peer endpoint.
pub struct UdpWire {
    socket: Arc<UdpSocket>,
    endpoint: SocketAddr,
}

impl UdpWire {
    pub fn new(socket: Arc<UdpSocket>, endpoint: SocketAddr) -> Self {
        Self { socket, endpoint }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }
}

impl Wire for UdpWire {
    fn write(&self, datagram: &[u8]) -> io::Result<()> {
        match self.socket.send_to(datagram, self.endpoint) {
            Ok(sent) => {
                log::debug!(
                    "[wire] sent {} of {} bytes -> {}",
                    sent,
                    datagram.len(),
                    self.endpoint
                );
                Ok(())
            }
            // A full socket buffer is a droppable datagram, not an error:
            // the retransmit tick covers the loss.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("[wire] send to {} would block; dropped", self.endpoint);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
pub mod test_wire {
    //! In-memory wires for protocol unit tests.

    use super::Wire;
    use parking_lot::Mutex;
    use std::io;

    /// Captures every datagram written to it.
    #[derive(Default)]
    pub struct CaptureWire {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl CaptureWire {
        pub fn new() -> Self {
            Self::default()
        }

        /// Snapshot of everything written so far.
        pub fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().clone()
        }
    }

    impl Wire for CaptureWire {
        fn write(&self, datagram: &[u8]) -> io::Result<()> {
            self.sent.lock().push(datagram.to_vec());
            Ok(())
        }
    }
}
