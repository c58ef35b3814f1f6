// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Plug-and-play device session server.
//!
//! A TCP server on the configured factory port accepts one client at a
//! time. The client enumerates its devices in an ASCII request terminated
//! by a blank line:
//!
//! ```text
//! Hello 7f3a21
//! sst sst7
//! load load3
//! <blank line>
//! ```
//!
//! A well-formed request builds a session adapter and its devices through
//! the device builder and answers `200 OK`; a malformed request answers
//! `400 BadRequest`, an unknown device type `404 NotFound`. The session
//! socket stays attached as the adapter's data channel: the client reports
//! state batches (`device signal value` lines, blank-line terminated) and
//! receives the full command table after each batch. A timeout or `QUIT`
//! drops the client and discards the session adapter and its devices.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::adapter::AdapterFactory;
use crate::device::{DeviceSignal, SignalValue};
use crate::error::{Error, Result};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// One parsed enumeration request.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Enumeration {
    pub serial: String,
    /// `(device type, device id)` pairs in request order.
    pub devices: Vec<(String, String)>,
}

/// Parse the request block (without the terminating blank line).
pub(crate) fn parse_enumeration(request: &str) -> Result<Enumeration> {
    let mut lines = request.lines();
    let hello = lines
        .next()
        .ok_or_else(|| Error::BadStream("empty session request".to_string()))?;
    let serial = match hello.split_whitespace().collect::<Vec<_>>()[..] {
        ["Hello", serial] => serial.to_string(),
        _ => {
            return Err(Error::BadStream(format!(
                "expected Hello line, got {:?}",
                hello
            )))
        }
    };

    let mut devices = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        match line.split_whitespace().collect::<Vec<_>>()[..] {
            [device_type, device] => {
                devices.push((device_type.to_string(), device.to_string()));
            }
            _ => {
                return Err(Error::BadStream(format!(
                    "bad enumeration line {:?}",
                    line
                )))
            }
        }
    }
    if devices.is_empty() {
        return Err(Error::BadStream("enumeration without devices".to_string()));
    }
    Ok(Enumeration { serial, devices })
}

/// TCP server handling plug-and-play device sessions.
pub struct SessionServer {
    factory: Arc<AdapterFactory>,
    timeout: Duration,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionServer {
    pub fn new(factory: Arc<AdapterFactory>, timeout: Duration) -> Self {
        Self {
            factory,
            timeout,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Bind the factory port and start accepting sessions. Returns the
    /// bound address (useful when the configured port is 0).
    pub fn start(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let socket = Socket::new(
            Domain::for_address(addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket
            .bind(&addr.into())
            .map_err(|e| Error::BindFailed(format!("tcp {}: {}", addr, e)))?;
        socket.listen(1)?;
        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        log::info!("[session] factory port open on {}", local);

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let factory = self.factory.clone();
        let timeout = self.timeout;
        let worker = std::thread::Builder::new()
            .name("pnp-session".to_string())
            .spawn(move || accept_loop(&listener, &factory, timeout, &running))
            .map_err(Error::Io)?;
        *self.worker.lock() = Some(worker);
        Ok(local)
    }

    /// Stop accepting and join the server thread.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::warn!("[session] server thread panicked");
            }
        }
    }
}

fn accept_loop(
    listener: &TcpListener,
    factory: &Arc<AdapterFactory>,
    timeout: Duration,
    running: &AtomicBool,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::info!("[session] client {}", peer);
                if let Err(err) = handle_session(stream, factory, timeout, running) {
                    log::warn!("[session] session with {} ended: {}", peer, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                log::warn!("[session] accept failed: {}", err);
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn handle_session(
    mut stream: TcpStream,
    factory: &Arc<AdapterFactory>,
    timeout: Duration,
    running: &AtomicBool,
) -> Result<()> {
    stream.set_read_timeout(Some(timeout))?;
    stream.set_nodelay(true)?;

    let request = match read_block(&mut stream) {
        Ok(block) => block,
        Err(err) => {
            // Enumeration never arrived inside the session timeout.
            let _ = stream.write_all(b"400 BadRequest\r\n\r\n");
            return Err(err);
        }
    };

    let enumeration = match parse_enumeration(&request) {
        Ok(enumeration) => enumeration,
        Err(err) => {
            let _ = stream.write_all(b"400 BadRequest\r\n\r\n");
            return Err(err);
        }
    };

    let adapter = match factory.create_session_adapter(&enumeration.serial, &enumeration.devices)
    {
        Ok(adapter) => adapter,
        Err(err @ Error::UnknownDeviceType(_)) => {
            let _ = stream.write_all(b"404 NotFound\r\n\r\n");
            return Err(err);
        }
        Err(err) => {
            let _ = stream.write_all(b"400 BadRequest\r\n\r\n");
            return Err(err);
        }
    };
    let adapter_name = format!("session-{}", enumeration.serial);
    stream.write_all(b"200 OK\r\n\r\n")?;

    // Index the state table by (device, signal) once.
    let state_slots: Vec<(DeviceSignal, usize)> = adapter.state_entries();

    let result = (|| -> Result<()> {
        loop {
            if !running.load(Ordering::SeqCst) {
                return Ok(());
            }
            let batch = read_block(&mut stream)?;
            if batch.trim() == "QUIT" {
                log::info!("[session] {} quit", adapter_name);
                return Ok(());
            }
            for line in batch.lines().filter(|l| !l.trim().is_empty()) {
                apply_state_line(&adapter, &state_slots, line)?;
            }

            let tx = adapter.snapshot_tx();
            let mut reply = String::new();
            for (signal, index) in adapter.command_entries() {
                reply.push_str(&format!(
                    "{} {} {}\r\n",
                    signal.device, signal.signal, tx[index]
                ));
            }
            reply.push_str("\r\n");
            stream.write_all(reply.as_bytes())?;
        }
    })();

    // Session over, for whatever reason: discard the adapter.
    factory.remove_adapter(&adapter_name);
    result
}

fn apply_state_line(
    adapter: &crate::adapter::BufferAdapter,
    slots: &[(DeviceSignal, usize)],
    line: &str,
) -> Result<()> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let (device, signal, value) = match parts[..] {
        [device, signal, value] => (device, signal, value),
        _ => return Err(Error::BadStream(format!("bad state line {:?}", line))),
    };
    let value: SignalValue = value
        .parse()
        .map_err(|_| Error::BadStream(format!("non-numeric value in {:?}", line)))?;
    let key = DeviceSignal::new(device, signal);
    let Some((_, index)) = slots.iter().find(|(slot, _)| *slot == key) else {
        return Err(Error::UnregisteredSignal {
            device: device.to_string(),
            signal: signal.to_string(),
        });
    };
    adapter.fill_rx_slot(*index, value);
    Ok(())
}

/// Read until a blank line (`\r\n\r\n`). The socket read timeout bounds the
/// wait.
fn read_block(stream: &mut TcpStream) -> Result<String> {
    let mut block = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "client hung up",
                )))
            }
            Ok(_) => {
                block.push(byte[0]);
                if block.ends_with(b"\r\n\r\n") {
                    block.truncate(block.len() - 4);
                    return String::from_utf8(block)
                        .map_err(|_| Error::BadStream("non-UTF-8 session data".to_string()));
                }
                if block.len() > 64 * 1024 {
                    return Err(Error::BadStream("session request too large".to_string()));
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "session timeout",
                )))
            }
            Err(err) => return Err(Error::Io(err)),
        }
    }
}
