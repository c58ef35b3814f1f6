// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! RTDS/FPGA adapter: lock-step binary exchange over TCP.
//!
//! Once per tick the command buffer is copied under a shared lock into a
//! network-byte-order scratch buffer and written to the socket, then a
//! fixed-size state frame is block-read, byte-swapped and copied into the
//! rx buffer under a unique lock. The remote side receives before it
//! sends, so the effective cycle rate is dictated by its blocking read;
//! the nominal tick only hands control back between cycles.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::adapter::{Adapter, BufferAdapter};
use crate::config::ADAPTER_TICK_US;
use crate::device::{DeviceSignal, SignalValue};
use crate::error::{Error, Result};

/// Seconds between reconnect attempts after an I/O failure.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Read timeout so the pump notices `stop()` while blocked.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Buffer adapter pumped by a lock-step binary TCP cycle.
pub struct RtdsAdapter {
    buffers: Arc<BufferAdapter>,
    endpoint: String,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RtdsAdapter {
    pub fn new(name: String, endpoint: String) -> Self {
        Self {
            buffers: Arc::new(BufferAdapter::new(name)),
            endpoint,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// The shared buffer core (bridge and test access).
    pub fn buffers(&self) -> Arc<BufferAdapter> {
        self.buffers.clone()
    }

    fn pump(buffers: &BufferAdapter, endpoint: &str, running: &AtomicBool) {
        let rx_len = buffers.rx_len();
        while running.load(Ordering::SeqCst) {
            let mut stream = match TcpStream::connect(endpoint) {
                Ok(stream) => {
                    if let Err(err) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
                        log::warn!("[rtds {}] read timeout: {}", buffers.name(), err);
                    }
                    buffers.mark_healthy();
                    log::info!("[rtds {}] connected to {}", buffers.name(), endpoint);
                    stream
                }
                Err(err) => {
                    log::warn!(
                        "[rtds {}] connect to {} failed: {}",
                        buffers.name(),
                        endpoint,
                        err
                    );
                    buffers.mark_degraded();
                    std::thread::sleep(RECONNECT_DELAY);
                    continue;
                }
            };

            while running.load(Ordering::SeqCst) {
                if let Err(err) = Self::cycle(buffers, &mut stream, rx_len) {
                    log::warn!("[rtds {}] cycle failed: {}", buffers.name(), err);
                    buffers.mark_degraded();
                    break;
                }
                std::thread::sleep(Duration::from_micros(ADAPTER_TICK_US));
            }
        }
    }

    /// One send/receive exchange: commands out, states in.
    fn cycle(buffers: &BufferAdapter, stream: &mut TcpStream, rx_len: usize) -> Result<()> {
        // Commands first; the remote reads before it writes.
        let tx = buffers.snapshot_tx();
        let frame = encode_frame(&tx);
        stream.write_all(&frame)?;

        let mut incoming = vec![0u8; rx_len * 4];
        read_exact_with_timeout(stream, &mut incoming)?;
        buffers.fill_rx(&decode_frame(&incoming));
        Ok(())
    }
}

/// Encode a float vector as 4-byte network-order words.
pub(crate) fn encode_frame(values: &[SignalValue]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_be_bytes());
    }
    out
}

/// Decode 4-byte network-order words into a float vector.
pub(crate) fn decode_frame(bytes: &[u8]) -> Vec<SignalValue> {
    bytes
        .chunks_exact(4)
        .map(|word| SignalValue::from_be_bytes([word[0], word[1], word[2], word[3]]))
        .collect()
}

/// `read_exact` that tolerates timeout wakeups so `stop()` is observed.
fn read_exact_with_timeout(stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed during frame",
                )))
            }
            Ok(n) => filled += n,
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => return Err(Error::Io(err)),
        }
    }
    Ok(())
}

impl Adapter for RtdsAdapter {
    fn name(&self) -> &str {
        self.buffers.name()
    }

    fn state(&self, device: &str, signal: &str) -> Result<SignalValue> {
        self.buffers.state(device, signal)
    }

    fn set_command(&self, device: &str, signal: &str, value: SignalValue) -> Result<()> {
        self.buffers.set_command(device, signal, value)
    }

    fn register_state(&self, signal: DeviceSignal, index: usize) -> Result<()> {
        self.buffers.register_state(signal, index)
    }

    fn register_command(&self, signal: DeviceSignal, index: usize) -> Result<()> {
        self.buffers.register_command(signal, index)
    }

    fn start(&self) -> Result<()> {
        self.buffers.finalize();
        self.running.store(true, Ordering::SeqCst);
        let buffers = self.buffers.clone();
        let endpoint = self.endpoint.clone();
        let running = self.running.clone();
        let worker = std::thread::Builder::new()
            .name(format!("rtds-{}", self.buffers.name()))
            .spawn(move || Self::pump(&buffers, &endpoint, &running))
            .map_err(Error::Io)?;
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::warn!("[rtds {}] pump thread panicked", self.buffers.name());
            }
        }
    }
}
