// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! PSCAD adapter: ASCII line exchange with the simulation line server.
//!
//! Per tick, every command slot is pushed with a `SET` line and every state
//! slot is pulled with a `GET` line:
//!
//! ```text
//! -> SET sst1 gateway 4.5\r\n
//! <- OK\r\n
//! -> GET sst1 gateway\r\n
//! <- 3.25\r\n
//! ```
//!
//! Same buffer core and degraded behavior as the RTDS flavor; only the
//! framing differs.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::adapter::{Adapter, BufferAdapter};
use crate::device::{DeviceSignal, SignalValue};
use crate::error::{Error, Result};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Milliseconds between line-exchange cycles. Lines are far more expensive
/// than the binary frames, so the pscad tick is coarser than the RTDS one.
const CYCLE_DELAY: Duration = Duration::from_millis(10);

/// Buffer adapter pumped by an ASCII line protocol.
pub struct PscadAdapter {
    buffers: Arc<BufferAdapter>,
    endpoint: String,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PscadAdapter {
    pub fn new(name: String, endpoint: String) -> Self {
        Self {
            buffers: Arc::new(BufferAdapter::new(name)),
            endpoint,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn buffers(&self) -> Arc<BufferAdapter> {
        self.buffers.clone()
    }

    fn pump(buffers: &BufferAdapter, endpoint: &str, running: &AtomicBool) {
        while running.load(Ordering::SeqCst) {
            let stream = match TcpStream::connect(endpoint) {
                Ok(stream) => {
                    let _ = stream.set_read_timeout(Some(READ_TIMEOUT));
                    buffers.mark_healthy();
                    log::info!("[pscad {}] connected to {}", buffers.name(), endpoint);
                    stream
                }
                Err(err) => {
                    log::warn!(
                        "[pscad {}] connect to {} failed: {}",
                        buffers.name(),
                        endpoint,
                        err
                    );
                    buffers.mark_degraded();
                    std::thread::sleep(RECONNECT_DELAY);
                    continue;
                }
            };
            let mut reader = BufReader::new(stream);

            while running.load(Ordering::SeqCst) {
                if let Err(err) = Self::cycle(buffers, &mut reader) {
                    log::warn!("[pscad {}] cycle failed: {}", buffers.name(), err);
                    buffers.mark_degraded();
                    break;
                }
                std::thread::sleep(CYCLE_DELAY);
            }
        }
    }

    fn cycle(buffers: &BufferAdapter, reader: &mut BufReader<TcpStream>) -> Result<()> {
        let tx = buffers.snapshot_tx();
        for (signal, index) in buffers.command_entries() {
            let line = format!("SET {} {} {}\r\n", signal.device, signal.signal, tx[index]);
            reader.get_mut().write_all(line.as_bytes())?;
            let reply = read_line(reader)?;
            if reply != "OK" {
                return Err(Error::BadStream(format!("SET answered {:?}", reply)));
            }
        }
        for (signal, index) in buffers.state_entries() {
            let line = format!("GET {} {}\r\n", signal.device, signal.signal);
            reader.get_mut().write_all(line.as_bytes())?;
            let reply = read_line(reader)?;
            let value = reply.trim().parse::<SignalValue>().map_err(|_| {
                Error::BadStream(format!("GET answered non-numeric {:?}", reply))
            })?;
            buffers.fill_rx_slot(index, value);
        }
        Ok(())
    }
}

fn read_line(reader: &mut BufReader<TcpStream>) -> Result<String> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "peer closed",
        )));
    }
    Ok(line.trim_end().to_string())
}

impl Adapter for PscadAdapter {
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
            .name(format!("pscad-{}", self.buffers.name()))
            .spawn(move || Self::pump(&buffers, &endpoint, &running))
            .map_err(Error::Io)?;
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::warn!("[pscad {}] pump thread panicked", self.buffers.name());
            }
        }
    }
}
