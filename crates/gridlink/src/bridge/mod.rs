// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Simulation bridge: TCP server mirroring the state and command tables to
//! an external power simulator.
//!
//! Wire protocol, one client at a time:
//!
//! ```text
//! request code: 5 ASCII bytes, NUL-padded ("RST\0\0", "GET\0\0", "SET\0\0", "QUIT\0")
//! payload:      4-byte IEEE-754 floats, network byte order
//! ```
//!
//! | Code | Payload in | Payload out | Effect |
//! |------|------------|-------------|--------|
//! | RST  | state-size floats | none | copies into BOTH tables (boot handshake) |
//! | GET  | none | command-size floats | reads the command table |
//! | SET  | state-size floats | none | writes the state table only |
//! | QUIT | none | none | ends the session |
//!
//! Locking: RST holds unique locks on both tables for the whole copy; GET
//! takes a shared lock on the command table; SET a unique lock on the
//! state table.

mod table;

pub use table::{DeviceTable, TableSpec};

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::device::SignalValue;
use crate::error::{Error, Result};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Size of the request-code field.
const CODE_SIZE: usize = 5;

/// External TCP server over the two shared tables.
pub struct SimulationBridge {
    state: Arc<DeviceTable>,
    command: Arc<DeviceTable>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimulationBridge {
    pub fn new(state: Arc<DeviceTable>, command: Arc<DeviceTable>) -> Self {
        Self {
            state,
            command,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Build both tables from one specification document (`<state>` and
    /// `<command>` tags).
    pub fn from_xml(xml: &str) -> Result<Self> {
        let state = Arc::new(DeviceTable::new(TableSpec::from_xml(xml, "state")?));
        let command = Arc::new(DeviceTable::new(TableSpec::from_xml(xml, "command")?));
        Ok(Self::new(state, command))
    }

    /// The shared state table.
    pub fn state_table(&self) -> Arc<DeviceTable> {
        self.state.clone()
    }

    /// The shared command table.
    pub fn command_table(&self) -> Arc<DeviceTable> {
        self.command.clone()
    }

    /// Bind and start serving. Returns the bound address.
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
        log::info!("[bridge] simulation server on {}", local);

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let state = self.state.clone();
        let command = self.command.clone();
        let worker = std::thread::Builder::new()
            .name("sim-bridge".to_string())
            .spawn(move || accept_loop(&listener, &state, &command, &running))
            .map_err(Error::Io)?;
        *self.worker.lock() = Some(worker);
        Ok(local)
    }

    /// Stop serving and join the server thread.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::warn!("[bridge] server thread panicked");
            }
        }
    }
}

fn accept_loop(
    listener: &TcpListener,
    state: &Arc<DeviceTable>,
    command: &Arc<DeviceTable>,
    running: &AtomicBool,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::info!("[bridge] simulator connected from {}", peer);
                if let Err(err) = serve_session(stream, state, command, running) {
                    log::warn!("[bridge] session with {} ended: {}", peer, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                log::warn!("[bridge] accept failed: {}", err);
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn serve_session(
    mut stream: TcpStream,
    state: &Arc<DeviceTable>,
    command: &Arc<DeviceTable>,
    running: &AtomicBool,
) -> Result<()> {
    stream.set_read_timeout(Some(Duration::from_millis(250)))?;
    stream.set_nodelay(true)?;

    loop {
        if !running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut code = [0u8; CODE_SIZE];
        match read_frame(&mut stream, &mut code, running) {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(err) => return Err(err),
        }

        match &code {
            b"RST\0\0" => {
                let values = read_floats(&mut stream, state.size(), running)?;
                // Boot handshake: both tables under unique locks at once.
                let mut state_guard = state.guard_write();
                let mut command_guard = command.guard_write();
                let n = values.len().min(state_guard.len());
                state_guard[..n].copy_from_slice(&values[..n]);
                let m = values.len().min(command_guard.len());
                command_guard[..m].copy_from_slice(&values[..m]);
                log::debug!("[bridge] RST with {} values", values.len());
            }
            b"GET\0\0" => {
                let snapshot: Vec<SignalValue> = command.guard_read().clone();
                let mut frame = Vec::with_capacity(snapshot.len() * 4);
                for value in &snapshot {
                    frame.extend_from_slice(&value.to_be_bytes());
                }
                stream.write_all(&frame)?;
                log::debug!("[bridge] GET answered {} values", snapshot.len());
            }
            b"SET\0\0" => {
                let values = read_floats(&mut stream, state.size(), running)?;
                state.write_all(&values);
                log::debug!("[bridge] SET with {} values", values.len());
            }
            b"QUIT\0" => {
                log::info!("[bridge] simulator quit");
                return Ok(());
            }
            other => {
                return Err(Error::BadStream(format!(
                    "unknown request code {:?}",
                    String::from_utf8_lossy(other)
                )));
            }
        }
    }
}

/// Fill `buf` from the stream. Returns false on a clean EOF at a frame
/// boundary or shutdown.
fn read_frame(stream: &mut TcpStream, buf: &mut [u8], running: &AtomicBool) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        if !running.load(Ordering::SeqCst) {
            return Ok(false);
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "simulator closed mid-frame",
                )));
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
    Ok(true)
}

fn read_floats(
    stream: &mut TcpStream,
    count: usize,
    running: &AtomicBool,
) -> Result<Vec<SignalValue>> {
    let mut bytes = vec![0u8; count * 4];
    if !read_frame(stream, &mut bytes, running)? {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "simulator closed before payload",
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|w| SignalValue::from_be_bytes([w[0], w[1], w[2], w[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge_pair(size: usize) -> (SimulationBridge, SocketAddr) {
        let bridge = SimulationBridge::new(
            Arc::new(DeviceTable::new(TableSpec::anonymous("state", size))),
            Arc::new(DeviceTable::new(TableSpec::anonymous("command", size))),
        );
        let addr = bridge
            .start("127.0.0.1:0".parse().expect("addr"))
            .expect("bridge starts");
        (bridge, addr)
    }

    fn send_floats(stream: &mut TcpStream, code: &[u8; 5], values: &[f32]) {
        stream.write_all(code).expect("code");
        let mut frame = Vec::new();
        for v in values {
            frame.extend_from_slice(&v.to_be_bytes());
        }
        stream.write_all(&frame).expect("payload");
    }

    fn get_floats(stream: &mut TcpStream, count: usize) -> Vec<f32> {
        stream.write_all(b"GET\0\0").expect("code");
        let mut bytes = vec![0u8; count * 4];
        stream.read_exact(&mut bytes).expect("response");
        bytes
            .chunks_exact(4)
            .map(|w| f32::from_be_bytes([w[0], w[1], w[2], w[3]]))
            .collect()
    }

    #[test]
    fn test_rst_get_set_semantics() {
        let (bridge, addr) = bridge_pair(4);
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");

        send_floats(&mut stream, b"RST\0\0", &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(get_floats(&mut stream, 4), vec![1.0, 2.0, 3.0, 4.0]);

        // SET writes the state table only; GET still answers the command
        // table.
        send_floats(&mut stream, b"SET\0\0", &[9.0, 9.0, 9.0, 9.0]);
        assert_eq!(get_floats(&mut stream, 4), vec![1.0, 2.0, 3.0, 4.0]);
        let state_deadline = std::time::Instant::now() + Duration::from_secs(1);
        while bridge.state_table().read_all() != vec![9.0, 9.0, 9.0, 9.0] {
            assert!(std::time::Instant::now() < state_deadline, "SET not applied");
            std::thread::sleep(Duration::from_millis(5));
        }

        // A second RST overwrites both tables.
        send_floats(&mut stream, b"RST\0\0", &[7.0, 7.0, 7.0, 7.0]);
        assert_eq!(get_floats(&mut stream, 4), vec![7.0, 7.0, 7.0, 7.0]);

        stream.write_all(b"QUIT\0").expect("quit");
        bridge.stop();
    }

    #[test]
    fn test_unknown_code_drops_session() {
        let (bridge, addr) = bridge_pair(1);
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream.write_all(b"BOOM\0").expect("code");
        // Server hangs up; the next read returns EOF.
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).unwrap_or(0), 0);
        bridge.stop();
    }

    #[test]
    fn test_reconnect_after_quit() {
        let (bridge, addr) = bridge_pair(2);
        {
            let mut stream = TcpStream::connect(addr).expect("connect");
            send_floats(&mut stream, b"RST\0\0", &[5.0, 6.0]);
            stream.write_all(b"QUIT\0").expect("quit");
        }
        // One client at a time: the next client is served after the first
        // session ends.
        let mut stream = TcpStream::connect(addr).expect("reconnect");
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let got = get_floats(&mut stream, 2);
            if got == vec![5.0, 6.0] {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "state lost across sessions");
        }
        bridge.stop();
    }

    #[test]
    fn test_from_xml_builds_both_tables() {
        let xml = r#"
<root>
  <state>
    <entry index="0"><device>sst1</device><signal>voltage</signal></entry>
  </state>
  <command>
    <entry index="0"><device>sst1</device><signal>gateway</signal></entry>
    <entry index="1"><device>sst2</device><signal>gateway</signal></entry>
  </command>
</root>"#;
        let bridge = SimulationBridge::from_xml(xml).expect("builds");
        assert_eq!(bridge.state_table().size(), 1);
        assert_eq!(bridge.command_table().size(), 2);
    }
}
