// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Per-process runtime context.
//!
//! One [`Runtime`] wires the whole broker stack from a [`BrokerConfig`]:
//! listener, connection registry, dispatcher, scheduler, clock
//! synchronizer and the device subsystem. It lives for the scope of the
//! daemon's `main` and is passed by reference; nothing in the crate is a
//! global singleton.

use std::net::ToSocketAddrs;
use std::sync::Arc;

use crate::adapter::{AdapterFactory, SessionServer};
use crate::broker::{Broker, BrokerHandle, BrokerIo, LISTENER_TOKEN};
use crate::clock::ClockSynchronizer;
use crate::config::BrokerConfig;
use crate::device::{DeviceBuilder, DeviceManager};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::message::{ProtocolKind, RemoteHost};
use crate::net::{ConnectionRegistry, Listener};
use crate::protocol::Identity;

/// Everything a peer process runs.
pub struct Runtime {
    config: BrokerConfig,
    broker: Broker,
    listener: Listener,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<ClockSynchronizer>,
    devices: Arc<DeviceManager>,
    factory: Option<Arc<AdapterFactory>>,
    session_server: Option<SessionServer>,
}

impl Runtime {
    /// Build the full stack from a configuration. Fatal configuration or
    /// bind problems surface here, before anything runs.
    pub fn build(config: BrokerConfig) -> Result<Self> {
        let mut broker = Broker::new()?;

        let listen_addr = (config.listen_address.as_str(), config.listen_port)
            .to_socket_addrs()
            .map_err(|e| {
                Error::BindFailed(format!(
                    "resolve {}:{}: {}",
                    config.listen_address, config.listen_port, e
                ))
            })?
            .next()
            .ok_or_else(|| {
                Error::BindFailed(format!(
                    "no address for {}:{}",
                    config.listen_address, config.listen_port
                ))
            })?;
        let mut listener = Listener::bind(listen_addr)?;
        listener.register(broker.mio_registry(), LISTENER_TOKEN)?;

        let identity = Identity {
            uuid: config.uuid.clone(),
            host: RemoteHost {
                hostname: config.hostname.clone(),
                port: config.listen_port.to_string(),
            },
        };
        let registry = Arc::new(ConnectionRegistry::new(
            identity,
            ProtocolKind::from_tag(&config.protocol)?,
            config.timings.duration("resend-time"),
            listener.socket(),
            broker.retransmit_scheduler(),
        ));
        {
            let registry = registry.clone();
            broker.add_phase_listener(move |new_round| {
                registry.on_phase_change(new_round);
            });
        }

        if let Some(path) = &config.topology_config {
            load_topology(&registry, path)?;
        }

        let dispatcher = Arc::new(Dispatcher::new());
        registry.set_dispatcher(dispatcher.clone());
        let clock = ClockSynchronizer::new(
            config.uuid.clone(),
            config.clock_skew,
            config.timings.duration("beacon-frequency"),
            broker.handle(),
            registry.clone(),
        );
        clock.clone().register(&dispatcher);

        let devices = Arc::new(DeviceManager::new());
        let mut factory = None;
        let mut session_server = None;
        if let Some(path) = &config.device_config {
            let builder = Arc::new(DeviceBuilder::from_file(path)?);
            let adapter_factory = Arc::new(AdapterFactory::new(builder, devices.clone()));
            if let Some(adapter_path) = &config.adapter_config {
                adapter_factory.load_file(adapter_path)?;
            }
            if config.factory_port != 0 {
                let server = SessionServer::new(
                    adapter_factory.clone(),
                    config.timings.duration("session-timeout"),
                );
                let mut addr = listen_addr;
                addr.set_port(config.factory_port);
                server.start(addr)?;
                session_server = Some(server);
            }
            factory = Some(adapter_factory);
        }

        Ok(Self {
            config,
            broker,
            listener,
            registry,
            dispatcher,
            clock,
            devices,
            factory,
            session_server,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn clock(&self) -> &Arc<ClockSynchronizer> {
        &self.clock
    }

    pub fn devices(&self) -> &Arc<DeviceManager> {
        &self.devices
    }

    pub fn factory(&self) -> Option<&Arc<AdapterFactory>> {
        self.factory.as_ref()
    }

    /// Handle for registering modules and scheduling work.
    pub fn broker_handle(&self) -> BrokerHandle {
        self.broker.handle()
    }

    /// Register an algorithm module before `run`.
    pub fn register_module(
        &mut self,
        id: &str,
        phase: std::time::Duration,
        quit: Option<crate::broker::QuitHook>,
    ) {
        self.broker.register_module(id, phase, quit);
    }

    /// Run the loop to completion; returns the stop signal number. Tears
    /// down the device subsystem and channels on the way out.
    pub fn run(&mut self) -> i32 {
        self.clock.clone().start();
        let signum = self.broker.run(Some(BrokerIo {
            listener: &mut self.listener,
            registry: &self.registry,
            dispatcher: &self.dispatcher,
        }));

        if let Some(server) = &self.session_server {
            server.stop();
        }
        if let Some(factory) = &self.factory {
            factory.stop();
        }
        self.registry.stop_all();
        signum
    }
}

/// Seed the registry from the topology file: one `uuid host port` triple
/// per line, `#` comments.
fn load_topology(registry: &ConnectionRegistry, path: &str) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .map_err(|_| Error::ConfigFileNotFound(path.to_string()))?;
    for line in text.lines() {
        let line = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        }
        .trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let (uuid, host, port) = match parts[..] {
            [uuid, host, port] => (uuid, host, port),
            _ => {
                return Err(Error::ConfigBadValue {
                    key: "topology".to_string(),
                    value: line.to_string(),
                })
            }
        };
        registry.register_peer(uuid, host, port)?;
    }
    log::info!("[runtime] topology loaded: {} peers", registry.peers().len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_text(port: u16) -> String {
        format!(
            "uuid=runtime-test\nhostname=localhost\naddress=127.0.0.1\nport={}\n",
            port
        )
    }

    #[test]
    fn test_build_minimal_runtime() {
        let config = BrokerConfig::parse(&config_text(0)).expect("config parses");
        let runtime = Runtime::build(config).expect("runtime builds");
        assert_eq!(runtime.config().uuid, "runtime-test");
        assert!(runtime.factory().is_none());
    }

    #[test]
    fn test_topology_seeds_registry() {
        let mut topology = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(topology, "# peers").expect("write");
        writeln!(topology, "peer-a 127.0.0.1 40101").expect("write");
        writeln!(topology, "peer-b 127.0.0.1 40102").expect("write");

        let mut text = config_text(0);
        text.push_str(&format!(
            "topology-config={}\n",
            topology.path().display()
        ));
        let config = BrokerConfig::parse(&text).expect("config parses");
        let runtime = Runtime::build(config).expect("runtime builds");
        let mut peers = runtime.registry().peers();
        peers.sort();
        assert_eq!(peers, vec!["peer-a", "peer-b"]);
    }

    #[test]
    fn test_bad_topology_line_rejected() {
        let mut topology = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(topology, "only-two fields").expect("write");
        let mut text = config_text(0);
        text.push_str(&format!(
            "topology-config={}\n",
            topology.path().display()
        ));
        let config = BrokerConfig::parse(&text).expect("config parses");
        assert!(Runtime::build(config).is_err());
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let mut text = config_text(0);
        text.push_str("protocol=XYZ\n");
        let config = BrokerConfig::parse(&text).expect("config parses");
        assert!(Runtime::build(config).is_err());
    }
}
