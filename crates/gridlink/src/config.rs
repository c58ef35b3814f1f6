// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Broker configuration - single source of truth.
//!
//! This module centralizes the protocol constants and the runtime
//! configuration loaded from the broker's key=value config file.
//! **Never hardcode these elsewhere!**
//!
//! # Architecture
//!
//! - **Level 1 (static)**: compile-time constants (wire format, windows,
//!   scheduler cadence).
//! - **Level 2 (dynamic)**: [`BrokerConfig`] and [`Timings`] read once at
//!   startup in `main` and passed by reference. There are no global
//!   singletons; the configuration lives in the process runtime context.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

// =======================================================================
// Wire format
// =======================================================================

/// Maximum UDP datagram carried by the broker (bytes).
///
/// Messages that encode larger than this are rejected at send time.
pub const MAX_DATAGRAM_SIZE: usize = 60_000;

/// Size of the fixed datagram envelope (bytes).
///
/// Layout: 11 ASCII digits body length, 11 ASCII digits sequence number,
/// 1 ASCII ack flag.
pub const ENVELOPE_SIZE: usize = 23;

/// Width of the envelope length field (ASCII digits).
pub const LENGTH_FIELD_SIZE: usize = 11;

/// Width of the envelope sequence field (ASCII digits).
pub const SEQUENCE_FIELD_SIZE: usize = 11;

/// Width of the record length prefix inside the key/value stream.
pub const STREAM_LENGTH_FIELD: usize = 5;

// =======================================================================
// Reliable protocol
// =======================================================================

/// Sequence numbers are assigned modulo this value.
pub const SEQUENCE_MODULO: u32 = 1024;

/// Maximum number of unacknowledged messages held per channel.
pub const WINDOW_SIZE: usize = 8;

/// Retransmissions attempted before a message is dropped.
pub const MAX_RETRIES: u32 = 100;

/// Number of kill hashes remembered by an SRC receiver.
pub const KILL_WINDOW_SIZE: usize = 6;

// =======================================================================
// Scheduler / clock
// =======================================================================

/// Wall time between full-cycle phase realignments (milliseconds).
pub const ALIGNMENT_DURATION_MS: u64 = 250;

/// Period of clock-synchronizer exchanges (milliseconds).
pub const BEACON_FREQUENCY_MS: u64 = 2000;

/// Beacons a peer may miss before its clock observations are discarded.
pub const STALE_EXCHANGES: u32 = 5;

// =======================================================================
// Device / adapter defaults
// =======================================================================

/// Plug-and-play session timeout (milliseconds).
pub const SESSION_TIMEOUT_MS: u64 = 5000;

/// Nominal adapter tick (microseconds). The effective rate is dictated by
/// the remote peer's blocking read; the tick only hands control back to the
/// adapter I/O loop between cycles.
pub const ADAPTER_TICK_US: u64 = 1;

/// Named timing parameters with their defaults (milliseconds).
///
/// Any of these may be overridden by a key of the same name in the broker
/// config file.
const TIMING_DEFAULTS: &[(&str, u64)] = &[
    ("resend-time", 200),
    ("alignment-duration", ALIGNMENT_DURATION_MS),
    ("beacon-frequency", BEACON_FREQUENCY_MS),
    ("session-timeout", SESSION_TIMEOUT_MS),
];

/// Table of named timing parameters, loaded from the broker config file.
#[derive(Debug, Clone)]
pub struct Timings {
    values: HashMap<String, u64>,
}

impl Timings {
    /// Build the table from defaults plus any overriding config keys.
    fn from_overrides(overrides: &HashMap<String, String>) -> Result<Self> {
        let mut values = HashMap::new();
        for (name, default) in TIMING_DEFAULTS {
            let value = match overrides.get(*name) {
                Some(raw) => raw.parse::<u64>().map_err(|_| Error::ConfigBadValue {
                    key: (*name).to_string(),
                    value: raw.clone(),
                })?,
                None => *default,
            };
            values.insert((*name).to_string(), value);
        }
        Ok(Self { values })
    }

    /// Look up a timing parameter in milliseconds.
    ///
    /// Unknown parameters fall back to zero with a warning; callers are
    /// expected to request only registered names.
    pub fn get(&self, param: &str) -> u64 {
        match self.values.get(param) {
            Some(v) => *v,
            None => {
                log::warn!("[config] unknown timing parameter {}", param);
                0
            }
        }
    }

    /// Look up a timing parameter as a [`Duration`].
    pub fn duration(&self, param: &str) -> Duration {
        Duration::from_millis(self.get(param))
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self::from_overrides(&HashMap::new()).expect("defaults parse")
    }
}

/// Runtime configuration for one broker process.
///
/// Loaded from a key=value file; `#` begins a comment. Required keys:
/// `uuid`, `hostname`, `port`. Everything else has a default.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// This node's globally unique identifier (UUID-shaped string).
    pub uuid: String,
    /// This node's hostname as other peers address it.
    pub hostname: String,
    /// Address the UDP listener binds to.
    pub listen_address: String,
    /// Port the UDP listener binds to.
    pub listen_port: u16,
    /// Port of the plug-and-play device session server; 0 disables it.
    pub factory_port: u16,
    /// Reliable protocol used for peer channels ("SUC" or "SRC").
    pub protocol: String,
    /// Fixed skew applied to the local clock before synchronization.
    pub clock_skew: Duration,
    /// Path to the device class XML specification.
    pub device_config: Option<String>,
    /// Path to the adapter XML specification.
    pub adapter_config: Option<String>,
    /// Path to the topology configuration.
    pub topology_config: Option<String>,
    /// Logger verbosity 0-3 (error, warn, info, debug).
    pub verbosity: u8,
    /// Named timing parameters.
    pub timings: Timings,
}

impl BrokerConfig {
    /// Load the configuration from a key=value file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(&path)
            .map_err(|_| Error::ConfigFileNotFound(path.as_ref().display().to_string()))?;
        Self::parse(&text)
    }

    /// Parse configuration text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut map = HashMap::new();
        for line in text.lines() {
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| Error::ConfigBadValue {
                key: line.to_string(),
                value: String::new(),
            })?;
            map.insert(key.trim().to_string(), value.trim().to_string());
        }

        let uuid = required(&map, "uuid")?;
        let hostname = required(&map, "hostname")?;
        let listen_port = parse_key(&map, "port")?.ok_or(Error::ConfigMissingKey(
            "port".to_string(),
        ))?;

        Ok(Self {
            uuid,
            hostname,
            listen_address: map
                .get("address")
                .cloned()
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            listen_port,
            factory_port: parse_key(&map, "factory-port")?.unwrap_or(0),
            protocol: map
                .get("protocol")
                .cloned()
                .unwrap_or_else(|| "SUC".to_string()),
            clock_skew: Duration::from_millis(parse_key(&map, "clock-skew")?.unwrap_or(0)),
            device_config: map.get("device-config").cloned(),
            adapter_config: map.get("adapter-config").cloned(),
            topology_config: map.get("topology-config").cloned(),
            verbosity: parse_key(&map, "verbose")?.unwrap_or(1),
            timings: Timings::from_overrides(&map)?,
        })
    }
}

fn required(map: &HashMap<String, String>, key: &str) -> Result<String> {
    map.get(key)
        .cloned()
        .ok_or_else(|| Error::ConfigMissingKey(key.to_string()))
}

fn parse_key<T: std::str::FromStr>(
    map: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>> {
    match map.get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::ConfigBadValue {
                key: key.to_string(),
                value: raw.clone(),
            }),
        None => Ok(None),
    }
}
