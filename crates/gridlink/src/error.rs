// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Error taxonomy for the broker runtime.
//!
//! Errors are grouped by where they originate: configuration errors are fatal
//! at startup, transport and protocol errors are logged and dropped by the
//! runtime, device and adapter errors are surfaced to the caller. The broker
//! core never aborts its loop on a per-message error.

/// Errors returned by gridlink operations.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Configuration errors (fatal at startup)
    // ========================================================================
    /// Config file missing or unreadable.
    ConfigFileNotFound(String),
    /// A required configuration key is absent.
    ConfigMissingKey(String),
    /// A configuration value failed to parse.
    ConfigBadValue { key: String, value: String },
    /// Device or adapter XML could not be parsed.
    MalformedXml(String),
    /// Device class XML declares the same id twice.
    DuplicateDeviceType(String),
    /// Device class XML has a duplicate entry within one type.
    DuplicateEntry { device_type: String, entry: String },
    /// Device class XML extends a type that is never defined.
    UndefinedExtends(String),
    /// Device class XML has cyclic inheritance.
    CyclicExtends(String),
    /// Two types present in one device's closure define the same signal.
    SignalConflict {
        signal: String,
        first: String,
        second: String,
    },
    /// Adapter XML registered the same buffer index twice.
    DuplicateIndex(usize),
    /// Adapter XML names an unknown adapter kind.
    UnknownAdapterKind(String),
    /// Two adapters share one name.
    DuplicateAdapter(String),

    // ========================================================================
    // Transport errors
    // ========================================================================
    /// Failed to bind a socket to the configured address (fatal at startup).
    BindFailed(String),
    /// I/O error with underlying cause.
    Io(std::io::Error),
    /// Outbound message exceeds the maximum datagram size.
    MessageTooLarge(usize),
    /// Peer uuid has never been registered.
    UnknownPeer(String),

    // ========================================================================
    // Protocol / codec errors (logged and dropped by the runtime)
    // ========================================================================
    /// Datagram envelope is malformed.
    BadEnvelope(String),
    /// Key/value stream is malformed.
    BadStream(String),
    /// Message body is missing a required field.
    MissingField(&'static str),
    /// Status code not in the known set.
    UnknownStatus(u32),

    // ========================================================================
    // Device / adapter errors (surfaced to the caller)
    // ========================================================================
    /// Signal name not recognized by the device.
    BadSignal { device: String, signal: String },
    /// Device type not known to the builder.
    UnknownDeviceType(String),
    /// Device id not present in the manager.
    UnknownDevice(String),
    /// Signal not registered with the adapter.
    UnregisteredSignal { device: String, signal: String },
    /// Adapter mutated after `start()`.
    AdapterStarted(String),
    /// Bridge table access outside the caller's access list.
    AccessDenied { device: String, signal: String },
    /// Bridge table index outside the table.
    IndexOutOfRange(usize),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // Configuration
            Error::ConfigFileNotFound(path) => write!(f, "Config file not found: {}", path),
            Error::ConfigMissingKey(key) => write!(f, "Missing config key: {}", key),
            Error::ConfigBadValue { key, value } => {
                write!(f, "Bad value for config key {}: {}", key, value)
            }
            Error::MalformedXml(msg) => write!(f, "Malformed XML: {}", msg),
            Error::DuplicateDeviceType(id) => write!(f, "Duplicate device type: {}", id),
            Error::DuplicateEntry { device_type, entry } => {
                write!(f, "Duplicate entry {} in device type {}", entry, device_type)
            }
            Error::UndefinedExtends(id) => write!(f, "Undefined extends target: {}", id),
            Error::CyclicExtends(id) => write!(f, "Cyclic extends through type: {}", id),
            Error::SignalConflict {
                signal,
                first,
                second,
            } => write!(
                f,
                "Signal conflict: {} defined by both {} and {}",
                signal, first, second
            ),
            Error::DuplicateIndex(idx) => write!(f, "Duplicate buffer index: {}", idx),
            Error::UnknownAdapterKind(kind) => write!(f, "Unknown adapter kind: {}", kind),
            Error::DuplicateAdapter(name) => write!(f, "Adapter name already in use: {}", name),
            // Transport
            Error::BindFailed(msg) => write!(f, "Bind failed: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::MessageTooLarge(len) => {
                write!(f, "Message of {} bytes exceeds datagram limit", len)
            }
            Error::UnknownPeer(uuid) => write!(f, "Unknown peer: {}", uuid),
            // Protocol / codec
            Error::BadEnvelope(msg) => write!(f, "Bad datagram envelope: {}", msg),
            Error::BadStream(msg) => write!(f, "Bad key/value stream: {}", msg),
            Error::MissingField(name) => write!(f, "Message missing field: {}", name),
            Error::UnknownStatus(code) => write!(f, "Unknown status code: {}", code),
            // Device / adapter
            Error::BadSignal { device, signal } => {
                write!(f, "Device {} has no signal {}", device, signal)
            }
            Error::UnknownDeviceType(t) => write!(f, "Unknown device type: {}", t),
            Error::UnknownDevice(id) => write!(f, "Unknown device: {}", id),
            Error::UnregisteredSignal { device, signal } => {
                write!(f, "Signal ({},{}) not registered with adapter", device, signal)
            }
            Error::AdapterStarted(name) => {
                write!(f, "Adapter {} cannot be modified after start", name)
            }
            Error::AccessDenied { device, signal } => {
                write!(f, "Access denied to table entry ({},{})", device, signal)
            }
            Error::IndexOutOfRange(idx) => write!(f, "Table index {} out of range", idx),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Convenient alias for results using the crate `Error` type.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_both_types_and_signal() {
        let err = Error::SignalConflict {
            signal: "power".to_string(),
            first: "T1".to_string(),
            second: "T2".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("power"));
        assert!(msg.contains("T1"));
        assert!(msg.contains("T2"));
    }

    #[test]
    fn test_io_source_preserved() {
        use std::error::Error as _;
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(err.source().is_some());
    }
}
