// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Typed message envelope exchanged between peers.
//!
//! A [`Message`] carries the sending peer's identity, a protocol tag and
//! sequence number, a status code, send/expire timestamps and two ordered
//! key/value trees: `properties` (protocol bookkeeping) and `submessages`
//! (the unit of dispatch for algorithm modules).
//!
//! The wire form is the 23-byte envelope plus the prefix-coded body stream
//! (see [`codec`]). `hash()` is a stable 64-bit digest over the encoded
//! submessage tree and the send timestamp; SRC uses it to identify
//! retransmits of the same content.

mod codec;
mod tree;

pub use codec::{decode_tree, encode_tree, Envelope};
pub use tree::KvTree;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};

use crate::config::{ENVELOPE_SIZE, MAX_DATAGRAM_SIZE};
use crate::error::{Error, Result};

/// Status codes, modeled after HTTP/1.0 plus the clock-exchange domain codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 200,
    Created = 201,
    Accepted = 202,
    NoContent = 204,
    MultipleChoices = 300,
    MovedPermanently = 301,
    MovedTemporarily = 302,
    NotModified = 304,
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    InternalServerError = 500,
    NotImplemented = 501,
    BadGateway = 502,
    ServiceUnavailable = 503,
    /// Clock synchronizer exchange query.
    ReadClock = 800,
    /// Clock synchronizer exchange response.
    ClockReading = 801,
}

impl StatusCode {
    /// Numeric wire value.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Parse the numeric wire value.
    pub fn from_code(code: u32) -> Result<Self> {
        Ok(match code {
            200 => Self::Ok,
            201 => Self::Created,
            202 => Self::Accepted,
            204 => Self::NoContent,
            300 => Self::MultipleChoices,
            301 => Self::MovedPermanently,
            302 => Self::MovedTemporarily,
            304 => Self::NotModified,
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            500 => Self::InternalServerError,
            501 => Self::NotImplemented,
            502 => Self::BadGateway,
            503 => Self::ServiceUnavailable,
            800 => Self::ReadClock,
            801 => Self::ClockReading,
            other => return Err(Error::UnknownStatus(other)),
        })
    }
}

/// Reliable-protocol flavor a message travels under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    /// Sliding-window sequenced channel with retransmit.
    Suc,
    /// Synchronized variant with kill hashes.
    Src,
}

impl ProtocolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Suc => "SUC",
            Self::Src => "SRC",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "SUC" => Ok(Self::Suc),
            "SRC" => Ok(Self::Src),
            other => Err(Error::BadStream(format!("unknown protocol tag {}", other))),
        }
    }
}

/// A peer's resolved location: hostname and service port as strings, the way
/// they appear in the topology configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteHost {
    pub hostname: String,
    pub port: String,
}

/// Message expiration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// No expiration has been configured.
    Unset,
    /// The message explicitly never expires.
    Never,
    /// Expires at the given wall time (microseconds since the Unix epoch).
    At(i64),
}

/// Current wall time in microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros() as i64,
        // Clock before the epoch: treat as epoch.
        Err(_) => 0,
    }
}

/// Typed message envelope. See module docs.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    source: String,
    host: RemoteHost,
    status: StatusCode,
    protocol: ProtocolKind,
    sequence: u32,
    send_ts: i64,
    expiry: Expiry,
    /// Protocol properties (sequence echo, hashes, kill announcements).
    pub properties: KvTree,
    /// Submessages keyed by module tag; the unit of dispatch.
    pub submessages: KvTree,
}

impl Message {
    /// Create a message with the given status; everything else defaulted.
    pub fn new(status: StatusCode) -> Self {
        Self {
            source: String::new(),
            host: RemoteHost::default(),
            status,
            protocol: ProtocolKind::Suc,
            sequence: 0,
            send_ts: 0,
            expiry: Expiry::Unset,
            properties: KvTree::new(),
            submessages: KvTree::new(),
        }
    }

    // ===== Accessors =====

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn host(&self) -> &RemoteHost {
        &self.host
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn send_ts(&self) -> i64 {
        self.send_ts
    }

    pub fn set_source<S: Into<String>>(&mut self, uuid: S) {
        self.source = uuid.into();
    }

    pub fn set_host(&mut self, host: RemoteHost) {
        self.host = host;
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn set_protocol(&mut self, protocol: ProtocolKind) {
        self.protocol = protocol;
    }

    pub fn set_sequence(&mut self, sequence: u32) {
        self.sequence = sequence;
    }

    /// Stamp the send time with the current wall clock.
    pub fn stamp_send_time(&mut self) {
        self.send_ts = now_micros();
    }

    pub fn set_send_ts(&mut self, micros: i64) {
        self.send_ts = micros;
    }

    // ===== Expiration =====

    /// True when any expiration state has been configured.
    pub fn is_expire_time_set(&self) -> bool {
        self.expiry != Expiry::Unset
    }

    /// True when a concrete (non-never) expire time is set.
    pub fn has_expire_time(&self) -> bool {
        matches!(self.expiry, Expiry::At(_))
    }

    pub fn set_expire_time(&mut self, micros: i64) {
        self.expiry = Expiry::At(micros);
    }

    /// Expire this message `after` from now.
    pub fn set_expire_from_now(&mut self, after: Duration) {
        self.expiry = Expiry::At(now_micros() + after.as_micros() as i64);
    }

    /// Mark the message as never expiring.
    pub fn set_never_expires(&mut self) {
        self.expiry = Expiry::Never;
    }

    /// Expired when a concrete expire time is set and lies in the past.
    pub fn is_expired(&self) -> bool {
        match self.expiry {
            Expiry::At(t) => t < now_micros(),
            _ => false,
        }
    }

    // ===== Hashing =====

    /// Stable 64-bit digest over the encoded submessage tree and send time.
    ///
    /// Equal iff the submessage trees and send timestamps match bit-for-bit.
    pub fn hash(&self) -> u64 {
        let mut hasher = Md5::new();
        hasher.update(encode_tree(&self.submessages));
        hasher.update(self.send_ts.to_le_bytes());
        let digest = hasher.finalize();
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(first)
    }

    // ===== Wire form =====

    /// Render the body tree.
    fn to_tree(&self) -> KvTree {
        let mut host = KvTree::new();
        host.put("name", self.host.hostname.clone());
        host.put("port", self.host.port.clone());

        let mut root = KvTree::new();
        root.put("source", self.source.clone());
        root.put_child("host", host);
        root.put("status", self.status.code().to_string());
        root.put("protocol", self.protocol.as_str());
        root.put("sequenceno", self.sequence.to_string());
        root.put("sendtime", self.send_ts.to_string());
        match self.expiry {
            Expiry::Unset => {}
            Expiry::Never => root.put("expiretime", "never"),
            Expiry::At(t) => root.put("expiretime", t.to_string()),
        }
        root.put_child("properties", self.properties.clone());
        root.put_child("submessages", self.submessages.clone());
        root
    }

    /// Rebuild a message from a decoded body tree.
    fn from_tree(root: &KvTree) -> Result<Self> {
        let source = root.get("source").ok_or(Error::MissingField("source"))?;
        let host_tree = root.get_child("host").ok_or(Error::MissingField("host"))?;
        let status = StatusCode::from_code(
            field_u32(root, "status")?,
        )?;
        let protocol = ProtocolKind::from_tag(
            root.get("protocol").ok_or(Error::MissingField("protocol"))?,
        )?;
        let sequence = field_u32(root, "sequenceno")?;
        let send_ts = root
            .get("sendtime")
            .ok_or(Error::MissingField("sendtime"))?
            .parse::<i64>()
            .map_err(|_| Error::BadStream("sendtime not numeric".to_string()))?;
        let expiry = match root.get("expiretime") {
            None => Expiry::Unset,
            Some("never") => Expiry::Never,
            Some(raw) => Expiry::At(
                raw.parse::<i64>()
                    .map_err(|_| Error::BadStream("expiretime not numeric".to_string()))?,
            ),
        };

        Ok(Self {
            source: source.to_string(),
            host: RemoteHost {
                hostname: host_tree.get("name").unwrap_or("").to_string(),
                port: host_tree.get("port").unwrap_or("").to_string(),
            },
            status,
            protocol,
            sequence,
            send_ts,
            expiry,
            properties: root.get_child("properties").cloned().unwrap_or_default(),
            submessages: root.get_child("submessages").cloned().unwrap_or_default(),
        })
    }

    /// Serialize into one datagram: envelope + body stream.
    ///
    /// Fails with [`Error::MessageTooLarge`] when the result would exceed
    /// [`MAX_DATAGRAM_SIZE`].
    pub fn to_datagram(&self, ack: bool) -> Result<Vec<u8>> {
        let body = encode_tree(&self.to_tree());
        let total = ENVELOPE_SIZE + body.len();
        if total > MAX_DATAGRAM_SIZE {
            return Err(Error::MessageTooLarge(total));
        }
        let envelope = Envelope {
            body_len: body.len(),
            sequence: self.sequence,
            ack,
        };
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&envelope.encode());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse a datagram into its envelope and message.
    pub fn from_datagram(datagram: &[u8]) -> Result<(Envelope, Self)> {
        let envelope = Envelope::decode(datagram)?;
        let body = &datagram[ENVELOPE_SIZE..];
        if body.len() < envelope.body_len {
            return Err(Error::BadEnvelope(format!(
                "envelope claims {} body bytes, datagram has {}",
                envelope.body_len,
                body.len()
            )));
        }
        let root = decode_tree(&body[..envelope.body_len])?;
        let message = Self::from_tree(&root)?;
        Ok((envelope, message))
    }
}

fn field_u32(root: &KvTree, name: &'static str) -> Result<u32> {
    root.get(name)
        .ok_or(Error::MissingField(name))?
        .parse::<u32>()
        .map_err(|_| Error::BadStream(format!("{} not numeric", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let mut msg = Message::new(StatusCode::Ok);
        msg.set_source("peer-a");
        msg.set_host(RemoteHost {
            hostname: "node1".to_string(),
            port: "51870".to_string(),
        });
        msg.set_protocol(ProtocolKind::Src);
        msg.set_sequence(17);
        msg.set_send_ts(1_700_000_000_000_000);
        msg.submessages.put_child("gm", {
            let mut t = KvTree::new();
            t.put("ping", "1");
            t
        });
        msg
    }

    #[test]
    fn test_datagram_roundtrip() {
        let msg = sample();
        let datagram = msg.to_datagram(false).expect("encodes");
        let (envelope, decoded) = Message::from_datagram(&datagram).expect("decodes");
        assert!(!envelope.ack);
        assert_eq!(envelope.sequence, 17);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_ack_flag_in_envelope() {
        let datagram = sample().to_datagram(true).expect("encodes");
        let (envelope, _) = Message::from_datagram(&datagram).expect("decodes");
        assert!(envelope.ack);
    }

    #[test]
    fn test_oversize_rejected() {
        let mut msg = sample();
        msg.submessages.put("blob", "x".repeat(MAX_DATAGRAM_SIZE));
        assert!(matches!(
            msg.to_datagram(false),
            Err(Error::MessageTooLarge(_))
        ));
    }

    #[test]
    fn test_hash_matches_iff_submessages_and_sendtime_match() {
        let m1 = sample();
        let mut m2 = sample();
        assert_eq!(m1.hash(), m2.hash());

        // Status, sequence and properties do not participate.
        m2.set_status(StatusCode::NotFound);
        m2.set_sequence(900);
        m2.properties.put("seq", "1");
        assert_eq!(m1.hash(), m2.hash());

        // Submessage change does.
        m2.submessages.put("extra", "1");
        assert_ne!(m1.hash(), m2.hash());

        // Send time change does.
        let mut m3 = sample();
        m3.set_send_ts(m1.send_ts() + 1);
        assert_ne!(m1.hash(), m3.hash());
    }

    #[test]
    fn test_submessage_order_changes_hash() {
        let mut m1 = Message::new(StatusCode::Ok);
        m1.submessages.put("a", "1");
        m1.submessages.put("b", "2");
        let mut m2 = Message::new(StatusCode::Ok);
        m2.submessages.put("b", "2");
        m2.submessages.put("a", "1");
        assert_ne!(m1.hash(), m2.hash());
    }

    #[test]
    fn test_expiry_states() {
        let mut msg = Message::new(StatusCode::Ok);
        assert!(!msg.is_expire_time_set());
        assert!(!msg.is_expired());

        msg.set_never_expires();
        assert!(msg.is_expire_time_set());
        assert!(!msg.has_expire_time());
        assert!(!msg.is_expired());

        msg.set_expire_time(now_micros() - 1);
        assert!(msg.has_expire_time());
        assert!(msg.is_expired());

        msg.set_expire_from_now(Duration::from_secs(60));
        assert!(!msg.is_expired());
    }

    #[test]
    fn test_expiry_survives_roundtrip() {
        let mut msg = sample();
        msg.set_never_expires();
        let (_, decoded) =
            Message::from_datagram(&msg.to_datagram(false).expect("encodes")).expect("decodes");
        assert!(decoded.is_expire_time_set());
        assert!(!decoded.has_expire_time());
    }

    #[test]
    fn test_missing_source_rejected() {
        let mut root = KvTree::new();
        root.put("status", "200");
        let body = encode_tree(&root);
        let envelope = Envelope {
            body_len: body.len(),
            sequence: 0,
            ack: false,
        };
        let mut datagram = envelope.encode().to_vec();
        datagram.extend_from_slice(&body);
        assert!(matches!(
            Message::from_datagram(&datagram),
            Err(Error::MissingField("source"))
        ));
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!(matches!(
            StatusCode::from_code(999),
            Err(Error::UnknownStatus(999))
        ));
    }
}
