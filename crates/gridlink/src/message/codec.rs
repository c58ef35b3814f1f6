// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Wire codec: datagram envelope and prefix-coded key/value stream.
//!
//! Every datagram starts with a fixed 23-byte ASCII envelope:
//!
//! ```text
//! bytes 0..10   decimal body length, left-zero-padded
//! bytes 11..21  decimal sequence number, left-zero-padded
//! byte  22      '1' if ACK, '0' otherwise
//! ```
//!
//! The body is a flat prefix-coded stream of records
//! `(type, 5 ASCII digit length, payload)` where type `k` introduces a key,
//! the `s` record that must follow it holds the encoded child stream, and
//! `v` holds a leaf value. A node that has children does not encode its own
//! value.
//!
//! The decoder is non-recursive: nesting is tracked with an explicit frame
//! stack so hostile input cannot exhaust the call stack. Malformed prefixes
//! are rejected with [`Error::BadStream`] / [`Error::BadEnvelope`].

use crate::config::{
    ENVELOPE_SIZE, LENGTH_FIELD_SIZE, SEQUENCE_FIELD_SIZE, STREAM_LENGTH_FIELD,
};
use crate::error::{Error, Result};
use crate::message::KvTree;

/// Parsed datagram envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    /// Length of the body following the envelope.
    pub body_len: usize,
    /// Sequence number duplicated from the message body.
    pub sequence: u32,
    /// True when the datagram carries an acknowledgement.
    pub ack: bool,
}

impl Envelope {
    /// Render the 23-byte envelope.
    pub fn encode(&self) -> [u8; ENVELOPE_SIZE] {
        let text = format!(
            "{:0lw$}{:0sw$}{}",
            self.body_len,
            self.sequence,
            if self.ack { '1' } else { '0' },
            lw = LENGTH_FIELD_SIZE,
            sw = SEQUENCE_FIELD_SIZE,
        );
        let mut out = [0u8; ENVELOPE_SIZE];
        out.copy_from_slice(text.as_bytes());
        out
    }

    /// Parse the envelope from the head of a datagram.
    pub fn decode(datagram: &[u8]) -> Result<Self> {
        if datagram.len() < ENVELOPE_SIZE {
            return Err(Error::BadEnvelope(format!(
                "datagram of {} bytes is shorter than the envelope",
                datagram.len()
            )));
        }
        let body_len = ascii_field(&datagram[..LENGTH_FIELD_SIZE])?;
        let sequence = ascii_field(
            &datagram[LENGTH_FIELD_SIZE..LENGTH_FIELD_SIZE + SEQUENCE_FIELD_SIZE],
        )?;
        let ack = match datagram[ENVELOPE_SIZE - 1] {
            b'1' => true,
            b'0' => false,
            other => {
                return Err(Error::BadEnvelope(format!(
                    "ack flag is {:#04x}, expected '0' or '1'",
                    other
                )))
            }
        };
        Ok(Self {
            body_len: body_len as usize,
            sequence,
            ack,
        })
    }
}

/// Parse a left-zero-padded ASCII decimal field.
fn ascii_field(field: &[u8]) -> Result<u32> {
    let mut value: u64 = 0;
    for &b in field {
        if !b.is_ascii_digit() {
            return Err(Error::BadEnvelope(format!(
                "non-digit {:#04x} in numeric field",
                b
            )));
        }
        value = value * 10 + u64::from(b - b'0');
        if value > u64::from(u32::MAX) {
            return Err(Error::BadEnvelope("numeric field overflow".to_string()));
        }
    }
    Ok(value as u32)
}

/// Encode a tree into the prefix-coded stream.
///
/// A childless node encodes its value as one `v` record (nothing at all
/// when it holds no value). A node with children encodes each child as a
/// `k` record (the key) followed by an `s` record (the encoded child); the
/// node's own value, if any, is dropped.
pub fn encode_tree(tree: &KvTree) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(tree, &mut out);
    out
}

fn encode_into(tree: &KvTree, out: &mut Vec<u8>) {
    if tree.is_leaf() {
        if let Some(value) = tree.value() {
            push_record(out, b'v', value.as_bytes());
        }
        return;
    }
    for (key, child) in tree.iter() {
        push_record(out, b'k', key.as_bytes());
        let encoded = encode_tree(child);
        push_record(out, b's', &encoded);
    }
}

fn push_record(out: &mut Vec<u8>, token: u8, payload: &[u8]) {
    out.push(token);
    out.extend_from_slice(format!("{:0w$}", payload.len(), w = STREAM_LENGTH_FIELD).as_bytes());
    out.extend_from_slice(payload);
}

/// Decode a prefix-coded stream back into a tree.
///
/// Non-recursive: `k`/`s` pairs push frames onto an explicit stack and a
/// frame pops when its region is exhausted. Rejected inputs: unknown record
/// token, non-digit or truncated length prefix, record overrunning its
/// enclosing region, `k` without a following `s`, and bare `s` records.
pub fn decode_tree(stream: &[u8]) -> Result<KvTree> {
    struct Frame {
        tree: KvTree,
        key: String,
        end: usize,
    }

    let mut stack: Vec<Frame> = Vec::new();
    let mut current = KvTree::new();
    let mut end = stream.len();
    let mut pos = 0usize;

    loop {
        while pos == end {
            match stack.pop() {
                Some(frame) => {
                    let child = std::mem::replace(&mut current, frame.tree);
                    current.add_child(frame.key, child);
                    end = frame.end;
                }
                None => return Ok(current),
            }
        }

        let (token, payload_len) = read_prefix(stream, pos, end)?;
        let payload_start = pos + 1 + STREAM_LENGTH_FIELD;
        let payload_end = payload_start + payload_len;
        if payload_end > end {
            return Err(Error::BadStream(format!(
                "record at offset {} overruns its region",
                pos
            )));
        }

        match token {
            b'v' => {
                let value = utf8_payload(&stream[payload_start..payload_end], pos)?;
                current.set_value(value);
                pos = payload_end;
            }
            b'k' => {
                let key = utf8_payload(&stream[payload_start..payload_end], pos)?;
                // The subtree record must follow immediately.
                let (sub_token, sub_len) = read_prefix(stream, payload_end, end)?;
                if sub_token != b's' {
                    return Err(Error::BadStream(format!(
                        "key at offset {} not followed by a subtree record",
                        pos
                    )));
                }
                let sub_start = payload_end + 1 + STREAM_LENGTH_FIELD;
                let sub_end = sub_start + sub_len;
                if sub_end > end {
                    return Err(Error::BadStream(format!(
                        "subtree at offset {} overruns its region",
                        payload_end
                    )));
                }
                stack.push(Frame {
                    tree: std::mem::take(&mut current),
                    key,
                    end,
                });
                end = sub_end;
                pos = sub_start;
            }
            b's' => {
                return Err(Error::BadStream(format!(
                    "subtree record at offset {} without a key",
                    pos
                )))
            }
            other => {
                return Err(Error::BadStream(format!(
                    "unknown record token {:#04x} at offset {}",
                    other, pos
                )))
            }
        }
    }
}

fn read_prefix(stream: &[u8], pos: usize, end: usize) -> Result<(u8, usize)> {
    if pos + 1 + STREAM_LENGTH_FIELD > end {
        return Err(Error::BadStream(format!(
            "truncated record prefix at offset {}",
            pos
        )));
    }
    let token = stream[pos];
    let mut len = 0usize;
    for &b in &stream[pos + 1..pos + 1 + STREAM_LENGTH_FIELD] {
        if !b.is_ascii_digit() {
            return Err(Error::BadStream(format!(
                "non-digit in length prefix at offset {}",
                pos
            )));
        }
        len = len * 10 + usize::from(b - b'0');
    }
    Ok((token, len))
}

fn utf8_payload(bytes: &[u8], offset: usize) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::BadStream(format!("non-UTF-8 payload at offset {}", offset)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> KvTree {
        let mut gm = KvTree::new();
        gm.put("ping", "1");
        gm.put("leader", "node-a");
        let mut tree = KvTree::new();
        tree.put_child("gm", gm);
        tree.put("seq", "42");
        tree
    }

    #[test]
    fn test_envelope_roundtrip() {
        let env = Envelope {
            body_len: 1234,
            sequence: 1023,
            ack: true,
        };
        let bytes = env.encode();
        assert_eq!(bytes.len(), ENVELOPE_SIZE);
        assert_eq!(Envelope::decode(&bytes).expect("decodes"), env);
    }

    #[test]
    fn test_envelope_layout_exact() {
        let env = Envelope {
            body_len: 57,
            sequence: 3,
            ack: false,
        };
        assert_eq!(&env.encode(), b"00000000057000000000030");
    }

    #[test]
    fn test_envelope_short_datagram_rejected() {
        assert!(matches!(
            Envelope::decode(b"0000"),
            Err(Error::BadEnvelope(_))
        ));
    }

    #[test]
    fn test_envelope_bad_ack_flag_rejected() {
        let mut bytes = Envelope {
            body_len: 0,
            sequence: 0,
            ack: false,
        }
        .encode();
        bytes[ENVELOPE_SIZE - 1] = b'x';
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(Error::BadEnvelope(_))
        ));
    }

    #[test]
    fn test_envelope_non_digit_rejected() {
        let mut bytes = Envelope {
            body_len: 10,
            sequence: 10,
            ack: false,
        }
        .encode();
        bytes[2] = b'z';
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(Error::BadEnvelope(_))
        ));
    }

    #[test]
    fn test_tree_roundtrip() {
        let tree = sample_tree();
        let encoded = encode_tree(&tree);
        let decoded = decode_tree(&encoded).expect("decodes");
        assert_eq!(decoded, tree);
    }

    #[test]
    fn test_leaf_encoding_exact() {
        // 'v' + 5-digit length + payload
        assert_eq!(encode_tree(&KvTree::leaf("hi")), b"v00002hi");
    }

    #[test]
    fn test_key_encoding_exact() {
        let mut tree = KvTree::new();
        tree.put("ab", "x");
        // k 00002 ab, then s holding the 7-byte leaf record v 00001 x
        assert_eq!(encode_tree(&tree), b"k00002abs00007v00001x");
    }

    #[test]
    fn test_empty_tree_roundtrip() {
        let encoded = encode_tree(&KvTree::new());
        assert!(encoded.is_empty());
        let decoded = decode_tree(&encoded).expect("decodes");
        assert_eq!(decoded, KvTree::new());
    }

    #[test]
    fn test_node_value_dropped_when_children_present() {
        let mut tree = KvTree::new();
        tree.set_value("shadowed");
        tree.put("k", "v");
        let decoded = decode_tree(&encode_tree(&tree)).expect("decodes");
        assert_eq!(decoded.value(), None);
        assert_eq!(decoded.get("k"), Some("v"));
    }

    #[test]
    fn test_deep_nesting_does_not_recurse() {
        // 4000 levels would overflow a recursive decoder's stack.
        let mut tree = KvTree::leaf("bottom");
        for i in 0..4000 {
            let mut parent = KvTree::new();
            parent.put_child(format!("n{}", i), tree);
            tree = parent;
        }
        let encoded = encode_tree(&tree);
        let decoded = decode_tree(&encoded).expect("decodes");
        assert_eq!(decoded, tree);
    }

    #[test]
    fn test_unknown_token_rejected() {
        assert!(matches!(
            decode_tree(b"x00001a"),
            Err(Error::BadStream(_))
        ));
    }

    #[test]
    fn test_truncated_prefix_rejected() {
        assert!(matches!(decode_tree(b"v00"), Err(Error::BadStream(_))));
    }

    #[test]
    fn test_non_digit_length_rejected() {
        assert!(matches!(
            decode_tree(b"v0a001x"),
            Err(Error::BadStream(_))
        ));
    }

    #[test]
    fn test_overrun_record_rejected() {
        // Claims 99 bytes of payload but provides 1.
        assert!(matches!(
            decode_tree(b"v00099x"),
            Err(Error::BadStream(_))
        ));
    }

    #[test]
    fn test_key_without_subtree_rejected() {
        // 'k' record followed by a 'v' record instead of 's'.
        assert!(matches!(
            decode_tree(b"k00001av00001b"),
            Err(Error::BadStream(_))
        ));
    }

    #[test]
    fn test_bare_subtree_rejected() {
        assert!(matches!(
            decode_tree(b"s00000"),
            Err(Error::BadStream(_))
        ));
    }

    #[test]
    fn test_subtree_overrunning_region_rejected() {
        // Outer subtree claims to be larger than the remaining input.
        assert!(matches!(
            decode_tree(b"k00001as99999"),
            Err(Error::BadStream(_))
        ));
    }

    #[test]
    fn test_duplicate_keys_survive_roundtrip() {
        let mut tree = KvTree::new();
        tree.add_child("entry", KvTree::leaf("a"));
        tree.add_child("entry", KvTree::leaf("b"));
        let decoded = decode_tree(&encode_tree(&tree)).expect("decodes");
        assert_eq!(decoded, tree);
    }
}
