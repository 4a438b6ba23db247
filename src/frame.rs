// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! CHP wire codec.
//!
//! Every data exchange is a five-frame multipart message:
//!
//! ```text
//! [key][sequence: f64 LE 8B][origin: 16B or empty][properties][value]
//! ```
//!
//! Submissions, live updates, snapshot entries and heartbeats all share this
//! shape; an empty value is a deletion tombstone. The snapshot handshake adds
//! a two-frame request (`"ICANHAZ?"`, subtree) and reuses the five-frame
//! shape for its `"KTHXBAI"` terminator. `properties` is reserved and must
//! round-trip unchanged.

use std::collections::VecDeque;

use tmq::{Message, Multipart};

use crate::error::{RegistryError, RegistryResult};
use crate::origin::{OriginId, ORIGIN_LEN};

/// Watchdog frame key published when the hub has nothing to flush.
pub const HEARTBEAT: &str = "HUGZ";
/// First frame of a snapshot request.
pub const SNAPSHOT_REQUEST: &str = "ICANHAZ?";
/// Key of the frame terminating a snapshot stream.
pub const SNAPSHOT_END: &str = "KTHXBAI";

/// Number of frames in every CHP data message.
const FRAME_COUNT: usize = 5;

/// A single CHP message: submission, live update, snapshot entry, heartbeat
/// or snapshot terminator, depending on key and context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFrame {
    pub key: String,
    pub sequence: u64,
    pub origin: Option<OriginId>,
    /// Reserved metadata frame, carried unchanged.
    pub properties: Vec<u8>,
    /// Opaque payload; empty means "delete this key".
    pub value: String,
}

impl UpdateFrame {
    pub fn new(
        key: impl Into<String>,
        sequence: u64,
        origin: Option<OriginId>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            sequence,
            origin,
            properties: Vec::new(),
            value: value.into(),
        }
    }

    /// The idle-tick watchdog frame: `("HUGZ", 0, "", "", "")`.
    pub fn heartbeat() -> Self {
        Self::new(HEARTBEAT, 0, None, "")
    }

    /// The snapshot terminator, echoing the requested subtree.
    pub fn terminator(sequence: u64, subtree: &[u8]) -> Self {
        Self::new(
            SNAPSHOT_END,
            sequence,
            None,
            String::from_utf8_lossy(subtree).into_owned(),
        )
    }

    pub fn is_heartbeat(&self) -> bool {
        self.key == HEARTBEAT
    }

    pub fn is_terminator(&self) -> bool {
        self.key == SNAPSHOT_END
    }

    /// True when the value is a deletion tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }

    pub fn to_multipart(&self) -> Multipart {
        Multipart(self.frames())
    }

    /// Same five frames prefixed with a ROUTER identity frame.
    pub fn to_multipart_with_identity(&self, identity: &[u8]) -> Multipart {
        let mut frames = self.frames();
        frames.push_front(Message::from(identity.to_vec()));
        Multipart(frames)
    }

    fn frames(&self) -> VecDeque<Message> {
        let mut frames = VecDeque::with_capacity(FRAME_COUNT);
        frames.push_back(Message::from(self.key.as_bytes().to_vec()));
        frames.push_back(Message::from(
            (self.sequence as f64).to_le_bytes().to_vec(),
        ));
        frames.push_back(Message::from(match &self.origin {
            Some(origin) => origin.as_bytes().to_vec(),
            None => Vec::new(),
        }));
        frames.push_back(Message::from(self.properties.clone()));
        frames.push_back(Message::from(self.value.as_bytes().to_vec()));
        frames
    }

    pub fn from_multipart(msg: &Multipart) -> RegistryResult<Self> {
        let frames: Vec<&Message> = msg.iter().collect();
        if frames.len() != FRAME_COUNT {
            return Err(RegistryError::MalformedFrame {
                expected: "5 frames",
                got: format!("{} frames", frames.len()),
            });
        }

        let sequence_bytes: [u8; 8] =
            frames[1]
                .as_ref()
                .try_into()
                .map_err(|_| RegistryError::MalformedFrame {
                    expected: "8-byte sequence frame",
                    got: format!("{} bytes", frames[1].len()),
                })?;
        let sequence = f64::from_le_bytes(sequence_bytes) as u64;

        let origin_bytes = frames[2].as_ref();
        let origin = if origin_bytes.is_empty() {
            None
        } else {
            Some(OriginId::from_slice(origin_bytes).ok_or(
                RegistryError::MalformedFrame {
                    expected: "empty or 16-byte origin frame",
                    got: format!("{} bytes", origin_bytes.len()),
                },
            )?)
        };

        Ok(Self {
            key: String::from_utf8_lossy(frames[0].as_ref()).into_owned(),
            sequence,
            origin,
            properties: frames[3].to_vec(),
            value: String::from_utf8_lossy(frames[4].as_ref()).into_owned(),
        })
    }
}

/// Build the client-side snapshot request: `("ICANHAZ?", subtree)`.
pub fn snapshot_request(subtree: &[u8]) -> Multipart {
    let mut frames = VecDeque::with_capacity(2);
    frames.push_back(Message::from(SNAPSHOT_REQUEST.as_bytes().to_vec()));
    frames.push_back(Message::from(subtree.to_vec()));
    Multipart(frames)
}

/// Parse a ROUTER-side snapshot request: `(identity, "ICANHAZ?", subtree)`.
///
/// Returns the identity and subtree, or `None` for any other message shape;
/// unknown requests get no response at all.
pub fn parse_snapshot_request(msg: &Multipart) -> Option<(Vec<u8>, Vec<u8>)> {
    let frames: Vec<&Message> = msg.iter().collect();
    if frames.len() != 3 || frames[1].as_ref() != SNAPSHOT_REQUEST.as_bytes() {
        return None;
    }
    Some((frames[0].to_vec(), frames[2].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_roundtrip() {
        let origin = OriginId::random();
        let frame = UpdateFrame::new("topic", 42, Some(origin), "payload");

        let decoded = UpdateFrame::from_multipart(&frame.to_multipart()).unwrap();
        assert_eq!(decoded, frame);
        assert!(!decoded.is_tombstone());
    }

    #[test]
    fn test_sequence_is_little_endian_double() {
        let frame = UpdateFrame::new("k", 42, None, "v");
        let mp = frame.to_multipart();
        let frames: Vec<_> = mp.iter().collect();
        assert_eq!(frames[1].as_ref(), &(42f64).to_le_bytes());
    }

    #[test]
    fn test_tombstone_roundtrip() {
        let frame = UpdateFrame::new("topic", 7, None, "");
        let decoded = UpdateFrame::from_multipart(&frame.to_multipart()).unwrap();
        assert!(decoded.is_tombstone());
        assert_eq!(decoded.origin, None);
    }

    #[test]
    fn test_heartbeat() {
        let hugz = UpdateFrame::heartbeat();
        assert!(hugz.is_heartbeat());
        assert_eq!(hugz.sequence, 0);

        let decoded = UpdateFrame::from_multipart(&hugz.to_multipart()).unwrap();
        assert!(decoded.is_heartbeat());
        assert!(decoded.is_tombstone());
    }

    #[test]
    fn test_properties_round_trip_unchanged() {
        let mut frame = UpdateFrame::new("k", 1, None, "v");
        frame.properties = vec![0xde, 0xad, 0xbe, 0xef];

        let decoded = UpdateFrame::from_multipart(&frame.to_multipart()).unwrap();
        assert_eq!(decoded.properties, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_wrong_frame_count_rejected() {
        let err = UpdateFrame::from_multipart(&snapshot_request(b"")).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::MalformedFrame {
                expected: "5 frames",
                ..
            }
        ));
    }

    #[test]
    fn test_bad_origin_length_rejected() {
        let mut frames = UpdateFrame::new("k", 1, None, "v").frames();
        frames[2] = Message::from(vec![1u8, 2, 3]);

        let err = UpdateFrame::from_multipart(&Multipart(frames)).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::MalformedFrame {
                expected: "empty or 16-byte origin frame",
                ..
            }
        ));
    }

    #[test]
    fn test_bad_sequence_length_rejected() {
        let mut frames = UpdateFrame::new("k", 1, None, "v").frames();
        frames[1] = Message::from(vec![0u8; 4]);

        let err = UpdateFrame::from_multipart(&Multipart(frames)).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::MalformedFrame {
                expected: "8-byte sequence frame",
                ..
            }
        ));
    }

    #[test]
    fn test_snapshot_request_parse() {
        let mut frames = VecDeque::new();
        frames.push_back(Message::from(b"client-1".to_vec()));
        frames.push_back(Message::from(SNAPSHOT_REQUEST.as_bytes().to_vec()));
        frames.push_back(Message::from(Vec::new()));

        let (identity, subtree) = parse_snapshot_request(&Multipart(frames)).unwrap();
        assert_eq!(identity, b"client-1");
        assert!(subtree.is_empty());
    }

    #[test]
    fn test_unknown_request_ignored() {
        let mut frames = VecDeque::new();
        frames.push_back(Message::from(b"client-1".to_vec()));
        frames.push_back(Message::from(b"GIMME".to_vec()));
        frames.push_back(Message::from(Vec::new()));
        assert!(parse_snapshot_request(&Multipart(frames)).is_none());

        // Wrong frame count is ignored too.
        let mut frames = VecDeque::new();
        frames.push_back(Message::from(b"client-1".to_vec()));
        frames.push_back(Message::from(SNAPSHOT_REQUEST.as_bytes().to_vec()));
        assert!(parse_snapshot_request(&Multipart(frames)).is_none());
    }

    #[test]
    fn test_terminator_with_identity() {
        let frame = UpdateFrame::terminator(9, b"");
        assert!(frame.is_terminator());

        let mp = frame.to_multipart_with_identity(b"client-1");
        let frames: Vec<_> = mp.iter().collect();
        assert_eq!(frames.len(), 6);
        assert_eq!(frames[0].as_ref(), b"client-1");
        assert_eq!(frames[1].as_ref(), SNAPSHOT_END.as_bytes());
    }
}
