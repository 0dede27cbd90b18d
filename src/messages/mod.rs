//! Wire structures carried inside frames.
//!
//! Every integer is big-endian. Decoders are handed the exact authenticated
//! plaintext (or, for the server handshake, the exact frame payload) and never
//! read past it.
use std::borrow::Cow;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod handshake;
pub mod remote_admin;

pub use handshake::{ClientFlags, ClientHandshake, ServerHandshake, CHALLENGE_LENGTH};
pub use remote_admin::{RemoteAdminFlags, RemoteAdminResponse};

/// Allowed clock difference, in seconds, between client and server stamps.
pub const TIMESTAMP_TOLERANCE_SECS: u64 = 120;

/// Errors raised while decoding or building wire structures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("need at least {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("server handshake must be 34 or 36 bytes, got {actual}")]
    Length { actual: usize },
    #[error("unknown content type {0:#04x}")]
    UnknownContentType(u8),
    #[error("username must be present and not blank when SpecifyLogUsername is set")]
    MissingUsername,
    #[error("content of {len} bytes does not fit an i32 length field")]
    ContentTooLong { len: usize },
    #[error("declared content length {declared} does not fit {available} available bytes")]
    ContentLength { declared: i32, available: usize },
    #[error("invalid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Seconds since the unix epoch, the unit of every protocol timestamp.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

pub(crate) fn within_tolerance(timestamp: i64, now: i64, tolerance_secs: u64) -> bool {
    now.abs_diff(timestamp) <= tolerance_secs
}

/// Closed set of content-type discriminators for one direction.
pub trait ContentType: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    fn as_byte(self) -> u8;
    fn from_byte(byte: u8) -> Option<Self>;
}

/// Content types a client may send to the server.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentTypeToServer {
    /// Console command to execute on the server.
    Command = 0,
}

impl ContentType for ContentTypeToServer {
    fn as_byte(self) -> u8 {
        self as u8
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Command),
            _ => None,
        }
    }
}

/// Content types the server sends to a client.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentTypeToClient {
    /// Server console output.
    ConsoleString = 0,
    /// A command threw while executing.
    CommandException = 1,
    /// Protocol or status notice from the query layer itself.
    QueryMessage = 2,
    /// Structured remote-admin response, see [`RemoteAdminResponse`].
    RemoteAdminSerializedResponse = 3,
    /// Remote-admin response text only.
    RemoteAdminPlaintextResponse = 4,
    /// Remote-admin failure text only.
    RemoteAdminUnsuccessfulPlaintextResponse = 5,
}

impl ContentType for ContentTypeToClient {
    fn as_byte(self) -> u8 {
        self as u8
    }

    fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Self::ConsoleString,
            1 => Self::CommandException,
            2 => Self::QueryMessage,
            3 => Self::RemoteAdminSerializedResponse,
            4 => Self::RemoteAdminPlaintextResponse,
            5 => Self::RemoteAdminUnsuccessfulPlaintextResponse,
            _ => return None,
        })
    }
}

/// Sequenced, timestamped application message.
///
/// ```text
/// u32 sequence | i64 timestamp | u8 content type | payload (remainder)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryMessage<C> {
    pub sequence: u32,
    pub timestamp: i64,
    pub content_type: C,
    pub payload: Vec<u8>,
}

/// Message travelling client → server.
pub type OutboundMessage = QueryMessage<ContentTypeToServer>;

/// Message travelling server → client.
pub type InboundMessage = QueryMessage<ContentTypeToClient>;

impl<C: ContentType> QueryMessage<C> {
    pub const HEADER_SIZE: usize = 13;

    /// Builds a message stamped with the current time.
    pub fn new(sequence: u32, content_type: C, payload: impl Into<Vec<u8>>) -> Self {
        Self::with_timestamp(sequence, unix_now(), content_type, payload)
    }

    pub fn with_timestamp(
        sequence: u32,
        timestamp: i64,
        content_type: C,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            sequence,
            timestamp,
            content_type,
            payload: payload.into(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len()
    }

    /// Appends the encoded message to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.reserve(self.encoded_len());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.push(self.content_type.as_byte());
        out.extend_from_slice(&self.payload);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < Self::HEADER_SIZE {
            return Err(CodecError::Truncated {
                needed: Self::HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let sequence = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[4..12]);
        let content_type =
            C::from_byte(bytes[12]).ok_or(CodecError::UnknownContentType(bytes[12]))?;
        Ok(Self {
            sequence,
            timestamp: i64::from_be_bytes(ts),
            content_type,
            payload: bytes[Self::HEADER_SIZE..].to_vec(),
        })
    }

    /// True when this message directly follows `last_accepted` and is fresh.
    pub fn validate(&self, last_accepted: u32) -> bool {
        self.validate_at(last_accepted, unix_now(), TIMESTAMP_TOLERANCE_SECS)
    }

    pub fn validate_at(&self, last_accepted: u32, now: i64, tolerance_secs: u64) -> bool {
        self.sequence == last_accepted.wrapping_add(1)
            && within_tolerance(self.timestamp, now, tolerance_secs)
    }

    /// Payload decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl InboundMessage {
    /// Parses the payload of a structured remote-admin response.
    ///
    /// Returns `None` for every other content type.
    pub fn remote_admin_response(&self) -> Option<Result<RemoteAdminResponse, CodecError>> {
        match self.content_type {
            ContentTypeToClient::RemoteAdminSerializedResponse => {
                Some(RemoteAdminResponse::decode(&self.payload))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn message_layout_is_big_endian() {
        let msg = OutboundMessage::with_timestamp(
            0x0102_0304,
            0x1112_1314_1516_1718,
            ContentTypeToServer::Command,
            b"players".to_vec(),
        );
        let bytes = msg.encode();
        assert_eq!(&bytes[..4], &[1, 2, 3, 4]);
        assert_eq!(&bytes[4..12], &[0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18]);
        assert_eq!(bytes[12], 0);
        assert_eq!(&bytes[13..], b"players");
        assert_eq!(OutboundMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn inbound_roundtrip_for_each_content_type() {
        for byte in 0u8..=5 {
            let ct = ContentTypeToClient::from_byte(byte).unwrap();
            let msg = InboundMessage::with_timestamp(9, NOW, ct, vec![byte; byte as usize]);
            assert_eq!(InboundMessage::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn unknown_content_type_rejected() {
        let mut bytes = InboundMessage::with_timestamp(
            1,
            NOW,
            ContentTypeToClient::ConsoleString,
            b"x".to_vec(),
        )
        .encode();
        bytes[12] = 6;
        assert_eq!(
            InboundMessage::decode(&bytes).unwrap_err(),
            CodecError::UnknownContentType(6)
        );
        bytes[12] = 1;
        assert_eq!(
            OutboundMessage::decode(&bytes).unwrap_err(),
            CodecError::UnknownContentType(1)
        );
    }

    #[test]
    fn short_input_rejected() {
        assert_eq!(
            InboundMessage::decode(&[0u8; 12]).unwrap_err(),
            CodecError::Truncated {
                needed: 13,
                actual: 12
            }
        );
    }

    #[test]
    fn empty_payload_decodes() {
        let msg = InboundMessage::with_timestamp(
            1,
            NOW,
            ContentTypeToClient::QueryMessage,
            Vec::new(),
        );
        let decoded = InboundMessage::decode(&msg.encode()).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn validation_requires_next_sequence_and_fresh_timestamp() {
        let msg = InboundMessage::with_timestamp(
            5,
            NOW,
            ContentTypeToClient::ConsoleString,
            b"ok".to_vec(),
        );
        assert!(msg.validate_at(4, NOW, 120));
        assert!(msg.validate_at(4, NOW + 120, 120));
        assert!(msg.validate_at(4, NOW - 120, 120));

        assert!(!msg.validate_at(5, NOW, 120), "duplicate");
        assert!(!msg.validate_at(3, NOW, 120), "gap");
        assert!(!msg.validate_at(6, NOW, 120), "reordered");
        assert!(!msg.validate_at(4, NOW + 121, 120), "stale");
        assert!(!msg.validate_at(4, NOW - 121, 120), "from the future");
    }

    #[test]
    fn sequence_wraps_after_u32_max() {
        let msg = InboundMessage::with_timestamp(
            0,
            NOW,
            ContentTypeToClient::ConsoleString,
            Vec::new(),
        );
        assert!(msg.validate_at(u32::MAX, NOW, 120));
    }

    #[test]
    fn altering_sequence_or_timestamp_breaks_validation() {
        let msg = InboundMessage::with_timestamp(
            1,
            NOW,
            ContentTypeToClient::ConsoleString,
            b"hi".to_vec(),
        );
        let bytes = msg.encode();
        // the lowest timestamp byte only matters once the change exceeds the tolerance
        let flips = (0..11)
            .flat_map(|idx| (0..8).map(move |bit| (idx, bit)))
            .chain(std::iter::once((11, 7)));
        for (idx, bit) in flips {
            let mut altered = bytes.clone();
            altered[idx] ^= 1u8 << bit;
            let decoded = InboundMessage::decode(&altered).unwrap();
            assert!(
                !decoded.validate_at(0, NOW, TIMESTAMP_TOLERANCE_SECS),
                "byte {} bit {} still validated",
                idx,
                bit
            );
        }
    }

    #[test]
    fn extreme_timestamp_does_not_overflow() {
        let msg = InboundMessage::with_timestamp(
            1,
            i64::MIN,
            ContentTypeToClient::ConsoleString,
            Vec::new(),
        );
        assert!(!msg.validate_at(0, i64::MAX, 120));
    }

    #[test]
    fn remote_admin_payload_only_for_structured_type() {
        let response = RemoteAdminResponse::new("Done", true, false, None);
        let msg = InboundMessage::with_timestamp(
            1,
            NOW,
            ContentTypeToClient::RemoteAdminSerializedResponse,
            response.encode().unwrap(),
        );
        assert_eq!(msg.remote_admin_response().unwrap().unwrap(), response);

        let plain = InboundMessage::with_timestamp(
            1,
            NOW,
            ContentTypeToClient::RemoteAdminPlaintextResponse,
            b"Done".to_vec(),
        );
        assert!(plain.remote_admin_response().is_none());
        assert_eq!(plain.text(), "Done");
    }
}
