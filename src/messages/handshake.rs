use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::{unix_now, within_tolerance, CodecError, TIMESTAMP_TOLERANCE_SECS};

/// Length of the authentication challenge issued by the server.
pub const CHALLENGE_LENGTH: usize = 24;

const BASE_SIZE: usize = 2 + 8 + CHALLENGE_LENGTH;

/// Option bits a client sends in its handshake response.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientFlags(u8);

impl ClientFlags {
    pub const NONE: Self = Self(0);
    /// Command responses are not sent back to the issuing client.
    pub const SUPPRESS_COMMAND_RESPONSES: Self = Self(1);
    /// Subscribe to the server console feed after authentication.
    pub const SUBSCRIBE_SERVER_CONSOLE: Self = Self(1 << 1);
    /// Subscribe to the server log feed after authentication.
    pub const SUBSCRIBE_SERVER_LOGS: Self = Self(1 << 2);
    /// Remote-admin responses arrive structured, with metadata.
    pub const REMOTE_ADMIN_METADATA: Self = Self(1 << 3);
    /// The handshake carries a permission mask and kick power to narrow the grant.
    pub const RESTRICT_PERMISSIONS: Self = Self(1 << 4);
    /// The handshake carries a username used for server-side logging.
    pub const SPECIFY_LOG_USERNAME: Self = Self(1 << 5);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: Self, enabled: bool) {
        if enabled {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }

    #[must_use]
    pub fn with(mut self, other: Self, enabled: bool) -> Self {
        self.set(other, enabled);
        self
    }
}

impl BitOr for ClientFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ClientFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ClientFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientFlags({:#08b})", self.0)
    }
}

fn read_base(
    bytes: &[u8],
    needed: usize,
) -> Result<(u16, i64, [u8; CHALLENGE_LENGTH]), CodecError> {
    if bytes.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            actual: bytes.len(),
        });
    }
    let max_packet_size = u16::from_be_bytes([bytes[0], bytes[1]]);
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&bytes[2..10]);
    let mut challenge = [0u8; CHALLENGE_LENGTH];
    challenge.copy_from_slice(&bytes[10..BASE_SIZE]);
    Ok((max_packet_size, i64::from_be_bytes(ts), challenge))
}

fn write_base(
    out: &mut Vec<u8>,
    max_packet_size: u16,
    timestamp: i64,
    challenge: &[u8; CHALLENGE_LENGTH],
) {
    out.extend_from_slice(&max_packet_size.to_be_bytes());
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(challenge);
}

/// Challenge the server opens every connection with. Sent in plaintext.
///
/// ```text
/// u16 max packet size | i64 timestamp | [u8; 24] challenge | [u16 timeout threshold ms]
/// ```
///
/// The trailing idle-timeout threshold is optional; servers that omit it send
/// the 34-byte form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandshake {
    pub max_packet_size: u16,
    pub timestamp: i64,
    pub challenge: [u8; CHALLENGE_LENGTH],
    pub timeout_threshold_ms: Option<u16>,
}

impl ServerHandshake {
    pub const MIN_SIZE: usize = BASE_SIZE;
    pub const MAX_SIZE: usize = BASE_SIZE + 2;

    /// Builds a handshake with a fresh random challenge stamped now.
    pub fn generate(max_packet_size: u16) -> Self {
        let mut challenge = [0u8; CHALLENGE_LENGTH];
        OsRng.fill_bytes(&mut challenge);
        Self {
            max_packet_size,
            timestamp: unix_now(),
            challenge,
            timeout_threshold_ms: None,
        }
    }

    #[must_use]
    pub fn with_timeout_threshold(mut self, threshold_ms: u16) -> Self {
        self.timeout_threshold_ms = Some(threshold_ms);
        self
    }

    pub fn encoded_len(&self) -> usize {
        BASE_SIZE + self.timeout_threshold_ms.map_or(0, |_| 2)
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.reserve(self.encoded_len());
        write_base(out, self.max_packet_size, self.timestamp, &self.challenge);
        if let Some(threshold) = self.timeout_threshold_ms {
            out.extend_from_slice(&threshold.to_be_bytes());
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (max_packet_size, timestamp, challenge) = read_base(bytes, BASE_SIZE)?;
        let timeout_threshold_ms = match &bytes[BASE_SIZE..] {
            [] => None,
            [hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
            _ => return Err(CodecError::Length { actual: bytes.len() }),
        };
        Ok(Self {
            max_packet_size,
            timestamp,
            challenge,
            timeout_threshold_ms,
        })
    }

    pub fn validate(&self) -> bool {
        self.validate_at(unix_now(), TIMESTAMP_TOLERANCE_SECS)
    }

    pub fn validate_at(&self, now: i64, tolerance_secs: u64) -> bool {
        within_tolerance(self.timestamp, now, tolerance_secs)
    }
}

/// Response a client returns once it accepts the server's challenge.
///
/// ```text
/// u16 max packet size | i64 timestamp | [u8; 24] challenge | u8 flags
///   [u64 permissions | u8 kick power]   if RESTRICT_PERMISSIONS
///   [utf-8 username (remainder)]        if SPECIFY_LOG_USERNAME
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHandshake {
    max_packet_size: u16,
    timestamp: i64,
    challenge: [u8; CHALLENGE_LENGTH],
    flags: ClientFlags,
    permissions: u64,
    kick_power: u8,
    username: Option<String>,
}

impl ClientHandshake {
    /// Builds a response stamped now.
    ///
    /// Permissions and kick power are only kept when `RESTRICT_PERMISSIONS` is
    /// set, and the username only when `SPECIFY_LOG_USERNAME` is set; otherwise
    /// they never reach the wire and are reset to their unrestricted values.
    pub fn new(
        max_packet_size: u16,
        challenge: [u8; CHALLENGE_LENGTH],
        flags: ClientFlags,
        permissions: u64,
        kick_power: u8,
        username: Option<String>,
    ) -> Result<Self, CodecError> {
        Self::with_timestamp(
            max_packet_size,
            unix_now(),
            challenge,
            flags,
            permissions,
            kick_power,
            username,
        )
    }

    pub fn with_timestamp(
        max_packet_size: u16,
        timestamp: i64,
        challenge: [u8; CHALLENGE_LENGTH],
        flags: ClientFlags,
        permissions: u64,
        kick_power: u8,
        username: Option<String>,
    ) -> Result<Self, CodecError> {
        let username = if flags.contains(ClientFlags::SPECIFY_LOG_USERNAME) {
            match username {
                Some(name) if !name.trim().is_empty() => Some(name),
                _ => return Err(CodecError::MissingUsername),
            }
        } else {
            None
        };
        let (permissions, kick_power) = if flags.contains(ClientFlags::RESTRICT_PERMISSIONS) {
            (permissions, kick_power)
        } else {
            (u64::MAX, u8::MAX)
        };
        Ok(Self {
            max_packet_size,
            timestamp,
            challenge,
            flags,
            permissions,
            kick_power,
            username,
        })
    }

    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn challenge(&self) -> &[u8; CHALLENGE_LENGTH] {
        &self.challenge
    }

    pub fn flags(&self) -> ClientFlags {
        self.flags
    }

    pub fn permissions(&self) -> u64 {
        self.permissions
    }

    pub fn kick_power(&self) -> u8 {
        self.kick_power
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn encoded_len(&self) -> usize {
        let mut len = BASE_SIZE + 1;
        if self.flags.contains(ClientFlags::RESTRICT_PERMISSIONS) {
            len += 8 + 1;
        }
        if let Some(name) = &self.username {
            len += name.len();
        }
        len
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.reserve(self.encoded_len());
        write_base(out, self.max_packet_size, self.timestamp, &self.challenge);
        out.push(self.flags.bits());
        if self.flags.contains(ClientFlags::RESTRICT_PERMISSIONS) {
            out.extend_from_slice(&self.permissions.to_be_bytes());
            out.push(self.kick_power);
        }
        if let Some(name) = &self.username {
            out.extend_from_slice(name.as_bytes());
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (max_packet_size, timestamp, challenge) = read_base(bytes, BASE_SIZE + 1)?;
        let flags = ClientFlags::from_bits(bytes[BASE_SIZE]);
        let mut offset = BASE_SIZE + 1;

        let (permissions, kick_power) = if flags.contains(ClientFlags::RESTRICT_PERMISSIONS) {
            let needed = offset + 9;
            if bytes.len() < needed {
                return Err(CodecError::Truncated {
                    needed,
                    actual: bytes.len(),
                });
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[offset..offset + 8]);
            let kick = bytes[offset + 8];
            offset = needed;
            (u64::from_be_bytes(raw), kick)
        } else {
            (u64::MAX, u8::MAX)
        };

        let username = if flags.contains(ClientFlags::SPECIFY_LOG_USERNAME) {
            Some(std::str::from_utf8(&bytes[offset..])?.to_owned())
        } else {
            None
        };

        Self::with_timestamp(
            max_packet_size,
            timestamp,
            challenge,
            flags,
            permissions,
            kick_power,
            username,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn challenge() -> [u8; CHALLENGE_LENGTH] {
        let mut c = [0u8; CHALLENGE_LENGTH];
        for (i, b) in c.iter_mut().enumerate() {
            *b = i as u8 * 3;
        }
        c
    }

    #[test]
    fn server_handshake_roundtrip_with_and_without_threshold() {
        let plain = ServerHandshake {
            max_packet_size: 4096,
            timestamp: NOW,
            challenge: challenge(),
            timeout_threshold_ms: None,
        };
        let bytes = plain.encode();
        assert_eq!(bytes.len(), ServerHandshake::MIN_SIZE);
        assert_eq!(&bytes[..2], &4096u16.to_be_bytes());
        assert_eq!(ServerHandshake::decode(&bytes).unwrap(), plain);

        let with = plain.clone().with_timeout_threshold(30_000);
        let bytes = with.encode();
        assert_eq!(bytes.len(), ServerHandshake::MIN_SIZE + 2);
        assert_eq!(ServerHandshake::decode(&bytes).unwrap(), with);
    }

    #[test]
    fn server_handshake_too_short() {
        let err = ServerHandshake::decode(&[0u8; 33]).unwrap_err();
        assert_eq!(
            err,
            CodecError::Truncated {
                needed: 34,
                actual: 33
            }
        );
    }

    #[test]
    fn server_handshake_rejects_trailing_garbage() {
        let mut bytes = ServerHandshake::generate(4096).encode();
        bytes.push(0xff);
        assert_eq!(
            ServerHandshake::decode(&bytes).unwrap_err(),
            CodecError::Length { actual: 35 }
        );
        bytes.extend_from_slice(&[0, 0]);
        assert_eq!(
            ServerHandshake::decode(&bytes).unwrap_err(),
            CodecError::Length { actual: 37 }
        );
    }

    #[test]
    fn server_handshake_timestamp_window() {
        let hs = ServerHandshake {
            max_packet_size: 4096,
            timestamp: NOW,
            challenge: challenge(),
            timeout_threshold_ms: None,
        };
        assert!(hs.validate_at(NOW + 120, 120));
        assert!(!hs.validate_at(NOW + 121, 120));
        assert!(!hs.validate_at(NOW - 121, 120));
    }

    #[test]
    fn generated_challenges_differ() {
        let a = ServerHandshake::generate(4096);
        let b = ServerHandshake::generate(4096);
        assert_ne!(a.challenge, b.challenge);
        assert!(a.validate());
    }

    #[test]
    fn client_handshake_roundtrip_all_flag_combinations() {
        let extra = [
            ClientFlags::NONE,
            ClientFlags::SUBSCRIBE_SERVER_CONSOLE | ClientFlags::REMOTE_ADMIN_METADATA,
        ];
        for base in extra {
            for restrict in [false, true] {
                for named in [false, true] {
                    let flags = base
                        .with(ClientFlags::RESTRICT_PERMISSIONS, restrict)
                        .with(ClientFlags::SPECIFY_LOG_USERNAME, named);
                    let hs = ClientHandshake::with_timestamp(
                        16384,
                        NOW,
                        challenge(),
                        flags,
                        0x00FF_00FF_00FF_00FF,
                        42,
                        Some("zażółć admin".to_string()),
                    )
                    .unwrap();
                    let bytes = hs.encode();
                    assert_eq!(bytes.len(), hs.encoded_len());
                    assert_eq!(ClientHandshake::decode(&bytes).unwrap(), hs, "flags {:?}", flags);
                }
            }
        }
    }

    #[test]
    fn client_handshake_layout() {
        let hs = ClientHandshake::with_timestamp(
            16384,
            NOW,
            challenge(),
            ClientFlags::RESTRICT_PERMISSIONS | ClientFlags::SPECIFY_LOG_USERNAME,
            7,
            3,
            Some("ops".into()),
        )
        .unwrap();
        let bytes = hs.encode();
        assert_eq!(
            bytes[34],
            (ClientFlags::RESTRICT_PERMISSIONS | ClientFlags::SPECIFY_LOG_USERNAME).bits()
        );
        assert_eq!(&bytes[35..43], &7u64.to_be_bytes());
        assert_eq!(bytes[43], 3);
        assert_eq!(&bytes[44..], b"ops");
    }

    #[test]
    fn unflagged_fields_are_dropped() {
        let hs = ClientHandshake::with_timestamp(
            16384,
            NOW,
            challenge(),
            ClientFlags::NONE,
            1,
            1,
            Some("ignored".into()),
        )
        .unwrap();
        assert_eq!(hs.permissions(), u64::MAX);
        assert_eq!(hs.kick_power(), u8::MAX);
        assert_eq!(hs.username(), None);
        assert_eq!(hs.encoded_len(), 35);
    }

    #[test]
    fn username_flag_requires_non_blank_name() {
        for name in [None, Some(String::new()), Some("  \t".to_string())] {
            let err = ClientHandshake::with_timestamp(
                16384,
                NOW,
                challenge(),
                ClientFlags::SPECIFY_LOG_USERNAME,
                u64::MAX,
                u8::MAX,
                name,
            )
            .unwrap_err();
            assert_eq!(err, CodecError::MissingUsername);
        }
    }

    #[test]
    fn restricted_handshake_missing_permissions_is_truncated() {
        let mut bytes = ClientHandshake::with_timestamp(
            16384,
            NOW,
            challenge(),
            ClientFlags::NONE,
            u64::MAX,
            u8::MAX,
            None,
        )
        .unwrap()
        .encode();
        bytes[34] = ClientFlags::RESTRICT_PERMISSIONS.bits();
        assert!(matches!(
            ClientHandshake::decode(&bytes).unwrap_err(),
            CodecError::Truncated { needed: 44, .. }
        ));
    }

    #[test]
    fn flags_set_and_clear() {
        let mut flags = ClientFlags::SUPPRESS_COMMAND_RESPONSES;
        flags.set(ClientFlags::SUBSCRIBE_SERVER_LOGS, true);
        assert!(flags.contains(ClientFlags::SUBSCRIBE_SERVER_LOGS));
        flags.set(ClientFlags::SUPPRESS_COMMAND_RESPONSES, false);
        assert_eq!(flags, ClientFlags::SUBSCRIBE_SERVER_LOGS);
        assert!(flags.contains(ClientFlags::NONE));
    }
}
