use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use super::CodecError;

/// Status bits attached to a structured remote-admin response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteAdminFlags(u8);

impl RemoteAdminFlags {
    pub const NONE: Self = Self(0);
    pub const SUCCESSFUL: Self = Self(1);
    pub const LOG_IN_CONSOLE: Self = Self(1 << 1);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for RemoteAdminFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Result of a remote-admin command, as carried by
/// `RemoteAdminSerializedResponse` messages.
///
/// ```text
/// u8 flags | i32 content length | utf-8 content | utf-8 display override (remainder)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAdminResponse {
    content: String,
    flags: RemoteAdminFlags,
    override_display: Option<String>,
}

impl RemoteAdminResponse {
    pub const HEADER_SIZE: usize = 5;

    pub fn new(
        content: impl Into<String>,
        successful: bool,
        log_in_console: bool,
        override_display: Option<String>,
    ) -> Self {
        let mut flags = RemoteAdminFlags::NONE;
        if successful {
            flags = flags | RemoteAdminFlags::SUCCESSFUL;
        }
        if log_in_console {
            flags = flags | RemoteAdminFlags::LOG_IN_CONSOLE;
        }
        Self::with_flags(content, flags, override_display)
    }

    pub fn with_flags(
        content: impl Into<String>,
        flags: RemoteAdminFlags,
        override_display: Option<String>,
    ) -> Self {
        Self {
            content: content.into(),
            flags,
            override_display: override_display.filter(|s| !s.is_empty()),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn flags(&self) -> RemoteAdminFlags {
        self.flags
    }

    /// Display text the server asked clients to show instead of the content.
    pub fn override_display(&self) -> Option<&str> {
        self.override_display.as_deref()
    }

    pub fn is_successful(&self) -> bool {
        self.flags.contains(RemoteAdminFlags::SUCCESSFUL)
    }

    pub fn log_in_console(&self) -> bool {
        self.flags.contains(RemoteAdminFlags::LOG_IN_CONSOLE)
    }

    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE
            + self.content.len()
            + self.override_display.as_ref().map_or(0, String::len)
    }

    /// Fails only when the content is too long for the `i32` length field.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let content_len = encoded_content_len(self.content.len())?;
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.flags.bits());
        out.extend_from_slice(&content_len.to_be_bytes());
        out.extend_from_slice(self.content.as_bytes());
        if let Some(display) = &self.override_display {
            out.extend_from_slice(display.as_bytes());
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < Self::HEADER_SIZE {
            return Err(CodecError::Truncated {
                needed: Self::HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let flags = RemoteAdminFlags::from_bits(bytes[0]);
        let declared = i32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let body = &bytes[Self::HEADER_SIZE..];
        let content_len = usize::try_from(declared)
            .ok()
            .filter(|len| *len <= body.len())
            .ok_or(CodecError::ContentLength {
                declared,
                available: body.len(),
            })?;

        let (content, rest) = body.split_at(content_len);
        let content = std::str::from_utf8(content)?.to_owned();
        let override_display = if rest.is_empty() {
            None
        } else {
            Some(std::str::from_utf8(rest)?.to_owned())
        };

        Ok(Self {
            content,
            flags,
            override_display,
        })
    }
}

fn encoded_content_len(len: usize) -> Result<i32, CodecError> {
    i32::try_from(len).map_err(|_| CodecError::ContentTooLong { len })
}
