//! Session key derivation and the AEAD envelope around every sealed frame.
//!
//! The key is SHA-256 over the UTF-8 passphrase, one pass, no salt. That is
//! weak against offline guessing, but every deployed server derives the key
//! the same way, so it cannot change without a protocol revision.
use std::fmt;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod envelope;

pub use envelope::Envelope;

/// AES-256 key size.
pub const KEY_SIZE: usize = 32;

/// Random nonce prepended to every sealed payload.
pub const NONCE_SIZE: usize = 32;

/// GCM authentication tag (128 bits) appended after the ciphertext.
pub const TAG_SIZE: usize = 16;

/// Bytes added by sealing: nonce in front, tag behind.
pub const ENVELOPE_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Errors raised by the envelope codec.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("sealed payload of {len} bytes is shorter than nonce and tag ({min} bytes)")]
    Truncated { len: usize, min: usize },
    #[error("authenticated decryption failed")]
    Authentication,
    #[error("encryption failed")]
    Encryption,
}

/// Pre-shared 256-bit key, derived once from the server passphrase.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&digest);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passphrase_key_is_plain_sha256() {
        let key = SessionKey::from_passphrase("abc");
        // FIPS 180-2 test vector for "abc"
        let expected = [
            0xba, 0x78, 0x16, 0xbf, 0x8f, 0x01, 0xcf, 0xea, 0x41, 0x41, 0x40, 0xde, 0x5d, 0xae,
            0x22, 0x23, 0xb0, 0x03, 0x61, 0xa3, 0x96, 0x17, 0x7a, 0x9c, 0xb4, 0x10, 0xff, 0x61,
            0xf2, 0x00, 0x15, 0xad,
        ];
        assert_eq!(key.as_bytes(), &expected);
    }

    #[test]
    fn debug_output_hides_key_material() {
        let key = SessionKey::from_passphrase("hunter2");
        assert_eq!(format!("{:?}", key), "SessionKey(..)");
    }
}
