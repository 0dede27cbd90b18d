use aes_gcm::aead::consts::U32;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use rand::rngs::OsRng;
use rand::RngCore;

use super::{CryptoError, SessionKey, ENVELOPE_OVERHEAD, NONCE_SIZE, TAG_SIZE};

/// AES-256-GCM with the protocol's 32-byte nonce and 16-byte tag.
type QueryCipher = AesGcm<Aes256, U32>;

/// Seals and opens frame payloads laid out as `nonce || ciphertext || tag`.
///
/// No associated data is bound; ordering and freshness are carried inside the
/// plaintext (sequence number and timestamp).
#[derive(Clone)]
pub struct Envelope {
    cipher: QueryCipher,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope").finish_non_exhaustive()
    }
}

impl Envelope {
    pub fn new(key: &SessionKey) -> Self {
        Self {
            cipher: QueryCipher::new(GenericArray::from_slice(key.as_bytes())),
        }
    }

    /// Size of the sealed payload for a plaintext of `plaintext_len` bytes.
    pub const fn sealed_len(plaintext_len: usize) -> usize {
        plaintext_len + ENVELOPE_OVERHEAD
    }

    /// Seals `plaintext` under a fresh random nonce, replacing `out`.
    pub fn seal_into(&self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        self.seal_with_nonce(&nonce, plaintext, out)
    }

    pub(crate) fn seal_with_nonce(
        &self,
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), CryptoError> {
        out.clear();
        out.reserve(Self::sealed_len(plaintext.len()));
        out.extend_from_slice(nonce);
        out.extend_from_slice(plaintext);

        let sealed = self.cipher.encrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            b"",
            &mut out[NONCE_SIZE..],
        );
        match sealed {
            Ok(tag) => out.extend_from_slice(&tag),
            Err(_) => {
                out.clear();
                return Err(CryptoError::Encryption);
            }
        }
        Ok(())
    }

    /// Opens a sealed payload into `out`, which is cleared on failure.
    pub fn open_into(&self, sealed: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        out.clear();
        if sealed.len() < ENVELOPE_OVERHEAD {
            return Err(CryptoError::Truncated {
                len: sealed.len(),
                min: ENVELOPE_OVERHEAD,
            });
        }

        let (nonce, rest) = sealed.split_at(NONCE_SIZE);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);
        out.extend_from_slice(ciphertext);

        let result = self.cipher.decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            b"",
            out.as_mut_slice(),
            GenericArray::from_slice(tag),
        );
        if result.is_err() {
            out.clear();
            return Err(CryptoError::Authentication);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(pass: &str) -> Envelope {
        Envelope::new(&SessionKey::from_passphrase(pass))
    }

    #[test]
    fn seal_layout_and_open() {
        let env = envelope("secret");
        let mut sealed = Vec::new();
        env.seal_into(b"list players", &mut sealed).unwrap();
        assert_eq!(sealed.len(), Envelope::sealed_len(12));
        // plaintext must not survive in the clear
        assert!(!sealed.windows(12).any(|w| w == b"list players"));

        let mut plain = Vec::new();
        env.open_into(&sealed, &mut plain).unwrap();
        assert_eq!(plain, b"list players");
    }

    #[test]
    fn nonces_are_fresh_per_seal() {
        let env = envelope("secret");
        let (mut a, mut b) = (Vec::new(), Vec::new());
        env.seal_into(b"same", &mut a).unwrap();
        env.seal_into(b"same", &mut b).unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn every_flipped_bit_fails_authentication() {
        let env = envelope("secret");
        let mut sealed = Vec::new();
        env.seal_into(b"ban 76561198000000000", &mut sealed).unwrap();

        let mut plain = Vec::new();
        for byte in 0..sealed.len() {
            for bit in 0..8 {
                let mut tampered = sealed.clone();
                tampered[byte] ^= 1 << bit;
                let err = env.open_into(&tampered, &mut plain).unwrap_err();
                assert!(matches!(err, CryptoError::Authentication));
                assert!(plain.is_empty());
            }
        }
    }

    #[test]
    fn wrong_passphrase_cannot_open() {
        let mut sealed = Vec::new();
        envelope("right").seal_into(b"hello", &mut sealed).unwrap();
        let mut plain = Vec::new();
        assert!(envelope("wrong").open_into(&sealed, &mut plain).is_err());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let env = envelope("secret");
        let mut plain = Vec::new();
        let err = env
            .open_into(&[0u8; ENVELOPE_OVERHEAD - 1], &mut plain)
            .unwrap_err();
        assert!(matches!(err, CryptoError::Truncated { len, .. } if len == ENVELOPE_OVERHEAD - 1));
    }

    #[test]
    fn empty_plaintext_still_authenticates() {
        let env = envelope("secret");
        let mut sealed = Vec::new();
        env.seal_with_nonce(&[7u8; NONCE_SIZE], b"", &mut sealed).unwrap();
        assert_eq!(sealed.len(), ENVELOPE_OVERHEAD);
        let mut plain = vec![1, 2, 3];
        env.open_into(&sealed, &mut plain).unwrap();
        assert!(plain.is_empty());
    }
}
