//! AES-256-GCM sealing of direct-message bodies.
//!
//! Wire format: `<iv>:<tag>:<ciphertext>`, each segment lower-case hex. The IV
//! is 16 random bytes drawn per call, the tag is the 16-byte GCM tag.

use std::fmt;
use std::sync::Arc;

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadCore, AeadInPlace, KeyInit, OsRng};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use thiserror::Error;

/// AES-256-GCM with a 128-bit nonce.
type MessageAead = AesGcm<Aes256, U16>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;
const DELIMITER: char = ':';

/// Returned by [`MessageCipher::decrypt_or_placeholder`] for unreadable input.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[message could not be decrypted]";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("message encryption key is not configured")]
    Missing,
    #[error("message encryption key must be {expected} hex characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("message encryption key is not valid hex")]
    InvalidHex,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptError {
    #[error("expected 3 `:`-separated segments, got {0}")]
    SegmentCount(usize),
    #[error("{segment} segment is not lower-case hex")]
    InvalidHex { segment: &'static str },
    #[error("{segment} segment must be {expected} bytes, got {actual}")]
    InvalidLength {
        segment: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("authentication tag did not verify")]
    Authentication,
    #[error("decrypted message is not UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("message could not be encrypted")]
pub struct EncryptError;

/// Process-wide message cipher. Cheap to clone.
#[derive(Clone)]
pub struct MessageCipher {
    cipher: Arc<MessageAead>,
}

impl fmt::Debug for MessageCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCipher").finish_non_exhaustive()
    }
}

impl MessageCipher {
    /// Build the cipher from a 64-character hex key.
    pub fn from_hex(key_hex: &str) -> Result<Self, KeyError> {
        let key_hex = key_hex.trim();
        if key_hex.is_empty() {
            return Err(KeyError::Missing);
        }
        if key_hex.len() != KEY_LEN * 2 {
            return Err(KeyError::InvalidLength {
                expected: KEY_LEN * 2,
                actual: key_hex.len(),
            });
        }
        let bytes = hex::decode(key_hex).map_err(|_| KeyError::InvalidHex)?;
        let cipher = MessageAead::new_from_slice(&bytes).map_err(|_| KeyError::InvalidLength {
            expected: KEY_LEN * 2,
            actual: key_hex.len(),
        })?;
        Ok(Self {
            cipher: Arc::new(cipher),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, EncryptError> {
        let iv = MessageAead::generate_nonce(&mut OsRng);
        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(&iv, b"", &mut buffer)
            .map_err(|_| EncryptError)?;

        Ok(format!(
            "{}{DELIMITER}{}{DELIMITER}{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(buffer)
        ))
    }

    /// Authentic plaintext or an explicit error; never partially decrypted text.
    pub fn decrypt(&self, encoded: &str) -> Result<String, DecryptError> {
        let segments: Vec<&str> = encoded.split(DELIMITER).collect();
        let [iv, tag, ciphertext] = segments.as_slice() else {
            return Err(DecryptError::SegmentCount(segments.len()));
        };

        let iv: [u8; IV_LEN] = decode_fixed(iv, "iv")?;
        let tag: [u8; TAG_LEN] = decode_fixed(tag, "tag")?;
        let mut buffer = decode_segment(ciphertext, "ciphertext")?;

        self.cipher
            .decrypt_in_place_detached(
                &GenericArray::from(iv),
                b"",
                &mut buffer,
                &GenericArray::from(tag),
            )
            .map_err(|_| DecryptError::Authentication)?;

        String::from_utf8(buffer).map_err(|_| DecryptError::InvalidUtf8)
    }

    /// Like [`decrypt`](Self::decrypt), substituting [`UNDECRYPTABLE_PLACEHOLDER`] on failure.
    pub fn decrypt_or_placeholder(&self, encoded: &str) -> String {
        match self.decrypt(encoded) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                tracing::warn!(error = %err, "Message could not be decrypted");
                UNDECRYPTABLE_PLACEHOLDER.to_string()
            }
        }
    }
}

/// Fresh random key, hex-encoded.
pub fn generate_key_hex() -> String {
    hex::encode(MessageAead::generate_key(&mut OsRng))
}

fn decode_segment(segment: &str, name: &'static str) -> Result<Vec<u8>, DecryptError> {
    let lower_hex = segment
        .bytes()
        .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte));
    if !lower_hex {
        return Err(DecryptError::InvalidHex { segment: name });
    }
    hex::decode(segment).map_err(|_| DecryptError::InvalidHex { segment: name })
}

fn decode_fixed<const N: usize>(segment: &str, name: &'static str) -> Result<[u8; N], DecryptError> {
    let bytes = decode_segment(segment, name)?;
    let actual = bytes.len();
    bytes.try_into().map_err(|_| DecryptError::InvalidLength {
        segment: name,
        expected: N,
        actual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn cipher() -> MessageCipher {
        MessageCipher::from_hex(KEY).expect("valid key")
    }

    #[test]
    fn wire_format_shape() {
        let encoded = cipher().encrypt("hello").unwrap();
        let parts: Vec<&str> = encoded.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 32);
        assert_eq!(parts[1].len(), 32);
        assert_eq!(parts[2].len(), "hello".len() * 2);
    }

    #[test]
    fn empty_message_round_trips() {
        let cipher = cipher();
        let encoded = cipher.encrypt("").unwrap();
        assert!(encoded.ends_with(':'));
        assert_eq!(cipher.decrypt(&encoded).unwrap(), "");
    }

    #[test]
    fn key_validation() {
        assert_eq!(MessageCipher::from_hex("").unwrap_err(), KeyError::Missing);
        assert_eq!(
            MessageCipher::from_hex("abcd").unwrap_err(),
            KeyError::InvalidLength {
                expected: 64,
                actual: 4
            }
        );
        let bad_hex = "zz".repeat(32);
        assert_eq!(
            MessageCipher::from_hex(&bad_hex).unwrap_err(),
            KeyError::InvalidHex
        );
    }

    #[test]
    fn generated_keys_are_usable_and_distinct() {
        let first = generate_key_hex();
        let second = generate_key_hex();
        assert_eq!(first.len(), 64);
        assert_ne!(first, second);
        assert!(MessageCipher::from_hex(&first).is_ok());
    }

    #[test]
    fn upper_case_hex_is_rejected() {
        let cipher = cipher();
        let encoded = cipher.encrypt("abc").unwrap();
        assert_eq!(
            cipher.decrypt(&encoded.to_uppercase()),
            Err(DecryptError::InvalidHex { segment: "iv" })
        );
    }

    #[test]
    fn short_iv_is_rejected() {
        let encoded = format!("{}:{}:{}", "ab".repeat(12), "00".repeat(16), "00");
        assert_eq!(
            cipher().decrypt(&encoded),
            Err(DecryptError::InvalidLength {
                segment: "iv",
                expected: 16,
                actual: 12
            })
        );
    }

    #[test]
    fn debug_output_hides_key() {
        let rendered = format!("{:?}", cipher());
        assert!(!rendered.contains("0001"));
    }
}
