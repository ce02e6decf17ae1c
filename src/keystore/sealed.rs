//! Passphrase-sealed key material.
//!
//! ```text
//! MAGIC (4) | VERSION (1) | KDF_ID (1) | KDF_A (4) | KDF_B (4) | KDF_C (4) |
//! SALT (16) | AEAD_ID (1) | NONCE (12 or 24) | TAG (16) | CIPHERTEXT
//! ```
//!
//! Integers are big-endian. Everything from MAGIC through AEAD_ID is bound
//! as associated data, so editing the recorded KDF cost or algorithm breaks
//! the tag.

use tracing::warn;

use crate::crypto::aead::{AeadAlgorithm, EncryptedPayload, SymmetricCipher, TAG_LEN};
use crate::crypto::kdf::{self, generate_salt, KdfParams, SALT_LEN};
use crate::crypto::sensitive::SecretBytes;
use crate::error::{EngineError, Result};

pub const SEALED_MAGIC: &[u8; 4] = b"QSKY";
pub const SEALED_VERSION: u8 = 1;

const PREFIX_LEN: usize = 4 + 1 + 1 + 4 * 3 + SALT_LEN + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedKey {
    params: KdfParams,
    salt: [u8; SALT_LEN],
    aead: AeadAlgorithm,
    nonce: Vec<u8>,
    tag: [u8; TAG_LEN],
    ciphertext: Vec<u8>,
}

impl SealedKey {
    /// Encrypt `secret` under a key derived from `passphrase` with a fresh salt.
    pub fn seal(
        secret: &[u8],
        passphrase: &str,
        params: KdfParams,
        aead: AeadAlgorithm,
    ) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(EngineError::Validation("passphrase must not be empty".into()));
        }

        let salt = generate_salt();
        let key = kdf::derive_key(passphrase.as_bytes(), &salt, params)?;
        let aad = associated_data(params, &salt, aead);
        let payload = SymmetricCipher::new(aead).encrypt_with_aad(secret, &aad, &key)?;

        Ok(Self {
            params,
            salt,
            aead,
            nonce: payload.nonce,
            tag: payload.tag,
            ciphertext: payload.ciphertext,
        })
    }

    /// A wrong passphrase and a corrupted blob both yield
    /// [`EngineError::Authentication`].
    pub fn open(&self, passphrase: &str) -> Result<SecretBytes> {
        self.open_inner(passphrase).map_err(|e| {
            warn!(
                op = "open_sealed",
                kdf = self.params.name(),
                aead = %self.aead,
                error_kind = e.kind(),
                "Sealed key could not be opened"
            );
            e
        })
    }

    fn open_inner(&self, passphrase: &str) -> Result<SecretBytes> {
        if passphrase.is_empty() {
            return Err(EngineError::Validation("passphrase must not be empty".into()));
        }

        let key = kdf::derive_key(passphrase.as_bytes(), &self.salt, self.params)?;
        let aad = associated_data(self.params, &self.salt, self.aead);
        let payload = EncryptedPayload {
            ciphertext: self.ciphertext.clone(),
            nonce: self.nonce.clone(),
            tag: self.tag,
        };

        let plaintext = SymmetricCipher::new(self.aead).decrypt_with_aad(&payload, &aad, &key)?;
        Ok(SecretBytes::new(plaintext))
    }

    pub fn kdf_params(&self) -> KdfParams {
        self.params
    }

    pub fn aead(&self) -> AeadAlgorithm {
        self.aead
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(PREFIX_LEN + self.nonce.len() + TAG_LEN + self.ciphertext.len());
        buf.extend_from_slice(&associated_data(self.params, &self.salt, self.aead));
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.tag);
        buf.extend_from_slice(&self.ciphertext);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < PREFIX_LEN {
            return Err(EngineError::Serialization("sealed key too short".into()));
        }
        if &data[..4] != SEALED_MAGIC {
            return Err(EngineError::Serialization("not a sealed key".into()));
        }
        if data[4] != SEALED_VERSION {
            return Err(EngineError::Serialization(format!(
                "unsupported sealed key version: {}",
                data[4]
            )));
        }

        let kdf_id = data[5];
        let a = read_u32(&data[6..10]);
        let b = read_u32(&data[10..14]);
        let c = read_u32(&data[14..18]);
        let params = KdfParams::from_wire(kdf_id, a, b, c)
            .map_err(|e| EngineError::Serialization(format!("sealed key kdf: {e}")))?;

        let mut offset = 18;
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&data[offset..offset + SALT_LEN]);
        offset += SALT_LEN;

        let aead = AeadAlgorithm::from_id(data[offset])
            .map_err(|e| EngineError::Serialization(e.to_string()))?;
        offset += 1;

        let nonce_len = aead.nonce_len();
        if data.len() < offset + nonce_len + TAG_LEN {
            return Err(EngineError::Serialization("sealed key truncated".into()));
        }
        let nonce = data[offset..offset + nonce_len].to_vec();
        offset += nonce_len;

        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&data[offset..offset + TAG_LEN]);
        offset += TAG_LEN;

        Ok(Self {
            params,
            salt,
            aead,
            nonce,
            tag,
            ciphertext: data[offset..].to_vec(),
        })
    }
}

fn associated_data(params: KdfParams, salt: &[u8; SALT_LEN], aead: AeadAlgorithm) -> Vec<u8> {
    let (kdf_id, a, b, c) = params.to_wire();
    let mut buf = Vec::with_capacity(PREFIX_LEN);
    buf.extend_from_slice(SEALED_MAGIC);
    buf.push(SEALED_VERSION);
    buf.push(kdf_id);
    buf.extend_from_slice(&a.to_be_bytes());
    buf.extend_from_slice(&b.to_be_bytes());
    buf.extend_from_slice(&c.to_be_bytes());
    buf.extend_from_slice(salt);
    buf.push(aead.id());
    buf
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(bytes);
    u32::from_be_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::fast_params;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn test_seal_open_roundtrip() {
        for aead in [AeadAlgorithm::Aes256Gcm, AeadAlgorithm::XChaCha20Poly1305] {
            let sealed = SealedKey::seal(SECRET, "correct horse", fast_params(), aead).unwrap();
            let bytes = sealed.to_bytes();
            let parsed = SealedKey::from_bytes(&bytes).unwrap();
            assert_eq!(parsed, sealed);
            assert_eq!(parsed.open("correct horse").unwrap().as_bytes(), SECRET);
        }
    }

    #[test]
    fn test_ciphertext_does_not_contain_secret() {
        let sealed =
            SealedKey::seal(SECRET, "correct horse", fast_params(), AeadAlgorithm::Aes256Gcm)
                .unwrap();
        let bytes = sealed.to_bytes();
        assert!(!bytes.windows(SECRET.len()).any(|w| w == SECRET));
    }

    #[test]
    fn test_wrong_passphrase() {
        let sealed =
            SealedKey::seal(SECRET, "correct horse", fast_params(), AeadAlgorithm::Aes256Gcm)
                .unwrap();
        assert!(matches!(
            sealed.open("battery staple"),
            Err(EngineError::Authentication)
        ));
    }

    #[test]
    fn test_header_is_authenticated() {
        let sealed =
            SealedKey::seal(SECRET, "pw", fast_params(), AeadAlgorithm::XChaCha20Poly1305)
                .unwrap();
        let mut bytes = sealed.to_bytes();

        // Bump the recorded iteration count; still a valid header.
        bytes[9] ^= 0x01;
        let tampered = SealedKey::from_bytes(&bytes).unwrap();
        assert!(matches!(tampered.open("pw"), Err(EngineError::Authentication)));
    }

    #[test]
    fn test_forged_kdf_cost_rejected_before_derivation() {
        let sealed = SealedKey::seal(SECRET, "pw", fast_params(), AeadAlgorithm::Aes256Gcm).unwrap();

        let mut bytes = sealed.to_bytes();
        bytes[6..10].copy_from_slice(&20_000_000u32.to_be_bytes());
        assert!(matches!(
            SealedKey::from_bytes(&bytes),
            Err(EngineError::Serialization(_))
        ));

        let mut bytes = sealed.to_bytes();
        bytes[5] = 0x02;
        bytes[6..10].copy_from_slice(&u32::MAX.to_be_bytes());
        bytes[10..14].copy_from_slice(&1u32.to_be_bytes());
        bytes[14..18].copy_from_slice(&1u32.to_be_bytes());
        assert!(matches!(
            SealedKey::from_bytes(&bytes),
            Err(EngineError::Serialization(_))
        ));
    }

    #[test]
    fn test_salt_is_fresh() {
        let a = SealedKey::seal(SECRET, "pw", fast_params(), AeadAlgorithm::Aes256Gcm).unwrap();
        let b = SealedKey::seal(SECRET, "pw", fast_params(), AeadAlgorithm::Aes256Gcm).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_malformed_input() {
        assert!(matches!(
            SealedKey::from_bytes(b"QSKY"),
            Err(EngineError::Serialization(_))
        ));

        let sealed = SealedKey::seal(SECRET, "pw", fast_params(), AeadAlgorithm::Aes256Gcm).unwrap();
        let mut bytes = sealed.to_bytes();
        bytes[0] = b'X';
        assert!(SealedKey::from_bytes(&bytes).is_err());

        let mut bytes = sealed.to_bytes();
        bytes[4] = 9;
        assert!(SealedKey::from_bytes(&bytes).is_err());

        let bytes = sealed.to_bytes();
        assert!(SealedKey::from_bytes(&bytes[..PREFIX_LEN + 4]).is_err());

        assert!(matches!(
            SealedKey::seal(SECRET, "", fast_params(), AeadAlgorithm::Aes256Gcm),
            Err(EngineError::Validation(_))
        ));
    }
}
