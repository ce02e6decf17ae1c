/// AEAD encryption for payloads and key wrapping.
///
/// Every call to [`SymmetricCipher::encrypt`] draws a fresh random nonce from
/// the OS RNG; callers cannot supply one. AES-256-GCM uses a 96-bit nonce,
/// XChaCha20-Poly1305 a 192-bit one. The tag is kept detached from the
/// ciphertext so envelopes carry it as its own field.
use std::fmt;
use std::str::FromStr;

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{self, AeadInPlace, KeyInit};
use chacha20poly1305::XChaCha20Poly1305;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto::sensitive::SymmetricKey;
use crate::error::{EngineError, Result};

pub const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AeadAlgorithm {
    #[default]
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "xchacha20-poly1305")]
    XChaCha20Poly1305,
}

impl AeadAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Aes256Gcm => "aes-256-gcm",
            Self::XChaCha20Poly1305 => "xchacha20-poly1305",
        }
    }

    pub fn nonce_len(&self) -> usize {
        match self {
            Self::Aes256Gcm => 12,
            Self::XChaCha20Poly1305 => 24,
        }
    }

    /// Wire identifier used in binary framings.
    pub fn id(&self) -> u8 {
        match self {
            Self::Aes256Gcm => 0x01,
            Self::XChaCha20Poly1305 => 0x02,
        }
    }

    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0x01 => Ok(Self::Aes256Gcm),
            0x02 => Ok(Self::XChaCha20Poly1305),
            other => Err(EngineError::Serialization(format!(
                "Unknown AEAD identifier: {other:#04x}"
            ))),
        }
    }

    fn generate_nonce(&self) -> Vec<u8> {
        let mut nonce = vec![0u8; self.nonce_len()];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        nonce
    }
}

impl fmt::Display for AeadAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AeadAlgorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "aes-256-gcm" => Ok(Self::Aes256Gcm),
            "xchacha20-poly1305" => Ok(Self::XChaCha20Poly1305),
            other => Err(EngineError::Validation(format!(
                "Unknown AEAD algorithm: {other}"
            ))),
        }
    }
}

/// Output of a symmetric encryption. Useless without all three fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SymmetricCipher {
    algorithm: AeadAlgorithm,
}

impl SymmetricCipher {
    pub fn new(algorithm: AeadAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> AeadAlgorithm {
        self.algorithm
    }

    pub fn encrypt(&self, plaintext: &[u8], key: &SymmetricKey) -> Result<EncryptedPayload> {
        self.encrypt_with_aad(plaintext, &[], key)
    }

    /// Encrypt under a fresh nonce. `aad` is authenticated but not encrypted.
    pub fn encrypt_with_aad(
        &self,
        plaintext: &[u8],
        aad: &[u8],
        key: &SymmetricKey,
    ) -> Result<EncryptedPayload> {
        let nonce = self.algorithm.generate_nonce();
        let (ciphertext, tag) = self.seal_with_nonce(key, &nonce, plaintext, aad)?;
        Ok(EncryptedPayload {
            ciphertext,
            nonce,
            tag,
        })
    }

    pub fn decrypt(&self, payload: &EncryptedPayload, key: &SymmetricKey) -> Result<Vec<u8>> {
        self.decrypt_with_aad(payload, &[], key)
    }

    /// Verify the tag and decrypt. On any failure the working buffer is
    /// wiped and [`EngineError::Authentication`] is returned.
    pub fn decrypt_with_aad(
        &self,
        payload: &EncryptedPayload,
        aad: &[u8],
        key: &SymmetricKey,
    ) -> Result<Vec<u8>> {
        if payload.nonce.len() != self.algorithm.nonce_len() {
            return Err(EngineError::Validation(format!(
                "{} nonce must be {} bytes, got {}",
                self.algorithm,
                self.algorithm.nonce_len(),
                payload.nonce.len()
            )));
        }

        let mut buffer = payload.ciphertext.clone();
        let opened = match self.algorithm {
            AeadAlgorithm::Aes256Gcm => open_detached::<Aes256Gcm>(
                key.as_bytes(),
                &payload.nonce,
                aad,
                &mut buffer,
                &payload.tag,
            ),
            AeadAlgorithm::XChaCha20Poly1305 => open_detached::<XChaCha20Poly1305>(
                key.as_bytes(),
                &payload.nonce,
                aad,
                &mut buffer,
                &payload.tag,
            ),
        };

        match opened {
            Ok(()) => Ok(buffer),
            Err(e) => {
                buffer.zeroize();
                Err(e)
            }
        }
    }

    /// Encrypt with a caller-chosen nonce. Only for keys that are used
    /// exactly once, such as KEM wrapping keys.
    pub(crate) fn seal_with_nonce(
        &self,
        key: &SymmetricKey,
        nonce: &[u8],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(Vec<u8>, [u8; TAG_LEN])> {
        if nonce.len() != self.algorithm.nonce_len() {
            return Err(EngineError::Encryption(format!(
                "{} nonce must be {} bytes",
                self.algorithm,
                self.algorithm.nonce_len()
            )));
        }

        let mut buffer = plaintext.to_vec();
        let tag = match self.algorithm {
            AeadAlgorithm::Aes256Gcm => {
                seal_detached::<Aes256Gcm>(key.as_bytes(), nonce, aad, &mut buffer)
            }
            AeadAlgorithm::XChaCha20Poly1305 => {
                seal_detached::<XChaCha20Poly1305>(key.as_bytes(), nonce, aad, &mut buffer)
            }
        };

        match tag {
            Ok(tag) => Ok((buffer, tag)),
            Err(e) => {
                buffer.zeroize();
                Err(e)
            }
        }
    }
}

fn seal_detached<C: AeadInPlace + KeyInit>(
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    buffer: &mut [u8],
) -> Result<[u8; TAG_LEN]> {
    let cipher = C::new_from_slice(key).map_err(|e| EngineError::Encryption(e.to_string()))?;
    let tag = cipher
        .encrypt_in_place_detached(aead::Nonce::<C>::from_slice(nonce), aad, buffer)
        .map_err(|e| EngineError::Encryption(e.to_string()))?;

    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(&tag);
    Ok(out)
}

fn open_detached<C: AeadInPlace + KeyInit>(
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    buffer: &mut [u8],
    tag: &[u8; TAG_LEN],
) -> Result<()> {
    let cipher = C::new_from_slice(key).map_err(|_| EngineError::Authentication)?;
    cipher
        .decrypt_in_place_detached(
            aead::Nonce::<C>::from_slice(nonce),
            aad,
            buffer,
            aead::Tag::<C>::from_slice(tag),
        )
        .map_err(|_| EngineError::Authentication)
}
