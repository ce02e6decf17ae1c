//! Hybrid encryption engine.
//!
//! Encrypt:
//! 1. Generate a random 256-bit data key
//! 2. AEAD-encrypt the plaintext under it (envelope header bound as AAD)
//! 3. Wrap the data key for the recipient through the KEM provider
//! 4. Drop the data key (zeroized)
//!
//! Decrypt is the inverse. Every failure after input parsing collapses to
//! [`EngineError::Authentication`] so callers cannot learn which layer
//! rejected the envelope.

use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::crypto::aead::SymmetricCipher;
use crate::crypto::kem::{KemProvider, PrivateKey, PublicKey};
use crate::crypto::sensitive::SymmetricKey;
use crate::envelope::{HybridEnvelope, ENVELOPE_VERSION, MAX_KEY_ID_LEN};
use crate::error::{EngineError, Result};

pub struct HybridEngine {
    kem: Box<dyn KemProvider>,
    cipher: SymmetricCipher,
}

impl HybridEngine {
    pub fn new(kem: Box<dyn KemProvider>, cipher: SymmetricCipher) -> Self {
        Self { kem, cipher }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.kem.algorithm.provider(),
            SymmetricCipher::new(config.symmetric.aead),
        )
    }

    pub fn kem(&self) -> &dyn KemProvider {
        self.kem.as_ref()
    }

    pub fn cipher(&self) -> SymmetricCipher {
        self.cipher
    }

    /// Encrypt `plaintext` for the holder of `recipient_public_key`.
    /// `key_id` is an optional reference the recipient uses to find the
    /// matching private key; it is authenticated but not secret.
    pub fn hybrid_encrypt(
        &self,
        plaintext: &[u8],
        recipient_public_key: &PublicKey,
        key_id: Option<&str>,
    ) -> Result<HybridEnvelope> {
        self.seal(plaintext, recipient_public_key, key_id).map_err(|e| {
            warn!(
                op = "hybrid_encrypt",
                key_id = key_id.unwrap_or("-"),
                error_kind = e.kind(),
                "Encryption failed"
            );
            e
        })
    }

    fn seal(
        &self,
        plaintext: &[u8],
        recipient_public_key: &PublicKey,
        key_id: Option<&str>,
    ) -> Result<HybridEnvelope> {
        if let Some(id) = key_id {
            if id.is_empty() || id.len() > MAX_KEY_ID_LEN {
                return Err(EngineError::Validation(format!(
                    "key_id must be 1..={MAX_KEY_ID_LEN} bytes"
                )));
            }
        }

        let kem = self.kem.algorithm();
        let aead = self.cipher.algorithm();
        let aad = HybridEnvelope::associated_data(ENVELOPE_VERSION, kem, aead, key_id);

        let data_key = SymmetricKey::generate();
        let payload = self.cipher.encrypt_with_aad(plaintext, &aad, &data_key)?;
        let encapsulated_key = self.kem.encapsulate(&data_key, recipient_public_key)?;
        drop(data_key);

        debug!(
            op = "hybrid_encrypt",
            kem = %kem,
            aead = %aead,
            key_id = key_id.unwrap_or("-"),
            plaintext_len = plaintext.len(),
            "Payload encrypted"
        );

        Ok(HybridEnvelope {
            version: ENVELOPE_VERSION,
            kem,
            aead,
            key_id: key_id.map(str::to_string),
            ciphertext: payload.ciphertext,
            nonce: payload.nonce,
            tag: payload.tag,
            encapsulated_key,
        })
    }

    /// Decrypt an envelope with the recipient's private key.
    pub fn hybrid_decrypt(
        &self,
        envelope: &HybridEnvelope,
        recipient_private_key: &PrivateKey,
    ) -> Result<Vec<u8>> {
        let result = self
            .check_algorithms(envelope)
            .and_then(|()| self.open(envelope, recipient_private_key));
        if let Err(e) = &result {
            warn!(
                op = "hybrid_decrypt",
                key_id = envelope.key_id.as_deref().unwrap_or("-"),
                error_kind = e.kind(),
                "Decryption failed"
            );
        }
        result
    }

    fn check_algorithms(&self, envelope: &HybridEnvelope) -> Result<()> {
        if envelope.kem != self.kem.algorithm() || envelope.aead != self.cipher.algorithm() {
            return Err(EngineError::Validation(format!(
                "envelope uses {}/{}, engine is configured for {}/{}",
                envelope.kem,
                envelope.aead,
                self.kem.algorithm(),
                self.cipher.algorithm()
            )));
        }
        Ok(())
    }

    fn open(&self, envelope: &HybridEnvelope, private_key: &PrivateKey) -> Result<Vec<u8>> {
        let data_key = self
            .kem
            .decapsulate(&envelope.encapsulated_key, private_key)
            .map_err(opaque)?;
        self.cipher
            .decrypt_with_aad(&envelope.payload(), &envelope.aad(), &data_key)
            .map_err(opaque)
    }

    /// Establish a fresh shared key with the holder of `public_key`.
    /// Returns the key and the encapsulation to send them.
    pub fn establish_key(&self, public_key: &PublicKey) -> Result<(SymmetricKey, Vec<u8>)> {
        let key = SymmetricKey::generate();
        let encapsulated = self.kem.encapsulate(&key, public_key).map_err(|e| {
            warn!(op = "establish_key", error_kind = e.kind(), "Key establishment failed");
            e
        })?;
        debug!(op = "establish_key", kem = %self.kem.algorithm(), "Shared key established");
        Ok((key, encapsulated))
    }

    /// Counterpart of [`Self::establish_key`].
    pub fn accept_key(&self, encapsulated_key: &[u8], private_key: &PrivateKey) -> Result<SymmetricKey> {
        self.kem.decapsulate(encapsulated_key, private_key).map_err(|e| {
            warn!(op = "accept_key", error_kind = e.kind(), "Key establishment failed");
            e
        })
    }
}

/// Both sub-steps report the same error so the failing layer stays hidden.
fn opaque(_: EngineError) -> EngineError {
    EngineError::Authentication
}
