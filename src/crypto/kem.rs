/// Post-quantum key encapsulation behind a swappable provider trait.
///
/// Two providers:
/// - [`MlKem768`]: ML-KEM-768 (CRYSTALS-Kyber) alone
/// - [`MlKem768X25519`]: ML-KEM-768 combined with X25519, so the wrap
///   survives if either primitive is broken
///
/// A KEM yields its own shared secret, so "encapsulating" a caller's
/// symmetric key means wrapping it: the shared secret is expanded with
/// BLAKE3 into a one-time wrapping key and the symmetric key is sealed
/// under it with XChaCha20-Poly1305.
///
/// Encapsulated key layouts:
/// ```text
/// ml-kem-768:        kem_ct(1088) | wrapped_key(48)
/// ml-kem-768-x25519: kem_ct(1088) | eph_x25519_pk(32) | wrapped_key(48)
/// ```
///
/// ML-KEM decapsulation uses implicit rejection: a corrupted ciphertext
/// yields a pseudo-random shared secret, never an early error. The wrap
/// tag then fails to verify and the caller sees
/// [`EngineError::Authentication`].
use std::fmt;
use std::str::FromStr;

use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{
    Ciphertext as _, PublicKey as PqPublicKey, SecretKey as PqSecretKey, SharedSecret as _,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::crypto::aead::{AeadAlgorithm, EncryptedPayload, SymmetricCipher, TAG_LEN};
use crate::crypto::hash;
use crate::crypto::sensitive::{SecretBytes, SymmetricKey, SYMMETRIC_KEY_LEN};
use crate::error::{EngineError, Result};

pub const MLKEM768_PUBLIC_KEY_LEN: usize = 1184;
pub const MLKEM768_SECRET_KEY_LEN: usize = 2400;
pub const MLKEM768_CIPHERTEXT_LEN: usize = 1088;
pub const X25519_KEY_LEN: usize = 32;
pub const WRAPPED_KEY_LEN: usize = SYMMETRIC_KEY_LEN + TAG_LEN;

/// BLAKE3 derive-key contexts.
const WRAP_CONTEXT_MLKEM: &str = "qsafe 2024 ml-kem-768 key wrap v1";
const WRAP_CONTEXT_HYBRID: &str = "qsafe 2024 ml-kem-768+x25519 key wrap v1";

const KEY_WRAP_AAD: &[u8] = b"qsafe-keywrap-v1";

/// Fixed zero nonce for key wrapping (each wrapping key is used once).
const KEY_WRAP_NONCE: [u8; 24] = [0u8; 24];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KemAlgorithm {
    #[default]
    #[serde(rename = "ml-kem-768")]
    MlKem768,
    #[serde(rename = "ml-kem-768-x25519")]
    MlKem768X25519,
}

impl KemAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MlKem768 => "ml-kem-768",
            Self::MlKem768X25519 => "ml-kem-768-x25519",
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            Self::MlKem768 => 0x01,
            Self::MlKem768X25519 => 0x02,
        }
    }

    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0x01 => Ok(Self::MlKem768),
            0x02 => Ok(Self::MlKem768X25519),
            other => Err(EngineError::Serialization(format!(
                "Unknown KEM identifier: {other:#04x}"
            ))),
        }
    }

    /// Instantiate the provider for this algorithm.
    pub fn provider(&self) -> Box<dyn KemProvider> {
        match self {
            Self::MlKem768 => Box::new(MlKem768),
            Self::MlKem768X25519 => Box::new(MlKem768X25519),
        }
    }
}

impl fmt::Display for KemAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KemAlgorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ml-kem-768" => Ok(Self::MlKem768),
            "ml-kem-768-x25519" => Ok(Self::MlKem768X25519),
            other => Err(EngineError::Validation(format!(
                "Unknown KEM algorithm: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Private half of a KEM key pair. Zeroized on drop, redacted in `Debug`.
#[derive(Debug, Clone)]
pub struct PrivateKey(SecretBytes);

impl PrivateKey {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(SecretBytes::from_slice(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// A freshly generated key pair. The private key is owned exclusively by
/// whoever requested generation.
#[derive(Debug)]
pub struct KeyPair {
    pub public_key: PublicKey,
    private_key: PrivateKey,
}

impl KeyPair {
    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    pub fn into_parts(self) -> (PublicKey, PrivateKey) {
        (self.public_key, self.private_key)
    }
}

/// Capability interface over a concrete KEM.
pub trait KemProvider: Send + Sync {
    fn algorithm(&self) -> KemAlgorithm;

    fn generate_keypair(&self) -> Result<KeyPair>;

    /// Wrap `symmetric_key` so only the holder of the matching private key
    /// can recover it.
    fn encapsulate(&self, symmetric_key: &SymmetricKey, public_key: &PublicKey) -> Result<Vec<u8>>;

    /// Recover the wrapped key. Corrupted or foreign input fails with
    /// [`EngineError::Authentication`].
    fn decapsulate(&self, encapsulated_key: &[u8], private_key: &PrivateKey) -> Result<SymmetricKey>;

    /// Exact length of the encapsulated key this provider emits.
    fn encapsulated_key_len(&self) -> usize;
}

/// ML-KEM-768 alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct MlKem768;

impl KemProvider for MlKem768 {
    fn algorithm(&self) -> KemAlgorithm {
        KemAlgorithm::MlKem768
    }

    fn generate_keypair(&self) -> Result<KeyPair> {
        let (pk, sk) = kyber768::keypair();
        Ok(KeyPair {
            public_key: PublicKey(pk.as_bytes().to_vec()),
            private_key: PrivateKey(SecretBytes::from_slice(sk.as_bytes())),
        })
    }

    fn encapsulate(&self, symmetric_key: &SymmetricKey, public_key: &PublicKey) -> Result<Vec<u8>> {
        let pk = mlkem_public_key(public_key.as_bytes())?;
        let (ss, kem_ct) = kyber768::encapsulate(&pk);

        let wrapping_key = SymmetricKey::new(hash::derive_subkey(WRAP_CONTEXT_MLKEM, ss.as_bytes()));
        let wrapped_key = wrap_key(&wrapping_key, symmetric_key)?;

        let mut out = Vec::with_capacity(self.encapsulated_key_len());
        out.extend_from_slice(kem_ct.as_bytes());
        out.extend_from_slice(&wrapped_key);
        Ok(out)
    }

    fn decapsulate(&self, encapsulated_key: &[u8], private_key: &PrivateKey) -> Result<SymmetricKey> {
        let sk = mlkem_secret_key(private_key.as_bytes())?;
        if encapsulated_key.len() != self.encapsulated_key_len() {
            return Err(EngineError::Authentication);
        }

        let (kem_ct, wrapped_key) = encapsulated_key.split_at(MLKEM768_CIPHERTEXT_LEN);
        let ct = kyber768::Ciphertext::from_bytes(kem_ct).map_err(|_| EngineError::Authentication)?;
        let ss = kyber768::decapsulate(&ct, &sk);

        let wrapping_key = SymmetricKey::new(hash::derive_subkey(WRAP_CONTEXT_MLKEM, ss.as_bytes()));
        unwrap_key(&wrapping_key, wrapped_key)
    }

    fn encapsulated_key_len(&self) -> usize {
        MLKEM768_CIPHERTEXT_LEN + WRAPPED_KEY_LEN
    }
}

/// ML-KEM-768 + X25519. Keys are the concatenation of both halves:
/// public `mlkem_pk | x25519_pk`, private `mlkem_sk | x25519_sk`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MlKem768X25519;

impl KemProvider for MlKem768X25519 {
    fn algorithm(&self) -> KemAlgorithm {
        KemAlgorithm::MlKem768X25519
    }

    fn generate_keypair(&self) -> Result<KeyPair> {
        let (pk, sk) = kyber768::keypair();
        let x_secret = StaticSecret::random_from_rng(OsRng);
        let x_public = X25519PublicKey::from(&x_secret);

        let mut public = Vec::with_capacity(MLKEM768_PUBLIC_KEY_LEN + X25519_KEY_LEN);
        public.extend_from_slice(pk.as_bytes());
        public.extend_from_slice(x_public.as_bytes());

        let mut private = Vec::with_capacity(MLKEM768_SECRET_KEY_LEN + X25519_KEY_LEN);
        private.extend_from_slice(sk.as_bytes());
        let mut x_bytes = x_secret.to_bytes();
        private.extend_from_slice(&x_bytes);
        x_bytes.zeroize();

        Ok(KeyPair {
            public_key: PublicKey(public),
            private_key: PrivateKey(SecretBytes::new(private)),
        })
    }

    fn encapsulate(&self, symmetric_key: &SymmetricKey, public_key: &PublicKey) -> Result<Vec<u8>> {
        let bytes = public_key.as_bytes();
        if bytes.len() != MLKEM768_PUBLIC_KEY_LEN + X25519_KEY_LEN {
            return Err(EngineError::Validation(format!(
                "hybrid public key must be {} bytes, got {}",
                MLKEM768_PUBLIC_KEY_LEN + X25519_KEY_LEN,
                bytes.len()
            )));
        }
        let (kem_pk_bytes, x_pk_bytes) = bytes.split_at(MLKEM768_PUBLIC_KEY_LEN);

        // ML-KEM-768 encapsulation
        let kem_pk = mlkem_public_key(kem_pk_bytes)?;
        let (ss_kem, kem_ct) = kyber768::encapsulate(&kem_pk);

        // X25519 ephemeral DH
        let recipient_pk = X25519PublicKey::from(to_array32(x_pk_bytes));
        let eph_secret = EphemeralSecret::random_from_rng(OsRng);
        let eph_public = X25519PublicKey::from(&eph_secret);
        let ss_x25519 = eph_secret.diffie_hellman(&recipient_pk);
        if !ss_x25519.was_contributory() {
            return Err(EngineError::Validation(
                "X25519 public key is a low-order point".into(),
            ));
        }

        let wrapping_key = combine_shared_secrets(
            ss_kem.as_bytes(),
            ss_x25519.as_bytes(),
            eph_public.as_bytes(),
            recipient_pk.as_bytes(),
        );
        let wrapped_key = wrap_key(&wrapping_key, symmetric_key)?;

        let mut out = Vec::with_capacity(self.encapsulated_key_len());
        out.extend_from_slice(kem_ct.as_bytes());
        out.extend_from_slice(eph_public.as_bytes());
        out.extend_from_slice(&wrapped_key);
        Ok(out)
    }

    fn decapsulate(&self, encapsulated_key: &[u8], private_key: &PrivateKey) -> Result<SymmetricKey> {
        let bytes = private_key.as_bytes();
        if bytes.len() != MLKEM768_SECRET_KEY_LEN + X25519_KEY_LEN {
            return Err(EngineError::Validation(format!(
                "hybrid private key must be {} bytes, got {}",
                MLKEM768_SECRET_KEY_LEN + X25519_KEY_LEN,
                bytes.len()
            )));
        }
        let (kem_sk_bytes, x_sk_bytes) = bytes.split_at(MLKEM768_SECRET_KEY_LEN);
        let sk = mlkem_secret_key(kem_sk_bytes)?;

        if encapsulated_key.len() != self.encapsulated_key_len() {
            return Err(EngineError::Authentication);
        }
        let (kem_ct, rest) = encapsulated_key.split_at(MLKEM768_CIPHERTEXT_LEN);
        let (eph_pk_bytes, wrapped_key) = rest.split_at(X25519_KEY_LEN);

        // ML-KEM-768 decapsulation
        let ct = kyber768::Ciphertext::from_bytes(kem_ct).map_err(|_| EngineError::Authentication)?;
        let ss_kem = kyber768::decapsulate(&ct, &sk);

        // X25519 DH
        let mut x_sk = to_array32(x_sk_bytes);
        let x_secret = StaticSecret::from(x_sk);
        x_sk.zeroize();
        let own_public = X25519PublicKey::from(&x_secret);
        let eph_pk = X25519PublicKey::from(to_array32(eph_pk_bytes));
        let ss_x25519 = x_secret.diffie_hellman(&eph_pk);
        if !ss_x25519.was_contributory() {
            return Err(EngineError::Authentication);
        }

        let wrapping_key = combine_shared_secrets(
            ss_kem.as_bytes(),
            ss_x25519.as_bytes(),
            eph_pk.as_bytes(),
            own_public.as_bytes(),
        );
        unwrap_key(&wrapping_key, wrapped_key)
    }

    fn encapsulated_key_len(&self) -> usize {
        MLKEM768_CIPHERTEXT_LEN + X25519_KEY_LEN + WRAPPED_KEY_LEN
    }
}

fn mlkem_public_key(bytes: &[u8]) -> Result<kyber768::PublicKey> {
    kyber768::PublicKey::from_bytes(bytes).map_err(|e| {
        EngineError::Validation(format!("Invalid ML-KEM-768 public key: {e:?}"))
    })
}

fn mlkem_secret_key(bytes: &[u8]) -> Result<kyber768::SecretKey> {
    kyber768::SecretKey::from_bytes(bytes).map_err(|_| {
        EngineError::Validation(format!(
            "ML-KEM-768 private key must be {MLKEM768_SECRET_KEY_LEN} bytes"
        ))
    })
}

/// Caller guarantees `bytes.len() == 32`.
fn to_array32(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(bytes);
    out
}

/// Combine both shared secrets and the DH transcript into one wrapping key.
fn combine_shared_secrets(
    ss_kem: &[u8],
    ss_x25519: &[u8],
    eph_pk: &[u8],
    recipient_pk: &[u8],
) -> SymmetricKey {
    let mut ikm = Vec::with_capacity(ss_kem.len() + ss_x25519.len() + 64);
    ikm.extend_from_slice(ss_kem);
    ikm.extend_from_slice(ss_x25519);
    ikm.extend_from_slice(eph_pk);
    ikm.extend_from_slice(recipient_pk);

    let key = SymmetricKey::new(hash::derive_subkey(WRAP_CONTEXT_HYBRID, &ikm));
    ikm.zeroize();
    key
}

fn key_wrap_cipher() -> SymmetricCipher {
    SymmetricCipher::new(AeadAlgorithm::XChaCha20Poly1305)
}

fn wrap_key(wrapping_key: &SymmetricKey, key: &SymmetricKey) -> Result<Vec<u8>> {
    let (mut ct, tag) =
        key_wrap_cipher().seal_with_nonce(wrapping_key, &KEY_WRAP_NONCE, key.as_bytes(), KEY_WRAP_AAD)?;
    ct.extend_from_slice(&tag);
    Ok(ct)
}

fn unwrap_key(wrapping_key: &SymmetricKey, wrapped_key: &[u8]) -> Result<SymmetricKey> {
    if wrapped_key.len() != WRAPPED_KEY_LEN {
        return Err(EngineError::Authentication);
    }
    let (ct, tag) = wrapped_key.split_at(SYMMETRIC_KEY_LEN);
    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag);

    let payload = EncryptedPayload {
        ciphertext: ct.to_vec(),
        nonce: KEY_WRAP_NONCE.to_vec(),
        tag: tag_bytes,
    };
    let mut raw = key_wrap_cipher()
        .decrypt_with_aad(&payload, KEY_WRAP_AAD, wrapping_key)
        .map_err(|_| EngineError::Authentication)?;

    let key = SymmetricKey::from_slice(&raw).ok_or(EngineError::Authentication);
    raw.zeroize();
    key
}
