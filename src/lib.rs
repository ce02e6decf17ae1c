pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod hybrid;
pub mod keystore;

pub use config::EngineConfig;
pub use crypto::aead::{AeadAlgorithm, EncryptedPayload, SymmetricCipher};
pub use crypto::hash::{hash, hash_file, HashAlgorithm, IntegrityHasher};
pub use crypto::kdf::{KdfParams, KeyDerivation, PassphraseDerivation};
pub use crypto::kem::{KemAlgorithm, KemProvider, KeyPair, PrivateKey, PublicKey};
pub use crypto::sensitive::{SecretBytes, SymmetricKey};
pub use envelope::HybridEnvelope;
pub use error::{EngineError, Result};
pub use hybrid::HybridEngine;
pub use keystore::{KeyId, KeyStore, SealedKey};
