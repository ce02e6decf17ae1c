//! Engine configuration.
//!
//! Loaded once by the host and passed into component constructors. Every
//! section falls back to its documented default when omitted.
//!
//! ```toml
//! [symmetric]
//! key_bits = 256
//! aead = "aes-256-gcm"
//!
//! [kem]
//! algorithm = "ml-kem-768"
//!
//! [hash]
//! algorithm = "sha3-512"
//!
//! [kdf]
//! algorithm = "pbkdf2-sha256"
//! iterations = 100000
//!
//! [key_store]
//! root = "data/keys"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::crypto::aead::AeadAlgorithm;
use crate::crypto::hash::HashAlgorithm;
use crate::crypto::kdf::{
    KdfParams, DEFAULT_ARGON2_MEMORY_KIB, DEFAULT_ARGON2_PARALLELISM, DEFAULT_ARGON2_TIME_COST,
    DEFAULT_PBKDF2_ITERATIONS,
};
use crate::crypto::kem::KemAlgorithm;
use crate::error::{EngineError, Result};

const SUPPORTED_KEY_BITS: u32 = 256;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub symmetric: SymmetricConfig,

    #[serde(default)]
    pub kem: KemConfig,

    #[serde(default)]
    pub hash: HashConfig,

    #[serde(default)]
    pub kdf: KdfConfig,

    #[serde(default)]
    pub key_store: KeyStoreConfig,
}

impl EngineConfig {
    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading engine configuration");

        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        let config = Self::from_toml_str(&content)?;

        info!(
            aead = %config.symmetric.aead,
            kem = %config.kem.algorithm,
            hash = %config.hash.algorithm,
            kdf = config.kdf.algorithm.name(),
            "Engine configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.symmetric.key_bits != SUPPORTED_KEY_BITS {
            return Err(EngineError::Config(format!(
                "symmetric.key_bits must be {SUPPORTED_KEY_BITS}, got {}",
                self.symmetric.key_bits
            )));
        }

        self.kdf
            .params()
            .map_err(|e| EngineError::Config(format!("kdf: {e}")))?;

        if self.key_store.root.as_os_str().is_empty() {
            return Err(EngineError::Config("key_store.root must not be empty".into()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SymmetricConfig {
    pub key_bits: u32,
    pub aead: AeadAlgorithm,
}

impl Default for SymmetricConfig {
    fn default() -> Self {
        Self {
            key_bits: SUPPORTED_KEY_BITS,
            aead: AeadAlgorithm::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KemConfig {
    pub algorithm: KemAlgorithm,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashConfig {
    pub algorithm: HashAlgorithm,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KdfAlgorithm {
    #[default]
    #[serde(rename = "pbkdf2-sha256")]
    Pbkdf2Sha256,
    #[serde(rename = "argon2id")]
    Argon2id,
}

impl KdfAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pbkdf2Sha256 => "pbkdf2-sha256",
            Self::Argon2id => "argon2id",
        }
    }
}

/// Argon2 fields are ignored for PBKDF2 and vice versa.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    pub algorithm: KdfAlgorithm,
    pub iterations: u32,
    pub argon2_memory_kib: u32,
    pub argon2_time_cost: u32,
    pub argon2_parallelism: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            algorithm: KdfAlgorithm::default(),
            iterations: DEFAULT_PBKDF2_ITERATIONS,
            argon2_memory_kib: DEFAULT_ARGON2_MEMORY_KIB,
            argon2_time_cost: DEFAULT_ARGON2_TIME_COST,
            argon2_parallelism: DEFAULT_ARGON2_PARALLELISM,
        }
    }
}

impl KdfConfig {
    pub fn params(&self) -> Result<KdfParams> {
        match self.algorithm {
            KdfAlgorithm::Pbkdf2Sha256 => KdfParams::pbkdf2(self.iterations),
            KdfAlgorithm::Argon2id => KdfParams::argon2id(
                self.argon2_memory_kib,
                self.argon2_time_cost,
                self.argon2_parallelism,
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyStoreConfig {
    pub root: PathBuf,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/keys"),
        }
    }
}
