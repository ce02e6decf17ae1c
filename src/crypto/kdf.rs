/// Passphrase-based key derivation.
///
/// Default: PBKDF2-HMAC-SHA256, 100 000 iterations, 128-bit salt.
/// Argon2id is available for memory-hard derivation.
/// Produces a 256-bit key. The salt and parameters must be persisted by
/// the caller; both are required to reproduce the key.
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

use crate::crypto::sensitive::{SymmetricKey, SYMMETRIC_KEY_LEN};
use crate::error::{EngineError, Result};

pub const SALT_LEN: usize = 16;
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 100_000;
pub const MIN_PBKDF2_ITERATIONS: u32 = 1_000;
pub const MAX_PBKDF2_ITERATIONS: u32 = 5_000_000;

/// Argon2id ceilings. Parameters read back from stored headers are checked
/// against these before any derivation work starts.
pub const MAX_ARGON2_MEMORY_KIB: u32 = 4 * 1024 * 1024; // 4 GiB
pub const MAX_ARGON2_TIME_COST: u32 = 64;
pub const MAX_ARGON2_PARALLELISM: u32 = 16;

pub(crate) const DEFAULT_ARGON2_MEMORY_KIB: u32 = 64 * 1024; // 64 MiB
pub(crate) const DEFAULT_ARGON2_TIME_COST: u32 = 3;
pub(crate) const DEFAULT_ARGON2_PARALLELISM: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm")]
pub enum KdfParams {
    #[serde(rename = "pbkdf2-sha256")]
    Pbkdf2Sha256 { iterations: u32 },
    #[serde(rename = "argon2id")]
    Argon2id {
        mem_cost_kib: u32,
        time_cost: u32,
        parallelism: u32,
    },
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::Pbkdf2Sha256 {
            iterations: DEFAULT_PBKDF2_ITERATIONS,
        }
    }
}

impl KdfParams {
    pub fn pbkdf2(iterations: u32) -> Result<Self> {
        let params = Self::Pbkdf2Sha256 { iterations };
        params.validate()?;
        Ok(params)
    }

    pub fn argon2id(mem_cost_kib: u32, time_cost: u32, parallelism: u32) -> Result<Self> {
        let params = Self::Argon2id {
            mem_cost_kib,
            time_cost,
            parallelism,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn default_argon2id() -> Self {
        Self::Argon2id {
            mem_cost_kib: DEFAULT_ARGON2_MEMORY_KIB,
            time_cost: DEFAULT_ARGON2_TIME_COST,
            parallelism: DEFAULT_ARGON2_PARALLELISM,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pbkdf2Sha256 { .. } => "pbkdf2-sha256",
            Self::Argon2id { .. } => "argon2id",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Pbkdf2Sha256 { iterations } => {
                if !(MIN_PBKDF2_ITERATIONS..=MAX_PBKDF2_ITERATIONS).contains(&iterations) {
                    return Err(EngineError::Validation(format!(
                        "pbkdf2 iterations must be in {MIN_PBKDF2_ITERATIONS}..={MAX_PBKDF2_ITERATIONS}, got {iterations}"
                    )));
                }
            }
            Self::Argon2id {
                mem_cost_kib,
                time_cost,
                parallelism,
            } => {
                if !(1..=MAX_ARGON2_TIME_COST).contains(&time_cost) {
                    return Err(EngineError::Validation(format!(
                        "argon2 time cost must be in 1..={MAX_ARGON2_TIME_COST}, got {time_cost}"
                    )));
                }
                if !(1..=MAX_ARGON2_PARALLELISM).contains(&parallelism) {
                    return Err(EngineError::Validation(format!(
                        "argon2 parallelism must be in 1..={MAX_ARGON2_PARALLELISM}, got {parallelism}"
                    )));
                }
                if mem_cost_kib > MAX_ARGON2_MEMORY_KIB {
                    return Err(EngineError::Validation(format!(
                        "argon2 memory cost must be <= {MAX_ARGON2_MEMORY_KIB} KiB, got {mem_cost_kib}"
                    )));
                }
                if mem_cost_kib < 8 * parallelism {
                    return Err(EngineError::Validation(
                        "argon2 memory cost must be at least 8 * parallelism".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Wire form: `(id, a, b, c)`. PBKDF2 uses only `a`.
    pub(crate) fn to_wire(self) -> (u8, u32, u32, u32) {
        match self {
            Self::Pbkdf2Sha256 { iterations } => (0x01, iterations, 0, 0),
            Self::Argon2id {
                mem_cost_kib,
                time_cost,
                parallelism,
            } => (0x02, mem_cost_kib, time_cost, parallelism),
        }
    }

    pub(crate) fn from_wire(id: u8, a: u32, b: u32, c: u32) -> Result<Self> {
        let params = match id {
            0x01 => Self::Pbkdf2Sha256 { iterations: a },
            0x02 => Self::Argon2id {
                mem_cost_kib: a,
                time_cost: b,
                parallelism: c,
            },
            other => {
                return Err(EngineError::Serialization(format!(
                    "Unknown KDF identifier: {other:#04x}"
                )))
            }
        };
        params.validate()?;
        Ok(params)
    }
}

/// Generate a random 128-bit salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Result of a passphrase derivation. Persist `salt` and `params` to
/// reproduce `key` later.
#[derive(Debug)]
pub struct PassphraseDerivation {
    pub key: SymmetricKey,
    pub salt: [u8; SALT_LEN],
    pub params: KdfParams,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeyDerivation {
    params: KdfParams,
}

impl KeyDerivation {
    pub fn new(params: KdfParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> KdfParams {
        self.params
    }

    /// Derive a key from `passphrase`. A fresh salt is generated when
    /// `salt` is `None`; a supplied salt must be exactly [`SALT_LEN`] bytes.
    pub fn derive(&self, passphrase: &str, salt: Option<&[u8]>) -> Result<PassphraseDerivation> {
        self.derive_inner(passphrase, salt).map_err(|e| {
            warn!(
                op = "derive",
                algorithm = self.params.name(),
                error_kind = e.kind(),
                "Key derivation failed"
            );
            e
        })
    }

    fn derive_inner(&self, passphrase: &str, salt: Option<&[u8]>) -> Result<PassphraseDerivation> {
        if passphrase.is_empty() {
            return Err(EngineError::Validation("passphrase must not be empty".into()));
        }

        let salt: [u8; SALT_LEN] = match salt {
            Some(s) => s.try_into().map_err(|_| {
                EngineError::Validation(format!(
                    "salt must be {SALT_LEN} bytes, got {}",
                    s.len()
                ))
            })?,
            None => generate_salt(),
        };

        let key = derive_key(passphrase.as_bytes(), &salt, self.params)?;

        Ok(PassphraseDerivation {
            key,
            salt,
            params: self.params,
        })
    }
}

/// Raw derivation, no input checks beyond parameter validation.
pub(crate) fn derive_key(passphrase: &[u8], salt: &[u8], params: KdfParams) -> Result<SymmetricKey> {
    params.validate()?;

    let mut output = [0u8; SYMMETRIC_KEY_LEN];
    match params {
        KdfParams::Pbkdf2Sha256 { iterations } => {
            pbkdf2::pbkdf2_hmac::<Sha256>(passphrase, salt, iterations, &mut output);
        }
        KdfParams::Argon2id {
            mem_cost_kib,
            time_cost,
            parallelism,
        } => {
            let argon_params = Params::new(mem_cost_kib, time_cost, parallelism, Some(SYMMETRIC_KEY_LEN))
                .map_err(|e| EngineError::KeyDerivation(e.to_string()))?;

            Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params)
                .hash_password_into(passphrase, salt, &mut output)
                .map_err(|e| EngineError::KeyDerivation(e.to_string()))?;
        }
    }

    Ok(SymmetricKey::new(output))
}

#[cfg(test)]
pub(crate) fn fast_params() -> KdfParams {
    KdfParams::Pbkdf2Sha256 {
        iterations: MIN_PBKDF2_ITERATIONS,
    }
}
