use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    Validation(String),

    /// AEAD tag or KEM unwrap failure. A wrong key and a tampered
    /// ciphertext produce the same value.
    #[error("Decryption failed")]
    Authentication,

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Integrity check failed for key: {0}")]
    IntegrityViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stable identifier used as the `error_kind` field of log events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Authentication => "authentication",
            Self::Encryption(_) => "encryption",
            Self::KeyDerivation(_) => "key_derivation",
            Self::Storage(_) => "storage",
            Self::NotFound(_) => "not_found",
            Self::IntegrityViolation(_) => "integrity_violation",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
        }
    }

    /// Whether the caller may reasonably retry (storage hiccups only).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
