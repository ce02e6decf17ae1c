use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, Result};

pub const MAX_KEY_ID_LEN: usize = 128;

/// Validated key identifier.
///
/// Allowed characters are ASCII letters, digits, `_`, `-` and `.`; a leading
/// `.` is rejected. That rules out path separators, `..` and hidden files, so
/// an id always maps to a single file directly under the store root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(String);

impl KeyId {
    pub fn parse(id: &str) -> Result<Self> {
        if id.is_empty() {
            return Err(EngineError::Validation("key_id must not be empty".into()));
        }
        if id.len() > MAX_KEY_ID_LEN {
            return Err(EngineError::Validation(format!(
                "key_id longer than {MAX_KEY_ID_LEN} characters"
            )));
        }
        if id.starts_with('.') {
            return Err(EngineError::Validation(
                "key_id must not start with '.'".into(),
            ));
        }
        if let Some(c) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(EngineError::Validation(format!(
                "key_id contains invalid character {c:?}"
            )));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for KeyId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for KeyId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for KeyId {
    type Error = EngineError;

    fn try_from(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
