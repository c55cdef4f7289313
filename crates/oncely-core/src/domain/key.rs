//! IdempotencyKey - caller-supplied identity of "one logical request".

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Longest key accepted (matches the width of the key column in the
/// relational layout).
pub const MAX_KEY_LEN: usize = 100;

/// Request-format errors for idempotency keys.
///
/// These are raised before a request ever reaches the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("idempotency key cannot be empty")]
    Empty,

    #[error("idempotency key is {len} characters long (max {max})")]
    TooLong { len: usize, max: usize },

    #[error("idempotency key contains control characters")]
    ControlCharacter,
}

/// Opaque, validated idempotency key.
///
/// The key is stored exactly as supplied; validation only rejects values that
/// cannot identify a request (blank, oversized, or containing control chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn parse(raw: impl Into<String>) -> Result<Self, KeyError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(KeyError::Empty);
        }
        let len = raw.chars().count();
        if len > MAX_KEY_LEN {
            return Err(KeyError::TooLong {
                len,
                max: MAX_KEY_LEN,
            });
        }
        if raw.chars().any(char::is_control) {
            return Err(KeyError::ControlCharacter);
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

impl FromStr for IdempotencyKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
