use std::fmt;

use uuid::Uuid;

use crate::error::{ModelError, Result};

/// Identifies a logical operation, e.g. `get-user:42`.
///
/// Two runs sharing a key are considered the same request; the executor
/// keeps at most one of them in flight.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct OperationKey(String);

impl OperationKey {
    /// Validate and wrap a key. Surrounding whitespace is trimmed.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ModelError::EmptyOperationKey);
        }
        if trimmed.len() == raw.len() {
            Ok(Self(raw))
        } else {
            Ok(Self(trimmed.to_string()))
        }
    }

    /// The trimmed key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OperationKey {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for OperationKey {
    type Error = ModelError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<OperationKey> for String {
    fn from(key: OperationKey) -> Self {
        key.0
    }
}

impl AsRef<str> for OperationKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation id for a single executor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RunId(pub Uuid);

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl RunId {
    /// Fresh, time-ordered id.
    pub fn new() -> Self {
        RunId(Uuid::now_v7())
    }

    /// The underlying v7 UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_key_trims_and_rejects_blank() {
        let key = OperationKey::new("  get-user:42 ").expect("valid key");
        assert_eq!(key.as_str(), "get-user:42");
        assert_eq!(
            OperationKey::new("   "),
            Err(ModelError::EmptyOperationKey)
        );
    }

    #[test]
    fn run_ids_are_v7_and_distinct() {
        let first = RunId::new();
        let second = RunId::new();
        assert_ne!(first, second);
        assert_eq!(first.as_uuid().get_version_num(), 7);
    }
}
