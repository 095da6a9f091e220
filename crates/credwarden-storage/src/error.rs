//! Resource store error types.
//!
//! Every variant names the resource kind and key involved so a failed
//! reconciliation can be diagnosed from the log line alone.

/// Errors that can occur during resource store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The object does not exist.
    #[error("{kind} '{key}' not found")]
    NotFound { kind: &'static str, key: String },

    /// An object with the same namespace and name already exists.
    #[error("{kind} '{key}' already exists")]
    AlreadyExists { kind: &'static str, key: String },

    /// The caller's copy is stale: another writer updated the object first.
    #[error("conflict updating {kind} '{key}': expected version {expected}, found {actual}")]
    Conflict {
        kind: &'static str,
        key: String,
        expected: u64,
        actual: u64,
    },

    /// An object could not be encoded or decoded.
    #[error("failed to serialize {kind} '{key}': {reason}")]
    Serialization {
        kind: &'static str,
        key: String,
        reason: String,
    },

    /// A file-backed store could not read or write its files.
    #[error("store i/o failure at '{path}': {reason}")]
    Io { path: String, reason: String },
}

impl StoreError {
    /// Whether the error is an optimistic-concurrency conflict that a
    /// fresh read-modify-write may resolve.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether the error reports a missing object.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
