//! Error types for the credwarden core.
//!
//! Each subsystem has its own error enum. All variants carry enough context
//! to diagnose the problem from a status condition or log line. Errors are
//! classified along three axes used by the reconcilers:
//!
//! - transient (transport failure, 429/5xx, store conflict): retry later
//! - terminal (invalid spec, rejected configuration): surface, never retry
//! - absent (404 on delete/revoke): callers treat as success

use credwarden_storage::StoreError;

/// Marker returned by the retry combinator when the shutdown signal fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled by shutdown")]
pub struct Cancelled;

/// Errors from talking to the secrets backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend could not be reached (DNS, connect, TLS, reset).
    #[error("secrets backend unreachable at {url}: {reason}")]
    Unreachable { url: String, reason: String },

    /// The request did not complete within the client timeout.
    #[error("request to secrets backend timed out: {method} {path}")]
    Timeout { method: String, path: String },

    /// The backend answered with a non-success status.
    #[error("secrets backend rejected {method} {path} ({status}): {message}")]
    Rejected {
        method: String,
        path: String,
        status: u16,
        message: String,
    },

    /// The addressed path does not exist on the backend.
    #[error("secrets backend path '{path}' not found")]
    NotFound { path: String },

    /// The backend answered with a body that could not be decoded.
    #[error("invalid response from secrets backend for '{path}': {reason}")]
    InvalidResponse { path: String, reason: String },

    /// The client could not be constructed from its connection reference.
    #[error("secrets backend client configuration error: {reason}")]
    Config { reason: String },

    /// Authentication against an auth method failed.
    #[error("login via auth method at '{path}' failed: {reason}")]
    Login { path: String, reason: String },

    /// Reading the connection reference or its secret failed.
    #[error("resource store error: {0}")]
    Store(#[from] StoreError),
}

impl BackendError {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable { .. } | Self::Timeout { .. } => true,
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
            Self::Store(e) => e.is_conflict(),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// HTTP status returned by the backend, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            Self::NotFound { .. } => Some(404),
            _ => None,
        }
    }
}

/// Errors from the engine manager.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The secret engine resource is incomplete or contradictory.
    #[error("invalid secret engine {engine}: {reason}")]
    InvalidSpec { engine: String, reason: String },

    /// The backend refused the engine's connection configuration.
    #[error("secret engine config at '{path}' rejected: {message}")]
    ConfigRejected { path: String, message: String },

    /// A referenced object (credential secret, connection binding) is missing.
    #[error("{kind} '{key}' referenced by secret engine not found")]
    MissingReference { kind: &'static str, key: String },

    #[error("secrets backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("resource store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Errors from role provisioning.
#[derive(Debug, thiserror::Error)]
pub enum RoleError {
    /// The role spec failed validation; no backend call was made.
    #[error("invalid role {role}: {reason}")]
    InvalidSpec { role: String, reason: String },

    /// The backend refused the database connection configuration.
    #[error("connection config at '{path}' rejected: {message}")]
    ConfigRejected { path: String, message: String },

    /// A referenced connection binding or secret is missing.
    #[error("{kind} '{key}' referenced by role not found")]
    MissingReference { kind: &'static str, key: String },

    #[error("secrets backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("resource store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from credential issuance and lease management.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// The backend did not issue a credential.
    #[error("credential issuance from '{path}' failed: {message}")]
    IssuanceFailed { path: String, message: String },

    /// The role an access request points at does not exist.
    #[error("role '{key}' referenced by access request not found")]
    RoleNotFound { key: String },

    /// The request parameters do not fit the role's backend kind.
    #[error("invalid access request: {reason}")]
    InvalidRequest { reason: String },

    /// Revoking a lease failed for a reason other than absence.
    #[error("failed to revoke lease {lease_id}: {source}")]
    Revoke {
        lease_id: String,
        #[source]
        source: BackendError,
    },

    #[error("secrets backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("resource store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Errors from policy and policy-binding management.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The policy or binding resource is incomplete.
    #[error("invalid policy resource {name}: {reason}")]
    InvalidSpec { name: String, reason: String },

    /// A `VaultPolicy` named by a binding does not exist yet.
    #[error("{kind} '{key}' referenced by policy binding not found")]
    MissingReference { kind: &'static str, key: String },

    #[error("secrets backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("resource store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Any failure of one reconciliation pass.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Role(#[from] RoleError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("secrets backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("resource store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl ReconcileError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled(_)
                | Self::Engine(EngineError::Cancelled(_))
                | Self::Credential(CredentialError::Cancelled(_))
                | Self::Policy(PolicyError::Cancelled(_))
        )
    }
}

/// Whether an error should stop retries for the current generation.
pub trait Terminal {
    /// `true` for spec errors that re-running cannot fix.
    fn is_terminal(&self) -> bool;
}

impl Terminal for EngineError {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::InvalidSpec { .. } | Self::ConfigRejected { .. })
    }
}

impl Terminal for RoleError {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::InvalidSpec { .. } | Self::ConfigRejected { .. })
    }
}

impl Terminal for CredentialError {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::InvalidRequest { .. })
    }
}

impl Terminal for PolicyError {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::InvalidSpec { .. })
    }
}

impl Terminal for ReconcileError {
    fn is_terminal(&self) -> bool {
        match self {
            Self::Engine(e) => e.is_terminal(),
            Self::Role(e) => e.is_terminal(),
            Self::Credential(e) => e.is_terminal(),
            Self::Policy(e) => e.is_terminal(),
            Self::Backend(_) | Self::Store(_) | Self::Cancelled(_) => false,
        }
    }
}
