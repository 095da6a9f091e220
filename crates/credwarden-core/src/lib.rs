//! Core library for credwarden.
//!
//! Provisions credential-issuing mounts and roles in a Vault-compatible
//! secrets backend, gates credential issuance behind an approval decision
//! recorded on access requests, and tracks the resulting leases. Resources
//! are read and written through the `credwarden-storage` store traits; this
//! crate knows nothing about how the operator schedules reconciliation.

pub mod approval;
pub mod auth;
pub mod client;
pub mod credential;
pub mod engine;
pub mod engine_config;
pub mod error;
pub mod lease;
pub mod naming;
pub mod policy;
pub mod resources;
pub mod retry;
pub mod role;
pub mod store;
pub mod transform;

pub use approval::{ApprovalFlow, Outcome};
pub use auth::ClientFactory;
pub use client::{BackendClient, ClientConfig, TlsConfig};
pub use credential::CredentialIssuer;
pub use engine::EngineManager;
pub use error::{
    BackendError, Cancelled, CredentialError, EngineError, PolicyError, ReconcileError, RoleError, Terminal,
};
pub use lease::LeaseManager;
pub use policy::PolicyManager;
pub use retry::{CancelToken, RetryPolicy};
pub use role::RoleProvisioner;
pub use store::{StatusWriter, Stores};
