//! Resource store abstraction for credwarden.
//!
//! This crate defines the [`ResourceStore`] trait: typed CRUD over
//! declarative objects with optimistic concurrency through
//! [`ObjectMeta::resource_version`]. It knows nothing about secrets engines,
//! roles or leases; `credwarden-core` layers patch and conflict-retry helpers
//! on top of it.
//!
//! Two implementations are provided:
//!
//! - [`FileStore`]: one JSON file per object under a root directory, so the
//!   operator can reconcile a manifest tree
//! - [`MemoryStore`]: in-memory, for tests and ephemeral runs
//!
//! Both implement the same lifecycle rules:
//!
//! - `create` assigns a uid and starts `resource_version` and `generation` at 1.
//! - `update` fails with [`StoreError::Conflict`] when the caller's
//!   `resource_version` is stale (0 means "unconditional").
//! - `delete` of an object with finalizers only stamps `deletion_timestamp`;
//!   the object disappears once an update clears its last finalizer.
//! - `delete` of a missing object is a no-op.

mod error;
mod file;
mod lifecycle;
mod memory;
pub mod meta;
pub mod objects;

pub use error::StoreError;
pub use file::FileStore;
pub use memory::MemoryStore;
pub use meta::{ObjectKey, ObjectMeta, OwnerReference};
pub use objects::{PolicyRule, RbacRole, RoleBinding, RoleRef, Secret, Subject};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A declarative object that can be kept in a [`ResourceStore`].
pub trait Resource: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Kind name, e.g. `SecretEngine`.
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Copy the status section of `other` into `self`. Objects without a
    /// status keep the default no-op.
    fn copy_status_from(&mut self, other: &Self) {
        let _ = other;
    }
}

/// Typed CRUD over one resource kind.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait ResourceStore<R: Resource>: Send + Sync + 'static {
    /// Fetch one object. Returns `Ok(None)` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] or [`StoreError::Serialization`] if the
    /// backend cannot produce the object.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<R>, StoreError>;

    /// List objects, optionally restricted to one namespace, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] or [`StoreError::Serialization`] on backend
    /// failure.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<R>, StoreError>;

    /// Create a new object and return it as stored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if the key is taken.
    async fn create(&self, object: R) -> Result<R, StoreError>;

    /// Replace an object, including its status, and return it as stored.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the object does not exist.
    /// - [`StoreError::Conflict`] if `resource_version` is stale.
    async fn update(&self, object: R) -> Result<R, StoreError>;

    /// Replace only the status section of an object.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the object does not exist.
    /// - [`StoreError::Conflict`] if `resource_version` is stale.
    async fn update_status(&self, object: R) -> Result<R, StoreError>;

    /// Request deletion. Idempotent: deleting a missing object succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the backend fails.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}
