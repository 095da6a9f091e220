//! Resource store wiring and conflict-retrying write helpers.
//!
//! [`Stores`] bundles one type-erased store per kind. [`patch`],
//! [`create_or_patch`] and [`StatusWriter`] run a read-modify-write loop that
//! re-reads the object and re-applies the mutation whenever the store
//! reports a `resource_version` conflict.

use std::path::Path;
use std::sync::Arc;

use credwarden_storage::{
    FileStore, MemoryStore, RbacRole, Resource, ResourceStore, RoleBinding, Secret, StoreError,
};
use tracing::debug;

use crate::resources::{
    AccessRequest, AppBinding, BackendRole, SecretEngine, VaultPolicy, VaultPolicyBinding,
};
use crate::retry::{self, RetryPolicy};

/// A shared, type-erased store for one kind.
pub type DynStore<R> = Arc<dyn ResourceStore<R>>;

/// One store per resource kind the operator reads or writes.
#[derive(Clone)]
pub struct Stores {
    pub app_bindings: DynStore<AppBinding>,
    pub secrets: DynStore<Secret>,
    pub rbac_roles: DynStore<RbacRole>,
    pub role_bindings: DynStore<RoleBinding>,
    pub secret_engines: DynStore<SecretEngine>,
    pub backend_roles: DynStore<BackendRole>,
    pub access_requests: DynStore<AccessRequest>,
    pub policies: DynStore<VaultPolicy>,
    pub policy_bindings: DynStore<VaultPolicyBinding>,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

impl Stores {
    /// Fresh in-memory stores.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            app_bindings: Arc::new(MemoryStore::new()),
            secrets: Arc::new(MemoryStore::new()),
            rbac_roles: Arc::new(MemoryStore::new()),
            role_bindings: Arc::new(MemoryStore::new()),
            secret_engines: Arc::new(MemoryStore::new()),
            backend_roles: Arc::new(MemoryStore::new()),
            access_requests: Arc::new(MemoryStore::new()),
            policies: Arc::new(MemoryStore::new()),
            policy_bindings: Arc::new(MemoryStore::new()),
        }
    }

    /// File-backed stores sharing one root directory.
    #[must_use]
    pub fn on_disk(root: &Path) -> Self {
        Self {
            app_bindings: Arc::new(FileStore::open(root)),
            secrets: Arc::new(FileStore::open(root)),
            rbac_roles: Arc::new(FileStore::open(root)),
            role_bindings: Arc::new(FileStore::open(root)),
            secret_engines: Arc::new(FileStore::open(root)),
            backend_roles: Arc::new(FileStore::open(root)),
            access_requests: Arc::new(FileStore::open(root)),
            policies: Arc::new(FileStore::open(root)),
            policy_bindings: Arc::new(FileStore::open(root)),
        }
    }
}

/// Apply `mutate` to the current copy of an object and write it back.
/// `mutate` returns `false` to skip the write.
///
/// # Errors
///
/// - [`StoreError::NotFound`] if the object does not exist.
/// - [`StoreError::Conflict`] once the retry budget is exhausted.
pub async fn patch<R, F>(
    store: &dyn ResourceStore<R>,
    namespace: &str,
    name: &str,
    mutate: F,
) -> Result<R, StoreError>
where
    R: Resource,
    F: Fn(&mut R) -> bool,
{
    let mutate = &mutate;
    retry::retry(&RetryPolicy::CONFLICT, StoreError::is_conflict, || async move {
        let mut current = store
            .get(namespace, name)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind: R::KIND,
                key: format!("{namespace}/{name}"),
            })?;
        if !mutate(&mut current) {
            return Ok(current);
        }
        store.update(current).await
    })
    .await
}

/// Create `object` with `mutate` applied, or patch the existing one.
///
/// # Errors
///
/// Returns [`StoreError::Conflict`] once the retry budget is exhausted, or
/// any backend error.
pub async fn create_or_patch<R, F>(
    store: &dyn ResourceStore<R>,
    object: R,
    mutate: F,
) -> Result<R, StoreError>
where
    R: Resource,
    F: Fn(&mut R) -> bool,
{
    let mutate = &mutate;
    let object = &object;
    let retryable = |e: &StoreError| e.is_conflict() || matches!(e, StoreError::AlreadyExists { .. });
    retry::retry(&RetryPolicy::CONFLICT, retryable, || async move {
        let meta = object.meta();
        match store.get(&meta.namespace, &meta.name).await? {
            Some(mut current) => {
                if !mutate(&mut current) {
                    return Ok(current);
                }
                store.update(current).await
            }
            None => {
                let mut fresh = object.clone();
                mutate(&mut fresh);
                debug!(kind = R::KIND, key = %fresh.meta().key(), "creating object");
                store.create(fresh).await
            }
        }
    })
    .await
}

/// Delete an object, tolerating its absence.
///
/// # Errors
///
/// Returns backend failures only.
pub async fn delete_if_exists<R: Resource>(
    store: &dyn ResourceStore<R>,
    namespace: &str,
    name: &str,
) -> Result<(), StoreError> {
    match store.delete(namespace, name).await {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Writes status sections, through the status subresource or, when that is
/// disabled, as a full-object update.
#[derive(Debug, Clone, Copy)]
pub struct StatusWriter {
    enable_status_subresource: bool,
}

impl StatusWriter {
    #[must_use]
    pub const fn new(enable_status_subresource: bool) -> Self {
        Self {
            enable_status_subresource,
        }
    }

    #[must_use]
    pub const fn uses_subresource(&self) -> bool {
        self.enable_status_subresource
    }

    /// Re-read the object, apply `mutate` to it and persist its status.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the object is gone.
    /// - [`StoreError::Conflict`] once the retry budget is exhausted.
    pub async fn update<R, F>(
        &self,
        store: &dyn ResourceStore<R>,
        namespace: &str,
        name: &str,
        mutate: F,
    ) -> Result<R, StoreError>
    where
        R: Resource,
        F: Fn(&mut R),
    {
        let mutate = &mutate;
        let subresource = self.enable_status_subresource;
        retry::retry(&RetryPolicy::CONFLICT, StoreError::is_conflict, || async move {
            let mut current = store
                .get(namespace, name)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    kind: R::KIND,
                    key: format!("{namespace}/{name}"),
                })?;
            mutate(&mut current);
            if subresource {
                store.update_status(current).await
            } else {
                store.update(current).await
            }
        })
        .await
    }
}

impl Default for StatusWriter {
    fn default() -> Self {
        Self::new(true)
    }
}
