//! In-memory resource store.
//!
//! Objects live in a `BTreeMap` behind a `RwLock`. Nothing is persisted;
//! use this for unit tests, integration tests, and throwaway operator runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::lifecycle::{self, Outcome};
use crate::{ObjectKey, Resource, ResourceStore, StoreError};

/// An in-memory store for one resource kind.
///
/// Cloning is cheap and clones share state.
///
/// # Examples
///
/// ```
/// # use credwarden_storage::{MemoryStore, ObjectMeta, ResourceStore, Secret};
/// # #[tokio::main]
/// # async fn main() {
/// let store = MemoryStore::<Secret>::new();
/// let secret = Secret { metadata: ObjectMeta::new("default", "db"), ..Secret::default() };
/// store.create(secret).await.unwrap();
/// assert!(store.get("default", "db").await.unwrap().is_some());
/// # }
/// ```
pub struct MemoryStore<R> {
    objects: Arc<RwLock<BTreeMap<ObjectKey, R>>>,
}

impl<R> MemoryStore<R> {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl<R> Clone for MemoryStore<R> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
        }
    }
}

impl<R> Default for MemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> std::fmt::Debug for MemoryStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl<R: Resource> ResourceStore<R> for MemoryStore<R> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<R>, StoreError> {
        let objects = self.objects.read().await;
        Ok(objects.get(&ObjectKey::new(namespace, name)).cloned())
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<R>, StoreError> {
        let objects = self.objects.read().await;
        Ok(objects
            .iter()
            .filter(|(k, _)| namespace.is_none_or(|ns| k.namespace == ns))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn create(&self, object: R) -> Result<R, StoreError> {
        let mut objects = self.objects.write().await;
        let key = object.meta().key();
        let created = lifecycle::prepare_create(object, objects.get(&key))?;
        objects.insert(key, created.clone());
        Ok(created)
    }

    async fn update(&self, object: R) -> Result<R, StoreError> {
        let mut objects = self.objects.write().await;
        let key = object.meta().key();
        match lifecycle::prepare_update(object, objects.get(&key))? {
            Outcome::Store(updated) => {
                objects.insert(key, updated.clone());
                Ok(updated)
            }
            Outcome::Remove(removed) => {
                objects.remove(&key);
                Ok(removed)
            }
        }
    }

    async fn update_status(&self, object: R) -> Result<R, StoreError> {
        let mut objects = self.objects.write().await;
        let key = object.meta().key();
        let updated = lifecycle::prepare_status_update(&object, objects.get(&key))?;
        objects.insert(key, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut objects = self.objects.write().await;
        let key = ObjectKey::new(namespace, name);
        let Some(stored) = objects.get(&key) else {
            return Ok(());
        };
        match lifecycle::prepare_delete(stored) {
            Some(marked) => {
                objects.insert(key, marked);
            }
            None => {
                objects.remove(&key);
            }
        }
        Ok(())
    }
}
