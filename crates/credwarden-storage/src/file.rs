//! JSON-file resource store.
//!
//! Each object is one pretty-printed JSON file at
//! `<root>/<kind>/<namespace>/<name>.json`, so an operator can be pointed at a
//! directory of hand-written manifests. Writes go to a temporary file and are
//! renamed into place. A per-store mutex serializes writers within one
//! process; concurrent processes sharing a root are not supported.

use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::lifecycle::{self, Outcome};
use crate::{Resource, ResourceStore, StoreError};

/// A file-backed store for one resource kind.
pub struct FileStore<R> {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
    _kind: PhantomData<fn() -> R>,
}

impl<R> Clone for FileStore<R> {
    fn clone(&self) -> Self {
        Self {
            dir: self.dir.clone(),
            write_lock: Arc::clone(&self.write_lock),
            _kind: PhantomData,
        }
    }
}

impl<R> std::fmt::Debug for FileStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl<R: Resource> FileStore<R> {
    /// Open a store rooted at `root`. The kind directory is created lazily.
    #[must_use]
    pub fn open(root: impl AsRef<Path>) -> Self {
        Self {
            dir: root.as_ref().join(R::KIND.to_ascii_lowercase()),
            write_lock: Arc::new(Mutex::new(())),
            _kind: PhantomData,
        }
    }

    /// Directory holding this kind's objects.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn object_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.dir.join(namespace).join(format!("{name}.json"))
    }

    async fn read(&self, namespace: &str, name: &str) -> Result<Option<R>, StoreError> {
        let path = self.object_path(namespace, name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, &e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Serialization {
                kind: R::KIND,
                key: format!("{namespace}/{name}"),
                reason: e.to_string(),
            })
    }

    async fn write(&self, object: &R) -> Result<(), StoreError> {
        let meta = object.meta();
        let path = self.object_path(&meta.namespace, &meta.name);
        let bytes = serde_json::to_vec_pretty(object).map_err(|e| StoreError::Serialization {
            kind: R::KIND,
            key: meta.key().to_string(),
            reason: e.to_string(),
        })?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, &e))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error(&tmp, &e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, &e))?;

        debug!(kind = R::KIND, key = %meta.key(), version = meta.resource_version, "object written");
        Ok(())
    }

    async fn remove(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let path = self.object_path(namespace, name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, &e)),
        }
    }

    async fn namespaces(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.dir, &e)),
        };

        let mut namespaces = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&self.dir, &e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| io_error(&entry.path(), &e))?
                .is_dir();
            if is_dir {
                namespaces.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        namespaces.sort();
        Ok(namespaces)
    }

    async fn names_in(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.dir.join(namespace);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir, &e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, &e))? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(name) = file_name.strip_suffix(".json") {
                names.push(name.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait::async_trait]
impl<R: Resource> ResourceStore<R> for FileStore<R> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<R>, StoreError> {
        self.read(namespace, name).await
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<R>, StoreError> {
        let namespaces = match namespace {
            Some(ns) => vec![ns.to_owned()],
            None => self.namespaces().await?,
        };

        let mut objects = Vec::new();
        for ns in &namespaces {
            for name in self.names_in(ns).await? {
                if let Some(object) = self.read(ns, &name).await? {
                    objects.push(object);
                }
            }
        }
        Ok(objects)
    }

    async fn create(&self, object: R) -> Result<R, StoreError> {
        let _guard = self.write_lock.lock().await;
        let meta = object.meta();
        let existing = self.read(&meta.namespace, &meta.name).await?;
        let created = lifecycle::prepare_create(object, existing.as_ref())?;
        self.write(&created).await?;
        Ok(created)
    }

    async fn update(&self, object: R) -> Result<R, StoreError> {
        let _guard = self.write_lock.lock().await;
        let meta = object.meta();
        let stored = self.read(&meta.namespace, &meta.name).await?;
        match lifecycle::prepare_update(object, stored.as_ref())? {
            Outcome::Store(updated) => {
                self.write(&updated).await?;
                Ok(updated)
            }
            Outcome::Remove(removed) => {
                let meta = removed.meta();
                self.remove(&meta.namespace, &meta.name).await?;
                Ok(removed)
            }
        }
    }

    async fn update_status(&self, object: R) -> Result<R, StoreError> {
        let _guard = self.write_lock.lock().await;
        let meta = object.meta();
        let stored = self.read(&meta.namespace, &meta.name).await?;
        let updated = lifecycle::prepare_status_update(&object, stored.as_ref())?;
        self.write(&updated).await?;
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let Some(stored) = self.read(namespace, name).await? else {
            return Ok(());
        };
        match lifecycle::prepare_delete(&stored) {
            Some(marked) => self.write(&marked).await,
            None => self.remove(namespace, name).await,
        }
    }
}

fn io_error(path: &Path, e: &std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{ObjectMeta, Secret};

    fn secret(ns: &str, name: &str) -> Secret {
        let mut s = Secret {
            metadata: ObjectMeta::new(ns, name),
            ..Secret::default()
        };
        s.data.insert("password".to_owned(), b"hunter2".to_vec());
        s
    }

    #[tokio::test]
    async fn create_then_read_back_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::<Secret>::open(dir.path());
        store.create(secret("default", "db")).await.unwrap();

        assert!(dir.path().join("secret/default/db.json").exists());

        let reopened = FileStore::<Secret>::open(dir.path());
        let loaded = reopened.get("default", "db").await.unwrap().unwrap();
        assert_eq!(loaded.get_str("password"), Some("hunter2"));
        assert_eq!(loaded.metadata.resource_version, 1);
    }

    #[tokio::test]
    async fn list_walks_namespaces_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::<Secret>::open(dir.path());
        store.create(secret("b", "two")).await.unwrap();
        store.create(secret("a", "one")).await.unwrap();

        let names: Vec<_> = store
            .list(None)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.metadata.key().to_string())
            .collect();
        assert_eq!(names, vec!["a/one", "b/two"]);
    }

    #[tokio::test]
    async fn list_on_empty_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::<Secret>::open(dir.path());
        assert!(store.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::<Secret>::open(dir.path());
        let created = store.create(secret("default", "db")).await.unwrap();
        store.update(created.clone()).await.unwrap();

        let result = store.update(created).await;
        assert!(matches!(result, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn delete_removes_file_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::<Secret>::open(dir.path());
        store.create(secret("default", "db")).await.unwrap();

        store.delete("default", "db").await.unwrap();
        store.delete("default", "db").await.unwrap();
        assert!(store.get("default", "db").await.unwrap().is_none());
    }
}
