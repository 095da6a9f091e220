//! Object metadata shared by every stored resource.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Namespace/name pair identifying one object of a kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A weak back-reference from a dependent object to the object that
/// produced it. Used for lookups only, never for authority decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
}

/// Metadata carried by every resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    /// Name of the cluster the object lives in. Empty for the local cluster.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// Optimistic-concurrency token. Bumped by the store on every write.
    #[serde(default)]
    pub resource_version: u64,
    /// Bumped by the store on every spec write, not on status writes.
    #[serde(default)]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set by the store when a delete is requested on an object that still
    /// carries finalizers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Metadata for a new object with the given namespace and name.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    #[must_use]
    pub fn is_being_deleted(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    #[must_use]
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Add a finalizer. Returns `false` if it was already present.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_owned());
        true
    }

    /// Remove every occurrence of a finalizer. Returns `false` if absent.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        self.finalizers.len() != before
    }

    /// Add `owner` unless a reference with the same kind and name exists;
    /// an existing reference is refreshed in place.
    pub fn ensure_owner_reference(&mut self, owner: OwnerReference) {
        match self
            .owner_references
            .iter_mut()
            .find(|r| r.kind == owner.kind && r.name == owner.name)
        {
            Some(existing) => *existing = owner,
            None => self.owner_references.push(owner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalizers_add_and_remove() {
        let mut meta = ObjectMeta::new("default", "x");
        assert!(meta.add_finalizer("a"));
        assert!(!meta.add_finalizer("a"));
        assert!(meta.has_finalizer("a"));
        assert!(meta.remove_finalizer("a"));
        assert!(!meta.remove_finalizer("a"));
        assert!(meta.finalizers.is_empty());
    }

    #[test]
    fn owner_reference_is_not_duplicated() {
        let mut meta = ObjectMeta::new("default", "secret");
        let owner = OwnerReference {
            kind: "AccessRequest".to_owned(),
            name: "req".to_owned(),
            uid: "1".to_owned(),
            controller: true,
        };
        meta.ensure_owner_reference(owner.clone());
        meta.ensure_owner_reference(OwnerReference {
            uid: "2".to_owned(),
            ..owner
        });
        assert_eq!(meta.owner_references.len(), 1);
        assert_eq!(meta.owner_references[0].uid, "2");
    }

    #[test]
    fn key_display() {
        assert_eq!(ObjectKey::new("ns", "n").to_string(), "ns/n");
    }
}
