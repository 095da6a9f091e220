//! Write rules shared by every store backend.

use chrono::Utc;

use crate::{Resource, StoreError};

/// Result of applying a write to the stored copy.
pub(crate) enum Outcome<R> {
    /// Persist this object.
    Store(R),
    /// The object lost its last finalizer while being deleted; drop it.
    Remove(R),
}

pub(crate) fn prepare_create<R: Resource>(
    mut object: R,
    existing: Option<&R>,
) -> Result<R, StoreError> {
    if existing.is_some() {
        return Err(StoreError::AlreadyExists {
            kind: R::KIND,
            key: object.meta().key().to_string(),
        });
    }

    let meta = object.meta_mut();
    if meta.uid.is_empty() {
        meta.uid = uuid::Uuid::new_v4().to_string();
    }
    meta.resource_version = 1;
    meta.generation = 1;
    meta.creation_timestamp = Some(Utc::now());
    meta.deletion_timestamp = None;
    Ok(object)
}

pub(crate) fn prepare_update<R: Resource>(
    mut object: R,
    stored: Option<&R>,
) -> Result<Outcome<R>, StoreError> {
    let stored = require(stored, &object)?;
    check_version(stored, &object)?;

    let bump = spec_differs(&object, stored);
    let previous = stored.meta();
    let meta = object.meta_mut();
    meta.uid.clone_from(&previous.uid);
    meta.creation_timestamp = previous.creation_timestamp;
    meta.deletion_timestamp = previous.deletion_timestamp;
    meta.resource_version = previous.resource_version.saturating_add(1);
    meta.generation = if bump {
        previous.generation.saturating_add(1)
    } else {
        previous.generation
    };

    if meta.deletion_timestamp.is_some() && meta.finalizers.is_empty() {
        return Ok(Outcome::Remove(object));
    }
    Ok(Outcome::Store(object))
}

pub(crate) fn prepare_status_update<R: Resource>(
    object: &R,
    stored: Option<&R>,
) -> Result<R, StoreError> {
    let stored = require(stored, object)?;
    check_version(stored, object)?;

    let mut next = stored.clone();
    next.copy_status_from(object);
    let meta = next.meta_mut();
    meta.resource_version = meta.resource_version.saturating_add(1);
    Ok(next)
}

/// Returns `None` when the object should be dropped immediately, or the
/// object with `deletion_timestamp` stamped when finalizers hold it.
pub(crate) fn prepare_delete<R: Resource>(stored: &R) -> Option<R> {
    if stored.meta().finalizers.is_empty() {
        return None;
    }
    let mut next = stored.clone();
    let meta = next.meta_mut();
    if meta.deletion_timestamp.is_none() {
        meta.deletion_timestamp = Some(Utc::now());
        meta.resource_version = meta.resource_version.saturating_add(1);
    }
    Some(next)
}

/// Whether anything outside metadata and status changed. Only such writes
/// bump `generation`.
fn spec_differs<R: Resource>(incoming: &R, stored: &R) -> bool {
    let mut probe = incoming.clone();
    probe.copy_status_from(stored);
    *probe.meta_mut() = stored.meta().clone();
    match (serde_json::to_value(&probe), serde_json::to_value(stored)) {
        (Ok(a), Ok(b)) => a != b,
        _ => true,
    }
}

fn require<'a, R: Resource>(stored: Option<&'a R>, object: &R) -> Result<&'a R, StoreError> {
    stored.ok_or_else(|| StoreError::NotFound {
        kind: R::KIND,
        key: object.meta().key().to_string(),
    })
}

fn check_version<R: Resource>(stored: &R, object: &R) -> Result<(), StoreError> {
    let expected = object.meta().resource_version;
    let actual = stored.meta().resource_version;
    if expected != 0 && expected != actual {
        return Err(StoreError::Conflict {
            kind: R::KIND,
            key: object.meta().key().to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}
