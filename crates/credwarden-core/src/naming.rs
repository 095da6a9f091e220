//! Deterministic names for objects created in the secrets backend and the
//! resource store.

use credwarden_storage::ObjectMeta;

/// Backend-side name for a resource: `k8s.<cluster>.<namespace>.<name>`,
/// with `-` standing in for an empty cluster name.
#[must_use]
pub fn vault_name(meta: &ObjectMeta) -> String {
    vault_name_for(&meta.cluster_name, &meta.namespace, &meta.name)
}

#[must_use]
pub fn vault_name_for(cluster: &str, namespace: &str, name: &str) -> String {
    let cluster = if cluster.is_empty() { "-" } else { cluster };
    format!("k8s.{cluster}.{namespace}.{name}")
}

/// Name of the RBAC role and role binding granting read access to a
/// request's credential secret.
#[must_use]
pub fn cred_reader_name(kind: &str, namespace: &str, name: &str) -> String {
    format!("{}-{namespace}-{name}-cred-reader", kind.to_ascii_lowercase())
}

/// Name for a newly materialized credential secret.
#[must_use]
pub fn credential_secret_name(request_name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{request_name}-{}", &suffix[..8])
}
