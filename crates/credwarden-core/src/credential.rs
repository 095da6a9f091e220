//! Credential issuance and materialization.

use std::collections::BTreeMap;

use chrono::Utc;
use credwarden_storage::{
    ObjectMeta, OwnerReference, PolicyRule, RbacRole, Resource, ResourceStore, RoleBinding, RoleRef, Secret,
    Subject,
};
use reqwest::Method;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::client::{BackendClient, BackendResponse, decode};
use crate::error::{BackendError, CredentialError};
use crate::naming;
use crate::resources::{
    AccessGrantRef, AccessRequest, AccessRequestSpec, BackendRole, GcpSecretType, Lease, RoleSpec,
};
use crate::role;
use crate::store::{self, Stores};

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

/// A credential as returned by the backend. Values are raw bytes.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct IssuedCredential {
    pub lease_id: String,
    pub lease_duration: u64,
    pub renewable: bool,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl std::fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("lease_id", &self.lease_id)
            .field("lease_duration", &self.lease_duration)
            .field("renewable", &self.renewable)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl IssuedCredential {
    /// The lease to record on the request, stamped with the current time.
    #[must_use]
    pub fn lease(&self) -> Lease {
        Lease {
            id: self.lease_id.clone(),
            duration: self.lease_duration,
            renewable: self.renewable,
            issued_at: Some(Utc::now()),
        }
    }
}

/// Encode one credential value: strings as-is, scalars via their JSON text,
/// nested values as JSON, null as empty.
fn value_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::Null => Vec::new(),
        Value::String(s) => s.as_bytes().to_vec(),
        Value::Bool(_) | Value::Number(_) | Value::Array(_) | Value::Object(_) => {
            value.to_string().into_bytes()
        }
    }
}

/// How a credential is fetched for `role`.
///
/// # Errors
///
/// Returns [`CredentialError::InvalidRequest`] if the request carries
/// options the role's kind does not support.
pub fn credential_call(
    role: &BackendRole,
    request: &AccessRequestSpec,
) -> Result<(Method, String, Option<Value>), CredentialError> {
    let mount = role.path().trim_matches('/');
    let name = role::role_name(role);
    let is_aws = matches!(role.spec.role, RoleSpec::Aws(_));
    if !is_aws && (request.use_sts || request.role_arn.is_some()) {
        return Err(CredentialError::InvalidRequest {
            reason: "useSTS and roleARN apply to AWS roles only".to_owned(),
        });
    }

    let call = match &role.spec.role {
        RoleSpec::Aws(_) if request.use_sts => {
            let mut query = Vec::new();
            if let Some(ttl) = request.ttl.as_deref().filter(|t| !t.is_empty()) {
                query.push(format!("ttl={}", urlencoding::encode(ttl)));
            }
            if let Some(arn) = request.role_arn.as_deref().filter(|a| !a.is_empty()) {
                query.push(format!("role_arn={}", urlencoding::encode(arn)));
            }
            let mut path = format!("{mount}/sts/{name}");
            if !query.is_empty() {
                path.push('?');
                path.push_str(&query.join("&"));
            }
            (Method::GET, path, None)
        }
        RoleSpec::Aws(_) if request.role_arn.is_some() => {
            return Err(CredentialError::InvalidRequest {
                reason: "roleARN requires useSTS".to_owned(),
            });
        }
        RoleSpec::Gcp(gcp) if gcp.secret_type == GcpSecretType::ServiceAccountKey => {
            let mut body = Map::new();
            if let Some(algorithm) = request.key_algorithm.as_deref().filter(|a| !a.is_empty()) {
                body.insert("key_algorithm".into(), algorithm.into());
            }
            if let Some(key_type) = request.key_type.as_deref().filter(|t| !t.is_empty()) {
                body.insert("key_type".into(), key_type.into());
            }
            (Method::POST, format!("{mount}/key/{name}"), Some(Value::Object(body)))
        }
        RoleSpec::Gcp(_) => (Method::GET, format!("{mount}/token/{name}"), None),
        RoleSpec::Aws(_) | RoleSpec::Azure(_) | RoleSpec::Database(_) => {
            (Method::GET, format!("{mount}/creds/{name}"), None)
        }
    };
    Ok(call)
}

/// Look up the role a request points at.
///
/// # Errors
///
/// Returns [`CredentialError::RoleNotFound`] if it does not exist.
pub async fn resolve_role(
    backend_roles: &dyn ResourceStore<BackendRole>,
    request: &AccessRequest,
) -> Result<BackendRole, CredentialError> {
    let namespace = request.role_namespace();
    let name = &request.spec.role_ref.name;
    backend_roles
        .get(namespace, name)
        .await?
        .ok_or_else(|| CredentialError::RoleNotFound {
            key: format!("{namespace}/{name}"),
        })
}

/// Issues credentials from backend roles and materializes them.
#[derive(Debug, Clone)]
pub struct CredentialIssuer {
    client: BackendClient,
    stores: Stores,
}

impl CredentialIssuer {
    #[must_use]
    pub fn new(client: BackendClient, stores: Stores) -> Self {
        Self { client, stores }
    }

    /// Fetch a fresh credential from `role`.
    ///
    /// # Errors
    ///
    /// - [`CredentialError::IssuanceFailed`] if the backend refuses.
    /// - [`CredentialError::InvalidRequest`] for options the role does not take.
    pub async fn get_credential(
        &self,
        role: &BackendRole,
        request: &AccessRequestSpec,
    ) -> Result<IssuedCredential, CredentialError> {
        let (method, path, body) = credential_call(role, request)?;
        let value = self
            .client
            .send(method, &path, body.as_ref())
            .await
            .map_err(|e| match e {
                BackendError::Rejected { message, .. } => CredentialError::IssuanceFailed {
                    path: path.clone(),
                    message,
                },
                BackendError::NotFound { .. } => CredentialError::IssuanceFailed {
                    path: path.clone(),
                    message: "role not found".to_owned(),
                },
                other => CredentialError::Backend(other),
            })?;

        let resp: BackendResponse<Map<String, Value>> = decode(&path, value)?;
        let data = resp
            .data
            .unwrap_or_default()
            .iter()
            .map(|(k, v)| (k.clone(), value_bytes(v)))
            .collect();
        info!(role = %role.metadata.key(), path = %path, lease_id = %resp.lease_id, "credential issued");
        Ok(IssuedCredential {
            lease_id: resp.lease_id,
            lease_duration: resp.lease_duration,
            renewable: resp.renewable,
            data,
        })
    }

    /// Create or update the secret `namespace/name` holding `credential`.
    ///
    /// # Errors
    ///
    /// Any [`credwarden_storage::StoreError`].
    pub async fn materialize_secret(
        &self,
        name: &str,
        namespace: &str,
        credential: &IssuedCredential,
        owner: &OwnerReference,
    ) -> Result<Secret, CredentialError> {
        let secret = Secret {
            metadata: ObjectMeta::new(namespace, name),
            secret_type: "Opaque".to_owned(),
            ..Secret::default()
        };
        let stored = store::create_or_patch(self.stores.secrets.as_ref(), secret, |s| {
            let before = s.clone();
            s.data.clone_from(&credential.data);
            s.metadata.ensure_owner_reference(owner.clone());
            *s != before
        })
        .await?;
        info!(secret = %stored.metadata.key(), "credential secret written");
        Ok(stored)
    }

    /// Grant `get` on exactly `secret_name` to exactly `subjects`, through a
    /// role and role binding both named `name`.
    ///
    /// # Errors
    ///
    /// Any [`credwarden_storage::StoreError`].
    pub async fn grant_read_access(
        &self,
        name: &str,
        namespace: &str,
        secret_name: &str,
        subjects: &[Subject],
        owner: &OwnerReference,
    ) -> Result<AccessGrantRef, CredentialError> {
        let rules = vec![PolicyRule {
            api_groups: vec![String::new()],
            resources: vec!["secrets".to_owned()],
            resource_names: vec![secret_name.to_owned()],
            verbs: vec!["get".to_owned()],
        }];
        let role = RbacRole {
            metadata: ObjectMeta::new(namespace, name),
            rules: Vec::new(),
        };
        store::create_or_patch(self.stores.rbac_roles.as_ref(), role, |r| {
            let before = r.clone();
            r.rules.clone_from(&rules);
            r.metadata.ensure_owner_reference(owner.clone());
            *r != before
        })
        .await?;

        let role_ref = RoleRef {
            api_group: RBAC_GROUP.to_owned(),
            kind: RbacRole::KIND.to_owned(),
            name: name.to_owned(),
        };
        let binding = RoleBinding {
            metadata: ObjectMeta::new(namespace, name),
            ..RoleBinding::default()
        };
        store::create_or_patch(self.stores.role_bindings.as_ref(), binding, |b| {
            let before = b.clone();
            b.role_ref = role_ref.clone();
            b.subjects = subjects.to_vec();
            b.metadata.ensure_owner_reference(owner.clone());
            *b != before
        })
        .await?;

        debug!(namespace, name, secret = secret_name, subjects = subjects.len(), "read access granted");
        Ok(AccessGrantRef {
            role: name.to_owned(),
            role_binding: name.to_owned(),
        })
    }
}

/// Remove a credential secret. Absence is success.
///
/// # Errors
///
/// Any [`credwarden_storage::StoreError`] other than absence.
pub async fn delete_secret(stores: &Stores, namespace: &str, name: &str) -> Result<(), CredentialError> {
    store::delete_if_exists(stores.secrets.as_ref(), namespace, name).await?;
    debug!(namespace, name, "credential secret removed");
    Ok(())
}

/// Remove the role and role binding of a grant. Absence is success.
///
/// # Errors
///
/// Any [`credwarden_storage::StoreError`] other than absence.
pub async fn revoke_grant(stores: &Stores, namespace: &str, grant: &AccessGrantRef) -> Result<(), CredentialError> {
    store::delete_if_exists(stores.role_bindings.as_ref(), namespace, &grant.role_binding).await?;
    store::delete_if_exists(stores.rbac_roles.as_ref(), namespace, &grant.role).await?;
    debug!(namespace, role = %grant.role, "read access revoked");
    Ok(())
}

/// The grant name for a request: `<kind>-<ns>-<name>-cred-reader`.
#[must_use]
pub fn grant_name(request: &AccessRequest) -> String {
    naming::cred_reader_name(
        AccessRequest::KIND,
        &request.metadata.namespace,
        &request.metadata.name,
    )
}

/// Owner back-reference from materialized objects to their request.
#[must_use]
pub fn owner_of(request: &AccessRequest) -> OwnerReference {
    OwnerReference {
        kind: AccessRequest::KIND.to_owned(),
        name: request.metadata.name.clone(),
        uid: request.metadata.uid.clone(),
        controller: true,
    }
}
