//! ACL policies and auth-role bindings.

use serde_json::{Map, Value, json};
use tracing::info;

use crate::client::{BackendClient, ignore_absent};
use crate::error::PolicyError;
use crate::resources::{AppRoleSubjectRef, KubernetesSubjectRef, VaultPolicy, VaultPolicyBinding};
use crate::store::Stores;

const KUBERNETES_AUTH_PATH: &str = "kubernetes";
const APPROLE_AUTH_PATH: &str = "approle";

/// Auth method a binding attaches its policies through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingTarget<'a> {
    Kubernetes(&'a KubernetesSubjectRef),
    AppRole(&'a AppRoleSubjectRef),
}

impl BindingTarget<'_> {
    /// Auth mount path, trimmed of slashes.
    #[must_use]
    pub fn auth_path(&self) -> &str {
        let (path, default) = match self {
            Self::Kubernetes(k) => (k.path.as_deref(), KUBERNETES_AUTH_PATH),
            Self::AppRole(a) => (a.path.as_deref(), APPROLE_AUTH_PATH),
        };
        path.map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
            .unwrap_or(default)
    }

    /// Full-overwrite payload for the auth role.
    #[must_use]
    pub fn payload(&self, policies: &[String]) -> Value {
        let mut body = Map::new();
        body.insert("token_policies".into(), json!(policies));
        match self {
            Self::Kubernetes(k) => {
                body.insert("bound_service_account_names".into(), json!(k.service_account_names));
                body.insert(
                    "bound_service_account_namespaces".into(),
                    json!(k.service_account_namespaces),
                );
                for (key, value) in [
                    ("token_ttl", &k.ttl),
                    ("token_max_ttl", &k.max_ttl),
                    ("token_period", &k.period),
                ] {
                    if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
                        body.insert(key.into(), v.into());
                    }
                }
            }
            Self::AppRole(a) => {
                body.insert("bind_secret_id".into(), a.bind_secret_id.into());
                if !a.secret_id_bound_cidrs.is_empty() {
                    body.insert("secret_id_bound_cidrs".into(), json!(a.secret_id_bound_cidrs));
                }
                body.insert("secret_id_num_uses".into(), a.secret_id_num_uses.into());
                if let Some(ttl) = a.secret_id_ttl.as_deref().filter(|t| !t.is_empty()) {
                    body.insert("secret_id_ttl".into(), ttl.into());
                }
                body.insert("token_ttl".into(), a.token_ttl.into());
                body.insert("token_max_ttl".into(), a.token_max_ttl.into());
                body.insert("token_period".into(), a.token_period.into());
                body.insert("token_num_uses".into(), a.token_num_uses.into());
                if let Some(token_type) = a.token_type.as_deref().filter(|t| !t.is_empty()) {
                    body.insert("token_type".into(), token_type.into());
                }
            }
        }
        Value::Object(body)
    }
}

/// The auth method a binding targets.
///
/// # Errors
///
/// Returns [`PolicyError::InvalidSpec`] unless exactly one subject kind is set.
pub fn binding_target(binding: &VaultPolicyBinding) -> Result<BindingTarget<'_>, PolicyError> {
    let subject = &binding.spec.subject_ref;
    match (&subject.kubernetes, &subject.app_role) {
        (Some(k), None) => Ok(BindingTarget::Kubernetes(k)),
        (None, Some(a)) => Ok(BindingTarget::AppRole(a)),
        _ => Err(PolicyError::InvalidSpec {
            name: binding.metadata.key().to_string(),
            reason: "subjectRef must set exactly one of kubernetes or appRole".to_owned(),
        }),
    }
}

/// `auth/<path>/role/<role>` for a binding.
///
/// # Errors
///
/// Returns [`PolicyError::InvalidSpec`] if the subject is ambiguous.
pub fn binding_path(binding: &VaultPolicyBinding) -> Result<String, PolicyError> {
    let target = binding_target(binding)?;
    Ok(format!("auth/{}/role/{}", target.auth_path(), binding.role_name()))
}

/// Manages policies and policy bindings in the backend.
#[derive(Debug, Clone)]
pub struct PolicyManager {
    client: BackendClient,
    stores: Stores,
}

impl PolicyManager {
    #[must_use]
    pub fn new(client: BackendClient, stores: Stores) -> Self {
        Self { client, stores }
    }

    /// Write `document` as ACL policy `name`.
    ///
    /// # Errors
    ///
    /// Any [`crate::error::BackendError`].
    pub async fn ensure_policy(&self, name: &str, document: &str) -> Result<(), PolicyError> {
        self.client
            .put(&format!("sys/policies/acl/{name}"), &json!({ "policy": document }))
            .await?;
        info!(policy = %name, "policy written");
        Ok(())
    }

    /// Write the policy a `VaultPolicy` declares.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidSpec`] if it carries no document.
    pub async fn ensure_resource_policy(&self, policy: &VaultPolicy) -> Result<String, PolicyError> {
        let document = policy.document().ok_or_else(|| PolicyError::InvalidSpec {
            name: policy.metadata.key().to_string(),
            reason: "one of policyDocument or policy is required".to_owned(),
        })?;
        let name = policy.policy_name();
        self.ensure_policy(&name, &document).await?;
        Ok(name)
    }

    /// Delete ACL policy `name`. Absence is success.
    ///
    /// # Errors
    ///
    /// Any [`crate::error::BackendError`] other than absence.
    pub async fn delete_policy(&self, name: &str) -> Result<(), PolicyError> {
        ignore_absent(self.client.delete(&format!("sys/policies/acl/{name}")).await)?;
        info!(policy = %name, "policy deleted");
        Ok(())
    }

    /// Backend names of the binding's policies, in order and de-duplicated.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::InvalidSpec`] for an empty list or an empty entry.
    /// - [`PolicyError::MissingReference`] for an unknown `VaultPolicy`.
    pub async fn resolve_policies(&self, binding: &VaultPolicyBinding) -> Result<Vec<String>, PolicyError> {
        let invalid = |reason: &str| PolicyError::InvalidSpec {
            name: binding.metadata.key().to_string(),
            reason: reason.to_owned(),
        };
        if binding.spec.policies.is_empty() {
            return Err(invalid("policies must not be empty"));
        }

        let namespace = &binding.metadata.namespace;
        let mut names: Vec<String> = Vec::with_capacity(binding.spec.policies.len());
        for identifier in &binding.spec.policies {
            let name = match (
                identifier.name.as_deref().filter(|n| !n.is_empty()),
                identifier.reference.as_deref().filter(|r| !r.is_empty()),
            ) {
                (Some(name), None) => name.to_owned(),
                (None, Some(reference)) => self
                    .stores
                    .policies
                    .get(namespace, reference)
                    .await?
                    .ok_or_else(|| PolicyError::MissingReference {
                        kind: "VaultPolicy",
                        key: format!("{namespace}/{reference}"),
                    })?
                    .policy_name(),
                _ => return Err(invalid("each policy needs exactly one of name or ref")),
            };
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Overwrite the binding's auth role.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::InvalidSpec`] before any backend call.
    /// - Any [`crate::error::BackendError`].
    pub async fn ensure_binding(&self, binding: &VaultPolicyBinding) -> Result<(), PolicyError> {
        let target = binding_target(binding)?;
        let policies = self.resolve_policies(binding).await?;
        let path = format!("auth/{}/role/{}", target.auth_path(), binding.role_name());
        self.client.write(&path, &target.payload(&policies)).await?;
        info!(binding = %binding.metadata.key(), role = %path, policies = policies.len(), "policy binding written");
        Ok(())
    }

    /// Delete the binding's auth role. Absence is success.
    ///
    /// # Errors
    ///
    /// Any [`crate::error::BackendError`] other than absence.
    pub async fn delete_binding(&self, binding: &VaultPolicyBinding) -> Result<(), PolicyError> {
        let path = binding_path(binding)?;
        ignore_absent(self.client.delete(&path).await)?;
        info!(binding = %binding.metadata.key(), role = %path, "policy binding deleted");
        Ok(())
    }
}
