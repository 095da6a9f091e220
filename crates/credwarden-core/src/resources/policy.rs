//! `VaultPolicy` and `VaultPolicyBinding`.

use credwarden_storage::ObjectMeta;
use serde::{Deserialize, Serialize};

use super::{LocalObjectReference, ResourceStatus};
use crate::naming;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultPolicy {
    pub metadata: ObjectMeta,
    pub spec: VaultPolicySpec,
    #[serde(default)]
    pub status: ResourceStatus,
}

impl_resource!(VaultPolicy, "VaultPolicy");

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultPolicySpec {
    pub vault_ref: LocalObjectReference,
    /// Name in the backend. Defaults to `k8s.<cluster>.<namespace>.<name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_policy_name: Option<String>,
    /// HCL or JSON policy text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_document: Option<String>,
    /// Structured policy, serialized as JSON when written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<serde_json::Value>,
}

impl VaultPolicy {
    #[must_use]
    pub fn policy_name(&self) -> String {
        self.spec
            .vault_policy_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| naming::vault_name(&self.metadata))
    }

    /// The policy text to upload. `None` when neither form is given.
    #[must_use]
    pub fn document(&self) -> Option<String> {
        if let Some(doc) = self.spec.policy_document.as_deref().filter(|d| !d.is_empty()) {
            return Some(doc.to_owned());
        }
        self.spec.policy.as_ref().map(serde_json::Value::to_string)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultPolicyBinding {
    pub metadata: ObjectMeta,
    pub spec: VaultPolicyBindingSpec,
    #[serde(default)]
    pub status: ResourceStatus,
}

impl_resource!(VaultPolicyBinding, "VaultPolicyBinding");

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultPolicyBindingSpec {
    pub vault_ref: LocalObjectReference,
    /// Auth role name. Defaults to `k8s.<cluster>.<namespace>.<name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_role_name: Option<String>,
    pub policies: Vec<PolicyIdentifier>,
    pub subject_ref: SubjectRef,
}

impl VaultPolicyBinding {
    #[must_use]
    pub fn role_name(&self) -> String {
        self.spec
            .vault_role_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| naming::vault_name(&self.metadata))
    }
}

/// A policy given by backend name, or by reference to a `VaultPolicy`
/// in the binding's namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyIdentifier {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

/// Which auth method the binding's identities log in through. Exactly one
/// is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesSubjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_role: Option<AppRoleSubjectRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesSubjectRef {
    /// Auth mount path. Defaults to `kubernetes`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub service_account_names: Vec<String>,
    #[serde(default)]
    pub service_account_namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    #[serde(default, rename = "maxTTL", skip_serializing_if = "Option::is_none")]
    pub max_ttl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRoleSubjectRef {
    /// Auth mount path. Defaults to `approle`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, rename = "bindSecretID")]
    pub bind_secret_id: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_id_bound_cidrs: Vec<String>,
    #[serde(default)]
    pub secret_id_num_uses: i64,
    #[serde(default, rename = "secretIdTTL", skip_serializing_if = "Option::is_none")]
    pub secret_id_ttl: Option<String>,
    #[serde(default, rename = "tokenTTL")]
    pub token_ttl: i64,
    #[serde(default, rename = "tokenMaxTTL")]
    pub token_max_ttl: i64,
    #[serde(default)]
    pub token_period: i64,
    #[serde(default)]
    pub token_num_uses: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}
