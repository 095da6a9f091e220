//! Declarative resource kinds reconciled by credwarden.
//!
//! Every kind has a `metadata`, a `spec` written by users, and a `status`
//! written only by the operator.

/// Implements [`credwarden_storage::Resource`] for a kind with `metadata`
/// and `status` fields.
macro_rules! impl_resource {
    ($ty:ty, $kind:literal) => {
        impl ::credwarden_storage::Resource for $ty {
            const KIND: &'static str = $kind;

            fn meta(&self) -> &::credwarden_storage::ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut ::credwarden_storage::ObjectMeta {
                &mut self.metadata
            }

            fn copy_status_from(&mut self, other: &Self) {
                self.status.clone_from(&other.status);
            }
        }
    };
}

pub mod access_request;
pub mod app_binding;
pub mod backend_role;
pub mod condition;
pub mod policy;
pub mod secret_engine;

pub use access_request::{
    AccessGrantRef, AccessRequest, AccessRequestSpec, AccessRequestStatus, Decision, Lease,
    RequestPhase, RoleReference,
};
pub use app_binding::{
    AppBinding, AppBindingSpec, BackendParameters, ConnectionConfig, SecretTransform, ServiceReference,
};
pub use backend_role::{
    AwsCredentialType, AwsRoleSpec, AzureRoleSpec, BackendRole, BackendRoleSpec, DatabaseRoleSpec,
    GcpRoleSpec, GcpSecretType, RoleSpec,
};
pub use condition::{Condition, ConditionStatus};
pub use policy::{
    AppRoleSubjectRef, KubernetesSubjectRef, PolicyIdentifier, SubjectRef, VaultPolicy,
    VaultPolicyBinding, VaultPolicyBindingSpec, VaultPolicySpec,
};
pub use secret_engine::{
    AwsConfiguration, AzureConfiguration, ConnectionSettings, DatabaseConfiguration, DatabaseFlavor,
    EngineConfig, EngineKind, GcpConfiguration, LeaseConfig, SecretEngine, SecretEngineSpec,
};

use serde::{Deserialize, Serialize};

/// Reference to an object in the same namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalObjectReference {
    pub name: String,
}

impl LocalObjectReference {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Reference to a connection binding, possibly in another namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppReference {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

/// Coarse progress of a reconciled resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    Success,
    Failed,
    Terminating,
}

/// Status shared by engines, roles, policies and policy bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
