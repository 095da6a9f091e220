//! `BackendRole`: a role written under an engine mount.

use credwarden_storage::ObjectMeta;
use serde::{Deserialize, Serialize};

use super::secret_engine::{ConnectionSettings, DatabaseFlavor, EngineKind};
use super::{AppReference, LocalObjectReference, ResourceStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRole {
    pub metadata: ObjectMeta,
    pub spec: BackendRoleSpec,
    #[serde(default)]
    pub status: ResourceStatus,
}

impl_resource!(BackendRole, "BackendRole");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendRoleSpec {
    pub vault_ref: LocalObjectReference,
    /// Mount path of the engine. Defaults to the kind's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(flatten)]
    pub role: RoleSpec,
}

impl BackendRole {
    #[must_use]
    pub fn path(&self) -> &str {
        self.spec
            .path
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| self.spec.role.kind().default_path())
    }
}

/// Per-kind role specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoleSpec {
    Aws(AwsRoleSpec),
    Gcp(GcpRoleSpec),
    Azure(AzureRoleSpec),
    Database(DatabaseRoleSpec),
}

impl RoleSpec {
    #[must_use]
    pub const fn kind(&self) -> EngineKind {
        match self {
            Self::Aws(_) => EngineKind::Aws,
            Self::Gcp(_) => EngineKind::Gcp,
            Self::Azure(_) => EngineKind::Azure,
            Self::Database(_) => EngineKind::Database,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwsCredentialType {
    #[default]
    IamUser,
    AssumedRole,
    FederationToken,
}

impl AwsCredentialType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IamUser => "iam_user",
            Self::AssumedRole => "assumed_role",
            Self::FederationToken => "federation_token",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsRoleSpec {
    pub credential_type: AwsCredentialType,
    #[serde(default, rename = "roleARNs", skip_serializing_if = "Vec::is_empty")]
    pub role_arns: Vec<String>,
    #[serde(default, rename = "policyARNs", skip_serializing_if = "Vec::is_empty")]
    pub policy_arns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_document: Option<String>,
    /// Inline IAM policy, serialized to JSON when written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<serde_json::Value>,
    #[serde(default, rename = "defaultSTSTTL", skip_serializing_if = "Option::is_none")]
    pub default_sts_ttl: Option<String>,
    #[serde(default, rename = "maxSTSTTL", skip_serializing_if = "Option::is_none")]
    pub max_sts_ttl: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcpSecretType {
    #[default]
    AccessToken,
    ServiceAccountKey,
}

impl GcpSecretType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AccessToken => "access_token",
            Self::ServiceAccountKey => "service_account_key",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpRoleSpec {
    pub secret_type: GcpSecretType,
    #[serde(default)]
    pub project: String,
    /// HCL/JSON resource bindings.
    #[serde(default)]
    pub bindings: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub token_scopes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureRoleSpec {
    /// JSON list of Azure role assignments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_roles: Option<String>,
    #[serde(default, rename = "applicationObjectID", skip_serializing_if = "Option::is_none")]
    pub application_object_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    #[serde(default, rename = "maxTTL", skip_serializing_if = "Option::is_none")]
    pub max_ttl: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseRoleSpec {
    #[serde(default)]
    pub flavor: DatabaseFlavor,
    /// Binding of the database this role issues users for. The role then
    /// also owns the mount's connection config for that database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_ref: Option<AppReference>,
    /// Name of a connection config written out of band.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    /// Connection options used when `database_ref` is set.
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default, rename = "defaultTTL", skip_serializing_if = "Option::is_none")]
    pub default_ttl: Option<String>,
    #[serde(default, rename = "maxTTL", skip_serializing_if = "Option::is_none")]
    pub max_ttl: Option<String>,
    #[serde(default)]
    pub creation_statements: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revocation_statements: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollback_statements: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub renew_statements: Vec<String>,
}
