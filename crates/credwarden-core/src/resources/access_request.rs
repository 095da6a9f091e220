//! `AccessRequest`: an approval-gated ask for a credential from a role.

use chrono::{DateTime, Utc};
use credwarden_storage::{ObjectMeta, Subject};
use serde::{Deserialize, Serialize};

use super::condition::{self, Condition, kind};
use super::LocalObjectReference;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub metadata: ObjectMeta,
    pub spec: AccessRequestSpec,
    #[serde(default)]
    pub status: AccessRequestStatus,
}

impl_resource!(AccessRequest, "AccessRequest");

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequestSpec {
    /// The `BackendRole` to issue from, in the request's namespace unless
    /// the reference names another.
    pub role_ref: RoleReference,
    /// Identities granted read access to the issued secret.
    #[serde(default)]
    pub subjects: Vec<Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    /// AWS: request STS credentials instead of IAM user keys.
    #[serde(default, rename = "useSTS")]
    pub use_sts: bool,
    /// AWS: the role ARN to assume when the role lists several.
    #[serde(default, rename = "roleARN", skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
    /// GCP service account keys only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_algorithm: Option<String>,
    /// GCP service account keys only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestPhase {
    #[default]
    WaitingForApproval,
    Approved,
    Denied,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequestStatus {
    #[serde(default)]
    pub phase: RequestPhase,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Materialized credential secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<LocalObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    /// RBAC objects granting read access to [`Self::secret`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_grant: Option<AccessGrantRef>,
}

/// A backend lease backing one issued credential.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub id: String,
    /// Seconds the credential is valid for from `issued_at`.
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,
}

impl Lease {
    /// Wall-clock expiry, if the issue time and a non-zero duration are known.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.duration == 0 {
            return None;
        }
        let secs = i64::try_from(self.duration).ok()?;
        self.issued_at
            .and_then(|t| t.checked_add_signed(chrono::Duration::seconds(secs)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrantRef {
    pub role: String,
    pub role_binding: String,
}

/// The approval decision recorded on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Pending,
    Approved,
    Denied,
}

impl AccessRequest {
    /// Current decision. Denial wins over approval when both are set.
    #[must_use]
    pub fn decision(&self) -> Decision {
        let conditions = &self.status.conditions;
        if condition::is_condition_true(conditions, kind::DENIED) {
            Decision::Denied
        } else if condition::is_condition_true(conditions, kind::APPROVED) {
            Decision::Approved
        } else {
            Decision::Pending
        }
    }

    /// Namespace of the referenced role.
    #[must_use]
    pub fn role_namespace(&self) -> &str {
        self.spec
            .role_ref
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(&self.metadata.namespace)
    }

    #[must_use]
    pub fn has_failed(&self) -> bool {
        condition::is_condition_true(&self.status.conditions, kind::FAILED)
    }
}
