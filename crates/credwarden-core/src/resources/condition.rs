//! Status conditions.
//!
//! A condition list holds at most one entry per type. Setting a condition
//! whose status is unchanged keeps the original transition time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Condition types used across the resource kinds.
pub mod kind {
    pub const APPROVED: &str = "Approved";
    pub const DENIED: &str = "Denied";
    pub const FAILED: &str = "Failed";
    pub const AVAILABLE: &str = "Available";
    pub const READY: &str = "Ready";
}

/// Machine-readable reasons attached to conditions.
pub mod reason {
    pub const ISSUED: &str = "SuccessfullyIssuedCredential";
    pub const FAILED_TO_GET_CREDENTIAL: &str = "FailedToGetCredential";
    pub const FAILED_TO_CREATE_SECRET: &str = "FailedToCreateSecret";
    pub const FAILED_TO_GRANT_ACCESS: &str = "FailedToGrantAccess";
    pub const FAILED_TO_REVOKE_LEASE: &str = "FailedToRevokeLease";
    pub const LEASE_EXPIRED: &str = "LeaseExpired";
    pub const RECONCILED: &str = "Reconciled";
    pub const ENABLE_FAILED: &str = "FailedToEnableSecretEngine";
    pub const CONFIG_FAILED: &str = "FailedToConfigureSecretEngine";
    pub const POLICY_FAILED: &str = "FailedToCreatePolicy";
    pub const ROLE_FAILED: &str = "FailedToCreateRole";
    pub const BINDING_FAILED: &str = "FailedToCreateBinding";
    pub const CONNECT_FAILED: &str = "FailedToConnectBackend";
    pub const INVALID_SPEC: &str = "InvalidSpec";
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// One observation about a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub observed_generation: i64,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl Condition {
    #[must_use]
    pub fn new(kind: &str, status: ConditionStatus, reason: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_owned(),
            status,
            observed_generation: 0,
            last_transition_time: Utc::now(),
            reason: reason.to_owned(),
            message: message.into(),
        }
    }

    /// A `True` condition.
    #[must_use]
    pub fn truthy(kind: &str, reason: &str, message: impl Into<String>) -> Self {
        Self::new(kind, ConditionStatus::True, reason, message)
    }

    #[must_use]
    pub fn with_generation(mut self, generation: i64) -> Self {
        self.observed_generation = generation;
        self
    }

    #[must_use]
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Insert or replace the condition of the same type.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.kind == condition.kind) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Drop the condition of the given type. Returns whether one was present.
pub fn remove_condition(conditions: &mut Vec<Condition>, kind: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.kind != kind);
    conditions.len() != before
}

#[must_use]
pub fn find_condition<'a>(conditions: &'a [Condition], kind: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.kind == kind)
}

#[must_use]
pub fn is_condition_true(conditions: &[Condition], kind: &str) -> bool {
    find_condition(conditions, kind).is_some_and(Condition::is_true)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn set_replaces_same_type() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, Condition::truthy(kind::FAILED, "A", "first"));
        set_condition(&mut conditions, Condition::truthy(kind::FAILED, "B", "second"));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].reason, "B");
    }

    #[test]
    fn unchanged_status_keeps_transition_time() {
        let mut original = Condition::truthy(kind::AVAILABLE, reason::ISSUED, "");
        original.last_transition_time -= Duration::hours(1);
        let first_seen = original.last_transition_time;
        let mut conditions = vec![original];

        set_condition(&mut conditions, Condition::truthy(kind::AVAILABLE, reason::ISSUED, "again"));
        assert_eq!(conditions[0].last_transition_time, first_seen);

        set_condition(
            &mut conditions,
            Condition::new(kind::AVAILABLE, ConditionStatus::False, "Gone", ""),
        );
        assert!(conditions[0].last_transition_time > first_seen);
    }

    #[test]
    fn lookup_helpers() {
        let mut conditions = vec![Condition::new(kind::APPROVED, ConditionStatus::False, "", "")];
        assert!(!is_condition_true(&conditions, kind::APPROVED));
        assert!(find_condition(&conditions, kind::APPROVED).is_some());
        assert!(remove_condition(&mut conditions, kind::APPROVED));
        assert!(!remove_condition(&mut conditions, kind::APPROVED));
    }
}
