//! Role provisioning under engine mounts.
//!
//! [`RoleSpec`] is the single dispatch point: it decides the role path
//! (`roles/` or `roleset/`), the payload shape and the validation rules.

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::client::{BackendClient, ignore_absent};
use crate::engine::EngineManager;
use crate::engine_config;
use crate::error::{BackendError, RoleError};
use crate::naming;
use crate::resources::{
    AwsCredentialType, AwsRoleSpec, AzureRoleSpec, BackendRole, DatabaseRoleSpec, GcpRoleSpec, GcpSecretType,
    RoleSpec,
};
use crate::store::Stores;

/// Deterministic backend name of a role.
#[must_use]
pub fn role_name(role: &BackendRole) -> String {
    naming::vault_name(&role.metadata)
}

/// `<mount>/roles/<name>`, or `<mount>/roleset/<name>` for GCP.
#[must_use]
pub fn role_path(role: &BackendRole) -> String {
    let collection = match role.spec.role {
        RoleSpec::Gcp(_) => "roleset",
        RoleSpec::Aws(_) | RoleSpec::Azure(_) | RoleSpec::Database(_) => "roles",
    };
    format!("{}/{collection}/{}", role.path().trim_matches('/'), role_name(role))
}

/// Check a role spec before anything is sent to the backend.
///
/// # Errors
///
/// Returns [`RoleError::InvalidSpec`] naming the first violated rule.
pub fn validate(role: &BackendRole) -> Result<(), RoleError> {
    let check = match &role.spec.role {
        RoleSpec::Aws(aws) => validate_aws(aws),
        RoleSpec::Gcp(gcp) => validate_gcp(gcp),
        RoleSpec::Azure(azure) => validate_azure(azure),
        RoleSpec::Database(db) => validate_database(db),
    };
    check.map_err(|reason| RoleError::InvalidSpec {
        role: role.metadata.key().to_string(),
        reason: reason.to_owned(),
    })
}

fn validate_aws(spec: &AwsRoleSpec) -> Result<(), &'static str> {
    let has_document = spec.policy_document.as_deref().is_some_and(|d| !d.is_empty());
    if has_document && spec.policy.is_some() {
        return Err("policyDocument and policy are mutually exclusive");
    }
    match spec.credential_type {
        AwsCredentialType::AssumedRole if spec.role_arns.is_empty() => {
            Err("roleARNs is required for credential type assumed_role")
        }
        AwsCredentialType::AssumedRole => Ok(()),
        _ if !spec.role_arns.is_empty() => Err("roleARNs is only allowed for credential type assumed_role"),
        AwsCredentialType::IamUser if spec.policy_arns.is_empty() && !has_document && spec.policy.is_none() => {
            Err("iam_user requires policyARNs or a policy document")
        }
        _ => Ok(()),
    }
}

fn validate_gcp(spec: &GcpRoleSpec) -> Result<(), &'static str> {
    if spec.project.is_empty() {
        return Err("project is required");
    }
    if spec.bindings.is_empty() {
        return Err("bindings is required");
    }
    if spec.secret_type == GcpSecretType::AccessToken && spec.token_scopes.is_empty() {
        return Err("tokenScopes is required for secret type access_token");
    }
    Ok(())
}

fn validate_azure(spec: &AzureRoleSpec) -> Result<(), &'static str> {
    let roles = spec.azure_roles.as_deref().is_some_and(|r| !r.is_empty());
    let app = spec.application_object_id.as_deref().is_some_and(|a| !a.is_empty());
    match (roles, app) {
        (true, false) | (false, true) => Ok(()),
        (true, true) => Err("azureRoles and applicationObjectID are mutually exclusive"),
        (false, false) => Err("one of azureRoles or applicationObjectID is required"),
    }
}

fn validate_database(spec: &DatabaseRoleSpec) -> Result<(), &'static str> {
    let inline = spec.database_name.as_deref().is_some_and(|n| !n.is_empty());
    match (&spec.database_ref, inline) {
        (Some(_), true) => return Err("databaseRef and databaseName are mutually exclusive"),
        (None, false) => return Err("one of databaseRef or databaseName is required"),
        (Some(reference), false) if reference.namespace.is_empty() || reference.name.is_empty() => {
            return Err("databaseRef needs both namespace and name");
        }
        _ => {}
    }
    if spec.creation_statements.iter().all(String::is_empty) {
        return Err("creationStatements must not be empty");
    }
    Ok(())
}

/// Backend name of the connection config a database role issues from.
#[must_use]
pub fn database_config_name(role: &BackendRole, spec: &DatabaseRoleSpec) -> String {
    match (&spec.database_ref, &spec.database_name) {
        (Some(reference), _) => engine_config::database_name(&role.metadata.cluster_name, reference),
        (None, Some(name)) => name.clone(),
        (None, None) => String::new(),
    }
}

/// Role payload for the backend.
///
/// # Errors
///
/// Returns [`RoleError::InvalidSpec`] if an inline AWS policy cannot be
/// serialized.
pub fn role_payload(role: &BackendRole) -> Result<Value, RoleError> {
    let mut body = Map::new();
    match &role.spec.role {
        RoleSpec::Aws(aws) => {
            body.insert("credential_type".into(), aws.credential_type.as_str().into());
            if !aws.role_arns.is_empty() {
                body.insert("role_arns".into(), aws.role_arns.clone().into());
            }
            if !aws.policy_arns.is_empty() {
                body.insert("policy_arns".into(), aws.policy_arns.clone().into());
            }
            if let Some(document) = aws.policy_document.as_deref().filter(|d| !d.is_empty()) {
                body.insert("policy_document".into(), document.into());
            } else if let Some(policy) = &aws.policy {
                let document = serde_json::to_string(policy).map_err(|e| RoleError::InvalidSpec {
                    role: role.metadata.key().to_string(),
                    reason: format!("failed to serialize policy: {e}"),
                })?;
                body.insert("policy_document".into(), document.into());
            }
            insert_opt(&mut body, "default_sts_ttl", aws.default_sts_ttl.as_deref());
            insert_opt(&mut body, "max_sts_ttl", aws.max_sts_ttl.as_deref());
        }
        RoleSpec::Gcp(gcp) => {
            body.insert("project".into(), gcp.project.clone().into());
            body.insert("bindings".into(), gcp.bindings.clone().into());
            body.insert("secret_type".into(), gcp.secret_type.as_str().into());
            if !gcp.token_scopes.is_empty() {
                body.insert("token_scopes".into(), gcp.token_scopes.clone().into());
            }
        }
        RoleSpec::Azure(azure) => {
            insert_opt(&mut body, "azure_roles", azure.azure_roles.as_deref());
            insert_opt(&mut body, "application_object_id", azure.application_object_id.as_deref());
            insert_opt(&mut body, "ttl", azure.ttl.as_deref());
            insert_opt(&mut body, "max_ttl", azure.max_ttl.as_deref());
        }
        RoleSpec::Database(db) => {
            body.insert("db_name".into(), database_config_name(role, db).into());
            body.insert("creation_statements".into(), db.creation_statements.clone().into());
            for (key, statements) in [
                ("revocation_statements", &db.revocation_statements),
                ("rollback_statements", &db.rollback_statements),
                ("renew_statements", &db.renew_statements),
            ] {
                if !statements.is_empty() {
                    body.insert(key.into(), statements.clone().into());
                }
            }
            insert_opt(&mut body, "default_ttl", db.default_ttl.as_deref());
            insert_opt(&mut body, "max_ttl", db.max_ttl.as_deref());
        }
    }
    Ok(Value::Object(body))
}

fn insert_opt(body: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        body.insert(key.into(), v.into());
    }
}

/// Writes and removes backend roles.
#[derive(Debug, Clone)]
pub struct RoleProvisioner {
    client: BackendClient,
    stores: Stores,
}

impl RoleProvisioner {
    #[must_use]
    pub fn new(client: BackendClient, stores: Stores) -> Self {
        Self { client, stores }
    }

    /// Enable the role's mount if needed.
    ///
    /// # Errors
    ///
    /// Any [`BackendError`] from the engine manager.
    pub async fn ensure_backend_enabled(&self, role: &BackendRole) -> Result<bool, RoleError> {
        let engines = EngineManager::new(self.client.clone(), self.stores.clone());
        Ok(engines.enable(role.path(), role.spec.role.kind()).await?)
    }

    /// Write the connection config of a database role's referenced database.
    /// Does nothing for cloud roles and inline database names.
    ///
    /// # Errors
    ///
    /// - [`RoleError::MissingReference`] if the binding or its secret is gone.
    /// - [`RoleError::ConfigRejected`] if the backend refuses the config.
    pub async fn write_connection_config(&self, role: &BackendRole) -> Result<(), RoleError> {
        let RoleSpec::Database(db) = &role.spec.role else {
            return Ok(());
        };
        let Some(reference) = &db.database_ref else {
            debug!(role = %role.metadata.key(), "database named inline, no connection config to write");
            return Ok(());
        };
        validate(role)?;

        let connection = engine_config::resolve_database(
            self.stores.app_bindings.as_ref(),
            self.stores.secrets.as_ref(),
            reference,
        )
        .await?;
        let db_name = database_config_name(role, db);
        let write = engine_config::database(role.path().trim_matches('/'), &db_name, db.flavor, &db.connection, &connection);

        match self.client.write(&write.path, &write.body).await {
            Ok(_) => {
                info!(role = %role.metadata.key(), path = %write.path, "database connection config written");
                Ok(())
            }
            Err(BackendError::Rejected {
                path,
                status,
                message,
                ..
            }) if status < 500 && status != 429 => Err(RoleError::ConfigRejected { path, message }),
            Err(e) => Err(e.into()),
        }
    }

    /// Validate and write the role.
    ///
    /// # Errors
    ///
    /// - [`RoleError::InvalidSpec`] without touching the backend.
    /// - Any [`BackendError`].
    pub async fn write_role(&self, role: &BackendRole) -> Result<(), RoleError> {
        validate(role)?;
        let path = role_path(role);
        let body = role_payload(role)?;
        self.client.write(&path, &body).await?;
        info!(role = %role.metadata.key(), path = %path, "backend role written");
        Ok(())
    }

    /// Delete the role. An absent role is success.
    ///
    /// # Errors
    ///
    /// Any [`BackendError`] other than absence.
    pub async fn delete_role(&self, role: &BackendRole) -> Result<(), RoleError> {
        let path = role_path(role);
        ignore_absent(self.client.delete(&path).await)?;
        info!(role = %role.metadata.key(), path = %path, "backend role deleted");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn role(spec: Value) -> BackendRole {
        serde_json::from_value(json!({
            "metadata": { "name": "app", "namespace": "demo" },
            "spec": spec
        }))
        .unwrap()
    }

    #[test]
    fn gcp_roles_live_under_roleset() {
        let r = role(json!({
            "vaultRef": { "name": "vault" },
            "path": "my-gcp",
            "gcp": { "secretType": "service_account_key", "project": "p", "bindings": "resource {}" }
        }));
        assert_eq!(role_path(&r), "my-gcp/roleset/k8s.-.demo.app");
        validate(&r).unwrap();
    }

    #[test]
    fn aws_rejects_role_arns_for_iam_user() {
        let r = role(json!({
            "vaultRef": { "name": "vault" },
            "aws": {
                "credentialType": "iam_user",
                "roleARNs": ["arn:aws:iam::1:role/x"],
                "policyARNs": ["arn:aws:iam::aws:policy/ReadOnly"]
            }
        }));
        assert!(matches!(validate(&r), Err(RoleError::InvalidSpec { .. })));
    }

    #[test]
    fn aws_inline_policy_is_serialized() {
        let r = role(json!({
            "vaultRef": { "name": "vault" },
            "aws": {
                "credentialType": "federation_token",
                "policy": { "Version": "2012-10-17", "Statement": [] },
                "defaultSTSTTL": "1h"
            }
        }));
        let body = role_payload(&r).unwrap();
        assert_eq!(body["credential_type"], "federation_token");
        assert_eq!(body["default_sts_ttl"], "1h");
        let doc: Value = serde_json::from_str(body["policy_document"].as_str().unwrap()).unwrap();
        assert_eq!(doc["Version"], "2012-10-17");
        assert!(body.get("role_arns").is_none());
    }

    #[test]
    fn azure_needs_exactly_one_target() {
        let both = role(json!({
            "vaultRef": { "name": "vault" },
            "azure": { "azureRoles": "[]", "applicationObjectID": "abc" }
        }));
        assert!(validate(&both).is_err());
        let neither = role(json!({ "vaultRef": { "name": "vault" }, "azure": {} }));
        assert!(validate(&neither).is_err());
    }

    #[test]
    fn database_payload_names_inline_database() {
        let r = role(json!({
            "vaultRef": { "name": "vault" },
            "database": {
                "databaseName": "legacy-db",
                "creationStatements": ["CREATE ROLE \"{{name}}\";"],
                "maxTTL": "24h"
            }
        }));
        validate(&r).unwrap();
        let body = role_payload(&r).unwrap();
        assert_eq!(body["db_name"], "legacy-db");
        assert_eq!(body["max_ttl"], "24h");
        assert!(body.get("revocation_statements").is_none());
    }

    #[test]
    fn database_reference_needs_namespace() {
        let r = role(json!({
            "vaultRef": { "name": "vault" },
            "database": {
                "databaseRef": { "name": "pg" },
                "creationStatements": ["CREATE ROLE x;"]
            }
        }));
        assert!(matches!(validate(&r), Err(RoleError::InvalidSpec { .. })));
    }
}
