//! Engine manager: mounts, engine ACL policies, and the auth role those
//! policies are attached to.

use credwarden_storage::Secret;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::client::{BackendClient, decode, ignore_absent};
use crate::engine_config::{self, ConfigWrite};
use crate::error::{BackendError, EngineError};
use crate::naming;
use crate::resources::{AppBinding, AppReference, BackendParameters, EngineConfig, EngineKind, SecretEngine};
use crate::retry::{self, CancelToken, RetryPolicy};
use crate::store::Stores;

/// What an auth-role edit does when the role does not exist.
#[derive(Debug, Clone, Copy)]
enum AbsentRole {
    Fail,
    Skip,
}

/// Auth-role fields carried over when an auth role is rewritten.
const AUTH_ROLE_FIELDS: &[&str] = &[
    "bound_service_account_names",
    "bound_service_account_namespaces",
    "token_ttl",
    "token_max_ttl",
    "token_policies",
    "token_bound_cidrs",
    "token_explicit_max_ttl",
    "token_no_default_policy",
    "token_num_uses",
    "token_period",
    "token_type",
];

const CRUD: &str = r#"["create", "update", "read", "delete"]"#;
const CUR: &str = r#"["create", "update", "read"]"#;

/// Render the ACL policy an engine's operator identity needs on `mount`.
#[must_use]
pub fn engine_policy(kind: EngineKind, mount: &str) -> String {
    let rules: &[(&str, &str)] = match kind {
        EngineKind::Aws => &[("config/*", CRUD), ("roles/*", CRUD), ("creds/*", CUR), ("sts/*", CUR)],
        EngineKind::Gcp => &[("config", CRUD), ("roleset/*", CRUD), ("token/*", CUR), ("key/*", CUR)],
        EngineKind::Azure => &[("config", CRUD), ("roles/*", CRUD), ("creds/*", CUR)],
        EngineKind::Database => &[("config/*", CRUD), ("roles/*", CRUD), ("creds/*", CUR)],
    };

    let mut policy = String::new();
    for (suffix, capabilities) in rules {
        policy.push_str(&format!(
            "path \"{mount}/{suffix}\" {{\n  capabilities = {capabilities}\n}}\n\n"
        ));
    }
    policy.push_str("path \"/sys/leases/*\" {\n  capabilities = [\"create\", \"update\"]\n}\n");
    policy
}

#[derive(Debug, Default, Deserialize)]
struct MountsResponse {
    #[serde(default)]
    data: Option<Map<String, Value>>,
    #[serde(flatten)]
    top_level: Map<String, Value>,
}

/// Ensures engine mounts exist and are configured.
#[derive(Debug, Clone)]
pub struct EngineManager {
    client: BackendClient,
    stores: Stores,
    retry: RetryPolicy,
    cancel: CancelToken,
}

impl EngineManager {
    #[must_use]
    pub fn new(client: BackendClient, stores: Stores) -> Self {
        Self {
            client,
            stores,
            retry: RetryPolicy::default(),
            cancel: CancelToken::never(),
        }
    }

    /// Budget and cancellation for read-modify-write sequences.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy, cancel: CancelToken) -> Self {
        self.retry = retry;
        self.cancel = cancel;
        self
    }

    /// Whether a mount exists at `path`.
    ///
    /// # Errors
    ///
    /// Any [`BackendError`] from `GET sys/mounts`.
    pub async fn is_enabled(&self, path: &str) -> Result<bool, BackendError> {
        let mounts: MountsResponse = self.client.read("sys/mounts").await?;
        let key = format!("{}/", path.trim_matches('/'));
        Ok(mounts.data.as_ref().is_some_and(|d| d.contains_key(&key))
            || mounts.top_level.contains_key(&key))
    }

    /// Mount an engine of `kind` at `path` unless one is already there.
    /// Returns `true` when a mount was created.
    ///
    /// # Errors
    ///
    /// Any [`BackendError`].
    pub async fn enable(&self, path: &str, kind: EngineKind) -> Result<bool, BackendError> {
        if self.is_enabled(path).await? {
            debug!(path, "secret engine already enabled");
            return Ok(false);
        }
        let path = path.trim_matches('/');
        self.client
            .write(&format!("sys/mounts/{path}"), &json!({ "type": kind.mount_type() }))
            .await?;
        info!(path, kind = %kind, "secret engine enabled");
        Ok(true)
    }

    /// Write the engine's ACL policy. Returns the policy name.
    ///
    /// # Errors
    ///
    /// Any [`BackendError`].
    pub async fn create_policy(&self, engine: &SecretEngine) -> Result<String, EngineError> {
        let name = naming::vault_name(&engine.metadata);
        let policy = engine_policy(engine.spec.config.kind(), engine.path());
        self.client
            .put(&format!("sys/policies/acl/{name}"), &json!({ "policy": policy }))
            .await?;
        info!(engine = %engine.metadata.key(), policy = %name, "engine policy written");
        Ok(name)
    }

    /// Append the engine's policy to the auth role named by the connection
    /// binding, without duplicating it.
    ///
    /// # Errors
    ///
    /// - [`EngineError::MissingReference`] if the binding names no auth role
    ///   or the backend has no such role.
    /// - Any [`BackendError`] once retries are exhausted.
    pub async fn bind_policy_to_auth_role(&self, engine: &SecretEngine) -> Result<(), EngineError> {
        let policy = naming::vault_name(&engine.metadata);
        let (params, role) = self.auth_role(engine).await?;
        let path = format!("auth/{}/role/{role}", params.auth_path().trim_matches('/'));

        self.modify_auth_role(&path, AbsentRole::Fail, |policies| {
            let before = policies.len();
            let mut seen = std::collections::HashSet::new();
            policies.retain(|p| seen.insert(p.clone()));
            if seen.contains(&policy) {
                return policies.len() != before;
            }
            policies.push(policy.clone());
            true
        })
        .await?;
        info!(engine = %engine.metadata.key(), role = %path, policy = %policy, "policy bound to auth role");
        Ok(())
    }

    /// Write the engine's connection configuration.
    ///
    /// # Errors
    ///
    /// - [`EngineError::ConfigRejected`] if the backend refuses it.
    /// - [`EngineError::MissingReference`] if a credential secret or
    ///   database binding is absent.
    pub async fn configure(&self, engine: &SecretEngine) -> Result<(), EngineError> {
        let mount = engine.path();
        let namespace = &engine.metadata.namespace;

        let writes = match &engine.spec.config {
            EngineConfig::Aws(config) => {
                let credential = self.credential_secret(namespace, &config.credential_secret).await?;
                engine_config::aws(mount, config, &credential)?
            }
            EngineConfig::Gcp(config) => {
                let credential = self.credential_secret(namespace, &config.credential_secret).await?;
                vec![engine_config::gcp(mount, config, &credential)?]
            }
            EngineConfig::Azure(config) => {
                let credential = self.credential_secret(namespace, &config.credential_secret).await?;
                vec![engine_config::azure(mount, config, &credential)?]
            }
            EngineConfig::Postgres(_)
            | EngineConfig::MySql(_)
            | EngineConfig::MongoDb(_)
            | EngineConfig::Elasticsearch(_) => {
                let Some((flavor, config)) = engine.spec.config.database() else {
                    return Ok(());
                };
                let reference = AppReference {
                    namespace: if config.database_ref.namespace.is_empty() {
                        namespace.clone()
                    } else {
                        config.database_ref.namespace.clone()
                    },
                    name: config.database_ref.name.clone(),
                };
                if reference.name.is_empty() {
                    return Err(EngineError::InvalidSpec {
                        engine: engine.metadata.key().to_string(),
                        reason: "databaseRef.name is required".to_owned(),
                    });
                }
                let connection = engine_config::resolve_database(
                    self.stores.app_bindings.as_ref(),
                    self.stores.secrets.as_ref(),
                    &reference,
                )
                .await?;
                let db_name = engine_config::database_name(&engine.metadata.cluster_name, &reference);
                vec![engine_config::database(mount, &db_name, flavor, &config.settings, &connection)]
            }
        };

        for write in writes {
            self.apply(&write).await?;
        }
        info!(engine = %engine.metadata.key(), path = %mount, "secret engine configured");
        Ok(())
    }

    /// Remove the engine's policy and every occurrence of it on the auth
    /// role. The mount itself is left in place.
    ///
    /// # Errors
    ///
    /// Any [`BackendError`] other than absence.
    pub async fn delete(&self, engine: &SecretEngine) -> Result<(), EngineError> {
        let policy = naming::vault_name(&engine.metadata);
        ignore_absent(self.client.delete(&format!("sys/policies/acl/{policy}")).await)?;

        match self.auth_role(engine).await {
            Ok((params, role)) => {
                let path = format!("auth/{}/role/{role}", params.auth_path().trim_matches('/'));
                self.modify_auth_role(&path, AbsentRole::Skip, |policies| {
                    let before = policies.len();
                    policies.retain(|p| p != &policy);
                    policies.len() != before
                })
                .await?;
            }
            Err(EngineError::MissingReference { kind, key }) => {
                warn!(engine = %engine.metadata.key(), kind, key = %key, "auth role unknown, skipping policy unbind");
            }
            Err(e) => return Err(e),
        }
        info!(engine = %engine.metadata.key(), policy = %policy, "engine policy removed");
        Ok(())
    }

    async fn auth_role(&self, engine: &SecretEngine) -> Result<(BackendParameters, String), EngineError> {
        let namespace = &engine.metadata.namespace;
        let binding_name = &engine.spec.vault_ref.name;
        let binding: AppBinding = self
            .stores
            .app_bindings
            .get(namespace, binding_name)
            .await?
            .ok_or_else(|| EngineError::MissingReference {
                kind: "AppBinding",
                key: format!("{namespace}/{binding_name}"),
            })?;
        let params = binding.backend_parameters()?;
        let role = params
            .vault_role
            .clone()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| EngineError::MissingReference {
                kind: "vault_role parameter",
                key: format!("{namespace}/{binding_name}"),
            })?;
        Ok((params, role))
    }

    /// Read-modify-write of an auth role's `token_policies`, retried as a
    /// whole on transient failure. `edit` returns `false` to skip the write.
    async fn modify_auth_role<F>(&self, path: &str, absent: AbsentRole, edit: F) -> Result<(), EngineError>
    where
        F: Fn(&mut Vec<String>) -> bool,
    {
        let client = &self.client;
        let edit = &edit;
        retry::retry_with_cancel(
            &self.retry,
            &self.cancel,
            |e: &EngineError| matches!(e, EngineError::Backend(b) if b.is_transient()),
            || async move {
                let value = match client.read::<Value>(path).await {
                    Ok(value) => value,
                    Err(e) if e.is_not_found() => {
                        return match absent {
                            AbsentRole::Skip => {
                                debug!(path, "auth role absent");
                                Ok(())
                            }
                            AbsentRole::Fail => Err(EngineError::MissingReference {
                                kind: "auth role",
                                key: path.to_owned(),
                            }),
                        };
                    }
                    Err(e) => return Err(e.into()),
                };
                let mut role = auth_role_data(path, value)?;
                let mut policies = token_policies(&role);
                if !edit(&mut policies) {
                    return Ok(());
                }
                role.insert("token_policies".to_owned(), json!(policies));
                client.write(path, &Value::Object(role)).await?;
                Ok(())
            },
        )
        .await
    }

    async fn credential_secret(&self, namespace: &str, name: &str) -> Result<Secret, EngineError> {
        self.stores
            .secrets
            .get(namespace, name)
            .await?
            .ok_or_else(|| EngineError::MissingReference {
                kind: "Secret",
                key: format!("{namespace}/{name}"),
            })
    }

    async fn apply(&self, write: &ConfigWrite) -> Result<(), EngineError> {
        match self.client.write(&write.path, &write.body).await {
            Ok(_) => Ok(()),
            Err(BackendError::Rejected {
                path,
                status,
                message,
                ..
            }) if status < 500 && status != 429 => Err(EngineError::ConfigRejected { path, message }),
            Err(e) => Err(e.into()),
        }
    }
}

fn auth_role_data(path: &str, value: Value) -> Result<Map<String, Value>, BackendError> {
    #[derive(Deserialize, Default)]
    struct RoleResponse {
        #[serde(default)]
        data: Map<String, Value>,
    }
    let resp: RoleResponse = decode(path, value)?;
    Ok(resp
        .data
        .into_iter()
        .filter(|(k, _)| AUTH_ROLE_FIELDS.contains(&k.as_str()))
        .collect())
}

fn token_policies(role: &Map<String, Value>) -> Vec<String> {
    role.get("token_policies")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}
