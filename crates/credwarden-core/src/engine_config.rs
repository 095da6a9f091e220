//! Connection-configuration payloads for engine mounts.
//!
//! Cloud engines take one config write built from a credential secret.
//! Database engines take one config per database at
//! `<mount>/config/<db-name>`, built from the database's connection binding;
//! roles that reference a database write the same payload.

use std::collections::BTreeMap;

use credwarden_storage::{ResourceStore, Secret, StoreError};
use serde_json::{Map, Value, json};

use crate::error::{BackendError, EngineError, RoleError};
use crate::naming;
use crate::resources::{
    AppBinding, AppReference, AwsConfiguration, AzureConfiguration, ConnectionSettings, DatabaseFlavor,
    GcpConfiguration,
};
use crate::transform;

pub const AWS_ACCESS_KEY: &str = "access_key";
pub const AWS_SECRET_KEY: &str = "secret_key";
pub const GCP_SERVICE_ACCOUNT_KEY: &str = "sa.json";
pub const AZURE_SUBSCRIPTION_ID: &str = "subscription-id";
pub const AZURE_TENANT_ID: &str = "tenant-id";
pub const AZURE_CLIENT_ID: &str = "client-id";
pub const AZURE_CLIENT_SECRET: &str = "client-secret";

/// One write against the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigWrite {
    pub path: String,
    pub body: Value,
}

/// `<mount>/config/root` and, with a lease config, `<mount>/config/lease`.
///
/// # Errors
///
/// Returns [`EngineError::MissingReference`] if a credential key is absent.
pub fn aws(mount: &str, config: &AwsConfiguration, credential: &Secret) -> Result<Vec<ConfigWrite>, EngineError> {
    let mut root = Map::new();
    root.insert("access_key".into(), credential_value(credential, AWS_ACCESS_KEY)?.into());
    root.insert("secret_key".into(), credential_value(credential, AWS_SECRET_KEY)?.into());
    root.insert("region".into(), config.region.clone().into());
    insert_opt(&mut root, "iam_endpoint", config.iam_endpoint.as_deref());
    insert_opt(&mut root, "sts_endpoint", config.sts_endpoint.as_deref());
    if let Some(max_retries) = config.max_retries {
        root.insert("max_retries".into(), max_retries.into());
    }

    let mut writes = vec![ConfigWrite {
        path: format!("{mount}/config/root"),
        body: Value::Object(root),
    }];
    if let Some(lease) = &config.lease_config {
        writes.push(ConfigWrite {
            path: format!("{mount}/config/lease"),
            body: json!({ "lease": lease.lease, "lease_max": lease.lease_max }),
        });
    }
    Ok(writes)
}

/// `<mount>/config` with the service account key.
///
/// # Errors
///
/// Returns [`EngineError::MissingReference`] if `sa.json` is absent.
pub fn gcp(mount: &str, config: &GcpConfiguration, credential: &Secret) -> Result<ConfigWrite, EngineError> {
    let mut body = Map::new();
    body.insert(
        "credentials".into(),
        credential_value(credential, GCP_SERVICE_ACCOUNT_KEY)?.into(),
    );
    insert_opt(&mut body, "ttl", config.ttl.as_deref());
    insert_opt(&mut body, "max_ttl", config.max_ttl.as_deref());
    Ok(ConfigWrite {
        path: format!("{mount}/config"),
        body: Value::Object(body),
    })
}

/// `<mount>/config`. Subscription and tenant are required, the client
/// id/secret pair is optional.
///
/// # Errors
///
/// Returns [`EngineError::MissingReference`] if a required key is absent.
pub fn azure(mount: &str, config: &AzureConfiguration, credential: &Secret) -> Result<ConfigWrite, EngineError> {
    let mut body = Map::new();
    body.insert(
        "subscription_id".into(),
        credential_value(credential, AZURE_SUBSCRIPTION_ID)?.into(),
    );
    body.insert("tenant_id".into(), credential_value(credential, AZURE_TENANT_ID)?.into());
    insert_opt(&mut body, "client_id", credential.get_str(AZURE_CLIENT_ID));
    insert_opt(&mut body, "client_secret", credential.get_str(AZURE_CLIENT_SECRET));
    insert_opt(&mut body, "environment", config.environment.as_deref());
    Ok(ConfigWrite {
        path: format!("{mount}/config"),
        body: Value::Object(body),
    })
}

/// A database's address plus its (transformed) credentials.
#[derive(Clone, Default)]
pub struct DatabaseConnection {
    pub url: String,
    pub credentials: BTreeMap<String, String>,
}

impl std::fmt::Debug for DatabaseConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConnection")
            .field("url", &self.url)
            .field("credential_keys", &self.credentials.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Why a database reference could not be resolved.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("{kind} '{key}' not found")]
    Missing { kind: &'static str, key: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ResolveError> for EngineError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::Missing { kind, key } => Self::MissingReference { kind, key },
            ResolveError::Backend(e) => Self::Backend(e),
            ResolveError::Store(e) => Self::Store(e),
        }
    }
}

impl From<ResolveError> for RoleError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::Missing { kind, key } => Self::MissingReference { kind, key },
            ResolveError::Backend(e) => Self::Backend(e),
            ResolveError::Store(e) => Self::Store(e),
        }
    }
}

/// Load the database binding, build its URL template and read its
/// credentials through the binding's secret transforms.
///
/// # Errors
///
/// Returns [`ResolveError::Missing`] if the binding or its secret is absent.
pub async fn resolve_database(
    app_bindings: &dyn ResourceStore<AppBinding>,
    secrets: &dyn ResourceStore<Secret>,
    reference: &AppReference,
) -> Result<DatabaseConnection, ResolveError> {
    let binding = app_bindings
        .get(&reference.namespace, &reference.name)
        .await?
        .ok_or_else(|| ResolveError::Missing {
            kind: "AppBinding",
            key: format!("{}/{}", reference.namespace, reference.name),
        })?;
    let url = binding.url_template()?;

    let mut credentials = BTreeMap::new();
    if let Some(secret_ref) = binding.spec.secret.as_ref().filter(|s| !s.name.is_empty()) {
        let secret = secrets
            .get(&reference.namespace, &secret_ref.name)
            .await?
            .ok_or_else(|| ResolveError::Missing {
                kind: "Secret",
                key: format!("{}/{}", reference.namespace, secret_ref.name),
            })?;
        credentials = transform::string_data(&secret);
        transform::apply_transforms(
            secrets,
            &reference.namespace,
            &binding.spec.secret_transforms,
            &mut credentials,
        )
        .await
        .map_err(|e| match e {
            StoreError::NotFound { kind, key } => ResolveError::Missing { kind, key },
            other => ResolveError::Store(other),
        })?;
    }

    Ok(DatabaseConnection { url, credentials })
}

/// Backend name of a database's connection config.
#[must_use]
pub fn database_name(cluster: &str, reference: &AppReference) -> String {
    naming::vault_name_for(cluster, &reference.namespace, &reference.name)
}

/// `<mount>/config/<db_name>`.
#[must_use]
pub fn database(
    mount: &str,
    db_name: &str,
    flavor: DatabaseFlavor,
    settings: &ConnectionSettings,
    connection: &DatabaseConnection,
) -> ConfigWrite {
    let plugin = settings
        .plugin_name
        .as_deref()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| flavor.default_plugin());
    let allowed_roles = if settings.allowed_roles.is_empty() {
        vec!["*".to_owned()]
    } else {
        settings.allowed_roles.clone()
    };

    let mut body = Map::new();
    body.insert("plugin_name".into(), plugin.into());
    body.insert("allowed_roles".into(), allowed_roles.into());
    body.insert("connection_url".into(), connection.url.clone().into());
    for key in ["username", "password"] {
        if let Some(value) = connection.credentials.get(key) {
            body.insert(key.into(), value.clone().into());
        }
    }
    if settings.max_open_connections > 0 {
        body.insert("max_open_connections".into(), settings.max_open_connections.into());
    }
    if settings.max_idle_connections > 0 {
        body.insert("max_idle_connections".into(), settings.max_idle_connections.into());
    }
    insert_opt(&mut body, "max_connection_lifetime", settings.max_connection_lifetime.as_deref());
    if flavor == DatabaseFlavor::MongoDb {
        insert_opt(&mut body, "write_concern", settings.write_concern.as_deref());
    }

    ConfigWrite {
        path: format!("{mount}/config/{db_name}"),
        body: Value::Object(body),
    }
}

fn credential_value(secret: &Secret, key: &str) -> Result<String, EngineError> {
    secret
        .get_str(key)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| EngineError::MissingReference {
            kind: "credential key",
            key: format!("{}:{key}", secret.metadata.key()),
        })
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        map.insert(key.to_owned(), v.into());
    }
}
