//! `SecretEngine`: a credential-issuing mount in the secrets backend.

use std::fmt;

use credwarden_storage::ObjectMeta;
use serde::{Deserialize, Serialize};

use super::{AppReference, LocalObjectReference, ResourceStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretEngine {
    pub metadata: ObjectMeta,
    pub spec: SecretEngineSpec,
    #[serde(default)]
    pub status: ResourceStatus,
}

impl_resource!(SecretEngine, "SecretEngine");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretEngineSpec {
    /// Connection binding of the secrets backend.
    pub vault_ref: LocalObjectReference,
    /// Mount path. Defaults to the engine kind's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(flatten)]
    pub config: EngineConfig,
}

impl SecretEngine {
    /// Effective mount path.
    #[must_use]
    pub fn path(&self) -> &str {
        self.spec
            .path
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| self.spec.config.kind().default_path())
    }
}

/// Backend kind of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Aws,
    Gcp,
    Azure,
    Database,
}

impl EngineKind {
    /// Mount type passed to the backend; also the default mount path.
    #[must_use]
    pub const fn mount_type(self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
            Self::Database => "database",
        }
    }

    #[must_use]
    pub const fn default_path(self) -> &'static str {
        self.mount_type()
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mount_type())
    }
}

/// Per-kind engine configuration. Exactly one key is present on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EngineConfig {
    Aws(AwsConfiguration),
    Gcp(GcpConfiguration),
    Azure(AzureConfiguration),
    Postgres(DatabaseConfiguration),
    #[serde(rename = "mysql")]
    MySql(DatabaseConfiguration),
    #[serde(rename = "mongodb")]
    MongoDb(DatabaseConfiguration),
    Elasticsearch(DatabaseConfiguration),
}

impl EngineConfig {
    #[must_use]
    pub const fn kind(&self) -> EngineKind {
        match self {
            Self::Aws(_) => EngineKind::Aws,
            Self::Gcp(_) => EngineKind::Gcp,
            Self::Azure(_) => EngineKind::Azure,
            Self::Postgres(_) | Self::MySql(_) | Self::MongoDb(_) | Self::Elasticsearch(_) => {
                EngineKind::Database
            }
        }
    }

    /// The database flavor and its configuration, for database engines.
    #[must_use]
    pub const fn database(&self) -> Option<(DatabaseFlavor, &DatabaseConfiguration)> {
        match self {
            Self::Postgres(c) => Some((DatabaseFlavor::Postgres, c)),
            Self::MySql(c) => Some((DatabaseFlavor::MySql, c)),
            Self::MongoDb(c) => Some((DatabaseFlavor::MongoDb, c)),
            Self::Elasticsearch(c) => Some((DatabaseFlavor::Elasticsearch, c)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsConfiguration {
    /// Secret with `access_key` and `secret_key`.
    pub credential_secret: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iam_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sts_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_config: Option<LeaseConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseConfig {
    pub lease: String,
    pub lease_max: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpConfiguration {
    /// Secret with the service account key under `sa.json`.
    pub credential_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    #[serde(default, rename = "maxTTL", skip_serializing_if = "Option::is_none")]
    pub max_ttl: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureConfiguration {
    /// Secret with `subscription-id`, `tenant-id` and optionally
    /// `client-id` / `client-secret`.
    pub credential_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfiguration {
    pub database_ref: AppReference,
    #[serde(flatten)]
    pub settings: ConnectionSettings,
}

/// Connection options for a database engine config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_name: Option<String>,
    /// Roles allowed to use this connection. Empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_roles: Vec<String>,
    #[serde(default)]
    pub max_open_connections: i64,
    #[serde(default)]
    pub max_idle_connections: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connection_lifetime: Option<String>,
    /// MongoDB only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_concern: Option<String>,
}

/// Database plugin family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseFlavor {
    #[default]
    Postgres,
    #[serde(rename = "mysql")]
    MySql,
    #[serde(rename = "mongodb")]
    MongoDb,
    Elasticsearch,
}

impl DatabaseFlavor {
    #[must_use]
    pub const fn default_plugin(self) -> &'static str {
        match self {
            Self::Postgres => "postgresql-database-plugin",
            Self::MySql => "mysql-database-plugin",
            Self::MongoDb => "mongodb-database-plugin",
            Self::Elasticsearch => "elasticsearch-database-plugin",
        }
    }
}
