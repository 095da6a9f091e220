//! Building authenticated backend clients from connection bindings.
//!
//! The binding's auth secret selects the login method by its `type`:
//!
//! | secret type                           | method     | request body             |
//! |---------------------------------------|------------|--------------------------|
//! | `credwarden.dev/token` / `Opaque`     | token      | none, `token` key is used |
//! | `kubernetes.io/service-account-token` | kubernetes | `{jwt, role}`            |
//! | `kubernetes.io/basic-auth`            | userpass   | `{password}`             |
//! | `credwarden.dev/approle`              | approle    | `{role_id, secret_id}`   |
//!
//! The auth mount path comes from the secret's `credwarden.dev/auth-path`
//! annotation and falls back to the method name.

use credwarden_storage::Secret;
use serde_json::json;
use tracing::{debug, info};

use crate::client::{BackendClient, BackendResponse, ClientConfig, TlsConfig, decode};
use crate::error::BackendError;
use crate::resources::AppBinding;
use crate::store::{DynStore, Stores};

pub const AUTH_PATH_ANNOTATION: &str = "credwarden.dev/auth-path";

pub const SECRET_TYPE_TOKEN: &str = "credwarden.dev/token";
pub const SECRET_TYPE_OPAQUE: &str = "Opaque";
pub const SECRET_TYPE_SERVICE_ACCOUNT: &str = "kubernetes.io/service-account-token";
pub const SECRET_TYPE_BASIC_AUTH: &str = "kubernetes.io/basic-auth";
pub const SECRET_TYPE_APPROLE: &str = "credwarden.dev/approle";

/// Login method selected from an auth secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Token,
    Kubernetes,
    Userpass,
    AppRole,
}

impl AuthMethod {
    #[must_use]
    pub fn from_secret_type(secret_type: &str) -> Option<Self> {
        match secret_type {
            "" | SECRET_TYPE_TOKEN | SECRET_TYPE_OPAQUE => Some(Self::Token),
            SECRET_TYPE_SERVICE_ACCOUNT => Some(Self::Kubernetes),
            SECRET_TYPE_BASIC_AUTH => Some(Self::Userpass),
            SECRET_TYPE_APPROLE => Some(Self::AppRole),
            _ => None,
        }
    }

    #[must_use]
    pub const fn default_path(self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Kubernetes => "kubernetes",
            Self::Userpass => "userpass",
            Self::AppRole => "approle",
        }
    }
}

/// Builds one authenticated client per reconciliation.
#[derive(Clone)]
pub struct ClientFactory {
    app_bindings: DynStore<AppBinding>,
    secrets: DynStore<Secret>,
    config: ClientConfig,
}

impl std::fmt::Debug for ClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientFactory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ClientFactory {
    #[must_use]
    pub fn new(stores: &Stores, config: ClientConfig) -> Self {
        Self {
            app_bindings: stores.app_bindings.clone(),
            secrets: stores.secrets.clone(),
            config,
        }
    }

    /// Load the connection binding `namespace/name`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] if it does not exist.
    pub async fn binding(&self, namespace: &str, name: &str) -> Result<AppBinding, BackendError> {
        self.app_bindings
            .get(namespace, name)
            .await?
            .ok_or_else(|| BackendError::Config {
                reason: format!("app binding {namespace}/{name} not found"),
            })
    }

    /// Connect through the binding `namespace/name`.
    ///
    /// # Errors
    ///
    /// Any [`BackendError`] raised while resolving the binding or logging in.
    pub async fn connect(&self, namespace: &str, name: &str) -> Result<BackendClient, BackendError> {
        let binding = self.binding(namespace, name).await?;
        self.connect_binding(&binding).await
    }

    /// Connect through an already loaded binding.
    ///
    /// # Errors
    ///
    /// Any [`BackendError`] raised while logging in.
    pub async fn connect_binding(&self, binding: &AppBinding) -> Result<BackendClient, BackendError> {
        let tls = TlsConfig {
            ca_bundle: binding.spec.client_config.ca_bundle.clone(),
            insecure_skip_verify: binding.spec.client_config.insecure_skip_tls_verify,
        };
        let client = BackendClient::new(&binding.url()?, &self.config, &tls)?;

        let key = binding.metadata.key();
        let secret_name = binding
            .spec
            .secret
            .as_ref()
            .map(|s| s.name.as_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| BackendError::Config {
                reason: format!("app binding {key} has no auth secret"),
            })?;
        let secret = self
            .secrets
            .get(&key.namespace, secret_name)
            .await?
            .ok_or_else(|| BackendError::Config {
                reason: format!("auth secret {}/{secret_name} not found", key.namespace),
            })?;

        let method = AuthMethod::from_secret_type(&secret.secret_type).ok_or_else(|| {
            BackendError::Config {
                reason: format!(
                    "auth secret {}/{secret_name} has unsupported type '{}'",
                    key.namespace, secret.secret_type
                ),
            }
        })?;
        let auth_path = secret
            .metadata
            .annotations
            .get(AUTH_PATH_ANNOTATION)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| method.default_path())
            .trim_matches('/')
            .to_owned();

        let token = match method {
            AuthMethod::Token => required(&secret, "token")?.to_owned(),
            AuthMethod::Kubernetes => {
                let role = binding
                    .backend_parameters()?
                    .policy_controller_role
                    .filter(|r| !r.is_empty())
                    .ok_or_else(|| BackendError::Config {
                        reason: format!("app binding {key} has no policy_controller_role parameter"),
                    })?;
                let body = json!({ "jwt": required(&secret, "token")?, "role": role });
                login(&client, &format!("auth/{auth_path}/login"), &body).await?
            }
            AuthMethod::Userpass => {
                let username = required(&secret, "username")?;
                let body = json!({ "password": required(&secret, "password")? });
                login(&client, &format!("auth/{auth_path}/login/{username}"), &body).await?
            }
            AuthMethod::AppRole => {
                let body = json!({
                    "role_id": required(&secret, "role_id")?,
                    "secret_id": required(&secret, "secret_id")?,
                });
                login(&client, &format!("auth/{auth_path}/login"), &body).await?
            }
        };

        debug!(binding = %key, method = ?method, "backend client authenticated");
        Ok(client.with_token(token))
    }
}

fn required<'a>(secret: &'a Secret, field: &str) -> Result<&'a str, BackendError> {
    secret
        .get_str(field)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BackendError::Config {
            reason: format!("auth secret {} is missing '{field}'", secret.metadata.key()),
        })
}

async fn login(
    client: &BackendClient,
    path: &str,
    body: &serde_json::Value,
) -> Result<String, BackendError> {
    let value = client.write(path, body).await.map_err(|e| match e {
        BackendError::Rejected { message, .. } => BackendError::Login {
            path: path.to_owned(),
            reason: message,
        },
        BackendError::NotFound { .. } => BackendError::Login {
            path: path.to_owned(),
            reason: "auth method not mounted".to_owned(),
        },
        other => other,
    })?;
    let resp: BackendResponse = decode(path, value)?;
    let token = resp
        .auth
        .map(|a| a.client_token)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| BackendError::Login {
            path: path.to_owned(),
            reason: "response carried no client token".to_owned(),
        })?;
    info!(path, "logged in to secrets backend");
    Ok(token)
}
