//! Connection bindings: how to reach a service and which secret
//! authenticates against it.

use std::collections::BTreeMap;

use credwarden_storage::ObjectMeta;
use serde::{Deserialize, Serialize};

use super::LocalObjectReference;
use crate::error::BackendError;

/// Placeholders the secrets backend substitutes into database URLs.
const CREDENTIAL_TEMPLATE: &str = "{{username}}:{{password}}@";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppBinding {
    pub metadata: ObjectMeta,
    pub spec: AppBindingSpec,
}

impl credwarden_storage::Resource for AppBinding {
    const KIND: &'static str = "AppBinding";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppBindingSpec {
    /// Application type, e.g. `vault`, `postgres`, `mongodb`.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub app_type: String,
    pub client_config: ConnectionConfig,
    /// Secret holding credentials for the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<LocalObjectReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_transforms: Vec<SecretTransform>,
    /// Free-form, service-specific parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceReference>,
    /// PEM bundle used to verify the service's certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReference {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub name: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

fn default_scheme() -> String {
    "https".to_owned()
}

/// A rewrite applied to a binding's credential data before use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecretTransform {
    RenameKey { from: String, to: String },
    AddKey { key: String, value: String },
    /// Merge every key of another secret in the binding's namespace.
    AddKeysFrom {
        #[serde(rename = "secretRef")]
        secret_ref: LocalObjectReference,
    },
    RemoveKey { key: String },
}

/// Parameters understood on bindings that point at the secrets backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BackendParameters {
    /// Auth role that engine policies are attached to.
    #[serde(default)]
    pub vault_role: Option<String>,
    /// Mount path of that auth role's method. Defaults to `kubernetes`.
    #[serde(default)]
    pub auth_path: Option<String>,
    /// Role used when logging in with a service-account token.
    #[serde(default)]
    pub policy_controller_role: Option<String>,
    /// Extra, unrecognized parameters.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl BackendParameters {
    #[must_use]
    pub fn auth_path(&self) -> &str {
        self.auth_path.as_deref().unwrap_or("kubernetes")
    }
}

impl AppBinding {
    /// Decode [`AppBindingSpec::parameters`] as backend parameters.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] if the parameters are malformed.
    pub fn backend_parameters(&self) -> Result<BackendParameters, BackendError> {
        match &self.spec.parameters {
            None => Ok(BackendParameters::default()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| BackendError::Config {
                reason: format!("app binding {} has invalid parameters: {e}", self.metadata.key()),
            }),
        }
    }

    /// Base URL of the bound service.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] when neither a URL nor a service is set.
    pub fn url(&self) -> Result<String, BackendError> {
        let config = &self.spec.client_config;
        if let Some(url) = config.url.as_deref().filter(|u| !u.is_empty()) {
            return Ok(url.trim_end_matches('/').to_owned());
        }
        let service = self.service()?;
        Ok(format!(
            "{}://{}{}",
            service.scheme,
            self.service_host(service),
            service_suffix(service)
        ))
    }

    /// Connection URL for a database, with `{{username}}`/`{{password}}`
    /// placeholders for the backend to fill in.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] when no address is set, or when an
    /// explicit URL embeds credentials.
    pub fn url_template(&self) -> Result<String, BackendError> {
        let config = &self.spec.client_config;
        if let Some(url) = config.url.as_deref().filter(|u| !u.is_empty()) {
            if embeds_credentials(url) {
                return Err(BackendError::Config {
                    reason: format!(
                        "app binding {}: username/password must not be part of the url, \
                         use {{{{username}}}}/{{{{password}}}} placeholders instead",
                        self.metadata.key()
                    ),
                });
            }
            return Ok(url.to_owned());
        }
        let service = self.service()?;
        Ok(format!(
            "{}://{CREDENTIAL_TEMPLATE}{}{}",
            service.scheme,
            self.service_host(service),
            service_suffix(service)
        ))
    }

    fn service(&self) -> Result<&ServiceReference, BackendError> {
        self.spec
            .client_config
            .service
            .as_ref()
            .ok_or_else(|| BackendError::Config {
                reason: format!("app binding {} has neither url nor service", self.metadata.key()),
            })
    }

    fn service_host(&self, service: &ServiceReference) -> String {
        format!("{}.{}.svc:{}", service.name, self.metadata.namespace, service.port)
    }
}

fn service_suffix(service: &ServiceReference) -> String {
    let mut suffix = String::new();
    if let Some(path) = service.path.as_deref().filter(|p| !p.is_empty()) {
        if !path.starts_with('/') {
            suffix.push('/');
        }
        suffix.push_str(path);
    }
    if let Some(query) = service.query.as_deref().filter(|q| !q.is_empty()) {
        suffix.push('?');
        suffix.push_str(query.trim_start_matches('?'));
    }
    suffix
}

/// Whether `url` has a literal `user[:password]@` authority.
fn embeds_credentials(url: &str) -> bool {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    match authority.rsplit_once('@') {
        Some((userinfo, _)) => !userinfo.contains("{{"),
        None => false,
    }
}
