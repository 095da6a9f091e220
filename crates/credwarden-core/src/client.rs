//! HTTP client for the secrets backend.
//!
//! Paths are relative to `<address>/v1/`. Every request carries the
//! client's token in `X-Vault-Token`. Transport failures, 429 and 5xx are
//! retried a few times with jittered exponential backoff; everything else
//! is mapped straight to a [`BackendError`].

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::BackendError;

/// Header carrying the client token.
pub const TOKEN_HEADER: &str = "X-Vault-Token";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Settings shared by every client the operator builds.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: RETRY_BASE_DELAY,
            user_agent: format!("credwarden/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// TLS trust settings for one backend address.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// PEM bundle of additional trusted roots.
    pub ca_bundle: Option<String>,
    pub insecure_skip_verify: bool,
}

/// Envelope of a backend read or write response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendResponse<T = Value> {
    #[serde(default)]
    pub lease_id: String,
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub data: Option<T>,
    #[serde(default)]
    pub auth: Option<AuthInfo>,
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
}

/// The `auth` block of a login response.
#[derive(Clone, Default, Deserialize)]
pub struct AuthInfo {
    #[serde(default)]
    pub client_token: String,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub renewable: bool,
}

impl std::fmt::Debug for AuthInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthInfo")
            .field("client_token", &"<redacted>")
            .field("policies", &self.policies)
            .field("lease_duration", &self.lease_duration)
            .field("renewable", &self.renewable)
            .finish()
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

/// A client bound to one backend address and, once logged in, one token.
#[derive(Clone)]
pub struct BackendClient {
    address: String,
    token: Option<String>,
    http: reqwest::Client,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl std::fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendClient")
            .field("address", &self.address)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl BackendClient {
    /// Build an unauthenticated client for `address`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] if the address is empty, the CA
    /// bundle cannot be parsed, or the HTTP client cannot be built.
    pub fn new(address: &str, config: &ClientConfig, tls: &TlsConfig) -> Result<Self, BackendError> {
        let address = address.trim().trim_end_matches('/');
        if address.is_empty() {
            return Err(BackendError::Config {
                reason: "secrets backend address is empty".to_owned(),
            });
        }

        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone());

        if let Some(pem) = tls.ca_bundle.as_deref().filter(|p| !p.trim().is_empty()) {
            let certs = reqwest::Certificate::from_pem_bundle(pem.as_bytes()).map_err(|e| {
                BackendError::Config {
                    reason: format!("invalid CA bundle: {e}"),
                }
            })?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }
        if tls.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder.build().map_err(|e| BackendError::Config {
            reason: format!("failed to build HTTP client: {e}"),
        })?;

        Ok(Self {
            address: address.to_owned(),
            token: None,
            http,
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay,
        })
    }

    /// Attach a token. Replaces any previous one.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// GET `path` and decode the whole response body.
    ///
    /// # Errors
    ///
    /// Any [`BackendError`]; [`BackendError::InvalidResponse`] if the body
    /// does not decode as `T`.
    pub async fn read<T: DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        let value = self.send(Method::GET, path, None).await?;
        decode(path, value)
    }

    /// POST `body` to `path`, returning the decoded response (or `Null` for
    /// an empty one).
    ///
    /// # Errors
    ///
    /// Any [`BackendError`].
    pub async fn write(&self, path: &str, body: &Value) -> Result<Value, BackendError> {
        self.send(Method::POST, path, Some(body)).await
    }

    /// PUT `body` to `path`.
    ///
    /// # Errors
    ///
    /// Any [`BackendError`].
    pub async fn put(&self, path: &str, body: &Value) -> Result<Value, BackendError> {
        self.send(Method::PUT, path, Some(body)).await
    }

    /// DELETE `path`. A missing path is reported as
    /// [`BackendError::NotFound`]; wrap with [`ignore_absent`] where
    /// absence is success.
    ///
    /// # Errors
    ///
    /// Any [`BackendError`].
    pub async fn delete(&self, path: &str) -> Result<(), BackendError> {
        self.send(Method::DELETE, path, None).await.map(|_| ())
    }

    /// Issue one request, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Any [`BackendError`] from the final attempt.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, BackendError> {
        let path = path.trim_start_matches('/');
        let url = format!("{}/v1/{path}", self.address);
        let mut attempt: u32 = 0;

        loop {
            match self.send_once(&method, &url, path, body).await {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    debug!(
                        method = %method,
                        path,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        error = %e,
                        "backend request failed, retrying"
                    );
                    sleep_with_jitter(self.retry_base_delay, attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, BackendError> {
        let mut req = self.http.request(method.clone(), url);
        if let Some(token) = &self.token {
            req = req.header(TOKEN_HEADER, token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| self.transport_error(method, path, &e))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| self.transport_error(method, path, &e))?;

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).map_err(|e| BackendError::InvalidResponse {
                path: path.to_owned(),
                reason: e.to_string(),
            });
        }

        if status == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound {
                path: path.to_owned(),
            });
        }

        Err(BackendError::Rejected {
            method: method.to_string(),
            path: path.to_owned(),
            status: status.as_u16(),
            message: error_message(&text, status),
        })
    }

    fn transport_error(&self, method: &Method, path: &str, e: &reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout {
                method: method.to_string(),
                path: path.to_owned(),
            }
        } else {
            BackendError::Unreachable {
                url: self.address.clone(),
                reason: e.to_string(),
            }
        }
    }
}

/// Decode a response value as `T`.
///
/// # Errors
///
/// Returns [`BackendError::InvalidResponse`] on mismatch.
pub fn decode<T: DeserializeOwned>(path: &str, value: Value) -> Result<T, BackendError> {
    let value = if value.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        value
    };
    serde_json::from_value(value).map_err(|e| BackendError::InvalidResponse {
        path: path.to_owned(),
        reason: e.to_string(),
    })
}

/// Treat [`BackendError::NotFound`] as success.
///
/// # Errors
///
/// Passes through every other error.
pub fn ignore_absent<T: Default>(result: Result<T, BackendError>) -> Result<T, BackendError> {
    match result {
        Err(e) if e.is_not_found() => Ok(T::default()),
        other => other,
    }
}

fn error_message(body: &str, status: StatusCode) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .map(|b| b.errors.join("; "))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
}

async fn sleep_with_jitter(base: Duration, attempt: u32) {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let delay = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    // up to 30% jitter
    let jitter = delay.saturating_mul(jitter_permille()) / 1000 * 3 / 10;
    tokio::time::sleep(Duration::from_millis(delay.saturating_add(jitter))).await;
}

/// Pseudo-random value in `[0, 1000)` taken from the clock.
fn jitter_permille() -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    u64::from(nanos % 1000)
}
