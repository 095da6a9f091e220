//! Shared fixtures: a mock secrets backend and in-memory stores wired to it.

#![allow(dead_code, clippy::unwrap_used)]

use std::time::Duration;

use credwarden_core::client::{BackendClient, ClientConfig, TlsConfig};
use credwarden_core::resources::AppBinding;
use credwarden_core::Stores;
use credwarden_storage::{ObjectMeta, Secret};
use serde_json::{Value, json};
use wiremock::MockServer;

pub const NAMESPACE: &str = "demo";
pub const VAULT_BINDING: &str = "vault";
pub const ROOT_TOKEN: &str = "s.root-token";

/// Client config without retries, so error paths answer at once.
pub fn client_config() -> ClientConfig {
    ClientConfig {
        timeout: Duration::from_secs(5),
        max_retries: 0,
        ..ClientConfig::default()
    }
}

pub fn client(server: &MockServer) -> BackendClient {
    BackendClient::new(&server.uri(), &client_config(), &TlsConfig::default())
        .unwrap()
        .with_token(ROOT_TOKEN)
}

pub fn secret(namespace: &str, name: &str, secret_type: &str, pairs: &[(&str, &str)]) -> Secret {
    let mut secret = Secret {
        metadata: ObjectMeta::new(namespace, name),
        secret_type: secret_type.to_owned(),
        ..Secret::default()
    };
    for (k, v) in pairs {
        secret.data.insert((*k).to_owned(), v.as_bytes().to_vec());
    }
    secret
}

pub fn binding(namespace: &str, name: &str, spec: Value) -> AppBinding {
    serde_json::from_value(json!({
        "metadata": { "namespace": namespace, "name": name },
        "spec": spec
    }))
    .unwrap()
}

/// Stores holding the `demo/vault` binding to `server`, authenticating
/// with a static token, and attaching engine policies to auth role
/// `operator` on the `kubernetes` auth mount.
pub async fn stores_for(server: &MockServer) -> Stores {
    let stores = Stores::in_memory();
    stores
        .secrets
        .create(secret(
            NAMESPACE,
            "vault-token",
            "credwarden.dev/token",
            &[("token", ROOT_TOKEN)],
        ))
        .await
        .unwrap();
    stores
        .app_bindings
        .create(binding(
            NAMESPACE,
            VAULT_BINDING,
            json!({
                "type": "vault",
                "clientConfig": { "url": server.uri() },
                "secret": { "name": "vault-token" },
                "parameters": { "vault_role": "operator", "auth_path": "kubernetes" }
            }),
        ))
        .await
        .unwrap();
    stores
}
