//! Shared fixtures: a mock secrets backend and operator state wired to it.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use credwarden_core::resources::AppBinding;
use credwarden_core::{ClientConfig, ClientFactory, StatusWriter, Stores};
use credwarden_operator::controller::ReconcilerConfig;
use credwarden_operator::state::OperatorState;
use credwarden_storage::{ObjectMeta, Secret};
use serde_json::{Value, json};
use wiremock::MockServer;

pub const NAMESPACE: &str = "demo";

/// Short intervals and a two-failure requeue budget.
pub fn reconciler_config() -> ReconcilerConfig {
    ReconcilerConfig {
        workers: 2,
        resync_interval: Duration::from_millis(50),
        retry_interval: Duration::from_millis(10),
        retry_max_attempts: 2,
        finalizer_timeout: Duration::from_millis(50),
        max_requeues: 2,
        ..ReconcilerConfig::default()
    }
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

/// Deserialize `{metadata, spec}` in the test namespace.
pub fn resource<T: serde::de::DeserializeOwned>(name: &str, spec: Value) -> T {
    serde_json::from_value(json!({
        "metadata": { "namespace": NAMESPACE, "name": name },
        "spec": spec
    }))
    .unwrap()
}

/// Operator state whose `demo/vault` binding points at `server` with a
/// static token and attaches engine policies to auth role `operator`.
pub async fn state_for(server: &MockServer, config: ReconcilerConfig) -> Arc<OperatorState> {
    let stores = Stores::in_memory();
    stores
        .secrets
        .create(secret(NAMESPACE, "vault-token", "credwarden.dev/token", &[("token", "s.root")]))
        .await
        .unwrap();
    let binding: AppBinding = resource(
        "vault",
        json!({
            "type": "vault",
            "clientConfig": { "url": server.uri() },
            "secret": { "name": "vault-token" },
            "parameters": { "vault_role": "operator", "auth_path": "kubernetes" }
        }),
    );
    stores.app_bindings.create(binding).await.unwrap();

    let clients = ClientFactory::new(
        &stores,
        ClientConfig {
            timeout: Duration::from_secs(5),
            max_retries: 0,
            ..ClientConfig::default()
        },
    );
    Arc::new(OperatorState::new(stores, clients, StatusWriter::default(), config))
}
