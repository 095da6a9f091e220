//! Policies and policy bindings against a mock backend.

#![allow(clippy::unwrap_used)]

mod common;

use credwarden_core::resources::{VaultPolicy, VaultPolicyBinding};
use credwarden_core::{PolicyError, PolicyManager};
use serde_json::{Value, json};
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::NAMESPACE;

fn vault_policy(name: &str, spec: Value) -> VaultPolicy {
    serde_json::from_value(json!({
        "metadata": { "namespace": NAMESPACE, "name": name },
        "spec": spec
    }))
    .unwrap()
}

fn policy_binding(policies: Value) -> VaultPolicyBinding {
    serde_json::from_value(json!({
        "metadata": { "namespace": NAMESPACE, "name": "app" },
        "spec": {
            "vaultRef": { "name": "vault" },
            "policies": policies,
            "subjectRef": {
                "kubernetes": {
                    "serviceAccountNames": ["app"],
                    "serviceAccountNamespaces": [NAMESPACE]
                }
            }
        }
    }))
    .unwrap()
}

#[tokio::test]
async fn writes_resource_policy() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/policies/acl/k8s.-.demo.reader"))
        .and(body_json(json!({ "policy": "path \"secret/*\" { capabilities = [\"read\"] }" })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let manager = PolicyManager::new(common::client(&server), common::stores_for(&server).await);
    let policy = vault_policy(
        "reader",
        json!({
            "vaultRef": { "name": "vault" },
            "policyDocument": "path \"secret/*\" { capabilities = [\"read\"] }"
        }),
    );
    assert_eq!(manager.ensure_resource_policy(&policy).await.unwrap(), "k8s.-.demo.reader");
}

#[tokio::test]
async fn ensuring_a_policy_twice_is_stable() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/policies/acl/k8s.-.demo.reader"))
        .respond_with(ResponseTemplate::new(204))
        .expect(2)
        .mount(&server)
        .await;

    let manager = PolicyManager::new(common::client(&server), common::stores_for(&server).await);
    let policy = vault_policy(
        "reader",
        json!({
            "vaultRef": { "name": "vault" },
            "policyDocument": "path \"secret/*\" { capabilities = [\"read\"] }"
        }),
    );
    let first = manager.ensure_resource_policy(&policy).await.unwrap();
    let second = manager.ensure_resource_policy(&policy).await.unwrap();
    assert_eq!(first, second);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].body, requests[1].body);
}

#[tokio::test]
async fn policy_without_document_is_invalid() {
    let server = MockServer::start().await;
    let manager = PolicyManager::new(common::client(&server), common::stores_for(&server).await);
    let policy = vault_policy("empty", json!({ "vaultRef": { "name": "vault" } }));
    let err = manager.ensure_resource_policy(&policy).await.unwrap_err();
    assert!(matches!(err, PolicyError::InvalidSpec { .. }));
}

#[tokio::test]
async fn binding_resolves_refs_and_dedups() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/kubernetes/role/k8s.-.demo.app"))
        .and(body_json(json!({
            "token_policies": ["default", "custom-reader"],
            "bound_service_account_names": ["app"],
            "bound_service_account_namespaces": [NAMESPACE]
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let stores = common::stores_for(&server).await;
    stores
        .policies
        .create(vault_policy(
            "reader",
            json!({ "vaultRef": { "name": "vault" }, "vaultPolicyName": "custom-reader" }),
        ))
        .await
        .unwrap();
    let manager = PolicyManager::new(common::client(&server), stores);
    let binding = policy_binding(json!([
        { "name": "default" },
        { "ref": "reader" },
        { "name": "custom-reader" }
    ]));
    manager.ensure_binding(&binding).await.unwrap();
}

#[tokio::test]
async fn ensuring_a_binding_twice_is_stable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/kubernetes/role/k8s.-.demo.app"))
        .respond_with(ResponseTemplate::new(204))
        .expect(2)
        .mount(&server)
        .await;

    let manager = PolicyManager::new(common::client(&server), common::stores_for(&server).await);
    let binding = policy_binding(json!([{ "name": "default" }, { "name": "team-reader" }]));
    manager.ensure_binding(&binding).await.unwrap();
    manager.ensure_binding(&binding).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let first: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let second: Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(first, second);
    assert_eq!(first["token_policies"], json!(["default", "team-reader"]));
}

#[tokio::test]
async fn unknown_policy_ref_writes_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;

    let manager = PolicyManager::new(common::client(&server), common::stores_for(&server).await);
    let err = manager
        .ensure_binding(&policy_binding(json!([{ "ref": "nope" }])))
        .await
        .unwrap_err();
    assert!(matches!(err, PolicyError::MissingReference { kind: "VaultPolicy", .. }));

    let err = manager
        .ensure_binding(&policy_binding(json!([{ "name": "a", "ref": "b" }])))
        .await
        .unwrap_err();
    assert!(matches!(err, PolicyError::InvalidSpec { .. }));
}

#[tokio::test]
async fn deletes_tolerate_absence() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1/auth/kubernetes/role/k8s.-.demo.app"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/sys/policies/acl/k8s.-.demo.reader"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let manager = PolicyManager::new(common::client(&server), common::stores_for(&server).await);
    manager
        .delete_binding(&policy_binding(json!([{ "name": "default" }])))
        .await
        .unwrap();
    manager.delete_policy("k8s.-.demo.reader").await.unwrap();
}
