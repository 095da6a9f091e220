//! Credential issuance and lease handling against a mock backend.

#![allow(clippy::unwrap_used)]

mod common;

use std::time::Duration;

use credwarden_core::credential::{self, CredentialIssuer};
use credwarden_core::resources::{AccessRequestSpec, BackendRole};
use credwarden_core::{CredentialError, LeaseManager, Terminal};
use credwarden_storage::{OwnerReference, Subject};
use serde_json::{Value, json};
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::NAMESPACE;

fn backend_role(name: &str, spec: Value) -> BackendRole {
    serde_json::from_value(json!({
        "metadata": { "namespace": NAMESPACE, "name": name },
        "spec": spec
    }))
    .unwrap()
}

fn database_role() -> BackendRole {
    backend_role(
        "pg-reader",
        json!({
            "vaultRef": { "name": "vault" },
            "database": { "databaseName": "shared-pg", "creationStatements": ["CREATE ROLE x;"] }
        }),
    )
}

fn owner() -> OwnerReference {
    OwnerReference {
        kind: "AccessRequest".to_owned(),
        name: "req".to_owned(),
        uid: "uid-1".to_owned(),
        controller: true,
    }
}

#[tokio::test]
async fn issues_database_credential() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/database/creds/k8s.-.demo.pg-reader"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "lease_id": "database/creds/k8s.-.demo.pg-reader/abc",
            "lease_duration": 3600,
            "renewable": true,
            "data": { "username": "v-app-1", "password": "p4ss", "port": 5432 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let issuer = CredentialIssuer::new(common::client(&server), common::stores_for(&server).await);
    let cred = issuer
        .get_credential(&database_role(), &AccessRequestSpec::default())
        .await
        .unwrap();
    assert_eq!(cred.lease_id, "database/creds/k8s.-.demo.pg-reader/abc");
    assert_eq!(cred.lease_duration, 3600);
    assert!(cred.renewable);
    assert_eq!(cred.data["username"], b"v-app-1");
    assert_eq!(cred.data["port"], b"5432");
    assert!(!format!("{cred:?}").contains("p4ss"));
}

#[tokio::test]
async fn sts_request_passes_ttl_and_arn() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/aws/sts/k8s.-.demo.deploy"))
        .and(query_param("ttl", "15m"))
        .and(query_param("role_arn", "arn:aws:iam::1:role/deploy"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "lease_id": "aws/sts/k8s.-.demo.deploy/xyz",
            "lease_duration": 900,
            "data": { "access_key": "ASIA", "secret_key": "s", "security_token": "t" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let role = backend_role(
        "deploy",
        json!({
            "vaultRef": { "name": "vault" },
            "aws": { "credentialType": "assumed_role", "roleARNs": ["arn:aws:iam::1:role/deploy"] }
        }),
    );
    let request = AccessRequestSpec {
        use_sts: true,
        ttl: Some("15m".to_owned()),
        role_arn: Some("arn:aws:iam::1:role/deploy".to_owned()),
        ..AccessRequestSpec::default()
    };
    let issuer = CredentialIssuer::new(common::client(&server), common::stores_for(&server).await);
    let cred = issuer.get_credential(&role, &request).await.unwrap();
    assert_eq!(cred.data["security_token"], b"t");
}

#[tokio::test]
async fn backend_refusal_is_issuance_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/database/creds/k8s.-.demo.pg-reader"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({ "errors": ["permission denied"] })))
        .mount(&server)
        .await;

    let issuer = CredentialIssuer::new(common::client(&server), common::stores_for(&server).await);
    let err = issuer
        .get_credential(&database_role(), &AccessRequestSpec::default())
        .await
        .unwrap_err();
    assert!(matches!(&err, CredentialError::IssuanceFailed { message, .. } if message == "permission denied"));
}

#[tokio::test]
async fn materialize_and_grant() {
    let server = MockServer::start().await;
    let stores = common::stores_for(&server).await;
    let issuer = CredentialIssuer::new(common::client(&server), stores.clone());

    let mut cred = credwarden_core::credential::IssuedCredential::default();
    cred.data.insert("password".to_owned(), b"p4ss".to_vec());
    let secret = issuer
        .materialize_secret("req-1a2b3c4d", NAMESPACE, &cred, &owner())
        .await
        .unwrap();
    assert_eq!(secret.secret_type, "Opaque");
    assert_eq!(secret.metadata.owner_references, vec![owner()]);

    // A second pass with identical data leaves the stored version alone.
    let again = issuer
        .materialize_secret("req-1a2b3c4d", NAMESPACE, &cred, &owner())
        .await
        .unwrap();
    assert_eq!(again.metadata.resource_version, secret.metadata.resource_version);

    let subjects = vec![Subject::service_account(NAMESPACE, "app")];
    let grant = issuer
        .grant_read_access(
            "accessrequest-demo-req-cred-reader",
            NAMESPACE,
            "req-1a2b3c4d",
            &subjects,
            &owner(),
        )
        .await
        .unwrap();

    let role = stores.rbac_roles.get(NAMESPACE, &grant.role).await.unwrap().unwrap();
    assert_eq!(role.rules.len(), 1);
    assert_eq!(role.rules[0].resource_names, vec!["req-1a2b3c4d".to_owned()]);
    assert_eq!(role.rules[0].verbs, vec!["get".to_owned()]);
    let binding = stores
        .role_bindings
        .get(NAMESPACE, &grant.role_binding)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(binding.subjects, subjects);
    assert_eq!(binding.role_ref.kind, "Role");

    credential::revoke_grant(&stores, NAMESPACE, &grant).await.unwrap();
    credential::delete_secret(&stores, NAMESPACE, "req-1a2b3c4d").await.unwrap();
    assert!(stores.rbac_roles.get(NAMESPACE, &grant.role).await.unwrap().is_none());
    assert!(stores.secrets.get(NAMESPACE, "req-1a2b3c4d").await.unwrap().is_none());
    // Repeat removal is a no-op.
    credential::revoke_grant(&stores, NAMESPACE, &grant).await.unwrap();
}

#[tokio::test]
async fn empty_lease_counts_as_expired() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let leases = LeaseManager::new(common::client(&server));
    assert!(leases.is_lease_expired("").await.unwrap());
    leases.revoke_lease("").await.unwrap();
}

#[tokio::test]
async fn lease_lookup_error_counts_as_expired() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/leases/lookup"))
        .and(body_json(json!({ "lease_id": "database/creds/x/live" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "id": "database/creds/x/live", "ttl": 120 }
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/leases/lookup"))
        .and(body_json(json!({ "lease_id": "database/creds/x/gone" })))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "errors": ["invalid lease"] })))
        .mount(&server)
        .await;

    let leases = LeaseManager::new(common::client(&server));
    assert!(!leases.is_lease_expired("database/creds/x/live").await.unwrap());
    assert!(leases.is_lease_expired("database/creds/x/gone").await.unwrap());
}

#[tokio::test]
async fn revoke_tolerates_unknown_and_invalid_leases() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/leases/revoke"))
        .and(body_json(json!({ "lease_id": "a/missing" })))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/leases/revoke"))
        .and(body_json(json!({ "lease_id": "a/invalid" })))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "errors": ["invalid lease ID"] })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/leases/revoke"))
        .and(body_json(json!({ "lease_id": "a/denied" })))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({ "errors": ["permission denied"] })))
        .mount(&server)
        .await;

    let leases = LeaseManager::new(common::client(&server));
    leases.revoke_lease("a/missing").await.unwrap();
    leases.revoke_lease("a/invalid").await.unwrap();
    let err = leases.revoke_lease("a/denied").await.unwrap_err();
    assert!(matches!(&err, CredentialError::Revoke { lease_id, .. } if lease_id == "a/denied"));
    assert!(!err.is_terminal());
}

#[tokio::test]
async fn renew_with_increment() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/leases/renew"))
        .and(body_json(json!({ "lease_id": "a/1", "increment": 600 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "lease_id": "a/1",
            "lease_duration": 600,
            "renewable": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let leases = LeaseManager::new(common::client(&server));
    let lease = leases.renew_lease("a/1", Some(Duration::from_secs(600))).await.unwrap();
    assert_eq!(lease.id, "a/1");
    assert_eq!(lease.duration, 600);
    assert!(lease.issued_at.is_some());
}
