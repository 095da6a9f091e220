//! The approval state machine end to end, against a mock backend.

#![allow(clippy::unwrap_used, clippy::panic)]

mod common;

use chrono::Utc;
use credwarden_core::resources::condition::{self, Condition, kind, reason};
use credwarden_core::resources::{
    AccessGrantRef, AccessRequest, BackendRole, Lease, LocalObjectReference, RequestPhase,
};
use credwarden_core::{ApprovalFlow, ClientFactory, Outcome, StatusWriter, Stores};
use credwarden_storage::{ObjectMeta, RbacRole, RoleBinding};
use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::NAMESPACE;

const CREDS_PATH: &str = "/v1/database/creds/k8s.-.demo.pg-reader";
const LEASE_ID: &str = "database/creds/k8s.-.demo.pg-reader/abc";

fn flow(stores: &Stores) -> ApprovalFlow {
    ApprovalFlow::new(
        stores.clone(),
        ClientFactory::new(stores, common::client_config()),
        StatusWriter::default(),
    )
}

async fn seed_role(stores: &Stores) {
    let role: BackendRole = serde_json::from_value(json!({
        "metadata": { "namespace": NAMESPACE, "name": "pg-reader" },
        "spec": {
            "vaultRef": { "name": "vault" },
            "database": { "databaseName": "shared-pg", "creationStatements": ["CREATE ROLE x;"] }
        }
    }))
    .unwrap();
    stores.backend_roles.create(role).await.unwrap();
}

fn request(decision: &str) -> AccessRequest {
    let mut req: AccessRequest = serde_json::from_value(json!({
        "metadata": { "namespace": NAMESPACE, "name": "req" },
        "spec": {
            "roleRef": { "name": "pg-reader" },
            "subjects": [{ "kind": "ServiceAccount", "name": "app", "namespace": NAMESPACE }]
        }
    }))
    .unwrap();
    condition::set_condition(
        &mut req.status.conditions,
        Condition::truthy(decision, "ByAdmin", "decided"),
    );
    req
}

async fn reload(stores: &Stores) -> AccessRequest {
    stores.access_requests.get(NAMESPACE, "req").await.unwrap().unwrap()
}

/// An approved request whose credential was issued earlier.
async fn seed_issued(stores: &Stores, decision: &str) -> AccessRequest {
    let grant = "accessrequest-demo-req-cred-reader";
    stores
        .secrets
        .create(common::secret(NAMESPACE, "req-0000aaaa", "Opaque", &[("password", "p")]))
        .await
        .unwrap();
    stores
        .rbac_roles
        .create(RbacRole {
            metadata: ObjectMeta::new(NAMESPACE, grant),
            rules: Vec::new(),
        })
        .await
        .unwrap();
    stores
        .role_bindings
        .create(RoleBinding {
            metadata: ObjectMeta::new(NAMESPACE, grant),
            ..RoleBinding::default()
        })
        .await
        .unwrap();

    let mut req = request(decision);
    req.status.lease = Some(Lease {
        id: LEASE_ID.to_owned(),
        duration: 3600,
        renewable: true,
        issued_at: Some(Utc::now()),
    });
    req.status.secret = Some(LocalObjectReference::new("req-0000aaaa"));
    req.status.access_grant = Some(AccessGrantRef {
        role: grant.to_owned(),
        role_binding: grant.to_owned(),
    });
    stores.access_requests.create(req).await.unwrap()
}

#[tokio::test]
async fn approval_issues_exactly_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CREDS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "lease_id": LEASE_ID,
            "lease_duration": 3600,
            "renewable": true,
            "data": { "username": "v-app-1", "password": "p4ss" }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/leases/lookup"))
        .and(body_json(json!({ "lease_id": LEASE_ID })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "id": LEASE_ID, "ttl": 3599 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let stores = common::stores_for(&server).await;
    seed_role(&stores).await;
    let stored = stores.access_requests.create(request(kind::APPROVED)).await.unwrap();

    let outcome = flow(&stores).evaluate(&stored).await.unwrap();
    let Outcome::Issued { secret, lease_id } = outcome else {
        panic!("expected issuance, got {outcome:?}");
    };
    assert_eq!(lease_id, LEASE_ID);
    assert!(secret.starts_with("req-"));

    let materialized = stores.secrets.get(NAMESPACE, &secret).await.unwrap().unwrap();
    assert_eq!(materialized.get_str("username"), Some("v-app-1"));
    assert_eq!(materialized.metadata.owner_references[0].kind, "AccessRequest");

    let after = reload(&stores).await;
    assert_eq!(after.status.phase, RequestPhase::Approved);
    assert_eq!(after.status.lease.as_ref().unwrap().id, LEASE_ID);
    assert_eq!(after.status.secret.as_ref().unwrap().name, secret);
    let available = condition::find_condition(&after.status.conditions, kind::AVAILABLE).unwrap();
    assert!(available.is_true());
    assert_eq!(available.reason, reason::ISSUED);

    let grant = after.status.access_grant.clone().unwrap();
    let role = stores.rbac_roles.get(NAMESPACE, &grant.role).await.unwrap().unwrap();
    assert_eq!(role.rules[0].resource_names, vec![secret.clone()]);

    // A second pass leaves the live lease alone.
    let again = flow(&stores).evaluate(&after).await.unwrap();
    assert_eq!(again, Outcome::AlreadyIssued);
    assert_eq!(stores.secrets.list(Some(NAMESPACE)).await.unwrap().len(), 2);
}

#[tokio::test]
async fn lease_unknown_to_backend_is_replaced() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/leases/lookup"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "errors": ["invalid lease"] })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/leases/revoke"))
        .and(body_json(json!({ "lease_id": LEASE_ID })))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "errors": ["invalid lease"] })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(CREDS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "lease_id": "database/creds/k8s.-.demo.pg-reader/def",
            "lease_duration": 3600,
            "data": { "username": "v-app-2", "password": "n3w" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let stores = common::stores_for(&server).await;
    seed_role(&stores).await;
    let mut stored = seed_issued(&stores, kind::APPROVED).await;
    // No issue time: only the backend can tell the lease is gone.
    stored.status.lease.as_mut().unwrap().issued_at = None;
    let stored = stores.access_requests.update_status(stored).await.unwrap();

    let outcome = flow(&stores).evaluate(&stored).await.unwrap();
    let Outcome::Issued { secret, lease_id } = outcome else {
        panic!("expected reissue, got {outcome:?}");
    };
    assert_eq!(lease_id, "database/creds/k8s.-.demo.pg-reader/def");
    assert!(stores.secrets.get(NAMESPACE, "req-0000aaaa").await.unwrap().is_none());
    let fresh = stores.secrets.get(NAMESPACE, &secret).await.unwrap().unwrap();
    assert_eq!(fresh.get_str("username"), Some("v-app-2"));

    let after = reload(&stores).await;
    assert_eq!(after.status.lease.as_ref().unwrap().id, lease_id);
    let available = condition::find_condition(&after.status.conditions, kind::AVAILABLE).unwrap();
    assert_eq!(available.reason, reason::ISSUED);
}

#[tokio::test]
async fn expired_lease_reissue_failure_keeps_expiry_visible() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/leases/revoke"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(CREDS_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "errors": ["backend sealed"] })))
        .mount(&server)
        .await;

    let stores = common::stores_for(&server).await;
    seed_role(&stores).await;
    let mut stored = seed_issued(&stores, kind::APPROVED).await;
    stored.status.lease.as_mut().unwrap().issued_at = Some(Utc::now() - chrono::Duration::hours(2));
    let stored = stores.access_requests.update_status(stored).await.unwrap();

    assert!(flow(&stores).evaluate(&stored).await.is_err());
    let after = reload(&stores).await;
    assert!(after.status.lease.is_none());
    assert!(after.status.secret.is_none());
    let failed = condition::find_condition(&after.status.conditions, kind::FAILED).unwrap();
    assert_eq!(failed.reason, reason::FAILED_TO_GET_CREDENTIAL);
}

#[tokio::test]
async fn lost_status_write_rolls_back_issuance() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CREDS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "lease_id": LEASE_ID,
            "lease_duration": 3600,
            "data": { "username": "v-app-1", "password": "p4ss" }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/leases/revoke"))
        .and(body_json(json!({ "lease_id": LEASE_ID })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let stores = common::stores_for(&server).await;
    seed_role(&stores).await;
    // Deleted from the store while the pass was running.
    let vanished = request(kind::APPROVED);

    assert!(flow(&stores).evaluate(&vanished).await.is_err());
    let secrets = stores.secrets.list(Some(NAMESPACE)).await.unwrap();
    assert_eq!(secrets.len(), 1);
    assert_eq!(secrets[0].metadata.name, "vault-token");
}

#[tokio::test]
async fn issuance_failure_is_recorded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CREDS_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "errors": ["unknown role"] })))
        .mount(&server)
        .await;

    let stores = common::stores_for(&server).await;
    seed_role(&stores).await;
    let stored = stores.access_requests.create(request(kind::APPROVED)).await.unwrap();

    assert!(flow(&stores).evaluate(&stored).await.is_err());
    let after = reload(&stores).await;
    let failed = condition::find_condition(&after.status.conditions, kind::FAILED).unwrap();
    assert_eq!(failed.reason, reason::FAILED_TO_GET_CREDENTIAL);
    assert!(failed.message.contains("unknown role"));
    assert!(after.status.lease.is_none());
    assert!(after.status.secret.is_none());
}

#[tokio::test]
async fn denial_revokes_once() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/leases/revoke"))
        .and(body_json(json!({ "lease_id": LEASE_ID })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let stores = common::stores_for(&server).await;
    seed_role(&stores).await;
    let stored = seed_issued(&stores, kind::DENIED).await;

    let outcome = flow(&stores).evaluate(&stored).await.unwrap();
    assert_eq!(
        outcome,
        Outcome::Denied {
            revoked: Some(LEASE_ID.to_owned())
        }
    );
    assert!(stores.secrets.get(NAMESPACE, "req-0000aaaa").await.unwrap().is_none());
    assert!(stores.rbac_roles.list(Some(NAMESPACE)).await.unwrap().is_empty());
    assert!(stores.role_bindings.list(Some(NAMESPACE)).await.unwrap().is_empty());

    let after = reload(&stores).await;
    assert_eq!(after.status.phase, RequestPhase::Denied);
    assert!(after.status.lease.is_none());

    let again = flow(&stores).evaluate(&after).await.unwrap();
    assert_eq!(again, Outcome::Denied { revoked: None });
}

#[tokio::test]
async fn denial_removes_unrecorded_grant() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/leases/revoke"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let stores = common::stores_for(&server).await;
    seed_role(&stores).await;
    let mut stored = seed_issued(&stores, kind::DENIED).await;
    stored.status.access_grant = None;
    let stored = stores.access_requests.update_status(stored).await.unwrap();

    flow(&stores).evaluate(&stored).await.unwrap();
    assert!(stores.rbac_roles.list(Some(NAMESPACE)).await.unwrap().is_empty());
    assert!(stores.role_bindings.list(Some(NAMESPACE)).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_revocation_on_denial_is_recorded() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/leases/revoke"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "errors": ["internal error"] })))
        .mount(&server)
        .await;

    let stores = common::stores_for(&server).await;
    seed_role(&stores).await;
    let stored = seed_issued(&stores, kind::DENIED).await;

    assert!(flow(&stores).evaluate(&stored).await.is_err());
    let after = reload(&stores).await;
    assert_eq!(after.status.phase, RequestPhase::Denied);
    assert_eq!(after.status.lease.as_ref().unwrap().id, LEASE_ID);
    let failed = condition::find_condition(&after.status.conditions, kind::FAILED).unwrap();
    assert_eq!(failed.reason, reason::FAILED_TO_REVOKE_LEASE);
    assert!(stores.secrets.get(NAMESPACE, "req-0000aaaa").await.unwrap().is_some());
}

#[tokio::test]
async fn denial_with_deleted_role_leaves_lease() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;

    let stores = common::stores_for(&server).await;
    let stored = seed_issued(&stores, kind::DENIED).await;

    flow(&stores).evaluate(&stored).await.unwrap();
    assert!(stores.secrets.get(NAMESPACE, "req-0000aaaa").await.unwrap().is_none());
}

#[tokio::test]
async fn finalize_cleans_up() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/leases/revoke"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "errors": ["invalid lease"] })))
        .expect(1)
        .mount(&server)
        .await;

    let stores = common::stores_for(&server).await;
    seed_role(&stores).await;
    let stored = seed_issued(&stores, kind::APPROVED).await;

    flow(&stores).finalize(&stored).await.unwrap();
    assert!(stores.secrets.get(NAMESPACE, "req-0000aaaa").await.unwrap().is_none());
    assert!(stores.rbac_roles.list(Some(NAMESPACE)).await.unwrap().is_empty());

    // A request that never issued anything finalizes without backend calls.
    let bare: AccessRequest = request(kind::APPROVED);
    flow(&stores).finalize(&bare).await.unwrap();
}
