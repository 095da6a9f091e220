//! The access-request approval state machine.
//!
//! ```text
//!   Pending ──Approved──▶ issue ─▶ materialize ─▶ persist lease ─▶ grant ─▶ Available
//!      │                    │           │                            │
//!      │                    └───────────┴──── Failed (rolled back) ◀─┘
//!      └────Denied──▶ revoke once, delete secret and grant
//! ```
//!
//! Nothing reaches the secrets backend or the secret store until a decision
//! is recorded on the request.

use tracing::{debug, info, warn};

use crate::auth::ClientFactory;
use crate::client::BackendClient;
use crate::credential::{self, CredentialIssuer, IssuedCredential};
use crate::error::CredentialError;
use crate::lease::{self, LeaseManager};
use crate::naming;
use crate::resources::condition::{self, Condition, ConditionStatus, kind, reason};
use crate::resources::{
    AccessGrantRef, AccessRequest, AccessRequestStatus, BackendRole, Decision, Lease, LocalObjectReference,
    RequestPhase,
};
use crate::store::{StatusWriter, Stores};

/// What one evaluation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// No decision yet.
    Pending,
    /// Denied. `revoked` names the lease revoked by this pass, if any.
    Denied { revoked: Option<String> },
    /// Approved and a live lease already exists.
    AlreadyIssued,
    /// A credential was issued and materialized in this pass.
    Issued { secret: String, lease_id: String },
}

/// Drives access requests through approval, issuance and cleanup.
#[derive(Debug, Clone)]
pub struct ApprovalFlow {
    stores: Stores,
    clients: ClientFactory,
    status: StatusWriter,
}

impl ApprovalFlow {
    #[must_use]
    pub fn new(stores: Stores, clients: ClientFactory, status: StatusWriter) -> Self {
        Self {
            stores,
            clients,
            status,
        }
    }

    /// Advance `request` according to its recorded decision.
    ///
    /// # Errors
    ///
    /// Any [`CredentialError`]. Issuance failures are recorded on the
    /// request as a `Failed` condition before they are returned.
    pub async fn evaluate(&self, request: &AccessRequest) -> Result<Outcome, CredentialError> {
        match request.decision() {
            Decision::Pending => {
                debug!(request = %request.metadata.key(), "access request awaiting approval");
                self.write_status(request, |s| s.phase = RequestPhase::WaitingForApproval)
                    .await?;
                Ok(Outcome::Pending)
            }
            Decision::Denied => self.deny(request).await,
            Decision::Approved => self.approve(request).await,
        }
    }

    /// Tear down everything a request produced: its lease, secret and
    /// access grant. Already-absent pieces are skipped.
    ///
    /// # Errors
    ///
    /// Any [`CredentialError`] other than absence.
    pub async fn finalize(&self, request: &AccessRequest) -> Result<(), CredentialError> {
        let namespace = &request.metadata.namespace;
        if let Some(lease) = request.status.lease.as_ref().filter(|l| !l.id.is_empty()) {
            self.revoke(request, &lease.id).await?;
        }
        if let Some(secret) = &request.status.secret {
            credential::delete_secret(&self.stores, namespace, &secret.name).await?;
        }
        credential::revoke_grant(&self.stores, namespace, &grant_of(request)).await?;
        info!(request = %request.metadata.key(), "access request cleaned up");
        Ok(())
    }

    async fn deny(&self, request: &AccessRequest) -> Result<Outcome, CredentialError> {
        let namespace = &request.metadata.namespace;
        let status = &request.status;

        let mut revoked = None;
        if let Some(lease) = status.lease.as_ref().filter(|l| !l.id.is_empty()) {
            if let Err(e) = self.revoke(request, &lease.id).await {
                return Err(self.fail(request, reason::FAILED_TO_REVOKE_LEASE, e).await);
            }
            revoked = Some(lease.id.clone());
        }
        if let Some(secret) = &status.secret {
            credential::delete_secret(&self.stores, namespace, &secret.name).await?;
        }
        credential::revoke_grant(&self.stores, namespace, &grant_of(request)).await?;

        self.write_status(request, |s| {
            s.phase = RequestPhase::Denied;
            s.lease = None;
            s.secret = None;
            s.access_grant = None;
            condition::remove_condition(&mut s.conditions, kind::AVAILABLE);
            condition::remove_condition(&mut s.conditions, kind::FAILED);
        })
        .await?;
        if revoked.is_some() {
            info!(request = %request.metadata.key(), "access request denied, credential revoked");
        }
        Ok(Outcome::Denied { revoked })
    }

    async fn approve(&self, request: &AccessRequest) -> Result<Outcome, CredentialError> {
        let key = request.metadata.key();
        let role = match credential::resolve_role(self.stores.backend_roles.as_ref(), request).await {
            Ok(role) => role,
            Err(e) => return Err(self.fail(request, reason::FAILED_TO_GET_CREDENTIAL, e).await),
        };
        let client = match self.connect(&role).await {
            Ok(client) => client,
            Err(e) => return Err(self.fail(request, reason::FAILED_TO_GET_CREDENTIAL, e).await),
        };
        let issuer = CredentialIssuer::new(client.clone(), self.stores.clone());
        let leases = LeaseManager::new(client);

        if let Some(existing) = &request.status.lease {
            if !request.has_failed() && !lease_gone(&leases, existing).await? {
                self.write_status(request, |s| s.phase = RequestPhase::Approved).await?;
                return Ok(Outcome::AlreadyIssued);
            }

            // An expired credential is replaced; drop what is left of it first.
            info!(request = %key, lease_id = %existing.id, "replacing expired credential");
            if let Err(e) = leases.revoke_lease(&existing.id).await {
                return Err(self.fail(request, reason::FAILED_TO_REVOKE_LEASE, e).await);
            }
            if let Some(secret) = &request.status.secret {
                credential::delete_secret(&self.stores, &key.namespace, &secret.name).await?;
            }
            let failed = request.has_failed();
            let generation = request.metadata.generation;
            self.write_status(request, |s| {
                s.lease = None;
                s.secret = None;
                if !failed {
                    condition::set_condition(
                        &mut s.conditions,
                        Condition::new(
                            kind::AVAILABLE,
                            ConditionStatus::False,
                            reason::LEASE_EXPIRED,
                            "lease expired, issuing a new credential",
                        )
                        .with_generation(generation),
                    );
                }
            })
            .await?;
        }

        let issued = match issuer.get_credential(&role, &request.spec).await {
            Ok(issued) => issued,
            Err(e) => return Err(self.fail(request, reason::FAILED_TO_GET_CREDENTIAL, e).await),
        };

        let secret_name = naming::credential_secret_name(&request.metadata.name);
        let owner = credential::owner_of(request);
        if let Err(e) = issuer
            .materialize_secret(&secret_name, &key.namespace, &issued, &owner)
            .await
        {
            self.roll_back(request, &leases, &issued, None).await;
            return Err(self.fail(request, reason::FAILED_TO_CREATE_SECRET, e).await);
        }

        let lease = issued.lease();
        let secret_ref = LocalObjectReference::new(secret_name.clone());
        let persisted = self
            .write_status(request, |s| {
                s.lease = Some(lease.clone());
                s.secret = Some(secret_ref.clone());
            })
            .await;
        if let Err(e) = persisted {
            // Unreferenced from here on; revoke it now.
            self.roll_back(request, &leases, &issued, Some(&secret_name)).await;
            return Err(e);
        }

        let grant_name = credential::grant_name(request);
        let grant = match issuer
            .grant_read_access(&grant_name, &key.namespace, &secret_name, &request.spec.subjects, &owner)
            .await
        {
            Ok(grant) => grant,
            Err(e) => {
                self.roll_back(request, &leases, &issued, Some(&secret_name)).await;
                if let Err(clear) = self.clear_lease(request).await {
                    warn!(request = %key, error = %clear, "failed to clear lease after rollback");
                }
                return Err(self.fail(request, reason::FAILED_TO_GRANT_ACCESS, e).await);
            }
        };

        let generation = request.metadata.generation;
        self.write_status(request, |s| {
            s.phase = RequestPhase::Approved;
            s.access_grant = Some(grant.clone());
            condition::remove_condition(&mut s.conditions, kind::FAILED);
            condition::set_condition(
                &mut s.conditions,
                Condition::truthy(kind::AVAILABLE, reason::ISSUED, "credential issued")
                    .with_generation(generation),
            );
        })
        .await?;

        info!(request = %key, secret = %secret_name, lease_id = %issued.lease_id, "access request fulfilled");
        Ok(Outcome::Issued {
            secret: secret_name,
            lease_id: issued.lease_id,
        })
    }

    async fn connect(&self, role: &BackendRole) -> Result<BackendClient, CredentialError> {
        Ok(self
            .clients
            .connect(&role.metadata.namespace, &role.spec.vault_ref.name)
            .await?)
    }

    /// Revoke `lease_id` through the connection of the request's role. A
    /// missing role leaves the lease orphaned.
    async fn revoke(&self, request: &AccessRequest, lease_id: &str) -> Result<(), CredentialError> {
        let role = match credential::resolve_role(self.stores.backend_roles.as_ref(), request).await {
            Ok(role) => role,
            Err(CredentialError::RoleNotFound { key }) => {
                warn!(request = %request.metadata.key(), role = %key, lease_id, "role gone, lease left to expire");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let client = self.connect(&role).await?;
        LeaseManager::new(client).revoke_lease(lease_id).await
    }

    /// Undo a half-finished issuance. Failures are logged, the original
    /// error is what the caller reports.
    async fn roll_back(
        &self,
        request: &AccessRequest,
        leases: &LeaseManager,
        issued: &IssuedCredential,
        secret: Option<&str>,
    ) {
        let key = request.metadata.key();
        if let Err(e) = leases.revoke_lease(&issued.lease_id).await {
            warn!(request = %key, lease_id = %issued.lease_id, error = %e, "failed to revoke lease during rollback");
        }
        if let Some(secret) = secret {
            if let Err(e) = credential::delete_secret(&self.stores, &key.namespace, secret).await {
                warn!(request = %key, secret, error = %e, "failed to delete secret during rollback");
            }
        }
    }

    /// Record a `Failed` condition and hand the error back.
    async fn fail(&self, request: &AccessRequest, why: &'static str, error: CredentialError) -> CredentialError {
        let message = error.to_string();
        let generation = request.metadata.generation;
        let phase = match request.decision() {
            Decision::Denied => RequestPhase::Denied,
            _ => RequestPhase::Approved,
        };
        let recorded = self
            .write_status(request, |s| {
                s.phase = phase;
                condition::set_condition(
                    &mut s.conditions,
                    Condition::truthy(kind::FAILED, why, message.clone()).with_generation(generation),
                );
                condition::set_condition(
                    &mut s.conditions,
                    Condition::new(kind::AVAILABLE, ConditionStatus::False, why, message.clone())
                        .with_generation(generation),
                );
            })
            .await;
        if let Err(e) = recorded {
            warn!(request = %request.metadata.key(), error = %e, "failed to record failure condition");
        }
        warn!(request = %request.metadata.key(), reason = why, error = %error, "credential issuance failed");
        error
    }

    /// Drop the lease and secret references, whatever the caller's snapshot
    /// says.
    async fn clear_lease(&self, request: &AccessRequest) -> Result<(), CredentialError> {
        let meta = &request.metadata;
        self.status
            .update(self.stores.access_requests.as_ref(), &meta.namespace, &meta.name, |r| {
                r.status.lease = None;
                r.status.secret = None;
            })
            .await?;
        Ok(())
    }

    /// Persist a status change, skipping the write when it would not change
    /// the caller's snapshot.
    async fn write_status<F>(&self, request: &AccessRequest, mutate: F) -> Result<(), CredentialError>
    where
        F: Fn(&mut AccessRequestStatus),
    {
        let generation = request.metadata.generation;
        let mut probe = request.status.clone();
        mutate(&mut probe);
        probe.observed_generation = generation;
        if probe == request.status {
            return Ok(());
        }

        let meta = &request.metadata;
        self.status
            .update(self.stores.access_requests.as_ref(), &meta.namespace, &meta.name, |r| {
                mutate(&mut r.status);
                r.status.observed_generation = r.metadata.generation;
            })
            .await?;
        Ok(())
    }
}

/// The grant a request owns: the recorded one, or the deterministic name
/// when the final status write never happened.
fn grant_of(request: &AccessRequest) -> AccessGrantRef {
    request.status.access_grant.clone().unwrap_or_else(|| {
        let name = credential::grant_name(request);
        AccessGrantRef {
            role: name.clone(),
            role_binding: name,
        }
    })
}

/// A lease is gone once its duration has run out or the backend no longer
/// reports it live.
async fn lease_gone(leases: &LeaseManager, lease: &Lease) -> Result<bool, CredentialError> {
    if lease::lease_elapsed(lease) {
        return Ok(true);
    }
    leases.is_lease_expired(&lease.id).await
}
