//! Lease lookup, revocation and renewal.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::client::{BackendClient, BackendResponse, decode};
use crate::error::{BackendError, CredentialError};
use crate::resources::Lease;

/// Tracks the leases behind issued credentials.
#[derive(Debug, Clone)]
pub struct LeaseManager {
    client: BackendClient,
}

impl LeaseManager {
    #[must_use]
    pub fn new(client: BackendClient) -> Self {
        Self { client }
    }

    /// Whether a lease is gone. An empty id counts as expired, and so does
    /// any error answer from the backend.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Backend`] if the backend cannot be reached.
    pub async fn is_lease_expired(&self, lease_id: &str) -> Result<bool, CredentialError> {
        if lease_id.is_empty() {
            return Ok(true);
        }
        match self
            .client
            .put("sys/leases/lookup", &json!({ "lease_id": lease_id }))
            .await
        {
            Ok(_) => Ok(false),
            Err(BackendError::Rejected { status, message, .. }) => {
                debug!(lease_id, status, message = %message, "lease lookup answered with an error");
                Ok(true)
            }
            Err(BackendError::NotFound { .. }) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Revoke a lease. Empty ids, unknown leases and leases the backend
    /// reports as invalid all count as revoked.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Revoke`] for any other failure.
    pub async fn revoke_lease(&self, lease_id: &str) -> Result<(), CredentialError> {
        if lease_id.is_empty() {
            return Ok(());
        }
        match self
            .client
            .put("sys/leases/revoke", &json!({ "lease_id": lease_id }))
            .await
        {
            Ok(_) => {
                info!(lease_id, "lease revoked");
                Ok(())
            }
            Err(BackendError::NotFound { .. }) => {
                debug!(lease_id, "lease already gone");
                Ok(())
            }
            Err(BackendError::Rejected { status: 400, message, .. })
                if message.to_ascii_lowercase().contains("invalid lease") =>
            {
                warn!(lease_id, message = %message, "backend reports lease invalid, treating as revoked");
                Ok(())
            }
            Err(source) => Err(CredentialError::Revoke {
                lease_id: lease_id.to_owned(),
                source,
            }),
        }
    }

    /// Extend a renewable lease, optionally by `increment`. Returns the
    /// lease as the backend now reports it.
    ///
    /// # Errors
    ///
    /// Any [`BackendError`].
    pub async fn renew_lease(&self, lease_id: &str, increment: Option<Duration>) -> Result<Lease, CredentialError> {
        let mut body = json!({ "lease_id": lease_id });
        if let Some(increment) = increment {
            body["increment"] = json!(increment.as_secs());
        }
        let value = self.client.put("sys/leases/renew", &body).await?;
        let resp: BackendResponse = decode("sys/leases/renew", value)?;
        let lease = Lease {
            id: if resp.lease_id.is_empty() {
                lease_id.to_owned()
            } else {
                resp.lease_id
            },
            duration: resp.lease_duration,
            renewable: resp.renewable,
            issued_at: Some(Utc::now()),
        };
        info!(lease_id = %lease.id, duration = lease.duration, "lease renewed");
        Ok(lease)
    }
}

/// Whether `lease` has run out by wall clock. Leases without a known
/// expiry are assumed live.
#[must_use]
pub fn lease_elapsed(lease: &Lease) -> bool {
    lease.expires_at().is_some_and(|at| at <= Utc::now())
}
