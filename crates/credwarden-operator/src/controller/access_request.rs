//! `AccessRequest` reconciliation.
//!
//! The approval flow owns the request's status, so this controller only
//! evaluates the recorded decision and reports the outcome. A decision is
//! a status change that leaves `generation` alone, so it is folded into the
//! revision to give a freshly approved or denied request a new requeue
//! budget.

use std::sync::Arc;

use async_trait::async_trait;
use credwarden_core::resources::AccessRequest;
use credwarden_core::store::DynStore;
use credwarden_core::{ApprovalFlow, CancelToken, Outcome, ReconcileError};
use credwarden_storage::Resource;
use tracing::{debug, info};

use super::Reconcile;
use crate::state::OperatorState;

pub const FINALIZER: &str = "accessrequest.credwarden.dev";

#[derive(Debug, Clone)]
pub struct AccessRequestReconciler {
    state: Arc<OperatorState>,
    flow: ApprovalFlow,
}

impl AccessRequestReconciler {
    #[must_use]
    pub fn new(state: Arc<OperatorState>) -> Self {
        let flow = ApprovalFlow::new(state.stores.clone(), state.clients.clone(), state.status);
        Self { state, flow }
    }
}

#[async_trait]
impl Reconcile for AccessRequestReconciler {
    type Resource = AccessRequest;

    const FINALIZER: &'static str = FINALIZER;

    fn store(&self) -> &DynStore<AccessRequest> {
        &self.state.stores.access_requests
    }

    fn revision(&self, request: &AccessRequest) -> String {
        format!("{}/{:?}", request.meta().generation, request.decision())
    }

    async fn apply(&self, request: &AccessRequest, _cancel: &CancelToken) -> Result<(), ReconcileError> {
        let key = request.metadata.key();
        match self.flow.evaluate(request).await? {
            Outcome::Pending => debug!(request = %key, "waiting for approval"),
            Outcome::AlreadyIssued => debug!(request = %key, "credential already issued"),
            Outcome::Denied { revoked } => {
                debug!(request = %key, revoked = ?revoked, "access request denied");
            }
            Outcome::Issued { secret, lease_id } => {
                info!(request = %key, secret = %secret, lease_id = %lease_id, "credential issued");
            }
        }
        Ok(())
    }

    async fn cleanup(&self, request: &AccessRequest, _cancel: &CancelToken) -> Result<(), ReconcileError> {
        self.flow.finalize(request).await?;
        Ok(())
    }
}
