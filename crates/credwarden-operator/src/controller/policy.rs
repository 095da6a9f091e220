//! `VaultPolicy` reconciliation.

use std::sync::Arc;

use async_trait::async_trait;
use credwarden_core::resources::VaultPolicy;
use credwarden_core::resources::condition::reason;
use credwarden_core::store::DynStore;
use credwarden_core::{CancelToken, PolicyManager, ReconcileError};
use tracing::info;

use super::{Reconcile, checked, connect, mark_ready};
use crate::state::OperatorState;

pub const FINALIZER: &str = "vaultpolicy.credwarden.dev";

#[derive(Debug, Clone)]
pub struct VaultPolicyReconciler {
    state: Arc<OperatorState>,
}

impl VaultPolicyReconciler {
    #[must_use]
    pub fn new(state: Arc<OperatorState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Reconcile for VaultPolicyReconciler {
    type Resource = VaultPolicy;

    const FINALIZER: &'static str = FINALIZER;

    fn store(&self) -> &DynStore<VaultPolicy> {
        &self.state.stores.policies
    }

    async fn apply(&self, policy: &VaultPolicy, _cancel: &CancelToken) -> Result<(), ReconcileError> {
        let state = self.state.as_ref();
        let store = self.store();
        let client = connect(state, store, policy, &policy.spec.vault_ref.name).await?;
        let manager = PolicyManager::new(client, state.stores.clone());

        let name = checked(
            state,
            store,
            policy,
            reason::POLICY_FAILED,
            manager.ensure_resource_policy(policy).await,
        )
        .await?;
        mark_ready(state, store, policy).await?;
        info!(policy = %policy.metadata.key(), name = %name, "vault policy reconciled");
        Ok(())
    }

    async fn cleanup(&self, policy: &VaultPolicy, _cancel: &CancelToken) -> Result<(), ReconcileError> {
        let client = self
            .state
            .clients
            .connect(&policy.metadata.namespace, &policy.spec.vault_ref.name)
            .await?;
        PolicyManager::new(client, self.state.stores.clone())
            .delete_policy(&policy.policy_name())
            .await?;
        Ok(())
    }
}
