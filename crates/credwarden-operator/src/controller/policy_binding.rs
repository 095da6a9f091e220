//! `VaultPolicyBinding` reconciliation.

use std::sync::Arc;

use async_trait::async_trait;
use credwarden_core::resources::VaultPolicyBinding;
use credwarden_core::resources::condition::reason;
use credwarden_core::store::DynStore;
use credwarden_core::{CancelToken, PolicyManager, ReconcileError};
use tracing::info;

use super::{Reconcile, checked, connect, mark_ready};
use crate::state::OperatorState;

pub const FINALIZER: &str = "vaultpolicybinding.credwarden.dev";

#[derive(Debug, Clone)]
pub struct VaultPolicyBindingReconciler {
    state: Arc<OperatorState>,
}

impl VaultPolicyBindingReconciler {
    #[must_use]
    pub fn new(state: Arc<OperatorState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Reconcile for VaultPolicyBindingReconciler {
    type Resource = VaultPolicyBinding;

    const FINALIZER: &'static str = FINALIZER;

    fn store(&self) -> &DynStore<VaultPolicyBinding> {
        &self.state.stores.policy_bindings
    }

    async fn apply(&self, binding: &VaultPolicyBinding, _cancel: &CancelToken) -> Result<(), ReconcileError> {
        let state = self.state.as_ref();
        let store = self.store();
        let client = connect(state, store, binding, &binding.spec.vault_ref.name).await?;
        let manager = PolicyManager::new(client, state.stores.clone());

        checked(
            state,
            store,
            binding,
            reason::BINDING_FAILED,
            manager.ensure_binding(binding).await,
        )
        .await?;
        mark_ready(state, store, binding).await?;
        info!(binding = %binding.metadata.key(), "vault policy binding reconciled");
        Ok(())
    }

    async fn cleanup(&self, binding: &VaultPolicyBinding, _cancel: &CancelToken) -> Result<(), ReconcileError> {
        let client = self
            .state
            .clients
            .connect(&binding.metadata.namespace, &binding.spec.vault_ref.name)
            .await?;
        PolicyManager::new(client, self.state.stores.clone())
            .delete_binding(binding)
            .await?;
        Ok(())
    }
}
