//! `BackendRole` reconciliation: validate, mount the backend, write the
//! database connection config when one is referenced, then write the role.

use std::sync::Arc;

use async_trait::async_trait;
use credwarden_core::resources::BackendRole;
use credwarden_core::resources::condition::reason;
use credwarden_core::role;
use credwarden_core::store::DynStore;
use credwarden_core::{CancelToken, ReconcileError, RoleProvisioner};
use tracing::info;

use super::{Reconcile, checked, connect, mark_ready};
use crate::state::OperatorState;

pub const FINALIZER: &str = "backendrole.credwarden.dev";

#[derive(Debug, Clone)]
pub struct BackendRoleReconciler {
    state: Arc<OperatorState>,
}

impl BackendRoleReconciler {
    #[must_use]
    pub fn new(state: Arc<OperatorState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Reconcile for BackendRoleReconciler {
    type Resource = BackendRole;

    const FINALIZER: &'static str = FINALIZER;

    fn store(&self) -> &DynStore<BackendRole> {
        &self.state.stores.backend_roles
    }

    async fn apply(&self, backend_role: &BackendRole, _cancel: &CancelToken) -> Result<(), ReconcileError> {
        let state = self.state.as_ref();
        let store = self.store();
        // Spec errors are reported before anything is mounted.
        checked(state, store, backend_role, reason::INVALID_SPEC, role::validate(backend_role)).await?;

        let client = connect(state, store, backend_role, &backend_role.spec.vault_ref.name).await?;
        let provisioner = RoleProvisioner::new(client, state.stores.clone());

        checked(
            state,
            store,
            backend_role,
            reason::ENABLE_FAILED,
            provisioner.ensure_backend_enabled(backend_role).await,
        )
        .await?;
        checked(
            state,
            store,
            backend_role,
            reason::CONFIG_FAILED,
            provisioner.write_connection_config(backend_role).await,
        )
        .await?;
        checked(
            state,
            store,
            backend_role,
            reason::ROLE_FAILED,
            provisioner.write_role(backend_role).await,
        )
        .await?;

        mark_ready(state, store, backend_role).await?;
        info!(
            role = %backend_role.metadata.key(),
            path = %role::role_path(backend_role),
            "backend role reconciled"
        );
        Ok(())
    }

    async fn cleanup(&self, backend_role: &BackendRole, _cancel: &CancelToken) -> Result<(), ReconcileError> {
        let client = self
            .state
            .clients
            .connect(&backend_role.metadata.namespace, &backend_role.spec.vault_ref.name)
            .await?;
        RoleProvisioner::new(client, self.state.stores.clone())
            .delete_role(backend_role)
            .await?;
        Ok(())
    }
}
