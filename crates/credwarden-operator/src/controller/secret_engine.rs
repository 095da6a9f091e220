//! `SecretEngine` reconciliation.
//!
//! Order of operations: write the engine policy, bind it to the operator's
//! auth role, mount the engine, write its connection configuration. Each
//! step is idempotent, so a failed pass simply resumes from the top.

use std::sync::Arc;

use async_trait::async_trait;
use credwarden_core::resources::SecretEngine;
use credwarden_core::resources::condition::reason;
use credwarden_core::store::DynStore;
use credwarden_core::{CancelToken, EngineManager, ReconcileError};
use tracing::info;

use super::{Reconcile, checked, connect, mark_ready};
use crate::state::OperatorState;

pub const FINALIZER: &str = "secretengine.credwarden.dev";

#[derive(Debug, Clone)]
pub struct SecretEngineReconciler {
    state: Arc<OperatorState>,
}

impl SecretEngineReconciler {
    #[must_use]
    pub fn new(state: Arc<OperatorState>) -> Self {
        Self { state }
    }

    fn manager(&self, client: credwarden_core::BackendClient, cancel: &CancelToken) -> EngineManager {
        EngineManager::new(client, self.state.stores.clone())
            .with_retry(self.state.config.retry_policy(), cancel.clone())
    }
}

#[async_trait]
impl Reconcile for SecretEngineReconciler {
    type Resource = SecretEngine;

    const FINALIZER: &'static str = FINALIZER;

    fn store(&self) -> &DynStore<SecretEngine> {
        &self.state.stores.secret_engines
    }

    async fn apply(&self, engine: &SecretEngine, cancel: &CancelToken) -> Result<(), ReconcileError> {
        let state = self.state.as_ref();
        let store = self.store();
        let client = connect(state, store, engine, &engine.spec.vault_ref.name).await?;
        let manager = self.manager(client, cancel);

        let policy = checked(state, store, engine, reason::POLICY_FAILED, manager.create_policy(engine).await).await?;
        checked(
            state,
            store,
            engine,
            reason::BINDING_FAILED,
            manager.bind_policy_to_auth_role(engine).await,
        )
        .await?;
        let mounted = checked(
            state,
            store,
            engine,
            reason::ENABLE_FAILED,
            manager.enable(engine.path(), engine.spec.config.kind()).await,
        )
        .await?;
        checked(state, store, engine, reason::CONFIG_FAILED, manager.configure(engine).await).await?;

        mark_ready(state, store, engine).await?;
        info!(
            engine = %engine.metadata.key(),
            path = engine.path(),
            policy = %policy,
            mounted,
            "secret engine reconciled"
        );
        Ok(())
    }

    async fn cleanup(&self, engine: &SecretEngine, cancel: &CancelToken) -> Result<(), ReconcileError> {
        let client = self
            .state
            .clients
            .connect(&engine.metadata.namespace, &engine.spec.vault_ref.name)
            .await?;
        self.manager(client, cancel).delete(engine).await?;
        Ok(())
    }
}
