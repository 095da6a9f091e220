//! credwarden operator entry point.
//!
//! Opens the resource store, starts one controller per resource kind and
//! serves the health probes until SIGINT or SIGTERM. Controllers observe
//! the same shutdown channel and are given a bounded time to finish.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use credwarden_core::{ClientFactory, Stores};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use credwarden_operator::config::{OperatorConfig, StoreBackendType};
use credwarden_operator::controller::{
    AccessRequestReconciler, BackendRoleReconciler, Controller, SecretEngineReconciler,
    VaultPolicyBindingReconciler, VaultPolicyReconciler,
};
use credwarden_operator::health;
use credwarden_operator::state::OperatorState;

/// Time controllers get to finish their current pass after shutdown.
const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(store = ?config.store, cluster = %config.cluster_name, "credwarden operator starting");

    let stores = match &config.store {
        StoreBackendType::Memory => {
            info!("using in-memory resource store (state will not persist)");
            Stores::in_memory()
        }
        StoreBackendType::File { root } => {
            std::fs::create_dir_all(root)
                .with_context(|| format!("failed to create store directory {}", root.display()))?;
            info!(root = %root.display(), "using file resource store");
            Stores::on_disk(root)
        }
    };
    let clients = ClientFactory::new(&stores, config.client_config());
    let state = Arc::new(OperatorState::new(
        stores,
        clients,
        config.status_writer(),
        config.reconciler_config(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = spawn_controllers(&state, &shutdown_rx);
    state.set_ready(true);

    let listener = TcpListener::bind(config.health_addr)
        .await
        .with_context(|| format!("failed to bind health listener to {}", config.health_addr))?;
    info!(addr = %config.health_addr, "health probes listening");

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, health::router(Arc::clone(&state)))
        .with_graceful_shutdown(async move {
            shutdown_signal(shutdown_tx).await;
            shutdown_state.set_ready(false);
        })
        .await
        .context("health server error")?;

    info!("waiting for controllers to stop");
    if tokio::time::timeout(WORKER_SHUTDOWN_TIMEOUT, drain(workers)).await.is_err() {
        warn!(
            timeout_secs = WORKER_SHUTDOWN_TIMEOUT.as_secs(),
            "controllers did not stop in time"
        );
    }

    info!("credwarden operator stopped");
    Ok(())
}

fn spawn_controllers(state: &Arc<OperatorState>, shutdown: &watch::Receiver<bool>) -> JoinSet<()> {
    let config = state.config.clone();
    let mut workers = JoinSet::new();
    workers.spawn(
        Controller::new(SecretEngineReconciler::new(Arc::clone(state)), config.clone()).run(shutdown.clone()),
    );
    workers.spawn(
        Controller::new(BackendRoleReconciler::new(Arc::clone(state)), config.clone()).run(shutdown.clone()),
    );
    workers.spawn(
        Controller::new(AccessRequestReconciler::new(Arc::clone(state)), config.clone()).run(shutdown.clone()),
    );
    workers.spawn(
        Controller::new(VaultPolicyReconciler::new(Arc::clone(state)), config.clone()).run(shutdown.clone()),
    );
    workers.spawn(
        Controller::new(VaultPolicyBindingReconciler::new(Arc::clone(state)), config).run(shutdown.clone()),
    );
    workers
}

async fn drain(mut workers: JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "controller task aborted");
        }
    }
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping controllers");
    let _ = shutdown_tx.send(true);
}
