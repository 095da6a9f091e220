//! Shared operator state.
//!
//! A single [`OperatorState`] is built at startup and shared by every
//! controller and the health server via `Arc`.

use std::sync::atomic::{AtomicBool, Ordering};

use credwarden_core::{ClientFactory, StatusWriter, Stores};

use crate::controller::ReconcilerConfig;

pub struct OperatorState {
    /// One resource store per kind.
    pub stores: Stores,
    /// Builds an authenticated backend client from a connection binding.
    pub clients: ClientFactory,
    pub status: StatusWriter,
    pub config: ReconcilerConfig,
    ready: AtomicBool,
}

impl std::fmt::Debug for OperatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorState")
            .field("status", &self.status)
            .field("config", &self.config)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl OperatorState {
    #[must_use]
    pub fn new(stores: Stores, clients: ClientFactory, status: StatusWriter, config: ReconcilerConfig) -> Self {
        Self {
            stores,
            clients,
            status,
            config,
            ready: AtomicBool::new(false),
        }
    }

    /// Whether every controller is running and shutdown has not begun.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }
}
