//! Operator configuration.
//!
//! Loads configuration from environment variables with sensible defaults.
//! All settings can be overridden via `CREDWARDEN_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use credwarden_core::{ClientConfig, StatusWriter};

use crate::controller::ReconcilerConfig;

/// Operator configuration.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Log level filter (e.g., `info`, `debug`, `credwarden_core=trace`).
    pub log_level: String,
    /// Where resources are read from and written to.
    pub store: StoreBackendType,
    /// Cluster name used in backend object names. Empty means `-`.
    pub cluster_name: String,
    /// Objects reconciled concurrently per controller.
    pub workers: usize,
    /// Time between two passes over a kind's objects.
    pub resync_interval: Duration,
    /// Timeout of a single backend HTTP request.
    pub request_timeout: Duration,
    /// Wait between two attempts of a retried operation.
    pub retry_interval: Duration,
    /// Attempts of a retried read-modify-write operation.
    pub retry_max_attempts: u32,
    /// How long deletion cleanup is retried before the finalizer is dropped.
    pub finalizer_timeout: Duration,
    /// Write status through the status subresource instead of full updates.
    pub enable_status_subresource: bool,
    /// Failed passes tolerated per object generation.
    pub max_requeues: u32,
    /// Address of the health listener.
    pub health_addr: SocketAddr,
}

/// Supported resource store backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackendType {
    /// In-memory (state lost on restart).
    Memory,
    /// One JSON file per object under `root`.
    File { root: PathBuf },
}

impl OperatorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CREDWARDEN_LOG_LEVEL`: log filter (default: `info`, `RUST_LOG` wins)
    /// - `CREDWARDEN_STORE`: `memory` or `file:<dir>` (default: `memory`)
    /// - `CREDWARDEN_CLUSTER_NAME`: cluster name in backend names (default: empty)
    /// - `CREDWARDEN_WORKERS`: concurrent reconciles per kind (default: `4`)
    /// - `CREDWARDEN_RESYNC_INTERVAL`: seconds between passes (default: `30`)
    /// - `CREDWARDEN_REQUEST_TIMEOUT`: backend request timeout in seconds (default: `30`)
    /// - `CREDWARDEN_RETRY_INTERVAL`: milliseconds between retries (default: `500`)
    /// - `CREDWARDEN_RETRY_MAX_ATTEMPTS`: attempts per retried operation (default: `5`)
    /// - `CREDWARDEN_FINALIZER_TIMEOUT`: seconds of cleanup retries on deletion (default: `30`)
    /// - `CREDWARDEN_ENABLE_STATUS_SUBRESOURCE`: default: `true`
    /// - `CREDWARDEN_MAX_REQUEUES`: failed passes per generation (default: `5`)
    /// - `CREDWARDEN_HEALTH_ADDR`: health listener (default: `0.0.0.0:8080`)
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str, default: u64| -> u64 {
            lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };

        let store = match lookup("CREDWARDEN_STORE") {
            Some(v) => match v.trim().strip_prefix("file:") {
                Some(dir) if !dir.is_empty() => StoreBackendType::File { root: PathBuf::from(dir) },
                _ => StoreBackendType::Memory,
            },
            None => StoreBackendType::Memory,
        };

        let health_addr = lookup("CREDWARDEN_HEALTH_ADDR")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let enable_status_subresource = lookup("CREDWARDEN_ENABLE_STATUS_SUBRESOURCE")
            .is_none_or(|v| v != "false" && v != "0");

        Self {
            log_level: lookup("CREDWARDEN_LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
            store,
            cluster_name: lookup("CREDWARDEN_CLUSTER_NAME").unwrap_or_default(),
            workers: usize::try_from(number("CREDWARDEN_WORKERS", 4)).unwrap_or(4).max(1),
            resync_interval: Duration::from_secs(number("CREDWARDEN_RESYNC_INTERVAL", 30).max(1)),
            request_timeout: Duration::from_secs(number("CREDWARDEN_REQUEST_TIMEOUT", 30)),
            retry_interval: Duration::from_millis(number("CREDWARDEN_RETRY_INTERVAL", 500)),
            retry_max_attempts: u32::try_from(number("CREDWARDEN_RETRY_MAX_ATTEMPTS", 5)).unwrap_or(5),
            finalizer_timeout: Duration::from_secs(number("CREDWARDEN_FINALIZER_TIMEOUT", 30)),
            enable_status_subresource,
            max_requeues: u32::try_from(number("CREDWARDEN_MAX_REQUEUES", 5)).unwrap_or(5),
            health_addr,
        }
    }

    /// HTTP settings for backend clients.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: self.request_timeout,
            ..ClientConfig::default()
        }
    }

    #[must_use]
    pub fn status_writer(&self) -> StatusWriter {
        StatusWriter::new(self.enable_status_subresource)
    }

    /// Scheduling and retry settings shared by every controller.
    #[must_use]
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            cluster_name: self.cluster_name.clone(),
            workers: self.workers,
            resync_interval: self.resync_interval,
            retry_interval: self.retry_interval,
            retry_max_attempts: self.retry_max_attempts,
            finalizer_timeout: self.finalizer_timeout,
            max_requeues: self.max_requeues,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> OperatorConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        OperatorConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.store, StoreBackendType::Memory);
        assert!(config.cluster_name.is_empty());
        assert_eq!(config.workers, 4);
        assert_eq!(config.resync_interval, Duration::from_secs(30));
        assert_eq!(config.retry_max_attempts, 5);
        assert_eq!(config.max_requeues, 5);
        assert!(config.enable_status_subresource);
        assert_eq!(config.health_addr, "0.0.0.0:8080".parse().unwrap());
    }

    #[test]
    fn overrides() {
        let config = load(&[
            ("CREDWARDEN_STORE", "file:/var/lib/credwarden"),
            ("CREDWARDEN_CLUSTER_NAME", "prod"),
            ("CREDWARDEN_WORKERS", "8"),
            ("CREDWARDEN_REQUEST_TIMEOUT", "5"),
            ("CREDWARDEN_RETRY_INTERVAL", "100"),
            ("CREDWARDEN_ENABLE_STATUS_SUBRESOURCE", "false"),
            ("CREDWARDEN_HEALTH_ADDR", "127.0.0.1:9000"),
        ]);
        assert_eq!(
            config.store,
            StoreBackendType::File {
                root: PathBuf::from("/var/lib/credwarden")
            }
        );
        assert_eq!(config.workers, 8);
        assert_eq!(config.client_config().timeout, Duration::from_secs(5));
        assert!(!config.status_writer().uses_subresource());
        assert_eq!(config.health_addr.port(), 9000);

        let reconciler = config.reconciler_config();
        assert_eq!(reconciler.cluster_name, "prod");
        assert_eq!(reconciler.retry_interval, Duration::from_millis(100));
    }

    #[test]
    fn malformed_values_fall_back() {
        let config = load(&[
            ("CREDWARDEN_WORKERS", "0"),
            ("CREDWARDEN_RESYNC_INTERVAL", "soon"),
            ("CREDWARDEN_STORE", "file:"),
            ("CREDWARDEN_HEALTH_ADDR", "nowhere"),
        ]);
        assert_eq!(config.workers, 1);
        assert_eq!(config.resync_interval, Duration::from_secs(30));
        assert_eq!(config.store, StoreBackendType::Memory);
        assert_eq!(config.health_addr.port(), 8080);
    }
}
