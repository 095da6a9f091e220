//! Level-triggered reconciliation shared by every resource kind.
//!
//! A [`Controller`] lists its store once per resync interval and hands each
//! object to a [`Reconcile`] implementation on a bounded pool of tasks.
//! Objects that keep failing are skipped once they exhaust the requeue
//! budget for their current revision, and picked up again when it changes.
//!
//! Deletion follows the finalizer protocol: the finalizer is added before
//! the first backend write, and on deletion cleanup is retried until
//! `finalizer_timeout` elapses. The finalizer is then removed whether or not
//! cleanup succeeded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use credwarden_core::resources::condition::{self, Condition, ConditionStatus, kind, reason};
use credwarden_core::resources::{
    BackendRole, Phase, ResourceStatus, SecretEngine, VaultPolicy, VaultPolicyBinding,
};
use credwarden_core::store::{self, DynStore};
use credwarden_core::{
    BackendClient, CancelToken, EngineError, PolicyError, ReconcileError, RetryPolicy, RoleError, Terminal,
    retry,
};
use credwarden_storage::{ObjectKey, Resource};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::state::OperatorState;

pub mod access_request;
pub mod backend_role;
pub mod policy;
pub mod policy_binding;
pub mod secret_engine;

pub use access_request::AccessRequestReconciler;
pub use backend_role::BackendRoleReconciler;
pub use policy::VaultPolicyReconciler;
pub use policy_binding::VaultPolicyBindingReconciler;
pub use secret_engine::SecretEngineReconciler;

/// Scheduling and retry settings shared by every controller.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Stamped on objects that carry no cluster name of their own.
    pub cluster_name: String,
    pub workers: usize,
    pub resync_interval: Duration,
    pub retry_interval: Duration,
    pub retry_max_attempts: u32,
    pub finalizer_timeout: Duration,
    /// Failed passes per revision before an object is left alone. Zero
    /// disables the limit.
    pub max_requeues: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            workers: 4,
            resync_interval: Duration::from_secs(30),
            retry_interval: Duration::from_millis(500),
            retry_max_attempts: 5,
            finalizer_timeout: Duration::from_secs(30),
            max_requeues: 5,
        }
    }
}

impl ReconcilerConfig {
    /// Budget for read-modify-write sequences against the backend.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.retry_interval, self.retry_max_attempts)
    }

    /// Budget for deletion cleanup.
    #[must_use]
    pub fn cleanup_policy(&self) -> RetryPolicy {
        RetryPolicy::with_timeout(self.retry_interval, self.finalizer_timeout)
    }
}

/// Per-kind reconciliation logic driven by a [`Controller`].
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    type Resource: Resource;

    /// Finalizer guarding this kind's backend cleanup.
    const FINALIZER: &'static str;

    fn store(&self) -> &DynStore<Self::Resource>;

    /// Identifies the desired state the requeue budget is counted against.
    fn revision(&self, object: &Self::Resource) -> String {
        object.meta().generation.to_string()
    }

    /// Drive the backend towards `object`'s spec.
    async fn apply(&self, object: &Self::Resource, cancel: &CancelToken) -> Result<(), ReconcileError>;

    /// Remove everything `apply` created. Absent pieces are not errors.
    async fn cleanup(&self, object: &Self::Resource, cancel: &CancelToken) -> Result<(), ReconcileError>;
}

/// Runs one [`Reconcile`] implementation over its store.
pub struct Controller<C: Reconcile> {
    reconciler: Arc<C>,
    config: Arc<ReconcilerConfig>,
    permits: Arc<Semaphore>,
    requeues: RequeueTracker,
}

impl<C: Reconcile> std::fmt::Debug for Controller<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("kind", &Self::KIND)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C: Reconcile> Controller<C> {
    const KIND: &'static str = <C::Resource as Resource>::KIND;

    #[must_use]
    pub fn new(reconciler: C, config: ReconcilerConfig) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
            requeues: RequeueTracker::new(config.max_requeues),
            config: Arc::new(config),
        }
    }

    /// Reconcile every resync interval until `shutdown` flips. A pass in
    /// flight observes the same signal through its cancel token.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }
        let cancel = CancelToken::new(shutdown.clone());
        let mut interval = tokio::time::interval(self.config.resync_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            kind = Self::KIND,
            workers = self.config.workers,
            resync_secs = self.config.resync_interval.as_secs(),
            "controller started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => self.reconcile_all(&cancel).await,
                _ = shutdown.changed() => {
                    info!(kind = Self::KIND, "controller shutting down");
                    return;
                }
            }
        }
    }

    /// One pass over every stored object of the kind.
    pub async fn reconcile_all(&mut self, cancel: &CancelToken) {
        let objects = match self.reconciler.store().list(None).await {
            Ok(objects) => objects,
            Err(e) => {
                warn!(kind = Self::KIND, error = %e, "failed to list resources, will retry next pass");
                return;
            }
        };
        let live: HashSet<ObjectKey> = objects.iter().map(|o| o.meta().key()).collect();
        self.requeues.retain(&live);

        let mut tasks = JoinSet::new();
        for object in objects {
            if cancel.is_cancelled() {
                break;
            }
            let key = object.meta().key();
            let revision = self.reconciler.revision(&object);
            if !object.meta().is_being_deleted() && self.requeues.is_exhausted(&key, &revision) {
                debug!(kind = Self::KIND, key = %key, "requeue limit reached, waiting for a change");
                continue;
            }
            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                break;
            };
            let reconciler = Arc::clone(&self.reconciler);
            let config = Arc::clone(&self.config);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = process(reconciler.as_ref(), &config, object, &cancel).await;
                drop(permit);
                (key, revision, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, revision, result)) => self.settle(key, revision, result),
                Err(e) => error!(kind = Self::KIND, error = %e, "reconcile task aborted"),
            }
        }
    }

    fn settle(&mut self, key: ObjectKey, revision: String, result: Result<(), ReconcileError>) {
        let err = match result {
            Ok(()) => {
                self.requeues.forget(&key);
                return;
            }
            Err(e) => e,
        };
        if err.is_cancelled() {
            debug!(kind = Self::KIND, key = %key, "reconcile cancelled");
            return;
        }

        let terminal = err.is_terminal();
        let (failures, exhausted) = self.requeues.record_failure(key.clone(), revision, terminal);
        if exhausted {
            error!(
                kind = Self::KIND,
                key = %key,
                failures,
                terminal,
                error = %err,
                "reconcile failed, giving up until the resource changes"
            );
        } else {
            warn!(
                kind = Self::KIND,
                key = %key,
                failures,
                error = %err,
                "reconcile failed, will retry next pass"
            );
        }
    }
}

/// Handle one object: finalize it if it is being deleted, otherwise adopt
/// it and apply its spec.
async fn process<C: Reconcile>(
    reconciler: &C,
    config: &ReconcilerConfig,
    object: C::Resource,
    cancel: &CancelToken,
) -> Result<(), ReconcileError> {
    let meta = object.meta();
    if meta.is_being_deleted() {
        if !meta.has_finalizer(C::FINALIZER) {
            return Ok(());
        }
        return finalize(reconciler, config, &object, cancel).await;
    }
    let object = adopt(reconciler, config, object).await?;
    reconciler.apply(&object, cancel).await
}

/// Add the finalizer and the configured cluster name if either is missing.
async fn adopt<C: Reconcile>(
    reconciler: &C,
    config: &ReconcilerConfig,
    object: C::Resource,
) -> Result<C::Resource, ReconcileError> {
    let cluster = config.cluster_name.as_str();
    let meta = object.meta();
    let needs_cluster = meta.cluster_name.is_empty() && !cluster.is_empty();
    if meta.has_finalizer(C::FINALIZER) && !needs_cluster {
        return Ok(object);
    }

    let key = meta.key();
    let adopted = store::patch(
        reconciler.store().as_ref(),
        &key.namespace,
        &key.name,
        |o: &mut C::Resource| {
            let meta = o.meta_mut();
            let mut changed = meta.add_finalizer(C::FINALIZER);
            if meta.cluster_name.is_empty() && !cluster.is_empty() {
                meta.cluster_name = cluster.to_owned();
                changed = true;
            }
            changed
        },
    )
    .await?;
    debug!(kind = <C::Resource as Resource>::KIND, key = %key, "finalizer added");
    Ok(adopted)
}

async fn finalize<C: Reconcile>(
    reconciler: &C,
    config: &ReconcilerConfig,
    object: &C::Resource,
    cancel: &CancelToken,
) -> Result<(), ReconcileError> {
    let kind_name = <C::Resource as Resource>::KIND;
    let key = object.meta().key();
    let cleaned = retry::retry_with_cancel(
        &config.cleanup_policy(),
        cancel,
        |e: &ReconcileError| !e.is_terminal(),
        || reconciler.cleanup(object, cancel),
    )
    .await;

    match cleaned {
        Ok(()) => info!(kind = kind_name, key = %key, "cleanup finished"),
        Err(e) if e.is_cancelled() => return Err(e),
        Err(e) => warn!(
            kind = kind_name,
            key = %key,
            error = %e,
            timeout_secs = config.finalizer_timeout.as_secs(),
            "cleanup did not succeed before the finalizer timeout, removing finalizer anyway"
        ),
    }

    let removed = store::patch(
        reconciler.store().as_ref(),
        &key.namespace,
        &key.name,
        |o: &mut C::Resource| o.meta_mut().remove_finalizer(C::FINALIZER),
    )
    .await;
    match removed {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Consecutive failures per object, reset whenever its revision changes.
#[derive(Debug)]
struct RequeueTracker {
    limit: u32,
    entries: HashMap<ObjectKey, Failures>,
}

#[derive(Debug)]
struct Failures {
    revision: String,
    count: u32,
    terminal: bool,
}

impl RequeueTracker {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            entries: HashMap::new(),
        }
    }

    fn is_exhausted(&self, key: &ObjectKey, revision: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|f| f.revision == revision && self.gave_up(f))
    }

    /// Returns the failure count for the revision and whether the object
    /// is now out of budget.
    fn record_failure(&mut self, key: ObjectKey, revision: String, terminal: bool) -> (u32, bool) {
        let entry = self.entries.entry(key).or_insert_with(|| Failures {
            revision: revision.clone(),
            count: 0,
            terminal: false,
        });
        if entry.revision != revision {
            *entry = Failures {
                revision,
                count: 0,
                terminal: false,
            };
        }
        entry.count = entry.count.saturating_add(1);
        entry.terminal |= terminal;

        let count = entry.count;
        let exhausted = entry.terminal || (self.limit > 0 && count >= self.limit);
        (count, exhausted)
    }

    fn gave_up(&self, failures: &Failures) -> bool {
        failures.terminal || (self.limit > 0 && failures.count >= self.limit)
    }

    fn forget(&mut self, key: &ObjectKey) {
        self.entries.remove(key);
    }

    /// Drop entries of objects that no longer exist.
    fn retain(&mut self, live: &HashSet<ObjectKey>) {
        self.entries.retain(|key, _| live.contains(key));
    }
}

/// Kinds whose status is a plain [`ResourceStatus`].
pub trait ReportsStatus: Resource {
    fn status_mut(&mut self) -> &mut ResourceStatus;
}

macro_rules! reports_status {
    ($($ty:ty),+) => {
        $(impl ReportsStatus for $ty {
            fn status_mut(&mut self) -> &mut ResourceStatus {
                &mut self.status
            }
        })+
    };
}

reports_status!(SecretEngine, BackendRole, VaultPolicy, VaultPolicyBinding);

/// Connect to the backend named by `vault_ref`, recording a failure on the
/// object's status if that is impossible.
pub(crate) async fn connect<R: ReportsStatus>(
    state: &OperatorState,
    store: &DynStore<R>,
    object: &R,
    vault_ref: &str,
) -> Result<BackendClient, ReconcileError> {
    let outcome = state.clients.connect(&object.meta().namespace, vault_ref).await;
    checked(state, store, object, reason::CONNECT_FAILED, outcome).await
}

/// Pass `outcome` through, recording a failed step as `Ready=False` and
/// `Failed=True` conditions first. Spec errors are recorded as
/// [`reason::INVALID_SPEC`] whatever step raised them.
pub(crate) async fn checked<R, T, E>(
    state: &OperatorState,
    store: &DynStore<R>,
    object: &R,
    step_reason: &str,
    outcome: Result<T, E>,
) -> Result<T, ReconcileError>
where
    R: ReportsStatus,
    E: Into<ReconcileError>,
{
    let err: ReconcileError = match outcome {
        Ok(value) => return Ok(value),
        Err(e) => e.into(),
    };
    if err.is_cancelled() {
        return Err(err);
    }

    let reason = if is_invalid_spec(&err) {
        reason::INVALID_SPEC
    } else {
        step_reason
    };
    let message = err.to_string();
    let meta = object.meta();
    let generation = meta.generation;
    let recorded = state
        .status
        .update(store.as_ref(), &meta.namespace, &meta.name, |o: &mut R| {
            let status = o.status_mut();
            status.phase = Phase::Failed;
            condition::set_condition(
                &mut status.conditions,
                Condition::new(kind::READY, ConditionStatus::False, reason, message.clone())
                    .with_generation(generation),
            );
            condition::set_condition(
                &mut status.conditions,
                Condition::truthy(kind::FAILED, reason, message.clone()).with_generation(generation),
            );
        })
        .await;
    if let Err(e) = recorded {
        warn!(kind = R::KIND, key = %meta.key(), error = %e, "failed to record failure condition");
    }
    Err(err)
}

/// Mark the object reconciled at its current generation.
pub(crate) async fn mark_ready<R: ReportsStatus>(
    state: &OperatorState,
    store: &DynStore<R>,
    object: &R,
) -> Result<(), ReconcileError> {
    let meta = object.meta();
    let generation = meta.generation;
    state
        .status
        .update(store.as_ref(), &meta.namespace, &meta.name, |o: &mut R| {
            let status = o.status_mut();
            status.phase = Phase::Success;
            status.observed_generation = generation;
            condition::remove_condition(&mut status.conditions, kind::FAILED);
            condition::set_condition(
                &mut status.conditions,
                Condition::truthy(kind::READY, reason::RECONCILED, "reconciled").with_generation(generation),
            );
        })
        .await?;
    Ok(())
}

fn is_invalid_spec(err: &ReconcileError) -> bool {
    matches!(
        err,
        ReconcileError::Engine(EngineError::InvalidSpec { .. })
            | ReconcileError::Role(RoleError::InvalidSpec { .. })
            | ReconcileError::Policy(PolicyError::InvalidSpec { .. })
    )
}
