// ============================================================================
// mirrorsync Library
// ============================================================================

pub mod config;
pub mod core;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod web;

pub use config::{PermanentFailurePolicy, RetryPolicy, SyncConfig};
pub use crate::core::{
    CanonicalRecord, Collection, DeadLetter, Fields, Identity, Lifeline, Operation, OutboxEntry,
    Record, RemoteError, Result, SyncError,
};
pub use remote::{HttpRemoteAuthority, InMemoryRemoteAuthority, RemoteAuthority};
pub use storage::{DurabilityMode, EnqueueOutcome, LocalStore, MirrorStore, OutboxLog};
pub use sync::{
    ConnectivityMonitor, ConnectivityTriggerHandle, Nudge, PullMerge, ReconcileOutcome,
    ReconcilePolicy, ReconcileReport, ReconciliationEngine, Repository, SyncEvent,
};

use std::sync::Arc;
use tokio::sync::broadcast;

// ============================================================================
// Offline sync facade
// ============================================================================

/// One offline-first client: local store, outbox, engine and trigger wired
/// together.
///
/// # Examples
///
/// ```
/// use mirrorsync::{
///     Collection, ConnectivityMonitor, InMemoryRemoteAuthority, OfflineSync, SyncConfig,
/// };
/// use std::sync::Arc;
///
/// # fn main() -> mirrorsync::Result<()> {
/// let sync = OfflineSync::open(
///     SyncConfig::in_memory(),
///     Arc::new(InMemoryRemoteAuthority::new()),
///     ConnectivityMonitor::new(false),
/// )?;
///
/// let expenses = sync.repository(Collection::Expense);
/// let record = expenses.create(serde_json::json!({"amount": 50}))?;
/// assert!(record.identity.is_provisional());
/// assert_eq!(sync.outbox().len()?, 1);
/// # Ok(())
/// # }
/// ```
pub struct OfflineSync {
    config: SyncConfig,
    store: LocalStore,
    engine: Arc<ReconciliationEngine>,
    pull: PullMerge,
    connectivity: ConnectivityMonitor,
    nudge: Nudge,
    trigger: Option<ConnectivityTriggerHandle>,
}

impl OfflineSync {
    /// Opens (or recovers) the local store and builds the engine. Nothing
    /// runs in the background until [`OfflineSync::start`].
    pub fn open(
        config: SyncConfig,
        remote: Arc<dyn RemoteAuthority>,
        connectivity: ConnectivityMonitor,
    ) -> Result<Self> {
        let store = LocalStore::open(&config)?;
        let engine = ReconciliationEngine::new(store.clone(), remote.clone(), connectivity.clone())
            .with_policy(ReconcilePolicy::from(&config))
            .with_event_capacity(config.event_capacity);
        let pull = PullMerge::new(store.clone(), remote);

        Ok(Self {
            config,
            store,
            engine: Arc::new(engine),
            pull,
            connectivity,
            nudge: Nudge::new(),
            trigger: None,
        })
    }

    /// Starts the connectivity trigger on the current tokio runtime. Calling
    /// it again is a no-op.
    pub fn start(&mut self) {
        if self.trigger.is_some() {
            return;
        }
        self.trigger = Some(sync::spawn_connectivity_trigger(
            self.engine.clone(),
            self.connectivity.clone(),
            self.nudge.clone(),
            self.config.retry.clone(),
        ));
    }

    /// Stops the trigger and writes a final checkpoint.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(trigger) = self.trigger.take() {
            trigger.stop().await?;
        }
        self.store.checkpoint()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn mirror(&self) -> MirrorStore {
        MirrorStore::new(self.store.clone())
    }

    pub fn outbox(&self) -> OutboxLog {
        OutboxLog::new(self.store.clone())
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn repository(&self, collection: Collection) -> Repository {
        Repository::new(
            collection,
            self.store.clone(),
            self.nudge.clone(),
            self.pull.clone(),
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.subscribe()
    }

    /// Runs one pass now, independent of the trigger.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        self.engine.reconcile().await
    }

    pub async fn refresh(&self, collection: Collection) -> Result<Vec<Record>> {
        self.pull.refresh(collection).await
    }

    pub async fn refresh_all(&self) -> Vec<(Collection, Result<Vec<Record>>)> {
        self.pull.refresh_all().await
    }
}
