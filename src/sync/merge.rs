use crate::core::{Collection, Record, Result};
use crate::remote::RemoteAuthority;
use crate::storage::{LocalStore, MergeStats};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{Level, event};

/// Replaces the mirror's view of a collection with the Remote Authority's,
/// except for records that still have work queued.
#[derive(Clone)]
pub struct PullMerge {
    store: LocalStore,
    remote: Arc<dyn RemoteAuthority>,
}

impl PullMerge {
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteAuthority>) -> Self {
        Self { store, remote }
    }

    /// Fetches `collection` and merges it; returns the merged view.
    ///
    /// A failed fetch leaves the mirror untouched. Records written while the
    /// fetch was in flight keep their local state.
    pub async fn refresh(&self, collection: Collection) -> Result<Vec<Record>> {
        let window = self.store.open_pull_window(collection)?;
        let server = self.remote.list(collection).await?;
        let fetched = server.len();

        let (records, stats) = self.store.write(|inner| {
            let touched = inner.touched_since(window.ticket());
            let (ops, stats) = inner.state().plan_merge(collection, server, &touched);
            inner.commit(ops)?;
            Ok((inner.state().records(collection), stats))
        })?;

        log_merge(collection, fetched, stats);
        Ok(records)
    }

    /// Refreshes every collection concurrently. One collection failing does
    /// not stop the others.
    pub async fn refresh_all(&self) -> Vec<(Collection, Result<Vec<Record>>)> {
        let refreshes = Collection::ALL
            .into_iter()
            .map(|collection| async move { (collection, self.refresh(collection).await) });
        join_all(refreshes).await
    }
}

fn log_merge(collection: Collection, fetched: usize, stats: MergeStats) {
    event!(
        Level::INFO,
        %collection,
        fetched,
        upserted = stats.upserted,
        removed = stats.removed,
        preserved = stats.preserved,
        "pull merge applied"
    );
}

impl std::fmt::Debug for PullMerge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullMerge").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CanonicalRecord, Fields, Identity, Operation, SyncError};
    use crate::remote::{InMemoryRemoteAuthority, RemoteResult};
    use crate::storage::{MirrorStore, OutboxLog};
    use crate::sync::{ConnectivityMonitor, ReconciliationEngine};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Answers `list` from a snapshot taken before a delay.
    struct SlowList {
        inner: InMemoryRemoteAuthority,
        delay: Duration,
    }

    #[async_trait]
    impl RemoteAuthority for SlowList {
        async fn create(&self, collection: Collection, payload: &Fields) -> RemoteResult<CanonicalRecord> {
            self.inner.create(collection, payload).await
        }

        async fn update(
            &self,
            collection: Collection,
            id: &str,
            payload: &Fields,
        ) -> RemoteResult<Option<CanonicalRecord>> {
            self.inner.update(collection, id, payload).await
        }

        async fn delete(&self, collection: Collection, id: &str) -> RemoteResult<()> {
            self.inner.delete(collection, id).await
        }

        async fn list(&self, collection: Collection) -> RemoteResult<Vec<CanonicalRecord>> {
            let snapshot = self.inner.list(collection).await?;
            tokio::time::sleep(self.delay).await;
            Ok(snapshot)
        }
    }

    fn slow_pull(store: &LocalStore, remote: &InMemoryRemoteAuthority) -> PullMerge {
        PullMerge::new(
            store.clone(),
            Arc::new(SlowList {
                inner: remote.clone(),
                delay: Duration::from_millis(200),
            }),
        )
    }

    fn engine(store: &LocalStore, remote: &InMemoryRemoteAuthority) -> ReconciliationEngine {
        ReconciliationEngine::new(
            store.clone(),
            Arc::new(remote.clone()),
            ConnectivityMonitor::new(true),
        )
    }

    #[tokio::test]
    async fn refresh_keeps_records_with_pending_work() {
        let store = LocalStore::in_memory();
        let remote = InMemoryRemoteAuthority::new();
        remote.seed(Collection::Expense, "srv-1", json!({"amount": 50}));
        remote.seed(Collection::Expense, "srv-2", json!({"amount": 20}));

        let mirror = MirrorStore::new(store.clone());
        let edited = Identity::confirmed("srv-1");
        mirror
            .put(
                Collection::Expense,
                Record::new(Collection::Expense, edited.clone(), json!({"amount": 75})),
            )
            .unwrap();
        OutboxLog::new(store.clone())
            .enqueue(Collection::Expense, edited.clone(), Operation::Update, json!({"amount": 75}))
            .unwrap();

        let merge = PullMerge::new(store, Arc::new(remote));
        let records = merge.refresh(Collection::Expense).await.unwrap();

        assert_eq!(records.len(), 2);
        let kept = mirror.get(Collection::Expense, &edited).unwrap().unwrap();
        assert_eq!(kept.fields, json!({"amount": 75}));
    }

    #[tokio::test]
    async fn failed_fetch_leaves_mirror_untouched() {
        let store = LocalStore::in_memory();
        let remote = InMemoryRemoteAuthority::new();
        let mirror = MirrorStore::new(store.clone());
        mirror
            .put(
                Collection::Income,
                Record::new(Collection::Income, Identity::confirmed("srv-3"), json!({"amount": 1})),
            )
            .unwrap();
        remote.set_offline(true);

        let merge = PullMerge::new(store, Arc::new(remote));
        let err = merge.refresh(Collection::Income).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(_)));
        assert_eq!(mirror.len(Collection::Income).unwrap(), 1);
    }

    #[tokio::test]
    async fn refresh_all_reports_each_collection() {
        let remote = InMemoryRemoteAuthority::new();
        remote.seed(Collection::Saving, "srv-5", json!({"amount": 500}));
        let merge = PullMerge::new(LocalStore::in_memory(), Arc::new(remote));

        let results = merge.refresh_all().await;
        assert_eq!(results.len(), Collection::ALL.len());
        for (collection, result) in results {
            let records = result.unwrap();
            let expected = if collection == Collection::Saving { 1 } else { 0 };
            assert_eq!(records.len(), expected);
        }
    }

    #[tokio::test]
    async fn create_confirmed_during_fetch_survives_refresh() {
        let store = LocalStore::in_memory();
        let remote = InMemoryRemoteAuthority::new();
        let provisional = Identity::new_provisional();
        MirrorStore::new(store.clone())
            .put(
                Collection::Expense,
                Record::new(Collection::Expense, provisional.clone(), json!({"amount": 5})),
            )
            .unwrap();
        OutboxLog::new(store.clone())
            .enqueue(Collection::Expense, provisional, Operation::Create, json!({"amount": 5}))
            .unwrap();

        let pull = slow_pull(&store, &remote);
        let refresh = tokio::spawn(async move { pull.refresh(Collection::Expense).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine(&store, &remote).reconcile().await.unwrap();

        let records = refresh.await.unwrap().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].identity, Identity::confirmed("srv-1"));
    }

    #[tokio::test]
    async fn update_confirmed_during_fetch_is_not_rolled_back() {
        let store = LocalStore::in_memory();
        let remote = InMemoryRemoteAuthority::new();
        remote.seed(Collection::Saving, "srv-1", json!({"amount": 50}));
        let identity = Identity::confirmed("srv-1");
        MirrorStore::new(store.clone())
            .put(
                Collection::Saving,
                Record::new(Collection::Saving, identity.clone(), json!({"amount": 75})),
            )
            .unwrap();
        OutboxLog::new(store.clone())
            .enqueue(Collection::Saving, identity.clone(), Operation::Update, json!({"amount": 75}))
            .unwrap();

        let pull = slow_pull(&store, &remote);
        let refresh = tokio::spawn(async move { pull.refresh(Collection::Saving).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine(&store, &remote).reconcile().await.unwrap();
        refresh.await.unwrap().unwrap();

        let record = MirrorStore::new(store).get(Collection::Saving, &identity).unwrap().unwrap();
        assert_eq!(record.fields["amount"], json!(75));
    }

    #[tokio::test]
    async fn record_written_before_fetch_is_replaced() {
        let store = LocalStore::in_memory();
        let remote = InMemoryRemoteAuthority::new();
        let mirror = MirrorStore::new(store.clone());
        let identity = Identity::confirmed("srv-gone");
        mirror
            .put(
                Collection::Investment,
                Record::new(Collection::Investment, identity.clone(), json!({"amount": 1})),
            )
            .unwrap();

        let pull = PullMerge::new(store, Arc::new(remote));
        pull.refresh(Collection::Investment).await.unwrap();
        assert!(!mirror.contains(Collection::Investment, &identity).unwrap());
    }
}
