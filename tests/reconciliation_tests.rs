use mirrorsync::remote::RemoteOperation;
use mirrorsync::{
    Collection, ConnectivityMonitor, EnqueueOutcome, Identity, InMemoryRemoteAuthority,
    OfflineSync, Operation, ReconcileOutcome, ReconcileReport, RemoteError, SyncConfig, SyncEvent,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn client(online: bool) -> (OfflineSync, InMemoryRemoteAuthority, ConnectivityMonitor) {
    let remote = InMemoryRemoteAuthority::new();
    let connectivity = ConnectivityMonitor::new(online);
    let sync = OfflineSync::open(
        SyncConfig::in_memory(),
        Arc::new(remote.clone()),
        connectivity.clone(),
    )
    .unwrap();
    (sync, remote, connectivity)
}

async fn completed(sync: &OfflineSync) -> ReconcileReport {
    match sync.reconcile().await.unwrap() {
        ReconcileOutcome::Completed(report) => report,
        other => panic!("expected a completed pass, got {other:?}"),
    }
}

#[tokio::test]
async fn second_pass_without_new_work_makes_no_calls() {
    let (sync, remote, _) = client(true);
    let expenses = sync.repository(Collection::Expense);
    expenses.create(json!({"amount": 10})).unwrap();
    expenses.create(json!({"amount": 20})).unwrap();

    let first = completed(&sync).await;
    assert_eq!(first.reconciled, 2);
    let calls = remote.call_count();

    let second = completed(&sync).await;
    assert_eq!(second.attempted, 0);
    assert_eq!(remote.call_count(), calls);
}

#[tokio::test]
async fn confirmed_create_replaces_provisional_record() {
    let (sync, remote, _) = client(true);
    let expenses = sync.repository(Collection::Expense);
    let provisional = expenses.create(json!({"amount": 50})).unwrap().identity;

    completed(&sync).await;

    let confirmed = Identity::confirmed("srv-1");
    let record = expenses.get(&confirmed).unwrap().unwrap();
    let canonical = remote.get(Collection::Expense, "srv-1").unwrap();
    assert_eq!(record.fields, serde_json::Value::Object(canonical.fields));
    assert!(expenses.get(&provisional).unwrap().is_none());
}

#[tokio::test]
async fn delete_is_never_sent_before_its_update_confirms() {
    let (sync, remote, _) = client(true);
    remote.seed(Collection::Income, "srv-1", json!({"amount": 100}));
    sync.refresh(Collection::Income).await.unwrap();

    let incomes = sync.repository(Collection::Income);
    let identity = Identity::confirmed("srv-1");
    incomes.update(&identity, json!({"amount": 150})).unwrap();
    incomes.delete(&identity).unwrap();
    remote.clear_calls();

    remote.fail_next(RemoteOperation::Update, RemoteError::transient("HTTP 502"));
    let report = completed(&sync).await;
    assert_eq!(report.transient_failures, 1);
    assert_eq!(report.blocked, 1);
    assert_eq!(sync.outbox().len().unwrap(), 2);

    completed(&sync).await;
    let operations: Vec<RemoteOperation> = remote
        .mutation_calls()
        .into_iter()
        .map(|call| call.operation)
        .collect();
    assert_eq!(
        operations,
        vec![
            RemoteOperation::Update,
            RemoteOperation::Update,
            RemoteOperation::Delete
        ]
    );
    assert!(remote.get(Collection::Income, "srv-1").is_none());
    assert!(incomes.list().unwrap().is_empty());
}

#[tokio::test]
async fn create_then_delete_before_any_pass_leaves_nothing() {
    let (sync, remote, connectivity) = client(false);
    let savings = sync.repository(Collection::Saving);

    let record = savings.create(json!({"amount": 100})).unwrap();
    let outcome = savings.delete(&record.identity).unwrap();
    assert!(outcome.is_collapsed());

    connectivity.set_online(true);
    let report = completed(&sync).await;
    assert_eq!(report.attempted, 0);
    assert!(sync.outbox().is_empty().unwrap());
    assert!(savings.list().unwrap().is_empty());
    assert_eq!(remote.call_count(), 0);
}

#[tokio::test]
async fn refresh_does_not_overwrite_pending_edit() {
    let (sync, remote, connectivity) = client(true);
    remote.seed(Collection::Expense, "srv-1", json!({"amount": 50}));
    let expenses = sync.repository(Collection::Expense);
    expenses.refresh().await.unwrap();

    connectivity.set_online(false);
    let identity = Identity::confirmed("srv-1");
    expenses.update(&identity, json!({"amount": 75})).unwrap();
    remote.seed(Collection::Expense, "srv-2", json!({"amount": 20}));

    let merged = expenses.refresh().await.unwrap();
    assert_eq!(merged.len(), 2);
    let pending = expenses.get(&identity).unwrap().unwrap();
    assert_eq!(pending.fields, json!({"amount": 75}));
    assert!(
        expenses
            .get(&Identity::confirmed("srv-2"))
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn refresh_keeps_locally_deleted_record_hidden() {
    let (sync, remote, connectivity) = client(true);
    remote.seed(Collection::Investment, "srv-1", json!({"amount": 900}));
    let investments = sync.repository(Collection::Investment);
    investments.refresh().await.unwrap();

    connectivity.set_online(false);
    investments.delete(&Identity::confirmed("srv-1")).unwrap();

    let merged = investments.refresh().await.unwrap();
    assert!(merged.is_empty());
}

#[tokio::test]
async fn offline_update_of_confirmed_expense_converges() {
    let (sync, _remote, connectivity) = client(true);
    let expenses = sync.repository(Collection::Expense);
    expenses.create(json!({"amount": 50})).unwrap();
    completed(&sync).await;

    let records = expenses.list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].identity, Identity::confirmed("srv-1"));
    assert_eq!(records[0].fields["amount"], json!(50));

    connectivity.set_online(false);
    expenses
        .update(&Identity::confirmed("srv-1"), json!({"amount": 75}))
        .unwrap();
    assert_eq!(sync.outbox().len().unwrap(), 1);
    assert_eq!(sync.reconcile().await.unwrap(), ReconcileOutcome::Offline);

    connectivity.set_online(true);
    let report = completed(&sync).await;
    assert!(report.is_converged());
    assert!(sync.outbox().is_empty().unwrap());
    let record = expenses.get(&Identity::confirmed("srv-1")).unwrap().unwrap();
    assert_eq!(record.fields["amount"], json!(75));
}

#[tokio::test]
async fn failed_create_keeps_lifeline_provisional_and_unsendable() {
    let (sync, remote, _) = client(true);
    remote.set_offline(true);
    let savings = sync.repository(Collection::Saving);
    let provisional = savings.create(json!({"amount": 100})).unwrap().identity;

    let report = completed(&sync).await;
    assert_eq!(report.transient_failures, 1);
    let pending = sync.outbox().peek_all().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation, Operation::Create);
    assert!(savings.get(&provisional).unwrap().is_some());
    assert!(savings.list().unwrap().iter().all(|r| r.identity.is_provisional()));

    savings.update(&provisional, json!({"amount": 120})).unwrap();
    let report = completed(&sync).await;
    assert_eq!(report.blocked, 1);
    assert!(
        remote
            .mutation_calls()
            .iter()
            .all(|call| call.operation == RemoteOperation::Create)
    );

    remote.set_offline(false);
    let report = completed(&sync).await;
    assert_eq!(report.reconciled, 2);
    let record = savings.get(&Identity::confirmed("srv-1")).unwrap().unwrap();
    assert_eq!(record.fields["amount"], json!(120));
    assert!(savings.get(&provisional).unwrap().is_none());
}

#[tokio::test]
async fn concurrent_reconcile_is_a_no_op() {
    let (sync, remote, _) = client(true);
    remote.set_latency(Some(Duration::from_millis(100)));
    sync.repository(Collection::Income)
        .create(json!({"amount": 1}))
        .unwrap();

    let (first, second) = tokio::join!(sync.reconcile(), sync.reconcile());
    assert!(matches!(first.unwrap(), ReconcileOutcome::Completed(_)));
    assert_eq!(second.unwrap(), ReconcileOutcome::Skipped);
    assert_eq!(remote.mutation_calls().len(), 1);
}

#[tokio::test]
async fn delete_during_in_flight_create_is_queued_behind_it() {
    let (sync, remote, _) = client(true);
    remote.set_latency(Some(Duration::from_millis(200)));
    let expenses = sync.repository(Collection::Expense);
    let provisional = expenses.create(json!({"amount": 5})).unwrap().identity;

    let engine = sync.engine().clone();
    let pass = tokio::spawn(async move { engine.reconcile().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let outcome = expenses.delete(&provisional).unwrap();
    assert!(matches!(outcome, EnqueueOutcome::Enqueued { .. }));
    assert!(expenses.list().unwrap().is_empty());

    let report = pass.await.unwrap().unwrap().report().cloned().unwrap();
    assert_eq!(report.reconciled, 1);
    assert_eq!(report.remaining, 1);
    assert!(expenses.list().unwrap().is_empty());
    let pending = sync.outbox().peek_all().unwrap();
    assert_eq!(pending[0].identity, Identity::confirmed("srv-1"));

    remote.set_latency(None);
    completed(&sync).await;
    assert!(remote.get(Collection::Expense, "srv-1").is_none());
    assert!(sync.outbox().is_empty().unwrap());
}

#[tokio::test]
async fn rejected_entry_is_dead_lettered_and_can_be_requeued() {
    let (sync, remote, _) = client(true);
    let mut events = sync.subscribe();
    remote.fail_next(
        RemoteOperation::Create,
        RemoteError::permanent(Some(422), "amount must be positive"),
    );
    let incomes = sync.repository(Collection::Income);
    let record = incomes.create(json!({"amount": -5})).unwrap();

    let report = completed(&sync).await;
    assert_eq!(report.dead_lettered, 1);
    assert!(sync.outbox().is_empty().unwrap());

    match events.recv().await.unwrap() {
        SyncEvent::DeadLettered {
            sequence, identity, ..
        } => {
            assert_eq!(sequence, 1);
            assert_eq!(identity, record.identity);
        }
        other => panic!("expected a dead-letter event, got {other:?}"),
    }

    let dead = sync.outbox().dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].status, Some(422));

    let requeued = sync.outbox().requeue_dead_letter(1).unwrap();
    assert_eq!(requeued, EnqueueOutcome::Enqueued { sequence: 2 });
    let report = completed(&sync).await;
    assert!(report.is_converged());
    assert!(sync.outbox().dead_letters().unwrap().is_empty());
    assert_eq!(incomes.list().unwrap().len(), 1);
}

#[tokio::test]
async fn converged_event_follows_successful_pass() {
    let (sync, _remote, _) = client(true);
    let mut events = sync.subscribe();
    sync.repository(Collection::Saving)
        .create(json!({"amount": 3}))
        .unwrap();

    completed(&sync).await;

    let mut saw_converged = false;
    while let Ok(event) = events.try_recv() {
        if event == (SyncEvent::Converged { reconciled: 1 }) {
            saw_converged = true;
        }
    }
    assert!(saw_converged);
}
