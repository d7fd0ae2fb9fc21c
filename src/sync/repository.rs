use super::merge::PullMerge;
use super::trigger::Nudge;
use crate::core::{Collection, Fields, Identity, Operation, Record, Result, SyncError};
use crate::storage::{EnqueueOutcome, LocalStore, StoreOp};
use chrono::Utc;
use tracing::{Level, event};

/// The UI's mutation path for one collection.
///
/// Every mutation updates the mirror and the outbox in a single atomic batch,
/// then wakes the connectivity trigger so an online client sends it right
/// away.
#[derive(Debug, Clone)]
pub struct Repository {
    collection: Collection,
    store: LocalStore,
    nudge: Nudge,
    pull: PullMerge,
}

impl Repository {
    pub fn new(collection: Collection, store: LocalStore, nudge: Nudge, pull: PullMerge) -> Self {
        Self {
            collection,
            store,
            nudge,
            pull,
        }
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    /// Stores a new record under a fresh provisional identity and queues its
    /// Create.
    pub fn create(&self, fields: Fields) -> Result<Record> {
        let collection = self.collection;
        let record = Record::new(collection, Identity::new_provisional(), fields);
        let outcome = self.store.write(|inner| {
            let (enqueue, outcome) = inner.state().plan_enqueue(
                inner.in_flight(),
                collection,
                record.identity.clone(),
                Operation::Create,
                record.fields.clone(),
            )?;
            let mut ops = vec![StoreOp::PutRecord(record.clone())];
            ops.extend(enqueue);
            inner.commit(ops)?;
            Ok(outcome)
        })?;
        event!(Level::DEBUG, %collection, identity = %record.identity, ?outcome, "record created locally");
        self.nudge.notify();
        Ok(record)
    }

    /// Replaces a record's fields and queues the Update.
    pub fn update(&self, identity: &Identity, fields: Fields) -> Result<Record> {
        let collection = self.collection;
        let updated = self.store.write(|inner| {
            let existing = inner
                .state()
                .record(collection, identity)
                .cloned()
                .ok_or_else(|| {
                    SyncError::NotFound(format!("{}/{} is not in the local mirror", collection, identity))
                })?;
            let (enqueue, _) = inner.state().plan_enqueue(
                inner.in_flight(),
                collection,
                identity.clone(),
                Operation::Update,
                fields.clone(),
            )?;
            let updated = Record {
                fields,
                updated_at: Utc::now(),
                ..existing
            };
            let mut ops = vec![StoreOp::PutRecord(updated.clone())];
            ops.extend(enqueue);
            inner.commit(ops)?;
            Ok(updated)
        })?;
        event!(Level::DEBUG, %collection, %identity, "record updated locally");
        self.nudge.notify();
        Ok(updated)
    }

    /// Removes a record from the mirror and queues the Delete. A record the
    /// Remote Authority has not confirmed yet is cancelled locally instead.
    pub fn delete(&self, identity: &Identity) -> Result<EnqueueOutcome> {
        let collection = self.collection;
        let outcome = self.store.write(|inner| {
            if inner.state().record(collection, identity).is_none() {
                return Err(SyncError::NotFound(format!(
                    "{}/{} is not in the local mirror",
                    collection, identity
                )));
            }
            let (mut ops, outcome) = inner.state().plan_enqueue(
                inner.in_flight(),
                collection,
                identity.clone(),
                Operation::Delete,
                Fields::Null,
            )?;
            if !outcome.is_collapsed() {
                ops.push(StoreOp::DeleteRecord {
                    collection,
                    identity: identity.clone(),
                });
            }
            inner.commit(ops)?;
            Ok(outcome)
        })?;

        match &outcome {
            EnqueueOutcome::Collapsed { removed } => {
                event!(Level::DEBUG, %collection, %identity, removed = removed.len(), "unconfirmed record cancelled locally");
            }
            EnqueueOutcome::Enqueued { sequence } => {
                event!(Level::DEBUG, %collection, %identity, sequence, "record deleted locally");
                self.nudge.notify();
            }
        }
        Ok(outcome)
    }

    pub fn get(&self, identity: &Identity) -> Result<Option<Record>> {
        let collection = self.collection;
        self.store
            .read(|state| state.record(collection, identity).cloned())
    }

    pub fn list(&self) -> Result<Vec<Record>> {
        let collection = self.collection;
        self.store.read(|state| state.records(collection))
    }

    /// Pull-and-merge for this collection.
    pub async fn refresh(&self) -> Result<Vec<Record>> {
        self.pull.refresh(self.collection).await
    }
}
