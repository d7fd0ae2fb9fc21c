use super::state::{EnqueueOutcome, StoreOp};
use super::store::LocalStore;
use crate::core::{
    Collection, DeadLetter, Fields, Identity, Lifeline, Operation, OutboxEntry, Record, Result,
    SyncError,
};
use tracing::{Level, event};

/// Durable, sequence-ordered log of mutations the Remote Authority has not
/// confirmed yet. One log serves every collection.
#[derive(Debug, Clone)]
pub struct OutboxLog {
    store: LocalStore,
}

impl OutboxLog {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Appends a mutation after checking the lifeline invariants.
    ///
    /// Deleting a record whose Create has not been sent yet cancels the
    /// lifeline instead: the Create (and any Updates) are removed and the
    /// record disappears from the mirror.
    pub fn enqueue(
        &self,
        collection: Collection,
        identity: Identity,
        operation: Operation,
        payload: Fields,
    ) -> Result<EnqueueOutcome> {
        let outcome = self.store.write(|inner| {
            let (ops, outcome) = inner.state().plan_enqueue(
                inner.in_flight(),
                collection,
                identity,
                operation,
                payload,
            )?;
            inner.commit(ops)?;
            Ok(outcome)
        })?;
        event!(Level::DEBUG, ?outcome, %collection, %operation, "outbox enqueue");
        Ok(outcome)
    }

    /// Every pending entry, ordered by sequence.
    pub fn peek_all(&self) -> Result<Vec<OutboxEntry>> {
        self.store.read(|state| state.entries().cloned().collect())
    }

    pub fn get(&self, sequence: u64) -> Result<Option<OutboxEntry>> {
        self.store.read(|state| state.entry(sequence).cloned())
    }

    /// Returns `false` when the entry was already gone.
    pub fn remove(&self, sequence: u64) -> Result<bool> {
        self.store.write(|inner| {
            if inner.state().entry(sequence).is_none() {
                return Ok(false);
            }
            inner.commit(vec![StoreOp::RemoveEntry { sequence }])?;
            Ok(true)
        })
    }

    /// Re-keys a lifeline from its provisional to its confirmed identity,
    /// in the mirror and in every entry still queued for it.
    ///
    /// Returns the number of entries rewritten.
    pub fn rewrite_identity(
        &self,
        collection: Collection,
        old: &Identity,
        new: &Identity,
    ) -> Result<usize> {
        self.store.write(|inner| {
            let plan = inner
                .state()
                .plan_rewrite_identity(collection, old, new, None)?;
            let rewritten = plan.rewritten.len();
            inner.commit(plan.ops)?;
            Ok(rewritten)
        })
    }

    pub fn pending_for(&self, collection: Collection, identity: &Identity) -> Result<Vec<OutboxEntry>> {
        let lifeline = Lifeline::new(collection, identity.clone());
        self.store.read(|state| {
            state
                .pending_for(&lifeline)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    pub fn len(&self) -> Result<usize> {
        self.store.read(|state| state.outbox_len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    // ------------------------------------------------------------------
    // Dead letters
    // ------------------------------------------------------------------

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.store.read(|state| state.dead_letters().cloned().collect())
    }

    /// Puts a dead-lettered entry back in the queue under a fresh sequence.
    ///
    /// A requeued Create whose provisional record was dropped from the
    /// mirror meanwhile gets the record back from its payload.
    pub fn requeue_dead_letter(&self, sequence: u64) -> Result<EnqueueOutcome> {
        let outcome = self.store.write(|inner| {
            let dead = inner
                .state()
                .dead_letter(sequence)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(format!("dead letter #{}", sequence)))?;
            let entry = dead.entry;

            let mut ops = vec![StoreOp::RemoveDeadLetter { sequence }];
            if entry.operation == Operation::Create
                && inner
                    .state()
                    .record(entry.collection, &entry.identity)
                    .is_none()
            {
                ops.push(StoreOp::PutRecord(Record::new(
                    entry.collection,
                    entry.identity.clone(),
                    entry.payload.clone(),
                )));
            }
            let (enqueue_ops, outcome) = inner.state().plan_enqueue(
                inner.in_flight(),
                entry.collection,
                entry.identity,
                entry.operation,
                entry.payload,
            )?;
            ops.extend(enqueue_ops);
            inner.commit(ops)?;
            Ok(outcome)
        })?;
        event!(Level::INFO, sequence, ?outcome, "dead letter requeued");
        Ok(outcome)
    }

    pub fn discard_dead_letter(&self, sequence: u64) -> Result<DeadLetter> {
        let dead = self.store.write(|inner| {
            let dead = inner
                .state()
                .dead_letter(sequence)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(format!("dead letter #{}", sequence)))?;
            inner.commit(vec![StoreOp::RemoveDeadLetter { sequence }])?;
            Ok(dead)
        })?;
        event!(
            Level::WARN,
            sequence,
            collection = %dead.entry.collection,
            identity = %dead.entry.identity,
            "dead letter discarded"
        );
        Ok(dead)
    }
}
