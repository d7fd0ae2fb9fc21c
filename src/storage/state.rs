use crate::core::{
    CanonicalRecord, Collection, DeadLetter, Fields, Identity, Lifeline, Operation, OutboxEntry,
    Record, Result, SyncError,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// A single mutation of the local store. Batches of these are journaled and
/// applied atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreOp {
    PutRecord(Record),
    DeleteRecord {
        collection: Collection,
        identity: Identity,
    },
    Enqueue(OutboxEntry),
    RemoveEntry {
        sequence: u64,
    },
    /// Replaces a still-queued entry; a no-op if the entry is gone.
    ReplaceEntry(OutboxEntry),
    PutDeadLetter(DeadLetter),
    RemoveDeadLetter {
        sequence: u64,
    },
}

/// Result of asking the outbox to take a new mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { sequence: u64 },
    /// The mutation cancelled a never-confirmed lifeline; these sequences were dropped.
    Collapsed { removed: Vec<u64> },
}

impl EnqueueOutcome {
    pub fn sequence(&self) -> Option<u64> {
        match self {
            Self::Enqueued { sequence } => Some(*sequence),
            Self::Collapsed { .. } => None,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        matches!(self, Self::Collapsed { .. })
    }
}

/// Ops that move a lifeline from a provisional to a confirmed identity.
#[derive(Debug, Clone, Default)]
pub struct RewritePlan {
    pub ops: Vec<StoreOp>,
    pub rewritten: Vec<u64>,
    pub rekeyed: Option<Record>,
    pub has_pending_delete: bool,
    pub has_pending_update: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub upserted: usize,
    pub removed: usize,
    pub preserved: usize,
}

/// In-memory image of everything the local store holds.
#[derive(Debug, Clone, Default)]
pub struct StoreState {
    records: HashMap<Collection, BTreeMap<Identity, Record>>,
    outbox: BTreeMap<u64, OutboxEntry>,
    dead_letters: BTreeMap<u64, DeadLetter>,
    next_sequence: u64,
}

impl StoreState {
    pub fn from_parts(
        records: Vec<Record>,
        outbox: Vec<OutboxEntry>,
        dead_letters: Vec<DeadLetter>,
        next_sequence: u64,
    ) -> Self {
        let mut state = Self {
            next_sequence,
            ..Self::default()
        };
        for record in records {
            state.apply(StoreOp::PutRecord(record));
        }
        for entry in outbox {
            state.apply(StoreOp::Enqueue(entry));
        }
        for dead in dead_letters {
            state.apply(StoreOp::PutDeadLetter(dead));
        }
        state
    }

    /// Sequences start at 1 and never go backwards, even across dead letters.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.max(1)
    }

    pub fn apply(&mut self, op: StoreOp) {
        match op {
            StoreOp::PutRecord(record) => {
                self.records
                    .entry(record.collection)
                    .or_default()
                    .insert(record.identity.clone(), record);
            }
            StoreOp::DeleteRecord {
                collection,
                identity,
            } => {
                if let Some(records) = self.records.get_mut(&collection) {
                    records.remove(&identity);
                }
            }
            StoreOp::Enqueue(entry) => {
                self.bump_sequence(entry.sequence);
                self.outbox.insert(entry.sequence, entry);
            }
            StoreOp::RemoveEntry { sequence } => {
                self.outbox.remove(&sequence);
            }
            StoreOp::ReplaceEntry(entry) => {
                if let Some(slot) = self.outbox.get_mut(&entry.sequence) {
                    *slot = entry;
                }
            }
            StoreOp::PutDeadLetter(dead) => {
                self.bump_sequence(dead.entry.sequence);
                self.dead_letters.insert(dead.entry.sequence, dead);
            }
            StoreOp::RemoveDeadLetter { sequence } => {
                self.dead_letters.remove(&sequence);
            }
        }
    }

    fn bump_sequence(&mut self, used: u64) {
        self.next_sequence = self.next_sequence.max(used.saturating_add(1));
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn record(&self, collection: Collection, identity: &Identity) -> Option<&Record> {
        self.records.get(&collection).and_then(|r| r.get(identity))
    }

    pub fn records(&self, collection: Collection) -> Vec<Record> {
        self.records
            .get(&collection)
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_records(&self) -> Vec<Record> {
        Collection::ALL
            .into_iter()
            .flat_map(|c| self.records(c))
            .collect()
    }

    pub fn record_count(&self, collection: Collection) -> usize {
        self.records.get(&collection).map(BTreeMap::len).unwrap_or(0)
    }

    /// Outbox entries in sequence order.
    pub fn entries(&self) -> impl Iterator<Item = &OutboxEntry> {
        self.outbox.values()
    }

    pub fn entry(&self, sequence: u64) -> Option<&OutboxEntry> {
        self.outbox.get(&sequence)
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    pub fn pending_for(&self, lifeline: &Lifeline) -> Vec<&OutboxEntry> {
        self.outbox
            .values()
            .filter(|e| e.collection == lifeline.collection && e.identity == lifeline.identity)
            .collect()
    }

    pub fn referenced_identities(&self, collection: Collection) -> HashSet<Identity> {
        self.outbox
            .values()
            .filter(|e| e.collection == collection)
            .map(|e| e.identity.clone())
            .collect()
    }

    /// Records whose mirror copy or pending work `op` changes.
    pub fn touched_by(&self, op: &StoreOp) -> Vec<(Collection, Identity)> {
        match op {
            StoreOp::PutRecord(record) => vec![(record.collection, record.identity.clone())],
            StoreOp::DeleteRecord {
                collection,
                identity,
            } => vec![(*collection, identity.clone())],
            StoreOp::Enqueue(entry) => vec![(entry.collection, entry.identity.clone())],
            StoreOp::RemoveEntry { sequence } => self
                .entry(*sequence)
                .map(|entry| vec![(entry.collection, entry.identity.clone())])
                .unwrap_or_default(),
            StoreOp::ReplaceEntry(entry) => {
                let mut touched = vec![(entry.collection, entry.identity.clone())];
                if let Some(old) = self.entry(entry.sequence) {
                    touched.push((old.collection, old.identity.clone()));
                }
                touched
            }
            StoreOp::PutDeadLetter(_) | StoreOp::RemoveDeadLetter { .. } => Vec::new(),
        }
    }

    pub fn dead_letters(&self) -> impl Iterator<Item = &DeadLetter> {
        self.dead_letters.values()
    }

    pub fn dead_letter(&self, sequence: u64) -> Option<&DeadLetter> {
        self.dead_letters.get(&sequence)
    }

    // ------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------

    /// Validates a mutation against the lifeline invariants and returns the
    /// ops that record it.
    ///
    /// A Delete of a provisional record whose Create is not in flight cancels
    /// the whole lifeline instead of being queued.
    pub fn plan_enqueue(
        &self,
        in_flight: &HashSet<u64>,
        collection: Collection,
        identity: Identity,
        operation: Operation,
        payload: Fields,
    ) -> Result<(Vec<StoreOp>, EnqueueOutcome)> {
        let lifeline = Lifeline::new(collection, identity.clone());
        let pending = self.pending_for(&lifeline);

        match (operation, identity.is_provisional()) {
            (Operation::Create, false) => {
                return Err(SyncError::InvariantViolation(format!(
                    "create for {} must use a provisional identity",
                    lifeline
                )));
            }
            (Operation::Create, true) => {
                if pending.iter().any(|e| e.operation == Operation::Create) {
                    return Err(SyncError::InvariantViolation(format!(
                        "{} already has a pending create",
                        lifeline
                    )));
                }
            }
            (_, true) => {
                let create = pending.iter().find(|e| e.operation == Operation::Create);
                match (create, operation) {
                    (None, Operation::Delete) if self.record(collection, &identity).is_some() => {
                        // The Remote Authority never heard of it; drop it locally.
                        return Ok((
                            vec![StoreOp::DeleteRecord {
                                collection,
                                identity,
                            }],
                            EnqueueOutcome::Collapsed {
                                removed: Vec::new(),
                            },
                        ));
                    }
                    (None, _) => {
                        return Err(SyncError::InvariantViolation(format!(
                            "{} of {} has no pending create",
                            operation, lifeline
                        )));
                    }
                    (Some(create), Operation::Delete) if !in_flight.contains(&create.sequence) => {
                        let removed: Vec<u64> = pending.iter().map(|e| e.sequence).collect();
                        let mut ops: Vec<StoreOp> = removed
                            .iter()
                            .map(|&sequence| StoreOp::RemoveEntry { sequence })
                            .collect();
                        if self.record(collection, &identity).is_some() {
                            ops.push(StoreOp::DeleteRecord {
                                collection,
                                identity,
                            });
                        }
                        return Ok((ops, EnqueueOutcome::Collapsed { removed }));
                    }
                    _ => {}
                }
            }
            (_, false) => {
                if self.record(collection, &identity).is_none() {
                    return Err(SyncError::NotFound(format!(
                        "{} is not in the local mirror",
                        lifeline
                    )));
                }
            }
        }

        let sequence = self.next_sequence();
        let payload = match operation {
            Operation::Delete => Fields::Null,
            Operation::Create | Operation::Update => payload,
        };
        let entry = OutboxEntry {
            sequence,
            collection,
            identity,
            operation,
            payload,
            enqueued_at: Utc::now(),
        };
        Ok((
            vec![StoreOp::Enqueue(entry)],
            EnqueueOutcome::Enqueued { sequence },
        ))
    }

    /// Plans the swap of `old` (provisional) for `new` (confirmed) across the
    /// mirror record and every queued entry of that lifeline except `skip`.
    ///
    /// Fails with `IdentityConflict` when there is neither a provisional
    /// record to re-key nor a queued Delete explaining its absence.
    pub fn plan_rewrite_identity(
        &self,
        collection: Collection,
        old: &Identity,
        new: &Identity,
        skip: Option<u64>,
    ) -> Result<RewritePlan> {
        if !old.is_provisional() || !new.is_confirmed() {
            return Err(SyncError::InvariantViolation(format!(
                "identity rewrite must go from provisional to confirmed, got {} -> {}",
                old, new
            )));
        }

        let lifeline = Lifeline::new(collection, old.clone());
        let later: Vec<&OutboxEntry> = self
            .pending_for(&lifeline)
            .into_iter()
            .filter(|e| Some(e.sequence) != skip)
            .collect();
        if let Some(create) = later.iter().find(|e| e.operation == Operation::Create) {
            return Err(SyncError::InvariantViolation(format!(
                "cannot rewrite {} while its create #{} is still queued",
                lifeline, create.sequence
            )));
        }
        let has_pending_delete = later.iter().any(|e| e.operation == Operation::Delete);
        let has_pending_update = later.iter().any(|e| e.operation == Operation::Update);
        let record = self.record(collection, old);

        if record.is_none() && !has_pending_delete {
            return Err(SyncError::IdentityConflict(format!(
                "no provisional record for {} while confirming {}",
                lifeline, new
            )));
        }

        let mut plan = RewritePlan {
            has_pending_delete,
            has_pending_update,
            ..RewritePlan::default()
        };
        for entry in later {
            let mut rewritten = entry.clone();
            rewritten.identity = new.clone();
            plan.rewritten.push(rewritten.sequence);
            plan.ops.push(StoreOp::ReplaceEntry(rewritten));
        }
        if let Some(record) = record {
            let mut rekeyed = record.clone();
            rekeyed.identity = new.clone();
            plan.ops.push(StoreOp::DeleteRecord {
                collection,
                identity: old.clone(),
            });
            plan.ops.push(StoreOp::PutRecord(rekeyed.clone()));
            plan.rekeyed = Some(rekeyed);
        }
        Ok(plan)
    }

    /// Replaces the unreferenced part of a collection with the server's view.
    /// Any identity named by a queued entry, or listed in `protected`, is left
    /// exactly as it is locally.
    pub fn plan_merge(
        &self,
        collection: Collection,
        server: Vec<CanonicalRecord>,
        protected: &HashSet<Identity>,
    ) -> (Vec<StoreOp>, MergeStats) {
        let mut referenced = self.referenced_identities(collection);
        referenced.extend(protected.iter().cloned());
        let server_ids: HashSet<Identity> = server
            .iter()
            .map(|r| Identity::Confirmed(r.id.clone()))
            .collect();

        let mut ops = Vec::new();
        let mut stats = MergeStats::default();

        if let Some(local) = self.records.get(&collection) {
            for identity in local.keys() {
                if referenced.contains(identity) {
                    continue;
                }
                if !server_ids.contains(identity) {
                    ops.push(StoreOp::DeleteRecord {
                        collection,
                        identity: identity.clone(),
                    });
                    stats.removed += 1;
                }
            }
        }

        for canonical in server {
            let incoming = Record::from_canonical(collection, canonical);
            if referenced.contains(&incoming.identity) {
                stats.preserved += 1;
                continue;
            }
            let unchanged = self
                .record(collection, &incoming.identity)
                .map(|existing| existing.fields == incoming.fields)
                .unwrap_or(false);
            if !unchanged {
                ops.push(StoreOp::PutRecord(incoming));
                stats.upserted += 1;
            }
        }

        (ops, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with_provisional_create(state: &mut StoreState) -> Identity {
        let identity = Identity::new_provisional();
        state.apply(StoreOp::PutRecord(Record::new(
            Collection::Saving,
            identity.clone(),
            json!({"amount": 100}),
        )));
        let (ops, _) = state
            .plan_enqueue(
                &HashSet::new(),
                Collection::Saving,
                identity.clone(),
                Operation::Create,
                json!({"amount": 100}),
            )
            .unwrap();
        for op in ops {
            state.apply(op);
        }
        identity
    }

    #[test]
    fn sequences_are_strictly_increasing() {
        let mut state = StoreState::default();
        let first = with_provisional_create(&mut state);
        let (ops, outcome) = state
            .plan_enqueue(
                &HashSet::new(),
                Collection::Saving,
                first,
                Operation::Update,
                json!({"amount": 120}),
            )
            .unwrap();
        for op in ops {
            state.apply(op);
        }
        assert_eq!(outcome, EnqueueOutcome::Enqueued { sequence: 2 });
        state.apply(StoreOp::RemoveEntry { sequence: 2 });
        assert_eq!(state.next_sequence(), 3);
    }

    #[test]
    fn second_create_for_same_record_is_rejected() {
        let mut state = StoreState::default();
        let identity = with_provisional_create(&mut state);
        let err = state
            .plan_enqueue(
                &HashSet::new(),
                Collection::Saving,
                identity,
                Operation::Create,
                json!({}),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::InvariantViolation(_)));
    }

    #[test]
    fn update_of_unknown_confirmed_record_is_rejected() {
        let state = StoreState::default();
        let err = state
            .plan_enqueue(
                &HashSet::new(),
                Collection::Income,
                Identity::confirmed("srv-404"),
                Operation::Update,
                json!({"amount": 1}),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[test]
    fn delete_before_create_confirms_collapses_lifeline() {
        let mut state = StoreState::default();
        let identity = with_provisional_create(&mut state);
        let (ops, outcome) = state
            .plan_enqueue(
                &HashSet::new(),
                Collection::Saving,
                identity.clone(),
                Operation::Delete,
                Fields::Null,
            )
            .unwrap();
        for op in ops {
            state.apply(op);
        }
        assert_eq!(outcome, EnqueueOutcome::Collapsed { removed: vec![1] });
        assert_eq!(state.outbox_len(), 0);
        assert!(state.record(Collection::Saving, &identity).is_none());
    }

    #[test]
    fn delete_while_create_in_flight_is_queued() {
        let mut state = StoreState::default();
        let identity = with_provisional_create(&mut state);
        let in_flight: HashSet<u64> = [1].into_iter().collect();
        let (_, outcome) = state
            .plan_enqueue(
                &in_flight,
                Collection::Saving,
                identity,
                Operation::Delete,
                Fields::Null,
            )
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Enqueued { sequence: 2 });
    }

    #[test]
    fn rewrite_rekeys_record_and_later_entries() {
        let mut state = StoreState::default();
        let old = with_provisional_create(&mut state);
        let (ops, _) = state
            .plan_enqueue(
                &HashSet::new(),
                Collection::Saving,
                old.clone(),
                Operation::Update,
                json!({"amount": 150}),
            )
            .unwrap();
        for op in ops {
            state.apply(op);
        }

        let new = Identity::confirmed("srv-1");
        let plan = state
            .plan_rewrite_identity(Collection::Saving, &old, &new, Some(1))
            .unwrap();
        assert_eq!(plan.rewritten, vec![2]);
        assert!(plan.has_pending_update);
        for op in plan.ops {
            state.apply(op);
        }
        assert!(state.record(Collection::Saving, &old).is_none());
        assert!(state.record(Collection::Saving, &new).is_some());
        assert_eq!(state.entry(2).unwrap().identity, new);
        // The Create itself is not rewritten; the engine removes it.
        assert_eq!(state.entry(1).unwrap().identity, old);
    }

    #[test]
    fn rewrite_without_record_is_an_identity_conflict() {
        let state = StoreState::default();
        let err = state
            .plan_rewrite_identity(
                Collection::Saving,
                &Identity::new_provisional(),
                &Identity::confirmed("srv-1"),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::IdentityConflict(_)));
    }

    #[test]
    fn merge_skips_referenced_identities() {
        let mut state = StoreState::default();
        let pending = Identity::confirmed("srv-1");
        state.apply(StoreOp::PutRecord(Record::new(
            Collection::Expense,
            pending.clone(),
            json!({"amount": 75}),
        )));
        state.apply(StoreOp::PutRecord(Record::new(
            Collection::Expense,
            Identity::confirmed("srv-stale"),
            json!({"amount": 1}),
        )));
        let (ops, _) = state
            .plan_enqueue(
                &HashSet::new(),
                Collection::Expense,
                pending.clone(),
                Operation::Update,
                json!({"amount": 75}),
            )
            .unwrap();
        for op in ops {
            state.apply(op);
        }

        let server = vec![
            serde_json::from_value::<CanonicalRecord>(json!({"id": "srv-1", "amount": 50})).unwrap(),
            serde_json::from_value::<CanonicalRecord>(json!({"id": "srv-2", "amount": 20})).unwrap(),
        ];
        let (ops, stats) = state.plan_merge(Collection::Expense, server, &HashSet::new());
        for op in ops {
            state.apply(op);
        }
        assert_eq!(
            stats,
            MergeStats {
                upserted: 1,
                removed: 1,
                preserved: 1
            }
        );
        assert_eq!(
            state.record(Collection::Expense, &pending).unwrap().fields,
            json!({"amount": 75})
        );
        assert_eq!(state.record_count(Collection::Expense), 2);
    }

    #[test]
    fn touched_identities_are_left_alone_by_merge() {
        let mut state = StoreState::default();
        let confirmed = Identity::confirmed("srv-9");
        let record = Record::new(Collection::Income, confirmed.clone(), json!({"amount": 9}));
        let put = StoreOp::PutRecord(record);
        assert_eq!(
            state.touched_by(&put),
            vec![(Collection::Income, confirmed.clone())]
        );
        state.apply(put);

        let protected = HashSet::from([confirmed.clone()]);
        let (ops, stats) = state.plan_merge(Collection::Income, Vec::new(), &protected);
        assert!(ops.is_empty());
        assert_eq!(stats.removed, 0);

        let (ops, _) = state.plan_merge(Collection::Income, Vec::new(), &HashSet::new());
        assert_eq!(
            ops,
            vec![StoreOp::DeleteRecord {
                collection: Collection::Income,
                identity: confirmed,
            }]
        );
    }
}
