//! Drains the outbox against the Remote Authority.
//!
//! A pass walks the queued sequences in order. Each entry is re-read and
//! claimed under the store lock, sent without the lock, and its result applied
//! in one atomic batch conditioned on the entry still being queued. A failed
//! entry blocks the rest of its lifeline for the remainder of the pass; other
//! lifelines keep going.

use super::trigger::ConnectivityMonitor;
use crate::config::{PermanentFailurePolicy, SyncConfig};
use crate::core::{
    CanonicalRecord, Collection, DeadLetter, Identity, Lifeline, Operation, OutboxEntry, Record,
    RemoteError, Result, SyncError,
};
use crate::remote::{RemoteAuthority, RemoteResult};
use crate::storage::{LocalStore, StoreOp};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, watch};
use tracing::{Instrument, Level, event, info_span};

const DEFAULT_EVENT_CAPACITY: usize = 64;

/// How the engine treats remote calls and their failures.
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    pub request_timeout: Duration,
    pub permanent_failures: PermanentFailurePolicy,
    pub delete_missing_is_success: bool,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            permanent_failures: PermanentFailurePolicy::DeadLetter,
            delete_missing_is_success: true,
        }
    }
}

impl From<&SyncConfig> for ReconcilePolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            request_timeout: config.request_timeout_duration(),
            permanent_failures: config.permanent_failures,
            delete_missing_is_success: config.delete_missing_is_success,
        }
    }
}

/// Notifications published after engine activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// At least one entry was reconciled during the pass.
    Converged { reconciled: usize },
    /// The pass ended with entries still queued.
    PendingRemaining { remaining: usize },
    DeadLettered {
        sequence: u64,
        collection: Collection,
        identity: Identity,
        reason: String,
    },
    IdentityConfirmed {
        collection: Collection,
        provisional: Identity,
        confirmed: Identity,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Entries sent to the Remote Authority.
    pub attempted: usize,
    pub reconciled: usize,
    pub transient_failures: usize,
    pub dead_lettered: usize,
    /// Permanently rejected entries left queued.
    pub retained: usize,
    /// Entries skipped because an earlier entry of their lifeline failed.
    pub blocked: usize,
    /// Outbox length when the pass ended.
    pub remaining: usize,
    pub cancelled: bool,
}

impl ReconcileReport {
    pub fn is_converged(&self) -> bool {
        self.remaining == 0 && !self.cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Another pass was already running.
    Skipped,
    /// Connectivity was down when the pass would have started.
    Offline,
    Completed(ReconcileReport),
}

impl ReconcileOutcome {
    pub fn report(&self) -> Option<&ReconcileReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Skipped | Self::Offline => None,
        }
    }
}

enum RemoteResponse {
    Created(CanonicalRecord),
    Updated(Option<CanonicalRecord>),
    Deleted,
}

enum Dispatch {
    Done(RemoteResult<RemoteResponse>),
    Interrupted,
}

enum Claim {
    Gone,
    Blocked(Lifeline),
    Claimed(OutboxEntry),
}

enum Confirmation {
    Stale,
    Created {
        provisional: Identity,
        confirmed: Identity,
        rewritten: usize,
    },
    Conflict {
        reason: String,
        dead_lettered: Vec<DeadLetter>,
    },
    Applied,
}

/// Clears the single-flight flag when the pass ends, however it ends.
struct PassGuard<'a> {
    running: &'a AtomicBool,
}

impl<'a> PassGuard<'a> {
    fn acquire(running: &'a AtomicBool) -> Option<Self> {
        running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { running })
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Marks one sequence as being sent until dropped.
struct InFlight<'a> {
    store: &'a LocalStore,
    sequence: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.store.release_in_flight(self.sequence);
    }
}

pub struct ReconciliationEngine {
    store: LocalStore,
    remote: Arc<dyn RemoteAuthority>,
    connectivity: ConnectivityMonitor,
    policy: ReconcilePolicy,
    running: AtomicBool,
    cancel_requested: AtomicBool,
    cancel_notify: Notify,
    events: broadcast::Sender<SyncEvent>,
}

impl ReconciliationEngine {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteAuthority>,
        connectivity: ConnectivityMonitor,
    ) -> Self {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            store,
            remote,
            connectivity,
            policy: ReconcilePolicy::default(),
            running: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            events,
        }
    }

    pub fn with_policy(mut self, policy: ReconcilePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        self.events = events;
        self
    }

    pub fn policy(&self) -> &ReconcilePolicy {
        &self.policy
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops the running pass at the next suspension point. The entry being
    /// sent stays queued exactly as it was.
    pub fn cancel(&self) {
        if self.is_running() {
            event!(Level::INFO, "reconcile pass cancellation requested");
        }
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
    }

    /// Runs one reconciliation pass.
    ///
    /// Per-entry failures are absorbed into the report; only local store
    /// failures are returned as errors.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        let Some(_pass) = PassGuard::acquire(&self.running) else {
            event!(Level::DEBUG, "reconcile skipped: pass already running");
            return Ok(ReconcileOutcome::Skipped);
        };
        self.cancel_requested.store(false, Ordering::SeqCst);

        if !self.connectivity.is_online() {
            event!(Level::DEBUG, "reconcile skipped: offline");
            return Ok(ReconcileOutcome::Offline);
        }

        let report = self
            .run_pass()
            .instrument(info_span!("sync.reconcile"))
            .await?;

        event!(
            Level::INFO,
            attempted = report.attempted,
            reconciled = report.reconciled,
            transient_failures = report.transient_failures,
            dead_lettered = report.dead_lettered,
            blocked = report.blocked,
            remaining = report.remaining,
            cancelled = report.cancelled,
            "reconcile pass finished"
        );
        if report.reconciled > 0 {
            self.emit(SyncEvent::Converged {
                reconciled: report.reconciled,
            });
        }
        if report.remaining > 0 {
            self.emit(SyncEvent::PendingRemaining {
                remaining: report.remaining,
            });
        }
        Ok(ReconcileOutcome::Completed(report))
    }

    async fn run_pass(&self) -> Result<ReconcileReport> {
        let queued: Vec<u64> = self
            .store
            .read(|state| state.entries().map(|entry| entry.sequence).collect())?;
        event!(Level::DEBUG, pending = queued.len(), "reconcile pass started");

        let mut report = ReconcileReport::default();
        let mut blocked: HashSet<Lifeline> = HashSet::new();

        for sequence in queued {
            if self.interrupted() {
                report.cancelled = true;
                break;
            }

            let claim = self.store.write(|inner| {
                let Some(entry) = inner.state().entry(sequence).cloned() else {
                    return Ok(Claim::Gone);
                };
                let lifeline = entry.lifeline();
                // An Update/Delete still keyed provisionally means its Create
                // has not confirmed.
                let unsendable =
                    entry.operation != Operation::Create && entry.identity.is_provisional();
                if blocked.contains(&lifeline) || unsendable {
                    return Ok(Claim::Blocked(lifeline));
                }
                inner.mark_in_flight(sequence);
                Ok(Claim::Claimed(entry))
            })?;

            let entry = match claim {
                Claim::Gone => continue,
                Claim::Blocked(lifeline) => {
                    event!(Level::DEBUG, sequence, %lifeline, "entry blocked behind its lifeline");
                    report.blocked += 1;
                    blocked.insert(lifeline);
                    continue;
                }
                Claim::Claimed(entry) => entry,
            };
            let _in_flight = InFlight {
                store: &self.store,
                sequence,
            };

            report.attempted += 1;
            match self.dispatch(&entry).await {
                Dispatch::Interrupted => {
                    event!(Level::INFO, sequence, "reconcile pass interrupted mid-call");
                    report.cancelled = true;
                    break;
                }
                Dispatch::Done(Ok(response)) => self.confirm(entry, response, &mut report)?,
                Dispatch::Done(Err(err)) => {
                    self.handle_failure(entry, err, &mut report, &mut blocked)?
                }
            }
        }

        report.remaining = self.store.read(|state| state.outbox_len())?;
        Ok(report)
    }

    fn interrupted(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst) || !self.connectivity.is_online()
    }

    /// Sends one entry, racing the call against its timeout, `cancel()` and
    /// connectivity loss.
    async fn dispatch(&self, entry: &OutboxEntry) -> Dispatch {
        let cancelled = self.cancel_notify.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();
        if self.interrupted() {
            return Dispatch::Interrupted;
        }

        let mut connectivity = self.connectivity.subscribe();
        let timeout = self.policy.request_timeout;
        let call = tokio::time::timeout(timeout, self.call_remote(entry));

        tokio::select! {
            biased;
            _ = &mut cancelled => Dispatch::Interrupted,
            _ = went_offline(&mut connectivity) => Dispatch::Interrupted,
            result = call => match result {
                Ok(result) => Dispatch::Done(result),
                Err(_) => Dispatch::Done(Err(RemoteError::transient(format!(
                    "request timed out after {} ms",
                    timeout.as_millis()
                )))),
            },
        }
    }

    async fn call_remote(&self, entry: &OutboxEntry) -> RemoteResult<RemoteResponse> {
        let collection = entry.collection;
        match entry.operation {
            Operation::Create => self
                .remote
                .create(collection, &entry.payload)
                .await
                .map(RemoteResponse::Created),
            Operation::Update => self
                .remote
                .update(collection, confirmed_id(entry)?, &entry.payload)
                .await
                .map(RemoteResponse::Updated),
            Operation::Delete => self
                .remote
                .delete(collection, confirmed_id(entry)?)
                .await
                .map(|()| RemoteResponse::Deleted),
        }
    }

    /// Applies a successful remote call as one atomic batch.
    fn confirm(
        &self,
        sent: OutboxEntry,
        response: RemoteResponse,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let sequence = sent.sequence;
        let collection = sent.collection;

        let confirmation = self.store.write(|inner| {
            let Some(entry) = inner.state().entry(sequence).cloned() else {
                return Ok(Confirmation::Stale);
            };
            let lifeline = entry.lifeline();
            let mut ops = vec![StoreOp::RemoveEntry { sequence }];

            match response {
                RemoteResponse::Created(canonical) => {
                    let confirmed = Identity::Confirmed(canonical.id.clone());
                    let plan = inner.state().plan_rewrite_identity(
                        collection,
                        &entry.identity,
                        &confirmed,
                        Some(sequence),
                    );
                    match plan {
                        Ok(plan) => {
                            let rewritten = plan.rewritten.len();
                            let keep_local = plan.has_pending_update || plan.has_pending_delete;
                            ops.extend(plan.ops);
                            if !keep_local {
                                ops.push(StoreOp::PutRecord(Record::from_canonical(
                                    collection, canonical,
                                )));
                            }
                            inner.commit(ops)?;
                            Ok(Confirmation::Created {
                                provisional: entry.identity,
                                confirmed,
                                rewritten,
                            })
                        }
                        Err(SyncError::IdentityConflict(reason)) => {
                            let now = Utc::now();
                            let later: Vec<OutboxEntry> = inner
                                .state()
                                .pending_for(&lifeline)
                                .into_iter()
                                .filter(|e| e.sequence != sequence)
                                .cloned()
                                .collect();
                            let mut dead_lettered = Vec::with_capacity(later.len());
                            for later in later {
                                ops.push(StoreOp::RemoveEntry {
                                    sequence: later.sequence,
                                });
                                let dead = DeadLetter {
                                    entry: later,
                                    reason: format!("identity conflict: {}", reason),
                                    status: None,
                                    dead_lettered_at: now,
                                };
                                ops.push(StoreOp::PutDeadLetter(dead.clone()));
                                dead_lettered.push(dead);
                            }
                            ops.push(StoreOp::PutRecord(Record::from_canonical(
                                collection, canonical,
                            )));
                            inner.commit(ops)?;
                            Ok(Confirmation::Conflict {
                                reason,
                                dead_lettered,
                            })
                        }
                        Err(err) => Err(err),
                    }
                }
                RemoteResponse::Updated(echo) => {
                    let superseded = inner
                        .state()
                        .pending_for(&lifeline)
                        .iter()
                        .any(|e| e.sequence != sequence);
                    let present = inner.state().record(collection, &entry.identity).is_some();
                    if let Some(canonical) = echo {
                        if present && !superseded {
                            ops.push(StoreOp::PutRecord(Record::new(
                                collection,
                                entry.identity.clone(),
                                Value::Object(canonical.fields),
                            )));
                        }
                    }
                    inner.commit(ops)?;
                    Ok(Confirmation::Applied)
                }
                RemoteResponse::Deleted => {
                    if inner.state().record(collection, &entry.identity).is_some() {
                        ops.push(StoreOp::DeleteRecord {
                            collection,
                            identity: entry.identity.clone(),
                        });
                    }
                    inner.commit(ops)?;
                    Ok(Confirmation::Applied)
                }
            }
        })?;

        if !matches!(confirmation, Confirmation::Stale) {
            report.reconciled += 1;
        }
        match confirmation {
            Confirmation::Stale => {
                event!(
                    Level::DEBUG,
                    sequence,
                    "entry left the outbox while in flight; result not applied"
                );
            }
            Confirmation::Applied => {
                event!(Level::DEBUG, sequence, operation = %sent.operation, "entry reconciled");
            }
            Confirmation::Created {
                provisional,
                confirmed,
                rewritten,
            } => {
                event!(
                    Level::INFO,
                    sequence,
                    %collection,
                    %provisional,
                    %confirmed,
                    rewritten,
                    "create confirmed"
                );
                self.emit(SyncEvent::IdentityConfirmed {
                    collection,
                    provisional,
                    confirmed,
                });
            }
            Confirmation::Conflict {
                reason,
                dead_lettered,
            } => {
                event!(
                    Level::ERROR,
                    sequence,
                    %collection,
                    %reason,
                    dropped = dead_lettered.len(),
                    "identity conflict while confirming create"
                );
                report.dead_lettered += dead_lettered.len();
                self.announce_dead_letters(dead_lettered);
            }
        }
        Ok(())
    }

    fn handle_failure(
        &self,
        entry: OutboxEntry,
        err: RemoteError,
        report: &mut ReconcileReport,
        blocked: &mut HashSet<Lifeline>,
    ) -> Result<()> {
        if entry.operation == Operation::Delete
            && err.is_not_found()
            && self.policy.delete_missing_is_success
        {
            event!(
                Level::DEBUG,
                sequence = entry.sequence,
                "delete target already gone remotely"
            );
            return self.confirm(entry, RemoteResponse::Deleted, report);
        }

        let lifeline = entry.lifeline();
        match &err {
            RemoteError::Transient { message } => {
                event!(
                    Level::WARN,
                    sequence = entry.sequence,
                    %lifeline,
                    error = %message,
                    "transient failure; entry stays queued"
                );
                report.transient_failures += 1;
            }
            RemoteError::Permanent { status, message } => match self.policy.permanent_failures {
                PermanentFailurePolicy::Retain => {
                    event!(
                        Level::WARN,
                        sequence = entry.sequence,
                        %lifeline,
                        status = ?status,
                        error = %message,
                        "permanent failure; entry retained"
                    );
                    report.retained += 1;
                }
                PermanentFailurePolicy::DeadLetter => {
                    let dead = self.dead_letter(&entry, *status, message)?;
                    report.dead_lettered += dead.len();
                    self.announce_dead_letters(dead);
                }
            },
        }
        blocked.insert(lifeline);
        Ok(())
    }

    /// Moves a rejected entry to the dead-letter list. A rejected Create takes
    /// the rest of its lifeline with it.
    fn dead_letter(
        &self,
        entry: &OutboxEntry,
        status: Option<u16>,
        message: &str,
    ) -> Result<Vec<DeadLetter>> {
        self.store.write(|inner| {
            let Some(current) = inner.state().entry(entry.sequence).cloned() else {
                return Ok(Vec::new());
            };
            let now = Utc::now();
            let mut victims = vec![(current.clone(), message.to_string(), status)];
            if current.operation == Operation::Create {
                let dependent: Vec<OutboxEntry> = inner
                    .state()
                    .pending_for(&current.lifeline())
                    .into_iter()
                    .filter(|e| e.sequence != current.sequence)
                    .cloned()
                    .collect();
                for later in dependent {
                    let reason = format!("create #{} was rejected: {}", current.sequence, message);
                    victims.push((later, reason, None));
                }
            }

            let mut ops = Vec::with_capacity(victims.len() * 2);
            let mut dead_letters = Vec::with_capacity(victims.len());
            for (victim, reason, status) in victims {
                ops.push(StoreOp::RemoveEntry {
                    sequence: victim.sequence,
                });
                let dead = DeadLetter {
                    entry: victim,
                    reason,
                    status,
                    dead_lettered_at: now,
                };
                ops.push(StoreOp::PutDeadLetter(dead.clone()));
                dead_letters.push(dead);
            }
            inner.commit(ops)?;
            Ok(dead_letters)
        })
    }

    fn announce_dead_letters(&self, dead_letters: Vec<DeadLetter>) {
        for dead in dead_letters {
            event!(
                Level::WARN,
                sequence = dead.entry.sequence,
                collection = %dead.entry.collection,
                identity = %dead.entry.identity,
                operation = %dead.entry.operation,
                reason = %dead.reason,
                "entry dead-lettered"
            );
            self.emit(SyncEvent::DeadLettered {
                sequence: dead.entry.sequence,
                collection: dead.entry.collection,
                identity: dead.entry.identity,
                reason: dead.reason,
            });
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("policy", &self.policy)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn confirmed_id(entry: &OutboxEntry) -> RemoteResult<&str> {
    entry.identity.remote_id().ok_or_else(|| {
        RemoteError::permanent(None, format!("{} has no confirmed id", entry.lifeline()))
    })
}

async fn went_offline(rx: &mut watch::Receiver<bool>) {
    loop {
        if !*rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
