use super::persistence::{DurabilityMode, PersistenceManager};
use super::state::{StoreOp, StoreState};
use crate::config::SyncConfig;
use crate::core::{Collection, Identity, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{Level, event};

/// Mutable interior of the local store.
pub struct StoreInner {
    state: StoreState,
    persistence: Option<PersistenceManager>,
    /// Sequences currently being sent by a reconciliation pass. Not persisted:
    /// after a restart nothing is in flight.
    in_flight: HashSet<u64>,
    /// Open pull windows by ticket: the collection being fetched and every
    /// identity of it written since the fetch began.
    pulls: HashMap<u64, (Collection, HashSet<Identity>)>,
    next_pull: u64,
}

impl StoreInner {
    fn new(state: StoreState, persistence: Option<PersistenceManager>) -> Self {
        Self {
            state,
            persistence,
            in_flight: HashSet::new(),
            pulls: HashMap::new(),
            next_pull: 0,
        }
    }

    pub fn state(&self) -> &StoreState {
        &self.state
    }

    pub fn in_flight(&self) -> &HashSet<u64> {
        &self.in_flight
    }

    /// Journals `ops` as one frame, then applies them. Nothing is applied if
    /// the journal write fails.
    pub fn commit(&mut self, ops: Vec<StoreOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        if let Some(persistence) = self.persistence.as_mut() {
            persistence.log(&ops)?;
        }
        for op in ops {
            if !self.pulls.is_empty() {
                self.note_touched(&op);
            }
            self.state.apply(op);
        }
        self.maybe_checkpoint();
        Ok(())
    }

    fn maybe_checkpoint(&mut self) {
        let Some(persistence) = self.persistence.as_mut() else {
            return;
        };
        if !persistence.needs_checkpoint() {
            return;
        }
        // The journal already holds every committed frame; a failed snapshot
        // only delays compaction.
        if let Err(err) = persistence.checkpoint(&self.state) {
            event!(Level::WARN, error = %err, "local store checkpoint failed");
        }
    }

    fn note_touched(&mut self, op: &StoreOp) {
        for (collection, identity) in self.state.touched_by(op) {
            for (watched, touched) in self.pulls.values_mut() {
                if *watched == collection {
                    touched.insert(identity.clone());
                }
            }
        }
    }

    /// Identities written since the pull window `ticket` opened.
    pub fn touched_since(&self, ticket: u64) -> HashSet<Identity> {
        self.pulls
            .get(&ticket)
            .map(|(_, touched)| touched.clone())
            .unwrap_or_default()
    }

    pub fn mark_in_flight(&mut self, sequence: u64) {
        self.in_flight.insert(sequence);
    }

    pub fn clear_in_flight(&mut self, sequence: u64) {
        self.in_flight.remove(&sequence);
    }
}

/// The persistence substrate shared by the mirror and the outbox.
///
/// Every read and write goes through one mutex, so UI writes and engine
/// reads of the same keys are linearizable. The lock is never held across a
/// remote call.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl LocalStore {
    /// Opens the store described by `config`, recovering any journaled state.
    pub fn open(config: &SyncConfig) -> Result<Self> {
        config.validate()?;
        let (state, persistence) = match (&config.data_dir, config.durability) {
            (Some(dir), mode) if mode != DurabilityMode::None => {
                let mut manager = PersistenceManager::new(dir, mode)?;
                manager.set_checkpoint_threshold(config.checkpoint_every_ops);
                let state = manager.recover()?;
                (state, Some(manager))
            }
            _ => (StoreState::default(), None),
        };

        event!(
            Level::INFO,
            pending = state.outbox_len(),
            dead_letters = state.dead_letters().count(),
            durable = persistence.is_some(),
            "local store opened"
        );

        Ok(Self {
            inner: Arc::new(Mutex::new(StoreInner::new(state, persistence))),
        })
    }

    /// A store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner::new(StoreState::default(), None))),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> Result<R> {
        let guard = self.inner.lock()?;
        Ok(f(&guard.state))
    }

    /// Runs `f` with exclusive access; whatever it commits is atomic with
    /// respect to every other reader and writer.
    pub fn write<R>(&self, f: impl FnOnce(&mut StoreInner) -> Result<R>) -> Result<R> {
        let mut guard = self.inner.lock()?;
        f(&mut guard)
    }

    pub fn commit(&self, ops: Vec<StoreOp>) -> Result<()> {
        self.write(|inner| inner.commit(ops))
    }

    /// Forces a snapshot and truncates the journal.
    pub fn checkpoint(&self) -> Result<()> {
        let mut guard = self.inner.lock()?;
        let inner = &mut *guard;
        match inner.persistence.as_mut() {
            Some(persistence) => persistence.checkpoint(&inner.state),
            None => Ok(()),
        }
    }

    /// Releases a sequence claimed by a reconciliation pass. Runs from
    /// `Drop`, so a poisoned lock is entered anyway.
    pub fn release_in_flight(&self, sequence: u64) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.clear_in_flight(sequence);
    }

    /// Starts tracking writes to `collection` until the returned window is
    /// dropped. A server snapshot fetched inside the window is older than
    /// those writes.
    pub fn open_pull_window(&self, collection: Collection) -> Result<PullWindow> {
        let mut guard = self.inner.lock()?;
        guard.next_pull += 1;
        let ticket = guard.next_pull;
        guard.pulls.insert(ticket, (collection, HashSet::new()));
        Ok(PullWindow {
            store: self.clone(),
            ticket,
        })
    }

    pub fn is_durable(&self) -> Result<bool> {
        let guard = self.inner.lock()?;
        Ok(guard.persistence.is_some())
    }
}

/// Open pull window; closes when dropped.
pub struct PullWindow {
    store: LocalStore,
    ticket: u64,
}

impl PullWindow {
    pub fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl Drop for PullWindow {
    fn drop(&mut self) {
        let mut guard = self
            .store
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard.pulls.remove(&self.ticket);
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore").finish_non_exhaustive()
    }
}
