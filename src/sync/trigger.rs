use super::engine::{ReconcileOutcome, ReconciliationEngine};
use crate::config::RetryPolicy;
use crate::core::{Result, SyncError};
use std::sync::Arc;
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{Level, event};

/// External connectivity signal.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Subscribers are only woken on an actual change.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            event!(Level::INFO, online, "connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Wakes the trigger after a local mutation.
#[derive(Debug, Clone, Default)]
pub struct Nudge {
    notify: Arc<Notify>,
}

impl Nudge {
    pub fn new() -> Self {
        Self::default()
    }

    /// A nudge sent while no one is waiting is kept until the next wait.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Offline,
    Online,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    Reconcile,
    None,
}

impl TriggerState {
    /// State at process start; an online start drains leftovers from a
    /// previous session.
    pub fn initial(online: bool) -> (Self, TriggerAction) {
        if online {
            (Self::Online, TriggerAction::Reconcile)
        } else {
            (Self::Offline, TriggerAction::None)
        }
    }

    pub fn on_signal(self, online: bool) -> (Self, TriggerAction) {
        match (self, online) {
            (Self::Offline, true) => (Self::Online, TriggerAction::Reconcile),
            (Self::Online, false) => (Self::Offline, TriggerAction::None),
            (state, _) => (state, TriggerAction::None),
        }
    }
}

/// Exponential retry schedule used while the outbox stays non-empty.
#[derive(Debug)]
struct RetrySchedule {
    policy: RetryPolicy,
    attempt: u32,
    next: Option<Instant>,
}

impl RetrySchedule {
    fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            next: None,
        }
    }

    fn reset(&mut self) {
        self.attempt = 0;
        self.next = None;
    }

    fn schedule(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.policy.backoff(self.attempt);
        event!(Level::DEBUG, attempt = self.attempt, delay_ms = delay.as_millis() as u64, "reconcile retry scheduled");
        self.next = Some(Instant::now() + delay);
    }

    async fn wait(&self) {
        match self.next {
            Some(at) => sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    }
}

/// Background task driving `reconcile()` from connectivity edges, nudges and
/// retries. Local mutations reach it through the shared [`Nudge`].
pub struct ConnectivityTriggerHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl ConnectivityTriggerHandle {
    /// Signals the trigger to stop and waits for it to finish. A pass that is
    /// running is allowed to complete.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| SyncError::Execution(format!("connectivity trigger join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for ConnectivityTriggerHandle {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawns the trigger on the current tokio runtime.
pub fn spawn_connectivity_trigger(
    engine: Arc<ReconciliationEngine>,
    monitor: ConnectivityMonitor,
    nudge: Nudge,
    retry: RetryPolicy,
) -> ConnectivityTriggerHandle {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        let mut signal = monitor.subscribe();
        let mut retries = RetrySchedule::new(retry);
        let (mut state, action) = TriggerState::initial(*signal.borrow_and_update());
        event!(Level::DEBUG, ?state, "connectivity trigger started");
        if action == TriggerAction::Reconcile {
            run_pass(&engine, &mut retries).await;
        }

        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                changed = signal.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *signal.borrow_and_update();
                    let (next, action) = state.on_signal(online);
                    state = next;
                    if action == TriggerAction::Reconcile {
                        retries.reset();
                        run_pass(&engine, &mut retries).await;
                    }
                }
                _ = nudge.notified() => {
                    if state == TriggerState::Online {
                        run_pass(&engine, &mut retries).await;
                    }
                }
                _ = retries.wait() => {
                    retries.next = None;
                    if state == TriggerState::Online {
                        run_pass(&engine, &mut retries).await;
                    }
                }
            }
        }
        event!(Level::DEBUG, "connectivity trigger stopped");
    });

    ConnectivityTriggerHandle {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}

async fn run_pass(engine: &ReconciliationEngine, retries: &mut RetrySchedule) {
    match engine.reconcile().await {
        Ok(ReconcileOutcome::Completed(report)) => {
            if report.remaining == 0 {
                retries.reset();
            } else {
                retries.schedule();
            }
        }
        // The running pass owns the outbox; check back after it.
        Ok(ReconcileOutcome::Skipped) => retries.schedule(),
        // The next Offline -> Online edge starts over.
        Ok(ReconcileOutcome::Offline) => retries.reset(),
        Err(err) => {
            event!(Level::ERROR, error = %err, "reconcile pass failed");
            retries.schedule();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        assert_eq!(
            TriggerState::initial(true),
            (TriggerState::Online, TriggerAction::Reconcile)
        );
        assert_eq!(
            TriggerState::initial(false),
            (TriggerState::Offline, TriggerAction::None)
        );
        assert_eq!(
            TriggerState::Offline.on_signal(true),
            (TriggerState::Online, TriggerAction::Reconcile)
        );
        assert_eq!(
            TriggerState::Online.on_signal(false),
            (TriggerState::Offline, TriggerAction::None)
        );
        assert_eq!(
            TriggerState::Online.on_signal(true),
            (TriggerState::Online, TriggerAction::None)
        );
        assert_eq!(
            TriggerState::Offline.on_signal(false),
            (TriggerState::Offline, TriggerAction::None)
        );
    }

    #[tokio::test]
    async fn monitor_only_signals_real_changes() {
        let monitor = ConnectivityMonitor::new(false);
        let mut rx = monitor.subscribe();
        monitor.set_online(false);
        assert!(!rx.has_changed().unwrap());
        monitor.set_online(true);
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
        assert!(monitor.is_online());
    }

    #[test]
    fn retry_schedule_backs_off() {
        let mut retries = RetrySchedule::new(RetryPolicy {
            base_backoff_ms: 10,
            max_backoff_ms: 40,
        });
        retries.schedule();
        retries.schedule();
        retries.schedule();
        assert_eq!(retries.attempt, 3);
        assert!(retries.next.is_some());
        retries.reset();
        assert_eq!(retries.attempt, 0);
        assert!(retries.next.is_none());
    }
}
