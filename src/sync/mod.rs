pub mod engine;
pub mod merge;
pub mod repository;
pub mod trigger;

pub use engine::{
    ReconcileOutcome, ReconcilePolicy, ReconcileReport, ReconciliationEngine, SyncEvent,
};
pub use merge::PullMerge;
pub use repository::Repository;
pub use trigger::{
    ConnectivityMonitor, ConnectivityTriggerHandle, Nudge, TriggerAction, TriggerState,
    spawn_connectivity_trigger,
};
