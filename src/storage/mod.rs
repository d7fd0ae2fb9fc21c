pub mod mirror;
pub mod outbox;
pub mod persistence;
pub mod state;
pub mod store;

pub use mirror::MirrorStore;
pub use outbox::OutboxLog;
pub use persistence::{DurabilityMode, PersistenceManager};
pub use state::{EnqueueOutcome, MergeStats, StoreOp, StoreState};
pub use store::{LocalStore, PullWindow, StoreInner};
