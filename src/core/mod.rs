pub mod error;
pub mod types;

pub use error::{RemoteError, Result, SyncError};
pub use types::{
    CanonicalRecord, Collection, DeadLetter, Fields, Identity, Lifeline, Operation, OutboxEntry,
    Record,
};
