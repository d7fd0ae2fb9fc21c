//! Contract of the Remote Authority, the backend that owns canonical
//! identities and state.

use crate::core::{CanonicalRecord, Collection, Fields, RemoteError};
use async_trait::async_trait;

pub mod http;
pub mod memory;

pub use http::HttpRemoteAuthority;
pub use memory::{InMemoryRemoteAuthority, RemoteCall, RemoteOperation};

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Per-collection create/update/delete/list operations.
///
/// Every failure is classified as `Transient` (retry later) or `Permanent`
/// (cannot succeed as sent).
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Creates a record and returns it with its permanent id.
    async fn create(&self, collection: Collection, payload: &Fields) -> RemoteResult<CanonicalRecord>;

    /// Replaces a record's fields. Servers that echo the stored record
    /// return it; the echo wins over the local copy.
    async fn update(
        &self,
        collection: Collection,
        id: &str,
        payload: &Fields,
    ) -> RemoteResult<Option<CanonicalRecord>>;

    async fn delete(&self, collection: Collection, id: &str) -> RemoteResult<()>;

    async fn list(&self, collection: Collection) -> RemoteResult<Vec<CanonicalRecord>>;
}
