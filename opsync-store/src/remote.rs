//! The remote data service seam.

use async_trait::async_trait;
use opsync_core::{Entity, PartitionKey, QueryFilter, RawFailure, Record, RecordId};

/// The four operations a store needs from the remote data service for one
/// collection.
///
/// Implementations report failures as [`RawFailure`]; the store normalizes
/// them. Implementations need not enforce deadlines, the store does.
#[async_trait]
pub trait RemoteCollection<E: Entity>: Send + Sync {
    /// Fetch every row of the partition matching `filter`.
    async fn fetch_all(
        &self,
        partition: &PartitionKey,
        filter: &QueryFilter,
    ) -> Result<Vec<Record<E>>, RawFailure>;

    /// Create a row. The server assigns the id.
    async fn create(&self, partition: &PartitionKey, fields: &E) -> Result<Record<E>, RawFailure>;

    /// Apply a partial update and return the full row.
    async fn update_partial(&self, id: &RecordId, patch: &E::Patch)
        -> Result<Record<E>, RawFailure>;

    async fn delete(&self, id: &RecordId) -> Result<(), RawFailure>;
}
