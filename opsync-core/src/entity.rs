//! The entity contract shared by stores, caches and feeds.

use crate::identity::{PartitionKey, RecordId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::Debug;

/// A record shape an entity store can synchronize.
///
/// The store is generic over the domain fields; it only needs to read the
/// partition key and to apply a partial update.
///
/// # Implementation Requirements
///
/// - `partition_key()` must return the tenant/owner scope of this instance
/// - `apply_patch()` must only touch the fields the patch carries
/// - Implementations must be `Clone`, `Serialize` and `DeserializeOwned` for
///   caching and the wire
/// - Implementations must be `Send + Sync + 'static` for async compatibility
pub trait Entity: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Partial-change payload for `update`.
    type Patch: Clone + Debug + Serialize + Send + Sync + 'static;

    /// Column holding the partition key on the remote side.
    const PARTITION_FIELD: &'static str = "partition_key";

    /// Get the partition (tenant/owner) this entity belongs to.
    fn partition_key(&self) -> &PartitionKey;

    /// Apply a partial update, preserving every field the patch leaves out.
    fn apply_patch(&mut self, patch: &Self::Patch);
}

/// An entity as the remote data service returns it: server id plus fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<E> {
    pub id: RecordId,
    #[serde(flatten)]
    pub fields: E,
}

impl<E> Record<E> {
    pub fn new(id: impl Into<RecordId>, fields: E) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn map<U, F>(self, f: F) -> Record<U>
    where
        F: FnOnce(E) -> U,
    {
        Record {
            id: self.id,
            fields: f(self.fields),
        }
    }
}

impl<E: Entity> Record<E> {
    pub fn partition_key(&self) -> &PartitionKey {
        self.fields.partition_key()
    }
}
