//! Scope filtering of raw changes.

use opsync_core::{Entity, PartitionKey, QueryFilter, RawChange};
use std::sync::Arc;

type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Accepts the changes that belong to one store's scope.
///
/// A change is in scope when its partition key matches. Deletes that do not
/// carry a partition key are accepted, since the backend may omit it and an
/// unknown id is ignored downstream anyway. An optional predicate further
/// narrows inserts and updates.
pub struct ScopeFilter<E> {
    partition: PartitionKey,
    predicate: Option<Predicate<E>>,
}

impl<E: Entity> ScopeFilter<E> {
    pub fn new(partition: PartitionKey) -> Self {
        Self {
            partition,
            predicate: None,
        }
    }

    pub fn with_predicate(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Narrow by a secondary query filter evaluated on the serialized row.
    pub fn with_query(self, filter: QueryFilter) -> Self {
        if filter.is_empty() {
            return self;
        }
        self.with_predicate(move |fields: &E| match serde_json::to_value(fields) {
            Ok(object) => filter.matches(&object),
            Err(_) => false,
        })
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub fn accepts(&self, raw: &RawChange<E>) -> bool {
        if let Some(partition) = raw.partition_key() {
            if partition != &self.partition {
                return false;
            }
        }
        match (&self.predicate, raw.fields()) {
            (Some(predicate), Some(fields)) => predicate(fields),
            _ => true,
        }
    }
}

impl<E> Clone for ScopeFilter<E> {
    fn clone(&self) -> Self {
        Self {
            partition: self.partition.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

impl<E> std::fmt::Debug for ScopeFilter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeFilter")
            .field("partition", &self.partition)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}
