//! Side-effect notifications for toast-style UI hooks.

use opsync_core::{CollectionName, NormalizedError, RecordId};

/// Something the UI may want to announce.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreNotification {
    /// Another client inserted a row into this store's scope.
    ExternalInsert { collection: CollectionName, id: RecordId },
    /// A row in this store's scope was deleted remotely.
    ExternalDelete { collection: CollectionName, id: RecordId },
    /// An operation failed; the error has already been reported.
    Error(NormalizedError),
}

impl StoreNotification {
    pub fn is_error(&self) -> bool {
        matches!(self, StoreNotification::Error(_))
    }
}
