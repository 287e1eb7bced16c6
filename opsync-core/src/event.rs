//! Change feed event types.
//!
//! [`RawChange`] is what the push channel delivers; [`ChangeEvent`] is what a
//! store ingests once a subscriber has accepted the raw change.

use crate::entity::{Entity, Record};
use crate::identity::{CollectionName, PartitionKey, RecordId};
use serde::{Deserialize, Serialize};

/// The three kinds of change the feed reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Identity of a deleted row. Backends do not always ship the partition key
/// of a deleted row, so it is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRef {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<PartitionKey>,
}

/// A notification as received from the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum RawChange<E> {
    Insert {
        collection: CollectionName,
        record: Record<E>,
    },
    Update {
        collection: CollectionName,
        record: Record<E>,
    },
    Delete {
        collection: CollectionName,
        old_record: RecordRef,
    },
}

impl<E> RawChange<E> {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Insert { .. } => ChangeKind::Insert,
            Self::Update { .. } => ChangeKind::Update,
            Self::Delete { .. } => ChangeKind::Delete,
        }
    }

    pub fn collection(&self) -> &CollectionName {
        match self {
            Self::Insert { collection, .. }
            | Self::Update { collection, .. }
            | Self::Delete { collection, .. } => collection,
        }
    }

    pub fn record_id(&self) -> &RecordId {
        match self {
            Self::Insert { record, .. } | Self::Update { record, .. } => &record.id,
            Self::Delete { old_record, .. } => &old_record.id,
        }
    }

    /// Domain fields carried by the change; deletes carry none.
    pub fn fields(&self) -> Option<&E> {
        match self {
            Self::Insert { record, .. } | Self::Update { record, .. } => Some(&record.fields),
            Self::Delete { .. } => None,
        }
    }
}

impl<E: Entity> RawChange<E> {
    /// Partition key of the changed row, when the event carries one.
    pub fn partition_key(&self) -> Option<&PartitionKey> {
        match self {
            Self::Insert { record, .. } | Self::Update { record, .. } => {
                Some(record.partition_key())
            }
            Self::Delete { old_record, .. } => old_record.partition_key.as_ref(),
        }
    }
}

/// A change accepted by a subscriber and handed to a store.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<E> {
    Insert(Record<E>),
    Update(Record<E>),
    Delete(RecordId),
}

impl<E> ChangeEvent<E> {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Insert(_) => ChangeKind::Insert,
            Self::Update(_) => ChangeKind::Update,
            Self::Delete(_) => ChangeKind::Delete,
        }
    }

    pub fn record_id(&self) -> &RecordId {
        match self {
            Self::Insert(record) | Self::Update(record) => &record.id,
            Self::Delete(id) => id,
        }
    }
}

impl<E> From<RawChange<E>> for ChangeEvent<E> {
    fn from(raw: RawChange<E>) -> Self {
        match raw {
            RawChange::Insert { record, .. } => Self::Insert(record),
            RawChange::Update { record, .. } => Self::Update(record),
            RawChange::Delete { old_record, .. } => Self::Delete(old_record.id),
        }
    }
}
