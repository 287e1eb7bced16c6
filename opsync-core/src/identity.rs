//! Identity types for opsync entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier assigned by the remote data service.
    RecordId
);

string_id!(
    /// Tenant/owner scope an entity, a store and a subscription are bound to.
    PartitionKey
);

string_id!(
    /// Logical collection name (`plannings`, `inventories`, a named query).
    CollectionName
);

/// Client-generated identifier for an entity the server has not confirmed yet.
///
/// UUIDv7 keeps provisional ids sortable by creation time. The type is
/// distinct from [`RecordId`], so a provisional id can never be mistaken for
/// a server id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(Uuid);

impl LocalId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local:{}", self.0)
    }
}

/// Identity of an entry held by an entity store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "id", rename_all = "snake_case")]
pub enum EntryKey {
    /// Optimistically inserted, awaiting the remote create.
    Provisional(LocalId),
    /// Confirmed by the remote data service.
    Persisted(RecordId),
}

impl EntryKey {
    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self, Self::Persisted(_))
    }

    /// The server id, if the entry has one.
    pub fn record_id(&self) -> Option<&RecordId> {
        match self {
            Self::Persisted(id) => Some(id),
            Self::Provisional(_) => None,
        }
    }

    pub fn matches(&self, id: &RecordId) -> bool {
        self.record_id() == Some(id)
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisional(local) => local.fmt(f),
            Self::Persisted(id) => id.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ids_are_unique() {
        let a = LocalId::generate();
        let b = LocalId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_entry_key_record_id() {
        let persisted = EntryKey::Persisted(RecordId::new("real-42"));
        let provisional = EntryKey::Provisional(LocalId::generate());

        assert_eq!(persisted.record_id(), Some(&RecordId::new("real-42")));
        assert!(persisted.matches(&RecordId::new("real-42")));
        assert!(provisional.record_id().is_none());
        assert!(provisional.is_provisional());
    }

    #[test]
    fn test_provisional_display_is_prefixed() {
        let local = LocalId::generate();
        assert!(EntryKey::Provisional(local).to_string().starts_with("local:"));
    }

    #[test]
    fn test_string_ids_serialize_transparently() -> Result<(), serde_json::Error> {
        let id = RecordId::new("real-42");
        assert_eq!(serde_json::to_string(&id)?, "\"real-42\"");
        let back: PartitionKey = serde_json::from_str("\"tenant-1\"")?;
        assert_eq!(back.as_str(), "tenant-1");
        Ok(())
    }
}
