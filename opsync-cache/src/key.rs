//! Collision-free cache keys.
//!
//! A `CacheKey` can only be built from a collection, a partition and a query
//! shape, so two stores scoped to different tenants can never share a key.
//! Each segment is escaped before joining, which keeps `:` and `*` inside a
//! segment from colliding with the separators and the glob wildcard.

use opsync_core::{CollectionName, PartitionKey};
use std::fmt;

const SEPARATOR: char = ':';

/// Key of one cached query result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Private inner data - cannot be constructed externally
    inner: String,
}

impl CacheKey {
    /// Create a key for `collection` scoped to `partition`, narrowed by `shape`.
    pub fn new(collection: &CollectionName, partition: &PartitionKey, shape: &str) -> Self {
        Self {
            inner: format!(
                "{}{sep}{}{sep}{}",
                escape(collection.as_str()),
                escape(partition.as_str()),
                escape(shape),
                sep = SEPARATOR
            ),
        }
    }

    /// Glob matching every key of `collection` within `partition`.
    pub fn partition_pattern(collection: &CollectionName, partition: &PartitionKey) -> String {
        format!(
            "{}{sep}{}{sep}*",
            escape(collection.as_str()),
            escape(partition.as_str()),
            sep = SEPARATOR
        )
    }

    /// Glob matching every key of `collection`, across partitions.
    pub fn collection_pattern(collection: &CollectionName) -> String {
        format!("{}{}*", escape(collection.as_str()), SEPARATOR)
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

fn escape(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for c in segment.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '*' => out.push_str("%2A"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(collection: &str, partition: &str, shape: &str) -> CacheKey {
        CacheKey::new(&collection.into(), &partition.into(), shape)
    }

    #[test]
    fn test_key_format() {
        assert_eq!(key("plannings", "tenant-1", "all").as_str(), "plannings:tenant-1:all");
    }

    #[test]
    fn test_keys_differ_by_partition() {
        assert_ne!(key("plannings", "tenant-1", "all"), key("plannings", "tenant-2", "all"));
    }

    #[test]
    fn test_separator_inside_segment_does_not_collide() {
        let a = key("plannings", "a:b", "all");
        let b = key("plannings", "a", "b:all");
        assert_ne!(a, b);
    }

    #[test]
    fn test_partition_pattern() {
        let pattern = CacheKey::partition_pattern(&"plannings".into(), &"tenant-1".into());
        assert_eq!(pattern, "plannings:tenant-1:*");
    }

    #[test]
    fn test_wildcard_in_partition_is_escaped() {
        let pattern = CacheKey::partition_pattern(&"plannings".into(), &"*".into());
        assert_eq!(pattern, "plannings:%2A:*");
    }
}
