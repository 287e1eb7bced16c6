//! OPSYNC Cache - Short-Lived Read Cache
//!
//! A shared, explicitly constructed TTL cache used by entity stores to skip
//! redundant fetches. Keys are scoped by collection and partition.

pub mod key;
pub mod ttl;

pub use key::CacheKey;
pub use ttl::{CacheStats, TtlCache};
