//! OPSYNC Store - Synchronized Entity Store
//!
//! An [`EntityStore`] keeps a local, ordered, reactive copy of one remote
//! collection within one partition. Mutations apply optimistically and
//! roll back on failure; change feed events are merged, with this store's
//! own writes suppressed while their echo is expected.

pub mod config;
pub mod echo;
pub mod notify;
pub mod remote;
pub mod state;
pub mod store;

pub use config::StoreConfig;
pub use echo::EchoWindow;
pub use notify::StoreNotification;
pub use remote::RemoteCollection;
pub use state::{Comparator, EventOutcome, LoadStatus, Resolution, StoreEntry, StoreSnapshot};
pub use store::{EntityStore, EntityStoreBuilder};
