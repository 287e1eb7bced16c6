//! Shared online/offline hint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Last known reachability of the backend.
///
/// Transports flip it as connections fail or succeed; REST failures read it
/// to tell an offline client from a flaky network.
#[derive(Debug, Clone)]
pub struct Connectivity(Arc<AtomicBool>);

impl Default for Connectivity {
    fn default() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
}

impl Connectivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_online(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Record a new reachability. Returns true when it changed.
    pub fn set_online(&self, online: bool) -> bool {
        self.0.swap(online, Ordering::AcqRel) != online
    }
}
