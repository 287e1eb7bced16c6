//! Expiring set of ids awaiting their change feed echo.

use opsync_core::RecordId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Ids this store just wrote, each with the deadline after which a matching
/// feed event is treated as a genuine external change.
#[derive(Debug, Clone)]
pub struct EchoWindow {
    grace: Duration,
    deadlines: HashMap<RecordId, Instant>,
}

impl EchoWindow {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            deadlines: HashMap::new(),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Expect an echo for `id` until `now + grace`. Re-arming extends it.
    pub fn arm(&mut self, id: RecordId, now: Instant) {
        self.deadlines.insert(id, now + self.grace);
    }

    /// Consume the entry for `id` if it is still live.
    pub fn take(&mut self, id: &RecordId, now: Instant) -> bool {
        self.sweep(now);
        self.deadlines.remove(id).is_some()
    }

    pub fn contains(&mut self, id: &RecordId, now: Instant) -> bool {
        self.sweep(now);
        self.deadlines.contains_key(id)
    }

    /// Drop every entry whose deadline has passed. Returns how many.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.deadlines.len();
        self.deadlines.retain(|_, deadline| *deadline > now);
        before - self.deadlines.len()
    }

    pub fn ids(&mut self, now: Instant) -> Vec<RecordId> {
        self.sweep(now);
        let mut ids: Vec<RecordId> = self.deadlines.keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
