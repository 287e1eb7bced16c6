//! The push channel seam.

use opsync_core::{CollectionName, Entity, PartitionKey, RawChange};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What a feed source delivers into a subscriber's channel.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal<E> {
    Connected,
    Change(RawChange<E>),
    Disconnected { reason: String },
    Error { message: String },
}

/// A push channel delivering change notifications for one collection.
///
/// Implementations own their transport, including reconnection. Delivery
/// must stop once the returned handle is closed.
pub trait FeedSource<E: Entity>: Send + Sync {
    fn open(
        &self,
        collection: &CollectionName,
        partition: &PartitionKey,
        sender: mpsc::Sender<FeedSignal<E>>,
    ) -> SourceHandle;
}

/// Stops delivery from an opened source.
pub struct SourceHandle {
    close: Option<Box<dyn FnOnce() + Send>>,
}

impl SourceHandle {
    pub fn new(close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            close: Some(Box::new(close)),
        }
    }

    /// Handle for a source driven by a spawned task; closing aborts it.
    pub fn from_task(task: JoinHandle<()>) -> Self {
        Self::new(move || task.abort())
    }

    /// Handle for a source with nothing to stop.
    pub fn noop() -> Self {
        Self { close: None }
    }

    /// Stop delivery. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(close) = self.close.take() {
            close();
        }
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceHandle")
            .field("open", &self.close.is_some())
            .finish()
    }
}
