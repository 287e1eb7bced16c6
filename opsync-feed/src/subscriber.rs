//! Change feed subscriber.
//!
//! A subscription opens a [`FeedSource`] into a bounded channel and drains it
//! on a spawned task. Accepted changes are converted to [`ChangeEvent`]s and
//! handed to the caller's callback in arrival order.

use crate::source::{FeedSignal, FeedSource, SourceHandle};
use opsync_core::{ChangeEvent, CollectionName, Entity, PartitionKey, RawChange};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default capacity of the signal channel.
pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// Connection status of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    Connecting,
    Connected,
    Disconnected { reason: String },
}

impl FeedStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, FeedStatus::Connected)
    }
}

type Tick = Box<dyn FnMut() + Send>;

/// Builder for a change feed subscription on one collection and partition.
pub struct ChangeFeed {
    collection: CollectionName,
    partition: PartitionKey,
    capacity: usize,
    tick: Option<(Duration, Tick)>,
}

impl ChangeFeed {
    pub fn new(collection: CollectionName, partition: PartitionKey) -> Self {
        Self {
            collection,
            partition,
            capacity: DEFAULT_FEED_CAPACITY,
            tick: None,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Run `tick` every `period` on the subscriber task, between signals.
    pub fn with_tick(mut self, period: Duration, tick: impl FnMut() + Send + 'static) -> Self {
        if !period.is_zero() {
            self.tick = Some((period, Box::new(tick)));
        }
        self
    }

    /// Open `source` and start delivering accepted changes to `on_event`.
    ///
    /// Changes for another collection, or rejected by `filter`, are dropped.
    /// Must be called from within a tokio runtime.
    pub fn subscribe<E, F, H>(self, source: &dyn FeedSource<E>, filter: F, on_event: H) -> Subscription
    where
        E: Entity,
        F: Fn(&RawChange<E>) -> bool + Send + 'static,
        H: FnMut(ChangeEvent<E>) + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let (status_tx, status_rx) = watch::channel(FeedStatus::Connecting);

        let source_handle = source.open(&self.collection, &self.partition, sender);
        info!(
            collection = %self.collection,
            partition = %self.partition,
            capacity = self.capacity,
            "change feed subscribed"
        );

        let pump = Pump {
            collection: self.collection.clone(),
            receiver,
            status: status_tx.clone(),
            filter,
            on_event,
        };
        let task = tokio::spawn(pump.run(self.tick));

        Subscription {
            collection: self.collection,
            source: Some(source_handle),
            task: Some(task),
            status_tx,
            status_rx,
        }
    }
}

struct Pump<E, F, H> {
    collection: CollectionName,
    receiver: mpsc::Receiver<FeedSignal<E>>,
    status: watch::Sender<FeedStatus>,
    filter: F,
    on_event: H,
}

impl<E, F, H> Pump<E, F, H>
where
    E: Entity,
    F: Fn(&RawChange<E>) -> bool + Send + 'static,
    H: FnMut(ChangeEvent<E>) + Send + 'static,
{
    async fn run(mut self, tick: Option<(Duration, Tick)>) {
        match tick {
            Some((period, mut tick)) => {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        signal = self.receiver.recv() => match signal {
                            Some(signal) => self.handle(signal),
                            None => break,
                        },
                        _ = interval.tick() => tick(),
                    }
                }
            }
            None => {
                while let Some(signal) = self.receiver.recv().await {
                    self.handle(signal);
                }
            }
        }
        debug!(collection = %self.collection, "change feed source ended");
        self.status.send_replace(FeedStatus::Disconnected {
            reason: "source closed".to_string(),
        });
    }

    fn handle(&mut self, signal: FeedSignal<E>) {
        match signal {
            FeedSignal::Connected => {
                info!(collection = %self.collection, "change feed connected");
                self.status.send_replace(FeedStatus::Connected);
            }
            FeedSignal::Disconnected { reason } => {
                warn!(collection = %self.collection, reason = %reason, "change feed disconnected");
                self.status.send_replace(FeedStatus::Disconnected { reason });
            }
            FeedSignal::Error { message } => {
                warn!(collection = %self.collection, error = %message, "change feed error");
            }
            FeedSignal::Change(raw) => {
                if raw.collection() != &self.collection {
                    debug!(
                        collection = %self.collection,
                        other = %raw.collection(),
                        "change for another collection dropped"
                    );
                    return;
                }
                if !(self.filter)(&raw) {
                    debug!(
                        collection = %self.collection,
                        id = %raw.record_id(),
                        kind = ?raw.kind(),
                        "change outside scope dropped"
                    );
                    return;
                }
                debug!(
                    collection = %self.collection,
                    id = %raw.record_id(),
                    kind = ?raw.kind(),
                    "change accepted"
                );
                (self.on_event)(ChangeEvent::from(raw));
            }
        }
    }
}

/// A live change feed subscription.
///
/// Dropping the subscription tears it down.
#[derive(Debug)]
pub struct Subscription {
    collection: CollectionName,
    source: Option<SourceHandle>,
    task: Option<JoinHandle<()>>,
    status_tx: watch::Sender<FeedStatus>,
    status_rx: watch::Receiver<FeedStatus>,
}

impl Subscription {
    /// Current connection status.
    pub fn status(&self) -> FeedStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch connection status changes.
    pub fn watch_status(&self) -> watch::Receiver<FeedStatus> {
        self.status_rx.clone()
    }

    pub fn is_active(&self) -> bool {
        self.task.is_some()
    }

    /// Stop delivery. No callback runs after this returns. Idempotent.
    pub fn unsubscribe(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        if let Some(mut source) = self.source.take() {
            source.close();
        }
        task.abort();
        self.status_tx.send_replace(FeedStatus::Disconnected {
            reason: "unsubscribed".to_string(),
        });
        info!(collection = %self.collection, "change feed unsubscribed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
