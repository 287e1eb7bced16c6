//! The entity store.
//!
//! Holds the materialized rows of one collection within one partition and
//! keeps them consistent under three independent triggers: local optimistic
//! mutations, reloads, and change feed events (including echoes of this
//! store's own writes).

use crate::config::StoreConfig;
use crate::notify::StoreNotification;
use crate::remote::RemoteCollection;
use crate::state::{
    Comparator, EventOutcome, LoadStatus, Resolution, StoreEntry, StoreSnapshot, StoreState,
};
use opsync_cache::{CacheKey, TtlCache};
use opsync_core::{
    normalize, AcceptAll, ChangeEvent, ChangeKind, CollectionName, Entity, ErrorReporter, NormalizedError,
    PartitionKey, QueryFilter, RawFailure, Record, RecordId, ValidationError, Validator,
};
use opsync_feed::{ChangeFeed, FeedSource, FeedStatus, ScopeFilter, Subscription};
use std::cmp::Ordering;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const NOTIFICATION_CAPACITY: usize = 64;

/// Builder for an [`EntityStore`].
pub struct EntityStoreBuilder<E: Entity> {
    collection: CollectionName,
    partition: PartitionKey,
    remote: Arc<dyn RemoteCollection<E>>,
    cache: TtlCache,
    filter: QueryFilter,
    validator: Arc<dyn Validator<E>>,
    order: Option<Comparator<E>>,
    reporter: ErrorReporter,
    config: StoreConfig,
}

impl<E: Entity> EntityStoreBuilder<E> {
    pub fn with_filter(mut self, filter: QueryFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_validator(mut self, validator: impl Validator<E> + 'static) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    pub fn with_order(mut self, order: impl Fn(&E, &E) -> Ordering + Send + Sync + 'static) -> Self {
        self.order = Some(Arc::new(order));
        self
    }

    pub fn with_reporter(mut self, reporter: ErrorReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> EntityStore<E> {
        let state = StoreState::new(self.order, self.config.echo_grace);
        let (state_tx, _) = watch::channel(state.snapshot());
        let (notify_tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let cache_key = CacheKey::new(&self.collection, &self.partition, &self.filter.shape());

        EntityStore {
            shared: Arc::new(Shared {
                collection: self.collection,
                partition: self.partition,
                filter: self.filter,
                cache_key,
                remote: self.remote,
                cache: self.cache,
                validator: self.validator,
                reporter: self.reporter,
                config: self.config,
                state: Mutex::new(state),
                state_tx,
                notify_tx,
                feed: Mutex::new(None),
            }),
        }
    }
}

struct Shared<E: Entity> {
    collection: CollectionName,
    partition: PartitionKey,
    filter: QueryFilter,
    cache_key: CacheKey,
    remote: Arc<dyn RemoteCollection<E>>,
    cache: TtlCache,
    validator: Arc<dyn Validator<E>>,
    reporter: ErrorReporter,
    config: StoreConfig,
    state: Mutex<StoreState<E>>,
    state_tx: watch::Sender<StoreSnapshot<E>>,
    notify_tx: broadcast::Sender<StoreNotification>,
    feed: Mutex<Option<Subscription>>,
}

/// Synchronized view of one collection within one partition.
///
/// Cheap to clone; clones share state.
pub struct EntityStore<E: Entity> {
    shared: Arc<Shared<E>>,
}

impl<E: Entity> Clone for EntityStore<E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<E: Entity> std::fmt::Debug for EntityStore<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("collection", &self.shared.collection)
            .field("partition", &self.shared.partition)
            .field("cache_key", &self.shared.cache_key)
            .finish()
    }
}

impl<E: Entity> EntityStore<E> {
    pub fn builder(
        collection: impl Into<CollectionName>,
        partition: impl Into<PartitionKey>,
        remote: Arc<dyn RemoteCollection<E>>,
        cache: TtlCache,
    ) -> EntityStoreBuilder<E> {
        EntityStoreBuilder {
            collection: collection.into(),
            partition: partition.into(),
            remote,
            cache,
            filter: QueryFilter::default(),
            validator: Arc::new(AcceptAll),
            order: None,
            reporter: ErrorReporter::default(),
            config: StoreConfig::default(),
        }
    }

    pub fn collection(&self) -> &CollectionName {
        &self.shared.collection
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.shared.partition
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.shared.cache_key
    }

    // ------------------------------------------------------------------
    // Reactive surface
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> StoreSnapshot<E> {
        self.lock().snapshot()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<StoreSnapshot<E>> {
        self.shared.state_tx.subscribe()
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<StoreNotification> {
        self.shared.notify_tx.subscribe()
    }

    pub fn items(&self) -> Vec<StoreEntry<E>> {
        self.lock().entries().to_vec()
    }

    pub fn status(&self) -> LoadStatus {
        self.lock().status()
    }

    pub fn last_error(&self) -> Option<NormalizedError> {
        self.lock().last_error().cloned()
    }

    /// Ids still waiting for their feed echo.
    pub fn pending_echoes(&self) -> Vec<RecordId> {
        self.lock().pending_echoes(Instant::now())
    }

    /// Echo entries currently stored, including expired ones not yet swept.
    pub fn armed_echoes(&self) -> usize {
        self.lock().armed_echoes()
    }

    /// Feed inserts parked until an in-flight add resolves.
    pub fn held_inserts(&self) -> usize {
        self.lock().held_count()
    }

    /// Drop expired echo entries and release held inserts past their grace.
    /// Run periodically by the feed pump.
    pub fn sweep_echoes(&self) -> usize {
        let now = Instant::now();
        let (swept, released) = {
            let mut state = self.lock();
            (state.sweep_echoes(now), state.release_held(now))
        };
        if swept > 0 {
            debug!(collection = %self.shared.collection, count = swept, "echo entries expired");
        }
        if !released.is_empty() {
            self.publish();
            self.announce_released(released);
        }
        swept
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Adopt a fresh cached collection, or fetch it.
    pub async fn load(&self) -> Result<(), NormalizedError> {
        let ttl = self.shared.config.cache_ttl;
        if let Some(records) = self.shared.cache.get::<Vec<Record<E>>>(&self.shared.cache_key, ttl) {
            let count = records.len();
            self.with_state(|state| {
                let ticket = state.tick();
                state.apply_snapshot(records, ticket);
                state.set_status(LoadStatus::Ready);
            });
            debug!(
                collection = %self.shared.collection,
                partition = %self.shared.partition,
                count = count,
                "adopted cached collection"
            );
            return Ok(());
        }
        self.fetch("load").await
    }

    /// Re-fetch, bypassing the cache.
    pub async fn reload(&self) -> Result<(), NormalizedError> {
        self.fetch("reload").await
    }

    async fn fetch(&self, operation: &str) -> Result<(), NormalizedError> {
        let ticket = self.with_state(|state| {
            state.set_status(LoadStatus::Loading);
            state.begin_fetch()
        });
        let _fetch = FetchGuard { store: self, ticket };

        let shared = &self.shared;
        let result = self
            .deadline(operation, shared.remote.fetch_all(&shared.partition, &shared.filter))
            .await;

        match result {
            Ok(records) => {
                let count = records.len();
                let cached = records.clone();
                let applied = self.with_state(|state| {
                    let applied = state.apply_snapshot(records, ticket);
                    state.set_status(LoadStatus::Ready);
                    applied
                });
                if applied {
                    shared.cache.set(&shared.cache_key, cached);
                    info!(
                        collection = %shared.collection,
                        partition = %shared.partition,
                        count = count,
                        operation = operation,
                        "collection loaded"
                    );
                } else {
                    debug!(
                        collection = %shared.collection,
                        ticket = ticket,
                        "stale snapshot discarded"
                    );
                }
                Ok(())
            }
            Err(raw) => {
                let error = self.fail(raw, operation, Some(LoadStatus::Errored));
                Err(error)
            }
        }
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Optimistically insert `candidate`, then create it remotely.
    pub async fn add(&self, candidate: E) -> Result<Record<E>, NormalizedError> {
        let shared = &self.shared;
        if let Err(invalid) = self.validate_new(&candidate) {
            return Err(self.reject(invalid, "add"));
        }

        let local = self.with_state(|state| state.insert_provisional(candidate.clone()));
        debug!(collection = %shared.collection, local = %local, "provisional entry inserted");

        let result = self
            .deadline("add", shared.remote.create(&shared.partition, &candidate))
            .await;

        match result {
            Ok(record) => {
                let id = record.id.clone();
                let (resolution, released) = self.with_state(|state| {
                    let now = Instant::now();
                    let resolution = state.resolve_provisional(&local, record.clone(), now);
                    (resolution, state.release_held(now))
                });
                self.invalidate();
                match resolution {
                    Resolution::EchoArmed => debug!(collection = %shared.collection, id = %id, "echo armed"),
                    Resolution::EchoSeen => debug!(collection = %shared.collection, id = %id, "held echo consumed"),
                    Resolution::AlreadyPresent => {
                        debug!(collection = %shared.collection, id = %id, "record already materialized")
                    }
                }
                self.announce_released(released);
                Ok(record)
            }
            Err(raw) => {
                let released = self.with_state(|state| {
                    state.discard_provisional(&local);
                    state.release_held(Instant::now())
                });
                warn!(collection = %shared.collection, local = %local, "add rolled back");
                self.announce_released(released);
                Err(self.recover(raw, "add").await)
            }
        }
    }

    /// Optimistically patch `id`, then update it remotely.
    ///
    /// An id that is not loaded locally is still sent to the server.
    pub async fn update(&self, id: &RecordId, patch: E::Patch) -> Result<Record<E>, NormalizedError> {
        let shared = &self.shared;
        if let Err(invalid) = shared.validator.validate_patch(&patch) {
            return Err(self.reject(invalid, "update"));
        }

        let pending = self.with_state(|state| state.apply_patch(id, &patch));
        let ticket = pending.ticket;

        let result = self
            .deadline("update", shared.remote.update_partial(id, &patch))
            .await;

        match result {
            Ok(record) => {
                let landed = self.with_state(|state| state.confirm_update(record.clone(), ticket));
                if !landed {
                    debug!(collection = %shared.collection, id = %id, "newer write kept over update response");
                }
                self.invalidate();
                Ok(record)
            }
            Err(raw) => {
                let reverted = self.with_state(|state| state.revert_update(id, pending));
                if reverted {
                    warn!(collection = %shared.collection, id = %id, "update rolled back");
                }
                Err(self.recover(raw, "update").await)
            }
        }
    }

    /// Optimistically remove `id`, then delete it remotely.
    pub async fn remove(&self, id: &RecordId) -> Result<(), NormalizedError> {
        let shared = &self.shared;
        let removal = self.with_state(|state| state.remove_local(id));
        let ticket = removal.ticket;

        let result = self.deadline("remove", shared.remote.delete(id)).await;

        match result {
            Ok(()) => {
                self.with_state(|state| state.finish_removal(id, ticket));
                self.invalidate();
                Ok(())
            }
            Err(raw) => {
                let restored = self.with_state(|state| state.restore_removed(id, removal));
                if restored {
                    warn!(collection = %shared.collection, id = %id, "remove rolled back");
                }
                Err(self.recover(raw, "remove").await)
            }
        }
    }

    // ------------------------------------------------------------------
    // Change feed
    // ------------------------------------------------------------------

    /// Merge one change feed event.
    pub fn on_remote_event(&self, event: ChangeEvent<E>) {
        let shared = &self.shared;
        let id = event.record_id().clone();
        let kind = event.kind();
        let outcome = self.with_state(|state| state.apply_event(event, Instant::now()));

        match outcome {
            EventOutcome::EchoSuppressed => {
                debug!(collection = %shared.collection, id = %id, "echo suppressed");
                return;
            }
            EventOutcome::Held => {
                debug!(collection = %shared.collection, id = %id, kind = ?kind, "held until pending add resolves");
                return;
            }
            EventOutcome::Inserted => {
                self.notify(StoreNotification::ExternalInsert {
                    collection: shared.collection.clone(),
                    id: id.clone(),
                });
            }
            EventOutcome::Deleted => {
                self.notify(StoreNotification::ExternalDelete {
                    collection: shared.collection.clone(),
                    id: id.clone(),
                });
            }
            EventOutcome::Updated | EventOutcome::Ignored => {}
        }
        debug!(collection = %shared.collection, id = %id, kind = ?kind, outcome = ?outcome, "remote event merged");

        // Updates and deletes always invalidate; a no-op insert does not.
        if outcome != EventOutcome::Ignored || kind != ChangeKind::Insert {
            self.invalidate();
        }
    }

    /// Subscribe to `source` scoped to this store's partition and filter.
    pub fn connect_feed(&self, source: &dyn FeedSource<E>) -> watch::Receiver<FeedStatus> {
        let scope = ScopeFilter::new(self.shared.partition.clone()).with_query(self.shared.filter.clone());
        self.connect_feed_scoped(source, scope)
    }

    /// Subscribe to `source` with a custom scope filter.
    ///
    /// Replaces any previous subscription. The pump also sweeps the echo
    /// window every `sweep_interval`.
    pub fn connect_feed_scoped(
        &self,
        source: &dyn FeedSource<E>,
        scope: ScopeFilter<E>,
    ) -> watch::Receiver<FeedStatus> {
        let config = &self.shared.config;
        let on_event = self.weak_handler(|store, event| store.on_remote_event(event));
        let sweeper = Arc::downgrade(&self.shared);

        let subscription = ChangeFeed::new(self.shared.collection.clone(), self.shared.partition.clone())
            .with_capacity(config.feed_buffer)
            .with_tick(config.sweep_interval, move || {
                if let Some(shared) = sweeper.upgrade() {
                    EntityStore { shared }.sweep_echoes();
                }
            })
            .subscribe(source, move |raw| scope.accepts(raw), on_event);
        let status = subscription.watch_status();

        let previous = self
            .shared
            .feed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(subscription);
        drop(previous);
        status
    }

    /// Tear down the change feed subscription. Idempotent.
    pub fn dispose(&self) {
        let subscription = self
            .shared
            .feed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut subscription) = subscription {
            subscription.unsubscribe();
            info!(collection = %self.shared.collection, "store disposed");
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, StoreState<E>> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one state transition and publish the resulting snapshot.
    fn with_state<R>(&self, f: impl FnOnce(&mut StoreState<E>) -> R) -> R {
        let mut state = self.lock();
        let out = f(&mut state);
        self.shared.state_tx.send_replace(state.snapshot());
        out
    }

    fn publish(&self) {
        let snapshot = self.lock().snapshot();
        self.shared.state_tx.send_replace(snapshot);
    }

    /// Held feed inserts that turned out to be external.
    fn announce_released(&self, released: Vec<RecordId>) {
        if released.is_empty() {
            return;
        }
        for id in released {
            debug!(collection = %self.shared.collection, id = %id, "held insert released");
            self.notify(StoreNotification::ExternalInsert {
                collection: self.shared.collection.clone(),
                id,
            });
        }
        self.invalidate();
    }

    fn weak_handler(
        &self,
        handler: impl Fn(EntityStore<E>, ChangeEvent<E>) + Send + 'static,
    ) -> impl FnMut(ChangeEvent<E>) + Send + 'static {
        let weak: Weak<Shared<E>> = Arc::downgrade(&self.shared);
        move |event| {
            if let Some(shared) = weak.upgrade() {
                handler(EntityStore { shared }, event);
            }
        }
    }

    fn validate_new(&self, candidate: &E) -> Result<(), ValidationError> {
        let partition = candidate.partition_key();
        if partition != &self.shared.partition {
            return Err(ValidationError::PartitionMismatch {
                expected: self.shared.partition.to_string(),
                got: partition.to_string(),
            });
        }
        self.shared.validator.validate_new(candidate)
    }

    async fn deadline<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T, RawFailure>>,
    ) -> Result<T, RawFailure> {
        let after = self.shared.config.request_timeout;
        match tokio::time::timeout(after, call).await {
            Ok(result) => result,
            Err(_) => Err(RawFailure::Timeout {
                operation: format!("{}.{}", self.shared.collection, operation),
                after,
            }),
        }
    }

    fn invalidate(&self) {
        let pattern = CacheKey::partition_pattern(&self.shared.collection, &self.shared.partition);
        self.shared.cache.invalidate_pattern(&pattern);
    }

    fn notify(&self, notification: StoreNotification) {
        // No receivers is fine.
        let _ = self.shared.notify_tx.send(notification);
    }

    /// Surface a locally rejected mutation. Nothing reached the network.
    fn reject(&self, invalid: ValidationError, operation: &str) -> NormalizedError {
        let error: NormalizedError = invalid.into();
        self.surface(error.clone(), operation, None);
        error
    }

    /// Normalize, record and report a remote failure.
    fn fail(&self, raw: RawFailure, operation: &str, status: Option<LoadStatus>) -> NormalizedError {
        let error = normalize(raw);
        self.surface(error.clone(), operation, status);
        error
    }

    fn surface(&self, error: NormalizedError, operation: &str, status: Option<LoadStatus>) {
        let context = format!("{}.{}", self.shared.collection, operation);
        self.shared.reporter.report(&error, &context);
        self.with_state(|state| {
            state.record_error(error.clone());
            if let Some(status) = status {
                state.set_status(status);
            }
        });
        self.notify(StoreNotification::Error(error));
    }

    /// Failure path of a mutation: surface the error, then resync.
    ///
    /// A failed resync leaves the store errored but keeps the mutation's
    /// error as the one on record.
    async fn recover(&self, raw: RawFailure, operation: &str) -> NormalizedError {
        let error = self.fail(raw, operation, None);
        if let Err(reload_error) = self.reload().await {
            debug!(
                collection = %self.shared.collection,
                error = %reload_error,
                "resync after failed mutation also failed"
            );
            self.with_state(|state| state.record_error(error.clone()));
        }
        error
    }
}

/// Ends a fetch ticket when the fetch finishes or its future is dropped.
struct FetchGuard<'a, E: Entity> {
    store: &'a EntityStore<E>,
    ticket: u64,
}

impl<E: Entity> Drop for FetchGuard<'_, E> {
    fn drop(&mut self) {
        self.store.lock().end_fetch(self.ticket);
    }
}
