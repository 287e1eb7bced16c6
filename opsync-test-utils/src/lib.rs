//! OPSYNC Test Utilities
//!
//! Centralized test infrastructure for the opsync workspace:
//! - An in-memory remote collection with scriptable failures and latency
//! - A manual change feed source driven by the test
//! - Proptest generators for the built-in entities
//! - Test fixtures and store builders for common scenarios
//! - Custom assertions for normalized errors

pub use opsync_core::{
    normalize, ChangeEvent, CollectionName, DynamicRecord, Entity, EntryKey, ErrorKind,
    InventoryCount, InventoryPatch, NormalizedError, PartitionKey, Planning, PlanningPatch,
    PlanningStatus, QueryFilter, RawChange, RawFailure, Record, RecordId, RecordRef,
};
pub use opsync_feed::{FeedSignal, FeedSource, SourceHandle};
pub use opsync_store::{EntityStore, LoadStatus, RemoteCollection, StoreConfig};

use async_trait::async_trait;
use opsync_core::error::CODE_NO_ROWS;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// IN-MEMORY REMOTE
// ============================================================================

/// Remote operations, for scripting failures and counting calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    FetchAll,
    Create,
    Update,
    Delete,
}

struct RemoteInner<E> {
    rows: Vec<Record<E>>,
    failures: HashMap<RemoteOp, VecDeque<RawFailure>>,
    assigned_ids: VecDeque<RecordId>,
    calls: HashMap<RemoteOp, usize>,
    latency: Duration,
    echo: Option<(CollectionName, ManualFeedSource<E>)>,
}

/// A remote collection held in memory.
///
/// Server ids default to `srv-1`, `srv-2`, ...; script specific ids with
/// [`InMemoryRemote::assign_next_id`].
pub struct InMemoryRemote<E> {
    inner: Mutex<RemoteInner<E>>,
    sequence: AtomicU64,
}

impl<E: Entity> Default for InMemoryRemote<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> InMemoryRemote<E> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RemoteInner {
                rows: Vec::new(),
                failures: HashMap::new(),
                assigned_ids: VecDeque::new(),
                calls: HashMap::new(),
                latency: Duration::ZERO,
                echo: None,
            }),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn with_rows(rows: Vec<Record<E>>) -> Self {
        let remote = Self::new();
        remote.lock().rows = rows;
        remote
    }

    /// Publish every successful write to `feed`, as a backend would.
    pub fn with_echo(self, collection: impl Into<CollectionName>, feed: ManualFeedSource<E>) -> Self {
        self.lock().echo = Some((collection.into(), feed));
        self
    }

    fn lock(&self) -> MutexGuard<'_, RemoteInner<E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace a row directly, bypassing the call counters.
    pub fn seed(&self, record: Record<E>) {
        let mut inner = self.lock();
        inner.rows.retain(|row| row.id != record.id);
        inner.rows.push(record);
    }

    pub fn rows(&self) -> Vec<Record<E>> {
        self.lock().rows.clone()
    }

    pub fn row(&self, id: &RecordId) -> Option<Record<E>> {
        self.lock().rows.iter().find(|row| &row.id == id).cloned()
    }

    /// Make the next call of `op` fail with `failure`.
    pub fn fail_next(&self, op: RemoteOp, failure: RawFailure) {
        self.lock().failures.entry(op).or_default().push_back(failure);
    }

    /// The next `create` assigns `id`.
    pub fn assign_next_id(&self, id: impl Into<RecordId>) {
        self.lock().assigned_ids.push_back(id.into());
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn calls(&self, op: RemoteOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    /// Count the call and pop a scripted failure, then wait out the latency.
    async fn begin(&self, op: RemoteOp) -> Result<(), RawFailure> {
        let (failure, latency) = {
            let mut inner = self.lock();
            *inner.calls.entry(op).or_insert(0) += 1;
            let failure = inner.failures.get_mut(&op).and_then(VecDeque::pop_front);
            (failure, inner.latency)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn echo(&self, change: impl FnOnce(CollectionName) -> RawChange<E>) {
        let echo = self.lock().echo.clone();
        if let Some((collection, feed)) = echo {
            feed.try_emit(change(collection));
        }
    }
}

#[async_trait]
impl<E: Entity> RemoteCollection<E> for InMemoryRemote<E> {
    async fn fetch_all(
        &self,
        partition: &PartitionKey,
        filter: &QueryFilter,
    ) -> Result<Vec<Record<E>>, RawFailure> {
        self.begin(RemoteOp::FetchAll).await?;
        let rows = self
            .lock()
            .rows
            .iter()
            .filter(|row| row.partition_key() == partition)
            .filter(|row| {
                filter.is_empty()
                    || serde_json::to_value(&row.fields).is_ok_and(|object| filter.matches(&object))
            })
            .cloned()
            .collect();
        Ok(rows)
    }

    async fn create(&self, _partition: &PartitionKey, fields: &E) -> Result<Record<E>, RawFailure> {
        self.begin(RemoteOp::Create).await?;
        let record = {
            let mut inner = self.lock();
            let id = match inner.assigned_ids.pop_front() {
                Some(id) => id,
                None => RecordId::new(format!(
                    "srv-{}",
                    self.sequence.fetch_add(1, Ordering::SeqCst) + 1
                )),
            };
            let record = Record::new(id, fields.clone());
            inner.rows.push(record.clone());
            record
        };
        let echoed = record.clone();
        self.echo(move |collection| RawChange::Insert {
            collection,
            record: echoed,
        });
        Ok(record)
    }

    async fn update_partial(
        &self,
        id: &RecordId,
        patch: &E::Patch,
    ) -> Result<Record<E>, RawFailure> {
        self.begin(RemoteOp::Update).await?;
        let record = {
            let mut inner = self.lock();
            let Some(row) = inner.rows.iter_mut().find(|row| &row.id == id) else {
                return Err(RawFailure::backend(
                    CODE_NO_ROWS,
                    "JSON object requested, multiple (or no) rows returned",
                ));
            };
            row.fields.apply_patch(patch);
            row.clone()
        };
        let echoed = record.clone();
        self.echo(move |collection| RawChange::Update {
            collection,
            record: echoed,
        });
        Ok(record)
    }

    async fn delete(&self, id: &RecordId) -> Result<(), RawFailure> {
        self.begin(RemoteOp::Delete).await?;
        let removed = {
            let mut inner = self.lock();
            let before = inner.rows.len();
            let mut partition = None;
            inner.rows.retain(|row| {
                if &row.id == id {
                    partition = Some(row.partition_key().clone());
                    false
                } else {
                    true
                }
            });
            (before != inner.rows.len()).then_some(partition).flatten()
        };
        if let Some(partition) = removed {
            let id = id.clone();
            self.echo(move |collection| RawChange::Delete {
                collection,
                old_record: RecordRef {
                    id,
                    partition_key: Some(partition),
                },
            });
        }
        Ok(())
    }
}

// ============================================================================
// MANUAL FEED SOURCE
// ============================================================================

struct OpenFeed<E> {
    token: u64,
    collection: CollectionName,
    sender: mpsc::Sender<FeedSignal<E>>,
}

/// A change feed source the test pushes signals into.
pub struct ManualFeedSource<E> {
    open: Arc<Mutex<Vec<OpenFeed<E>>>>,
    tokens: Arc<AtomicU64>,
}

impl<E> Clone for ManualFeedSource<E> {
    fn clone(&self) -> Self {
        Self {
            open: self.open.clone(),
            tokens: self.tokens.clone(),
        }
    }
}

impl<E: Entity> Default for ManualFeedSource<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> ManualFeedSource<E> {
    pub fn new() -> Self {
        Self {
            open: Arc::new(Mutex::new(Vec::new())),
            tokens: Arc::new(AtomicU64::new(0)),
        }
    }

    fn senders(&self, collection: Option<&CollectionName>) -> Vec<mpsc::Sender<FeedSignal<E>>> {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|feed| collection.map_or(true, |c| &feed.collection == c))
            .map(|feed| feed.sender.clone())
            .collect()
    }

    /// Number of subscriptions currently open.
    pub fn open_count(&self) -> usize {
        self.open.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Deliver a change to every subscription on its collection.
    pub async fn emit(&self, change: RawChange<E>) {
        for sender in self.senders(Some(change.collection())) {
            let _ = sender.send(FeedSignal::Change(change.clone())).await;
        }
    }

    /// Deliver without waiting; drops the change if a channel is full.
    pub fn try_emit(&self, change: RawChange<E>) {
        for sender in self.senders(Some(change.collection())) {
            let _ = sender.try_send(FeedSignal::Change(change.clone()));
        }
    }

    pub async fn signal(&self, signal: FeedSignal<E>) {
        for sender in self.senders(None) {
            let _ = sender.send(signal.clone()).await;
        }
    }
}

impl<E: Entity> FeedSource<E> for ManualFeedSource<E> {
    fn open(
        &self,
        collection: &CollectionName,
        _partition: &PartitionKey,
        sender: mpsc::Sender<FeedSignal<E>>,
    ) -> SourceHandle {
        let token = self.tokens.fetch_add(1, Ordering::SeqCst);
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(OpenFeed {
                token,
                collection: collection.clone(),
                sender,
            });
        let open = self.open.clone();
        SourceHandle::new(move || {
            open.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|feed| feed.token != token);
        })
    }
}

/// Let spawned tasks (feed pumps, reporters) run to quiescence.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for the built-in entities.

    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    pub fn arb_planning_status() -> impl Strategy<Value = PlanningStatus> {
        prop_oneof![
            Just(PlanningStatus::Scheduled),
            Just(PlanningStatus::InProgress),
            Just(PlanningStatus::Done),
            Just(PlanningStatus::Cancelled),
        ]
    }

    pub fn arb_date() -> impl Strategy<Value = NaiveDate> {
        (2024i32..2027, 1u32..13, 1u32..29)
            .prop_filter_map("valid date", |(y, m, d)| NaiveDate::from_ymd_opt(y, m, d))
    }

    /// `HH:MM` on the quarter hour.
    pub fn arb_hour() -> impl Strategy<Value = String> {
        (0u32..24, prop_oneof![Just(0u32), Just(15), Just(30), Just(45)])
            .prop_map(|(h, m)| format!("{:02}:{:02}", h, m))
    }

    pub fn arb_planning(tenant: &str) -> impl Strategy<Value = Planning> {
        let tenant = PartitionKey::new(tenant);
        (arb_date(), arb_hour(), arb_planning_status(), any::<bool>()).prop_map(
            move |(date, hour, status, is_forecast)| {
                let mut planning = Planning::new(tenant.clone(), date, hour);
                planning.status = status;
                planning.is_forecast = is_forecast;
                planning
            },
        )
    }

    pub fn arb_inventory_count(tenant: &str) -> impl Strategy<Value = InventoryCount> {
        let tenant = PartitionKey::new(tenant);
        ("[A-D]-0[1-9]", "SKU-[0-9]{3}", 0i64..500, proptest::option::of(0i64..500)).prop_map(
            move |(location, sku, counted_quantity, expected_quantity)| InventoryCount {
                tenant: tenant.clone(),
                location,
                sku,
                counted_quantity,
                expected_quantity,
                counted_at: None,
            },
        )
    }

    pub fn arb_record_id() -> impl Strategy<Value = RecordId> {
        (1u32..10_000).prop_map(|n| RecordId::new(format!("real-{}", n)))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;
    use chrono::NaiveDate;
    use opsync_cache::TtlCache;
    use opsync_core::PlanningValidator;

    pub const TENANT: &str = "tenant-1";
    pub const OTHER_TENANT: &str = "tenant-2";

    pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).expect("valid fixture date")
    }

    /// A scheduled planning on `2025-01-{day}` at `hour`.
    pub fn planning(tenant: &str, day: u32, hour: &str) -> Planning {
        Planning::new(tenant, date(2025, 1, day), hour)
    }

    pub fn planning_record(id: &str, tenant: &str, day: u32, hour: &str) -> Record<Planning> {
        Record::new(id, planning(tenant, day, hour))
    }

    pub fn inventory_count(tenant: &str, location: &str, sku: &str, counted: i64) -> InventoryCount {
        InventoryCount {
            tenant: tenant.into(),
            location: location.to_string(),
            sku: sku.to_string(),
            counted_quantity: counted,
            expected_quantity: None,
            counted_at: None,
        }
    }

    /// Planning store over `remote` for [`TENANT`], ordered by schedule.
    pub fn planning_store(
        remote: Arc<InMemoryRemote<Planning>>,
        cache: TtlCache,
    ) -> EntityStore<Planning> {
        EntityStore::<Planning>::builder("plannings", TENANT, remote, cache)
            .with_validator(PlanningValidator)
            .with_order(Planning::by_schedule)
            .build()
    }

    pub fn insert_change(record: Record<Planning>) -> RawChange<Planning> {
        RawChange::Insert {
            collection: "plannings".into(),
            record,
        }
    }

    pub fn delete_change(id: &str) -> RawChange<Planning> {
        RawChange::Delete {
            collection: "plannings".into(),
            old_record: RecordRef {
                id: id.into(),
                partition_key: Some(TENANT.into()),
            },
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for normalized errors and store contents.

    use super::*;

    /// Assert that a result failed with an error of `kind`.
    #[track_caller]
    pub fn assert_kind<T: std::fmt::Debug>(result: &Result<T, NormalizedError>, kind: ErrorKind) {
        match result {
            Err(err) => assert_eq!(err.kind, kind, "wrong error kind: {}", err),
            Ok(value) => panic!("Expected {:?} error, got Ok({:?})", kind, value),
        }
    }

    /// Assert that no two entries of `store` share a key.
    #[track_caller]
    pub fn assert_unique_entries<E: Entity>(store: &EntityStore<E>) {
        let items = store.items();
        for (i, a) in items.iter().enumerate() {
            for b in items.iter().skip(i + 1) {
                assert_ne!(a.key, b.key, "duplicate entry {}", a.key);
            }
        }
    }
}
