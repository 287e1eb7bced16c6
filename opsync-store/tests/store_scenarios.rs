//! End-to-end store behavior against an in-memory remote and a manual feed.

use opsync_cache::TtlCache;
use opsync_core::{ErrorKind, RecoveryAction};
use opsync_store::{EntityStore, LoadStatus, StoreConfig, StoreNotification};
use opsync_test_utils::assertions::{assert_kind, assert_unique_entries};
use opsync_test_utils::fixtures::*;
use opsync_test_utils::{
    settle, FeedSignal, InMemoryRemote, ManualFeedSource, Planning, PlanningPatch,
    PlanningStatus, RawFailure, Record, RecordId, RemoteOp,
};
use std::sync::Arc;
use std::time::Duration;

fn remote() -> Arc<InMemoryRemote<Planning>> {
    Arc::new(InMemoryRemote::new())
}

fn status_of(store: &EntityStore<Planning>, id: &str) -> Option<PlanningStatus> {
    store
        .snapshot()
        .get(&RecordId::new(id))
        .map(|entry| entry.fields.status)
}

// ============================================================================
// ADD
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_add_swaps_provisional_for_server_record() {
    let remote = remote();
    remote.assign_next_id("real-42");
    remote.set_latency(Duration::from_millis(100));
    let store = planning_store(remote.clone(), TtlCache::new());

    let task = tokio::spawn({
        let store = store.clone();
        async move { store.add(planning(TENANT, 10, "08:00")).await }
    });
    settle().await;

    let during = store.snapshot();
    assert_eq!(during.len(), 1);
    assert!(during.entries[0].is_provisional());

    let record = task.await.expect("join").expect("add succeeds");
    assert_eq!(record.id, RecordId::new("real-42"));

    let after = store.snapshot();
    assert_eq!(after.len(), 1);
    assert_eq!(after.entries[0].id(), Some(&RecordId::new("real-42")));
    assert_eq!(after.provisional_count(), 0);
    assert_eq!(store.pending_echoes(), vec![RecordId::new("real-42")]);
}

#[tokio::test]
async fn test_echo_within_grace_window_does_not_duplicate() {
    let remote = remote();
    remote.assign_next_id("real-42");
    let feed = ManualFeedSource::new();
    let store = planning_store(remote.clone(), TtlCache::new());
    store.connect_feed(&feed);
    let mut notifications = store.subscribe_notifications();

    let record = store.add(planning(TENANT, 10, "08:00")).await.expect("add");
    feed.emit(insert_change(record)).await;
    settle().await;

    assert_eq!(store.snapshot().len(), 1);
    assert!(store.pending_echoes().is_empty());
    assert!(notifications.try_recv().is_err());
}

#[tokio::test]
async fn test_backend_echo_is_suppressed() {
    let feed = ManualFeedSource::new();
    let remote = Arc::new(InMemoryRemote::new().with_echo("plannings", feed.clone()));
    let store = planning_store(remote.clone(), TtlCache::new());
    store.connect_feed(&feed);

    store.add(planning(TENANT, 10, "08:00")).await.expect("add");
    settle().await;

    assert_eq!(store.snapshot().len(), 1);
    assert!(store.pending_echoes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_echo_before_response_does_not_duplicate() {
    let remote = remote();
    remote.assign_next_id("real-42");
    remote.set_latency(Duration::from_millis(100));
    let feed = ManualFeedSource::new();
    let store = planning_store(remote.clone(), TtlCache::new());
    store.connect_feed(&feed);
    let mut notifications = store.subscribe_notifications();

    let task = tokio::spawn({
        let store = store.clone();
        async move { store.add(planning(TENANT, 10, "08:00")).await }
    });
    settle().await;

    // The push arrives while the create response is still in flight.
    feed.emit(insert_change(planning_record("real-42", TENANT, 10, "08:00")))
        .await;
    settle().await;

    let during = store.snapshot();
    assert_eq!(during.len(), 1);
    assert_eq!(during.provisional_count(), 1);
    assert_eq!(store.held_inserts(), 1);

    task.await.expect("join").expect("add");
    assert_eq!(store.snapshot().len(), 1);
    assert_eq!(store.snapshot().provisional_count(), 0);
    assert_eq!(store.held_inserts(), 0);
    assert!(store.pending_echoes().is_empty());
    assert_unique_entries(&store);
    assert!(notifications.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_unrelated_insert_during_add_lands_after_response() {
    let remote = remote();
    remote.assign_next_id("real-42");
    remote.set_latency(Duration::from_millis(100));
    let feed = ManualFeedSource::new();
    let store = planning_store(remote.clone(), TtlCache::new());
    store.connect_feed(&feed);
    let mut notifications = store.subscribe_notifications();

    let task = tokio::spawn({
        let store = store.clone();
        async move { store.add(planning(TENANT, 10, "08:00")).await }
    });
    settle().await;

    feed.emit(insert_change(planning_record("real-7", TENANT, 9, "07:00")))
        .await;
    settle().await;
    assert_eq!(store.snapshot().len(), 1);
    assert!(notifications.try_recv().is_err());

    task.await.expect("join").expect("add");
    assert_eq!(store.snapshot().len(), 2);
    assert_unique_entries(&store);
    assert!(matches!(
        notifications.try_recv(),
        Ok(StoreNotification::ExternalInsert { ref id, .. }) if id.as_str() == "real-7"
    ));
}

#[tokio::test(start_paused = true)]
async fn test_held_insert_released_after_grace_while_add_pending() {
    let remote = remote();
    remote.set_latency(Duration::from_secs(5));
    let feed = ManualFeedSource::new();
    let store = planning_store(remote.clone(), TtlCache::new());
    store.connect_feed(&feed);
    let mut notifications = store.subscribe_notifications();

    let task = tokio::spawn({
        let store = store.clone();
        async move { store.add(planning(TENANT, 10, "08:00")).await }
    });
    settle().await;

    feed.emit(insert_change(planning_record("real-7", TENANT, 9, "07:00")))
        .await;
    settle().await;
    assert_eq!(store.held_inserts(), 1);

    tokio::time::advance(Duration::from_millis(2_600)).await;
    settle().await;

    let snapshot = store.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.provisional_count(), 1);
    assert_eq!(store.held_inserts(), 0);
    assert!(matches!(
        notifications.try_recv(),
        Ok(StoreNotification::ExternalInsert { ref id, .. }) if id.as_str() == "real-7"
    ));

    task.await.expect("join").expect("add");
    assert_eq!(store.snapshot().len(), 2);
    assert_unique_entries(&store);
}

#[tokio::test]
async fn test_invalid_candidate_is_rejected_locally() {
    let remote = remote();
    let store = planning_store(remote.clone(), TtlCache::new());

    let result = store.add(planning(TENANT, 10, "eight")).await;

    assert_kind(&result, ErrorKind::Validation);
    assert!(store.snapshot().is_empty());
    assert_eq!(remote.total_calls(), 0);
}

#[tokio::test]
async fn test_candidate_from_other_partition_is_rejected() {
    let remote = remote();
    let store = planning_store(remote.clone(), TtlCache::new());

    let result = store.add(planning(OTHER_TENANT, 10, "08:00")).await;

    assert_kind(&result, ErrorKind::Validation);
    assert_eq!(remote.total_calls(), 0);
}

#[tokio::test]
async fn test_failed_create_removes_provisional_and_reloads() {
    let remote = remote();
    remote.seed(planning_record("real-1", TENANT, 9, "08:00"));
    remote.fail_next(
        RemoteOp::Create,
        RawFailure::backend("23505", "duplicate key value violates unique constraint"),
    );
    let store = planning_store(remote.clone(), TtlCache::new());

    let result = store.add(planning(TENANT, 10, "08:00")).await;

    assert_kind(&result, ErrorKind::Conflict);
    let snapshot = store.snapshot();
    assert_eq!(snapshot.provisional_count(), 0);
    assert_eq!(snapshot.len(), 1);
    assert_eq!(remote.calls(RemoteOp::FetchAll), 1);
    assert_eq!(store.last_error().map(|e| e.kind), Some(ErrorKind::Conflict));
}

#[tokio::test]
async fn test_failed_resync_keeps_mutation_error() {
    let remote = remote();
    remote.fail_next(
        RemoteOp::Create,
        RawFailure::backend("23505", "duplicate key value violates unique constraint"),
    );
    remote.fail_next(RemoteOp::FetchAll, RawFailure::offline("Failed to fetch"));
    let store = planning_store(remote.clone(), TtlCache::new());

    let result = store.add(planning(TENANT, 10, "08:00")).await;

    assert_kind(&result, ErrorKind::Conflict);
    assert_eq!(remote.calls(RemoteOp::FetchAll), 1);
    assert_eq!(store.status(), LoadStatus::Errored);
    assert_eq!(store.last_error().map(|e| e.kind), Some(ErrorKind::Conflict));
}

#[tokio::test]
async fn test_entries_follow_comparator() {
    let remote = remote();
    let store = planning_store(remote.clone(), TtlCache::new());

    store.add(planning(TENANT, 11, "08:00")).await.expect("add");
    store.add(planning(TENANT, 10, "14:00")).await.expect("add");
    store.add(planning(TENANT, 10, "08:00")).await.expect("add");

    let order: Vec<(u32, String)> = store
        .items()
        .into_iter()
        .map(|e| (chrono::Datelike::day(&e.fields.date), e.fields.hour))
        .collect();
    assert_eq!(
        order,
        vec![
            (10, "08:00".to_string()),
            (10, "14:00".to_string()),
            (11, "08:00".to_string())
        ]
    );
}

// ============================================================================
// UPDATE / REMOVE
// ============================================================================

#[tokio::test]
async fn test_failed_update_reverts_and_surfaces_permission() {
    let remote = remote();
    remote.seed(planning_record("real-42", TENANT, 10, "08:00"));
    let store = planning_store(remote.clone(), TtlCache::new());
    store.load().await.expect("load");

    remote.fail_next(
        RemoteOp::Update,
        RawFailure::backend("42501", "permission denied for table plannings"),
    );
    let result = store
        .update(&"real-42".into(), PlanningPatch::status(PlanningStatus::Done))
        .await;

    assert_kind(&result, ErrorKind::Permission);
    assert_eq!(status_of(&store, "real-42"), Some(PlanningStatus::Scheduled));
    assert_eq!(remote.calls(RemoteOp::FetchAll), 2);
}

#[tokio::test(start_paused = true)]
async fn test_update_applies_optimistically() {
    let remote = remote();
    remote.seed(planning_record("real-42", TENANT, 10, "08:00"));
    let store = planning_store(remote.clone(), TtlCache::new());
    store.load().await.expect("load");
    remote.set_latency(Duration::from_millis(100));

    let task = tokio::spawn({
        let store = store.clone();
        async move {
            store
                .update(&"real-42".into(), PlanningPatch::status(PlanningStatus::Done))
                .await
        }
    });
    settle().await;
    assert_eq!(status_of(&store, "real-42"), Some(PlanningStatus::Done));

    let record = task.await.expect("join").expect("update");
    assert_eq!(record.fields.status, PlanningStatus::Done);
    assert_eq!(record.fields.hour, "08:00");
}

#[tokio::test]
async fn test_update_of_unloaded_id_still_reaches_remote() {
    let remote = remote();
    remote.seed(planning_record("real-7", TENANT, 10, "08:00"));
    let store = planning_store(remote.clone(), TtlCache::new());

    let record = store
        .update(&"real-7".into(), PlanningPatch::status(PlanningStatus::InProgress))
        .await
        .expect("update");

    assert_eq!(record.fields.status, PlanningStatus::InProgress);
    assert!(store.snapshot().is_empty());
    assert_eq!(remote.calls(RemoteOp::Update), 1);
}

#[tokio::test]
async fn test_update_validation_blocks_bad_patch() {
    let remote = remote();
    let store = planning_store(remote.clone(), TtlCache::new());
    let patch = PlanningPatch {
        hour: Some("25h".to_string()),
        ..PlanningPatch::default()
    };

    let result = store.update(&"real-1".into(), patch).await;

    assert_kind(&result, ErrorKind::Validation);
    assert_eq!(remote.total_calls(), 0);
}

#[tokio::test]
async fn test_failed_remove_restores_entry() {
    let remote = remote();
    remote.seed(planning_record("real-1", TENANT, 10, "08:00"));
    let store = planning_store(remote.clone(), TtlCache::new());
    store.load().await.expect("load");

    remote.fail_next(RemoteOp::Delete, RawFailure::offline("Failed to fetch"));
    let result = store.remove(&"real-1".into()).await;

    assert_kind(&result, ErrorKind::Offline);
    assert_eq!(store.snapshot().len(), 1);
}

#[tokio::test]
async fn test_remove_deletes_remotely() {
    let remote = remote();
    remote.seed(planning_record("real-1", TENANT, 10, "08:00"));
    let store = planning_store(remote.clone(), TtlCache::new());
    store.load().await.expect("load");

    store.remove(&"real-1".into()).await.expect("remove");

    assert!(store.snapshot().is_empty());
    assert!(remote.rows().is_empty());
}

// ============================================================================
// LOAD / CACHE / DEADLINES
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_load_adopts_cache_within_ttl() {
    let remote = remote();
    remote.seed(planning_record("real-1", TENANT, 10, "08:00"));
    let cache = TtlCache::new();

    let first = planning_store(remote.clone(), cache.clone());
    first.load().await.expect("load");
    let second = planning_store(remote.clone(), cache.clone());
    second.load().await.expect("load");

    assert_eq!(remote.calls(RemoteOp::FetchAll), 1);
    assert_eq!(second.snapshot().len(), 1);
    assert_eq!(second.status(), LoadStatus::Ready);

    tokio::time::advance(Duration::from_secs(121)).await;
    second.load().await.expect("load");
    assert_eq!(remote.calls(RemoteOp::FetchAll), 2);
}

#[tokio::test]
async fn test_mutation_invalidates_partition_cache() {
    let remote = remote();
    let cache = TtlCache::new();
    let store = planning_store(remote.clone(), cache.clone());
    store.load().await.expect("load");
    assert_eq!(cache.len(), 1);

    store.add(planning(TENANT, 10, "08:00")).await.expect("add");

    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_failed_load_keeps_entries() {
    let remote = remote();
    remote.seed(planning_record("real-1", TENANT, 10, "08:00"));
    let store = planning_store(remote.clone(), TtlCache::new());
    store.load().await.expect("load");

    remote.fail_next(RemoteOp::FetchAll, RawFailure::http(401, "JWT expired"));
    let result = store.reload().await;

    assert_kind(&result, ErrorKind::Auth);
    assert_eq!(
        result.err().and_then(|e| e.suggested_action()),
        Some(RecoveryAction::Reauthenticate)
    );
    assert_eq!(store.status(), LoadStatus::Errored);
    assert_eq!(store.snapshot().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hung_remote_times_out_as_network() {
    let remote = remote();
    remote.set_latency(Duration::from_secs(30));
    let store = EntityStore::<Planning>::builder("plannings", TENANT, remote.clone(), TtlCache::new())
        .with_config(StoreConfig::new().with_request_timeout(Duration::from_secs(5)))
        .build();

    let result = store.load().await;

    assert_kind(&result, ErrorKind::Network);
    assert!(result.err().is_some_and(|e| e.message.contains("timed out")));
    assert_eq!(store.status(), LoadStatus::Errored);
}

#[tokio::test]
async fn test_state_watch_sees_load() {
    let remote = remote();
    remote.seed(planning_record("real-1", TENANT, 10, "08:00"));
    let store = planning_store(remote.clone(), TtlCache::new());
    let mut state = store.subscribe_state();

    store.load().await.expect("load");

    assert!(state.has_changed().unwrap_or(false));
    let snapshot = state.borrow_and_update().clone();
    assert_eq!(snapshot.status, LoadStatus::Ready);
    assert_eq!(snapshot.len(), 1);
}

// ============================================================================
// CHANGE FEED
// ============================================================================

#[tokio::test]
async fn test_external_insert_and_delete_notify() {
    let remote = remote();
    let feed = ManualFeedSource::new();
    let store = planning_store(remote.clone(), TtlCache::new());
    store.connect_feed(&feed);
    let mut notifications = store.subscribe_notifications();

    feed.emit(insert_change(planning_record("real-5", TENANT, 10, "08:00")))
        .await;
    settle().await;
    assert_eq!(store.snapshot().len(), 1);
    assert!(matches!(
        notifications.try_recv(),
        Ok(StoreNotification::ExternalInsert { ref id, .. }) if id.as_str() == "real-5"
    ));

    // Same id again is idempotent.
    feed.emit(insert_change(planning_record("real-5", TENANT, 10, "08:00")))
        .await;
    feed.emit(delete_change("real-5")).await;
    settle().await;

    assert!(store.snapshot().is_empty());
    assert!(matches!(
        notifications.try_recv(),
        Ok(StoreNotification::ExternalDelete { .. })
    ));
}

#[tokio::test]
async fn test_feed_ignores_other_partitions() {
    let remote = remote();
    let feed = ManualFeedSource::new();
    let store = planning_store(remote.clone(), TtlCache::new());
    store.connect_feed(&feed);

    feed.emit(insert_change(planning_record("real-9", OTHER_TENANT, 10, "08:00")))
        .await;
    settle().await;

    assert!(store.snapshot().is_empty());
}

#[tokio::test]
async fn test_feed_update_for_absent_id_is_ignored() {
    let remote = remote();
    let feed = ManualFeedSource::new();
    let store = planning_store(remote.clone(), TtlCache::new());
    store.connect_feed(&feed);

    feed.emit(opsync_test_utils::RawChange::Update {
        collection: "plannings".into(),
        record: planning_record("real-3", TENANT, 10, "08:00"),
    })
    .await;
    settle().await;

    assert!(store.snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_echo_entry_expires_after_grace() {
    let remote = remote();
    remote.assign_next_id("real-42");
    let feed = ManualFeedSource::new();
    let store = planning_store(remote.clone(), TtlCache::new());
    store.connect_feed(&feed);

    store.add(planning(TENANT, 10, "08:00")).await.expect("add");
    assert_eq!(store.pending_echoes().len(), 1);

    tokio::time::advance(Duration::from_millis(2_600)).await;
    settle().await;

    // Swept by the feed pump, not by the caller.
    assert_eq!(store.armed_echoes(), 0);
    assert!(store.pending_echoes().is_empty());

    // A late echo is now merged like any insert, and the id is already present.
    feed.emit(insert_change(Record::new("real-42", planning(TENANT, 10, "08:00"))))
        .await;
    settle().await;
    assert_eq!(store.snapshot().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_echo_entry_lingers_without_feed() {
    let remote = remote();
    let store = planning_store(remote.clone(), TtlCache::new());

    store.add(planning(TENANT, 10, "08:00")).await.expect("add");
    tokio::time::advance(Duration::from_millis(2_600)).await;
    settle().await;

    assert_eq!(store.armed_echoes(), 1);
    assert!(store.pending_echoes().is_empty());
}

#[tokio::test]
async fn test_feed_delete_during_reload_is_not_resurrected() {
    let remote = remote();
    remote.seed(planning_record("real-1", TENANT, 10, "08:00"));
    let feed = ManualFeedSource::new();
    let store = planning_store(remote.clone(), TtlCache::new());
    store.connect_feed(&feed);
    store.load().await.expect("load");
    remote.set_latency(Duration::from_millis(50));

    let reload = tokio::spawn({
        let store = store.clone();
        async move { store.reload().await }
    });
    settle().await;

    feed.emit(delete_change("real-1")).await;
    settle().await;
    reload.await.expect("join").expect("reload");

    assert!(store.snapshot().is_empty());
}

#[tokio::test]
async fn test_feed_status_and_dispose() {
    let remote = remote();
    let feed = ManualFeedSource::new();
    let store = planning_store(remote.clone(), TtlCache::new());
    let status = store.connect_feed(&feed);

    feed.signal(FeedSignal::Connected).await;
    settle().await;
    assert!(status.borrow().is_connected());

    store.dispose();
    store.dispose();
    assert_eq!(feed.open_count(), 0);
    assert!(!status.borrow().is_connected());
}

#[tokio::test]
async fn test_failure_notifies_error() {
    let remote = remote();
    let store = planning_store(remote.clone(), TtlCache::new());
    let mut notifications = store.subscribe_notifications();

    remote.fail_next(RemoteOp::FetchAll, RawFailure::transport("network error"));
    let _ = store.load().await;

    match notifications.try_recv() {
        Ok(StoreNotification::Error(err)) => assert_eq!(err.kind, ErrorKind::Network),
        other => panic!("expected error notification, got {:?}", other),
    }
}
