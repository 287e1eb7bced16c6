//! Property tests over random mutation and feed sequences.

use opsync_cache::TtlCache;
use opsync_test_utils::assertions::assert_unique_entries;
use opsync_test_utils::fixtures::*;
use opsync_test_utils::generators::arb_planning;
use opsync_test_utils::{
    settle, InMemoryRemote, ManualFeedSource, Planning, PlanningPatch, PlanningStatus,
    RawFailure, Record, RemoteOp,
};
use proptest::prelude::*;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Step {
    Add(Planning, bool),
    Update(usize, bool),
    Remove(usize, bool),
    ExternalInsert(usize, Planning),
    ExternalDelete(usize),
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (arb_planning(TENANT), any::<bool>()).prop_map(|(p, fail)| Step::Add(p, fail)),
        (0usize..8, any::<bool>()).prop_map(|(i, fail)| Step::Update(i, fail)),
        (0usize..8, any::<bool>()).prop_map(|(i, fail)| Step::Remove(i, fail)),
        (0usize..8, arb_planning(TENANT)).prop_map(|(i, p)| Step::ExternalInsert(i, p)),
        (0usize..8).prop_map(Step::ExternalDelete),
    ]
}

fn failure() -> RawFailure {
    RawFailure::transport("network error")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_store_never_holds_duplicates(steps in prop::collection::vec(arb_step(), 1..24)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async move {
            let feed = ManualFeedSource::new();
            let remote = Arc::new(InMemoryRemote::new().with_echo("plannings", feed.clone()));
            let store = planning_store(remote.clone(), TtlCache::new());
            store.connect_feed(&feed);

            for step in steps {
                match step {
                    Step::Add(candidate, fail) => {
                        if fail {
                            remote.fail_next(RemoteOp::Create, failure());
                        }
                        let _ = store.add(candidate).await;
                    }
                    Step::Update(index, fail) => {
                        let Some(id) = store.items().get(index).and_then(|e| e.id().cloned()) else {
                            continue;
                        };
                        if fail {
                            remote.fail_next(RemoteOp::Update, failure());
                        }
                        let _ = store.update(&id, PlanningPatch::status(PlanningStatus::Done)).await;
                    }
                    Step::Remove(index, fail) => {
                        let Some(id) = store.items().get(index).and_then(|e| e.id().cloned()) else {
                            continue;
                        };
                        if fail {
                            remote.fail_next(RemoteOp::Delete, failure());
                        }
                        let _ = store.remove(&id).await;
                    }
                    Step::ExternalInsert(n, fields) => {
                        feed.emit(insert_change(Record::new(format!("ext-{}", n), fields))).await;
                    }
                    Step::ExternalDelete(n) => {
                        feed.emit(delete_change(&format!("ext-{}", n))).await;
                    }
                }
                settle().await;
                assert_unique_entries(&store);
            }

            // Nothing is left in flight once every call has returned.
            assert_eq!(store.snapshot().provisional_count(), 0);
            assert_eq!(store.held_inserts(), 0);
            store.dispose();
        });
    }
}
