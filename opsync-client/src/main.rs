//! opsync-tail: mirror one collection partition and log its changes.

use opsync_cache::TtlCache;
use opsync_client::{
    build_reporter, telemetry, Connectivity, RestCollection, SyncConfig, WsFeedSource,
};
use opsync_core::DynamicRecord;
use opsync_store::{EntityStore, StoreNotification};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let config = SyncConfig::load()?;
    telemetry::init_logging(&config.logging)?;

    let connectivity = Connectivity::new();
    let remote = Arc::new(RestCollection::<DynamicRecord>::new(
        &config,
        connectivity.clone(),
    )?);
    let feed = WsFeedSource::new(&config, connectivity.clone());

    let store = EntityStore::<DynamicRecord>::builder(
        config.collection.as_str(),
        config.partition_key.as_str(),
        remote,
        TtlCache::new(),
    )
    .with_reporter(build_reporter(&config)?)
    .with_config(config.store_config())
    .build();

    let mut notifications = store.subscribe_notifications();
    let mut feed_status = store.connect_feed(&feed);

    // Failures are already reported by the store; keep tailing the feed.
    if store.load().await.is_ok() {
        info!(
            collection = %store.collection(),
            partition = %store.partition(),
            count = store.snapshot().len(),
            "initial snapshot loaded"
        );
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Ok(()) = feed_status.changed() => {
                let status = feed_status.borrow_and_update().clone();
                info!(status = ?status, online = connectivity.is_online(), "feed status changed");
            }
            received = notifications.recv() => match received {
                Ok(StoreNotification::ExternalInsert { collection, id }) => {
                    info!(collection = %collection, id = %id, count = store.snapshot().len(), "row inserted");
                }
                Ok(StoreNotification::ExternalDelete { collection, id }) => {
                    info!(collection = %collection, id = %id, count = store.snapshot().len(), "row deleted");
                }
                Ok(StoreNotification::Error(err)) => {
                    warn!(kind = ?err.kind, message = %err.message, "store error");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "notifications lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    store.dispose();
    info!("opsync-tail stopped");
    Ok(())
}
