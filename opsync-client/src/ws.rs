//! WebSocket change feed with reconnect backoff.

use crate::config::{AuthConfig, ReconnectConfig, SyncConfig};
use crate::connectivity::Connectivity;
use futures_util::{SinkExt, StreamExt};
use opsync_core::{CollectionName, Entity, PartitionKey, RawChange};
use opsync_feed::{FeedSignal, FeedSource, SourceHandle};
use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Request};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// [`FeedSource`] backed by a WebSocket endpoint.
///
/// Each `open` spawns a task that connects, sends a subscribe frame for the
/// collection and partition, and forwards every change frame. Dropped
/// connections are retried with jittered exponential backoff until the
/// handle is closed.
#[derive(Debug, Clone)]
pub struct WsFeedSource {
    endpoint: String,
    auth: AuthConfig,
    reconnect: ReconnectConfig,
    connectivity: Connectivity,
}

impl WsFeedSource {
    pub fn new(config: &SyncConfig, connectivity: Connectivity) -> Self {
        Self {
            endpoint: config.ws_endpoint.clone(),
            auth: config.auth.clone(),
            reconnect: config.reconnect.clone(),
            connectivity,
        }
    }

    pub fn reconnect_config(&self) -> &ReconnectConfig {
        &self.reconnect
    }

    fn request(&self) -> Result<Request<()>, String> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| e.to_string())?;
        let headers = request.headers_mut();
        for (name, value) in self.auth.header_pairs() {
            let value = HeaderValue::from_str(&value).map_err(|e| e.to_string())?;
            headers.insert(HeaderName::from_static(name), value);
        }
        Ok(request)
    }
}

impl<E: Entity> FeedSource<E> for WsFeedSource {
    fn open(
        &self,
        collection: &CollectionName,
        partition: &PartitionKey,
        sender: mpsc::Sender<FeedSignal<E>>,
    ) -> SourceHandle {
        let task = tokio::spawn(run_feed(
            self.clone(),
            collection.clone(),
            partition.clone(),
            sender,
        ));
        SourceHandle::from_task(task)
    }
}

async fn run_feed<E: Entity>(
    ws: WsFeedSource,
    collection: CollectionName,
    partition: PartitionKey,
    sender: mpsc::Sender<FeedSignal<E>>,
) {
    let mut backoff = ws.reconnect.initial_ms;
    loop {
        let reason = match connect_once(&ws, &collection, &partition, &sender).await {
            Session::Closed => return,
            Session::Ended(reason) => {
                backoff = ws.reconnect.initial_ms;
                reason
            }
            Session::Failed(reason) => reason,
        };

        if ws.connectivity.set_online(false) {
            info!(collection = %collection, "change feed offline");
        }
        if sender
            .send(FeedSignal::Disconnected {
                reason: reason.clone(),
            })
            .await
            .is_err()
        {
            return;
        }

        let delay = jittered_backoff(backoff, ws.reconnect.jitter_ms);
        warn!(collection = %collection, reason = %reason, retry_ms = delay, "change feed reconnecting");
        tokio::time::sleep(Duration::from_millis(delay)).await;
        backoff = next_backoff(backoff, &ws.reconnect);
    }
}

enum Session {
    /// The subscriber went away; stop for good.
    Closed,
    /// A session ran and then dropped.
    Ended(String),
    /// No session could be established.
    Failed(String),
}

async fn connect_once<E: Entity>(
    ws: &WsFeedSource,
    collection: &CollectionName,
    partition: &PartitionKey,
    sender: &mpsc::Sender<FeedSignal<E>>,
) -> Session {
    let request = match ws.request() {
        Ok(request) => request,
        Err(reason) => return Session::Failed(reason),
    };
    let mut stream = match tokio_tungstenite::connect_async(request).await {
        Ok((stream, _)) => stream,
        Err(err) => return Session::Failed(err.to_string()),
    };

    let frame = subscribe_frame(collection, partition);
    if let Err(err) = stream.send(Message::Text(frame)).await {
        return Session::Failed(err.to_string());
    }

    ws.connectivity.set_online(true);
    info!(collection = %collection, partition = %partition, "change feed connected");
    if sender.send(FeedSignal::Connected).await.is_err() {
        return Session::Closed;
    }

    while let Some(message) = stream.next().await {
        let signal = match message {
            Ok(Message::Text(text)) => match decode_frame::<E>(&text) {
                Ok(Some(change)) => FeedSignal::Change(change),
                Ok(None) => continue,
                Err(err) => FeedSignal::Error {
                    message: format!("feed decode error: {}", err),
                },
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                let _ = sender
                    .send(FeedSignal::Error {
                        message: err.to_string(),
                    })
                    .await;
                break;
            }
        };
        if sender.send(signal).await.is_err() {
            return Session::Closed;
        }
    }

    Session::Ended("connection closed".to_string())
}

pub(crate) fn subscribe_frame(collection: &CollectionName, partition: &PartitionKey) -> String {
    serde_json::json!({
        "type": "subscribe",
        "collection": collection,
        "partition_key": partition,
    })
    .to_string()
}

/// Decode one text frame. Control frames yield `None`.
pub(crate) fn decode_frame<E: Entity>(text: &str) -> Result<Option<RawChange<E>>, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    match value.get("type").and_then(Value::as_str) {
        Some("INSERT" | "UPDATE" | "DELETE") => serde_json::from_value(value).map(Some),
        other => {
            debug!(frame_type = ?other, "control frame skipped");
            Ok(None)
        }
    }
}

pub(crate) fn next_backoff(current_ms: u64, config: &ReconnectConfig) -> u64 {
    let next = (current_ms as f64 * config.multiplier) as u64;
    next.min(config.max_ms).max(config.initial_ms)
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    base_ms.saturating_add(nanos % jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_core::{ChangeKind, DynamicRecord};

    fn reconnect() -> ReconnectConfig {
        ReconnectConfig {
            initial_ms: 250,
            max_ms: 5_000,
            multiplier: 2.0,
            jitter_ms: 100,
        }
    }

    #[test]
    fn test_backoff_grows_to_cap() {
        let config = reconnect();
        let mut delay = config.initial_ms;
        let mut seen = vec![delay];
        for _ in 0..6 {
            delay = next_backoff(delay, &config);
            seen.push(delay);
        }
        assert_eq!(seen, vec![250, 500, 1_000, 2_000, 4_000, 5_000, 5_000]);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        for _ in 0..32 {
            let delay = jittered_backoff(1_000, 100);
            assert!((1_000..1_100).contains(&delay));
        }
        assert_eq!(jittered_backoff(1_000, 0), 1_000);
    }

    #[test]
    fn test_decode_change_frame() {
        let text = r#"{"type":"INSERT","collection":"notes","record":{"id":"r1","partition_key":"t1","body":"hi"}}"#;
        let change = decode_frame::<DynamicRecord>(text)
            .expect("valid frame")
            .expect("change frame");

        assert_eq!(change.kind(), ChangeKind::Insert);
        assert_eq!(change.record_id().as_str(), "r1");
        assert_eq!(change.partition_key().map(|p| p.as_str()), Some("t1"));
    }

    #[test]
    fn test_decode_delete_without_partition() {
        let text = r#"{"type":"DELETE","collection":"notes","old_record":{"id":"r1"}}"#;
        let change = decode_frame::<DynamicRecord>(text)
            .expect("valid frame")
            .expect("change frame");
        assert_eq!(change.kind(), ChangeKind::Delete);
        assert!(change.partition_key().is_none());
    }

    #[test]
    fn test_control_frames_are_skipped() {
        let ack = r#"{"type":"subscribed","collection":"notes"}"#;
        assert!(decode_frame::<DynamicRecord>(ack).expect("valid").is_none());
        assert!(decode_frame::<DynamicRecord>("{}").expect("valid").is_none());
    }

    #[test]
    fn test_malformed_frame_is_an_error() {
        assert!(decode_frame::<DynamicRecord>("not json").is_err());
        let bad = r#"{"type":"INSERT","collection":"notes"}"#;
        assert!(decode_frame::<DynamicRecord>(bad).is_err());
    }

    #[test]
    fn test_subscribe_frame_shape() {
        let frame = subscribe_frame(&"notes".into(), &"t1".into());
        let value: Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(value["type"], "subscribe");
        assert_eq!(value["collection"], "notes");
        assert_eq!(value["partition_key"], "t1");
    }
}
