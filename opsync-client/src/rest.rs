//! REST transport for one collection.
//!
//! Speaks the PostgREST dialect: rows live under `/rest/v1/{collection}`,
//! filters are `column=op.value` query pairs and writes ask for the
//! resulting row with `Prefer: return=representation`.

use crate::config::{AuthConfig, SyncConfig};
use crate::connectivity::Connectivity;
use crate::error::ClientError;
use async_trait::async_trait;
use opsync_core::error::CODE_NO_ROWS;
use opsync_core::{Entity, PartitionKey, QueryFilter, RawFailure, Record, RecordId};
use opsync_store::RemoteCollection;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::marker::PhantomData;
use std::time::Duration;
use tracing::debug;

/// Error body the backend returns on failure.
#[derive(Debug, Default, Deserialize)]
struct BackendErrorBody {
    code: Option<String>,
    message: Option<String>,
    details: Option<Value>,
    hint: Option<String>,
}

/// [`RemoteCollection`] over HTTP.
pub struct RestCollection<E> {
    client: reqwest::Client,
    endpoint: String,
    headers: HeaderMap,
    timeout: Duration,
    connectivity: Connectivity,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> RestCollection<E> {
    pub fn new(config: &SyncConfig, connectivity: Connectivity) -> Result<Self, ClientError> {
        let timeout = config.request_timeout();
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: collection_endpoint(&config.api_base_url, &config.collection),
            headers: build_auth_headers(&config.auth)?,
            timeout,
            connectivity,
            _entity: PhantomData,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request(&self, method: reqwest::Method) -> RequestBuilder {
        self.client
            .request(method, &self.endpoint)
            .headers(self.headers.clone())
    }

    async fn send(&self, request: RequestBuilder, operation: &str) -> Result<Response, RawFailure> {
        match request.send().await {
            Ok(response) => {
                if self.connectivity.set_online(true) {
                    debug!(operation = operation, "backend reachable again");
                }
                Ok(response)
            }
            Err(err) => Err(self.transport_failure(err, operation)),
        }
    }

    fn transport_failure(&self, err: reqwest::Error, operation: &str) -> RawFailure {
        if err.is_timeout() {
            return RawFailure::Timeout {
                operation: operation.to_string(),
                after: self.timeout,
            };
        }
        if err.is_connect() {
            self.connectivity.set_online(false);
        }
        RawFailure::Transport {
            message: err.to_string(),
            offline: !self.connectivity.is_online(),
        }
    }

    async fn rows(&self, response: Response) -> Result<Vec<Record<E>>, RawFailure> {
        read_json(response).await
    }

    async fn single_row(&self, response: Response) -> Result<Record<E>, RawFailure> {
        self.rows(response)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RawFailure::Backend {
                status: Some(406),
                code: Some(CODE_NO_ROWS.to_string()),
                message: Some("The result contains 0 rows".to_string()),
                details: None,
                hint: None,
            })
    }
}

#[async_trait]
impl<E: Entity> RemoteCollection<E> for RestCollection<E> {
    async fn fetch_all(
        &self,
        partition: &PartitionKey,
        filter: &QueryFilter,
    ) -> Result<Vec<Record<E>>, RawFailure> {
        let query = fetch_query(E::PARTITION_FIELD, partition, filter);
        let request = self.request(reqwest::Method::GET).query(&query);
        let response = self.send(request, "fetch_all").await?;
        self.rows(response).await
    }

    async fn create(&self, _partition: &PartitionKey, fields: &E) -> Result<Record<E>, RawFailure> {
        let request = self
            .request(reqwest::Method::POST)
            .header("prefer", "return=representation")
            .json(fields);
        let response = self.send(request, "create").await?;
        self.single_row(response).await
    }

    async fn update_partial(
        &self,
        id: &RecordId,
        patch: &E::Patch,
    ) -> Result<Record<E>, RawFailure> {
        let request = self
            .request(reqwest::Method::PATCH)
            .query(&[id_pair(id)])
            .header("prefer", "return=representation")
            .json(patch);
        let response = self.send(request, "update").await?;
        self.single_row(response).await
    }

    async fn delete(&self, id: &RecordId) -> Result<(), RawFailure> {
        let request = self.request(reqwest::Method::DELETE).query(&[id_pair(id)]);
        let response = self.send(request, "delete").await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(backend_failure(status.as_u16(), &body))
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, RawFailure> {
    let status = response.status();
    let body = response.text().await.map_err(|err| RawFailure::Transport {
        message: err.to_string(),
        offline: false,
    })?;
    if !status.is_success() {
        return Err(backend_failure(status.as_u16(), &body));
    }
    serde_json::from_str(&body).map_err(|err| {
        RawFailure::Other(json!({
            "message": format!("Unexpected response body: {}", err),
            "status": status.as_u16(),
        }))
    })
}

/// Classify a non-success response from its status and error body.
pub(crate) fn backend_failure(status: u16, body: &str) -> RawFailure {
    let parsed: BackendErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed.message.or_else(|| {
        let trimmed = body.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    RawFailure::Backend {
        status: Some(status),
        code: parsed.code,
        message,
        details: parsed.details,
        hint: parsed.hint,
    }
}

pub(crate) fn collection_endpoint(base_url: &str, collection: &str) -> String {
    format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), collection)
}

pub(crate) fn fetch_query(
    partition_field: &str,
    partition: &PartitionKey,
    filter: &QueryFilter,
) -> Vec<(String, String)> {
    let mut query = vec![
        ("select".to_string(), "*".to_string()),
        (partition_field.to_string(), format!("eq.{}", partition)),
    ];
    query.extend(filter.query_pairs());
    query
}

fn id_pair(id: &RecordId) -> (&'static str, String) {
    ("id", format!("eq.{}", id))
}

fn build_auth_headers(auth: &AuthConfig) -> Result<HeaderMap, ClientError> {
    let mut headers = HeaderMap::new();
    for (name, value) in auth.header_pairs() {
        let value = HeaderValue::from_str(&value).map_err(|e| ClientError::InvalidHeader {
            name,
            reason: e.to_string(),
        })?;
        headers.insert(HeaderName::from_static(name), value);
    }
    Ok(headers)
}
