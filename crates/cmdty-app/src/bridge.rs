//! Adapters routing query reads and mutation replays through the cache worker.

use cmdty_core::{BoxFuture, SyncTask};
use cmdty_query::{QueryError, QueryKey, QueryResult, QuerySource};
use cmdty_sync::{SyncError, SyncResult, SyncTransport};
use cmdty_telemetry::Metrics;
use cmdty_worker::{Request, ResponseSource, RouterOutcome, WorkerHandle};
use reqwest::{Method, Url};
use tracing::debug;

fn record(outcome: &RouterOutcome) {
    let strategy = outcome.strategy.map(|s| s.as_str()).unwrap_or("bypass");
    Metrics::asset_response(strategy, outcome.cache_source());
}

/// Resolves query keys to `<base>/api/<resource>?<params>` and reads them
/// through the worker's caching strategies.
#[derive(Clone)]
pub struct WorkerQuerySource {
    worker: WorkerHandle,
    base: Url,
}

impl WorkerQuerySource {
    pub fn new(worker: WorkerHandle, base: Url) -> Self {
        Self { worker, base }
    }

    pub fn url_for(&self, key: &QueryKey) -> QueryResult<Url> {
        let mut url = self
            .base
            .join(&format!("/api/{}", key.resource()))
            .map_err(|e| QueryError::Decode(format!("bad URL for {key}: {e}")))?;
        let mut params = key.params().peekable();
        if params.peek().is_some() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url)
    }
}

impl QuerySource for WorkerQuerySource {
    fn fetch(&self, key: &QueryKey) -> BoxFuture<'_, QueryResult<serde_json::Value>> {
        let url = self.url_for(key);
        Box::pin(async move {
            let url = url?;
            let outcome = self
                .worker
                .fetch(Request::new(Method::GET, url))
                .await
                .map_err(|e| QueryError::Network(e.to_string()))?;
            record(&outcome);

            if outcome.source == ResponseSource::Offline {
                return Err(QueryError::Offline);
            }
            if !outcome.response.is_ok() {
                return Err(QueryError::Status {
                    status: outcome.response.status,
                });
            }
            outcome
                .response
                .json()
                .map_err(|e| QueryError::Decode(e.to_string()))
        })
    }
}

/// POSTs replayed mutations to the sync endpoint with the task id as
/// `Idempotency-Key`. Non-GET requests pass through the worker untouched.
#[derive(Clone)]
pub struct WorkerSyncTransport {
    worker: WorkerHandle,
    endpoint: Url,
}

impl WorkerSyncTransport {
    pub fn new(worker: WorkerHandle, endpoint: Url) -> Self {
        Self { worker, endpoint }
    }
}

impl SyncTransport for WorkerSyncTransport {
    fn send<'a>(&'a self, task: &'a SyncTask) -> BoxFuture<'a, SyncResult<()>> {
        Box::pin(async move {
            let body = serde_json::to_vec(task)?;
            let request = Request::new(Method::POST, self.endpoint.clone())
                .with_header("content-type", "application/json")
                .with_header("idempotency-key", task.idempotency_key())
                .with_body(body);

            let outcome = self
                .worker
                .fetch(request)
                .await
                .map_err(|e| SyncError::Transport(e.to_string()))?;
            record(&outcome);

            match (outcome.source, outcome.response.status) {
                (ResponseSource::Offline, _) => Err(SyncError::Transport("offline".to_string())),
                (_, status) if (200..300).contains(&status) => {
                    debug!(id = %task.id, status, "Sync task accepted");
                    Ok(())
                }
                (_, status) => Err(SyncError::Rejected { status }),
            }
        })
    }
}
