//! Cache worker actor.
//!
//! The worker owns the asset cache and is the only writer to it. Callers
//! talk to it through a [`WorkerHandle`]; every request is answered over a
//! oneshot. Network fetches and snapshot writes run on spawned tasks and
//! report back through an internal channel, so a slow upstream or disk never
//! blocks other requests.

use crate::asset_cache::{AssetCache, PartitionKind, PartitionStats, PutOutcome, SnapshotJob};
use crate::classify::{Classifier, RequestClass, Route};
use crate::config::WorkerConfig;
use crate::error::{CacheError, CacheResult, FetchError};
use crate::fallback;
use crate::http::{Request, Response};
use crate::message::{ControlAck, WorkerMessage};
use crate::network::Network;
use crate::strategy::{self, Plan, ResponseSource, RouterOutcome, SharedFetch};
use cmdty_core::{BoxFuture, Clock};
use futures_util::future::{join_all, try_join_all, FutureExt};
use reqwest::{Method, Url};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of the install phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub critical: usize,
    pub optional_cached: usize,
    pub optional_skipped: usize,
}

/// Result of the activate phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivateReport {
    /// Partitions of other versions that were removed.
    pub deleted: Vec<String>,
}

enum WorkerRequest {
    Install(oneshot::Sender<CacheResult<InstallReport>>),
    Activate(oneshot::Sender<CacheResult<ActivateReport>>),
    Fetch {
        request: Request,
        reply: oneshot::Sender<RouterOutcome>,
    },
    Message {
        text: String,
        reply: oneshot::Sender<CacheResult<ControlAck>>,
    },
    Stats(oneshot::Sender<Vec<PartitionStats>>),
}

/// Work finished off the worker task, to be committed on it.
enum Completion {
    /// A routed fetch finished. Successful 200s are written back.
    Fetched {
        key: String,
        partition: PartitionKind,
        response: Option<Response>,
    },
    Installed {
        critical: CacheResult<Vec<(String, Response)>>,
        optional: Vec<(String, Result<Response, FetchError>)>,
        /// Optional paths that did not resolve against the origin.
        unresolved: usize,
        reply: oneshot::Sender<CacheResult<InstallReport>>,
    },
    Updated {
        fetched: Vec<(String, PartitionKind, Option<Response>)>,
        unresolved: usize,
        reply: oneshot::Sender<CacheResult<ControlAck>>,
    },
    Persisted {
        job: SnapshotJob,
        result: CacheResult<()>,
    },
}

/// Cloneable handle to a running [`CacheWorker`].
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerRequest>,
}

impl WorkerHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WorkerRequest,
    ) -> CacheResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| CacheError::WorkerClosed)?;
        rx.await.map_err(|_| CacheError::WorkerClosed)
    }

    /// Precache the critical and optional assets.
    pub async fn install(&self) -> CacheResult<InstallReport> {
        self.call(WorkerRequest::Install).await?
    }

    /// Drop partitions of other versions and start routing requests.
    pub async fn activate(&self) -> CacheResult<ActivateReport> {
        self.call(WorkerRequest::Activate).await?
    }

    /// Route a request through the caching strategies. Always yields a
    /// response while the worker is running.
    pub async fn fetch(&self, request: Request) -> CacheResult<RouterOutcome> {
        self.call(|reply| WorkerRequest::Fetch { request, reply }).await
    }

    /// Post a JSON control message (`CACHE_UPDATE`, `CACHE_CLEAR`).
    pub async fn post_message(&self, text: &str) -> CacheResult<ControlAck> {
        let text = text.to_string();
        self.call(|reply| WorkerRequest::Message { text, reply })
            .await?
    }

    pub async fn stats(&self) -> CacheResult<Vec<PartitionStats>> {
        self.call(WorkerRequest::Stats).await
    }
}

pub struct CacheWorker {
    config: WorkerConfig,
    origin: Url,
    classifier: Classifier,
    cache: AssetCache,
    network: Arc<dyn Network>,
    /// Set by activation. Until then requests go straight to the network.
    ready: bool,
    inflight: HashMap<String, SharedFetch>,
    /// At most one snapshot write runs at a time.
    snapshot_task: Option<JoinHandle<()>>,
    requests: mpsc::Receiver<WorkerRequest>,
    done_tx: mpsc::UnboundedSender<Completion>,
    done_rx: mpsc::UnboundedReceiver<Completion>,
    cancel: CancellationToken,
}

impl CacheWorker {
    /// Build the worker and spawn its task.
    pub fn spawn(
        config: WorkerConfig,
        network: Arc<dyn Network>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> CacheResult<(WorkerHandle, JoinHandle<()>)> {
        let origin = Url::parse(&config.origin)
            .map_err(|e| FetchError::InvalidUrl(format!("{}: {e}", config.origin)))?;

        let mut cache = AssetCache::new(
            config.cache_prefix.clone(),
            config.version.clone(),
            config.budgets,
            config.cleanup_interval,
            clock,
        );
        if let Some(dir) = &config.snapshot_dir {
            cache = cache.with_snapshot_dir(dir.clone())?;
        }

        let (tx, requests) = mpsc::channel(config.channel_capacity.max(1));
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let worker = Self {
            classifier: Classifier::new(config.api_hosts.clone(), config.swr_prefixes.clone()),
            config,
            origin,
            cache,
            network,
            ready: false,
            inflight: HashMap::new(),
            snapshot_task: None,
            requests,
            done_tx,
            done_rx,
            cancel,
        };

        let task = tokio::spawn(worker.run());
        Ok((WorkerHandle { tx }, task))
    }

    async fn run(mut self) {
        info!(
            prefix = %self.config.cache_prefix,
            version = %self.config.version,
            "Cache worker started"
        );

        let period = self.config.snapshot_interval.max(Duration::from_millis(10));
        let mut snapshots = interval_at(Instant::now() + period, period);
        snapshots.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                Some(completion) = self.done_rx.recv() => self.on_completion(completion),

                request = self.requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },

                _ = snapshots.tick() => self.start_snapshot(),
            }
        }

        self.flush_snapshots().await;
        info!("Cache worker stopped");
    }

    fn handle(&mut self, request: WorkerRequest) {
        match request {
            WorkerRequest::Install(reply) => self.install(reply),
            WorkerRequest::Activate(reply) => {
                let _ = reply.send(Ok(self.activate()));
            }
            WorkerRequest::Fetch { request, reply } => self.route(request, reply),
            WorkerRequest::Message { text, reply } => self.on_message(&text, reply),
            WorkerRequest::Stats(reply) => {
                let _ = reply.send(self.cache.stats());
            }
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Fetched {
                key,
                partition,
                response,
            } => {
                self.inflight.remove(&key);
                if let Some(response) = response {
                    if self.cache.put(partition, &key, response) == PutOutcome::Dropped {
                        debug!(%key, "Fetched response not cached");
                    }
                }
            }
            Completion::Installed {
                critical,
                optional,
                unresolved,
                reply,
            } => {
                let _ = reply.send(self.commit_install(critical, optional, unresolved));
            }
            Completion::Updated {
                fetched,
                unresolved,
                reply,
            } => {
                let _ = reply.send(Ok(self.commit_update(fetched, unresolved)));
            }
            Completion::Persisted { job, result } => {
                if let Err(e) = result {
                    warn!(error = %e, partitions = job.partitions(), "Failed to persist cache partitions");
                    self.cache.snapshot_failed(job);
                }
            }
        }
    }

    /// Hand dirty partitions to a blocking writer, unless one is still busy.
    fn start_snapshot(&mut self) {
        if self
            .snapshot_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            return;
        }
        let Some(job) = self.cache.take_snapshot() else {
            return;
        };

        let done_tx = self.done_tx.clone();
        self.snapshot_task = Some(tokio::spawn(async move {
            if let Some((job, result)) = write_snapshot(job).await {
                let _ = done_tx.send(Completion::Persisted { job, result });
            }
        }));
    }

    /// Wait for the running snapshot, commit what already finished, then
    /// write whatever is still dirty.
    async fn flush_snapshots(&mut self) {
        if let Some(task) = self.snapshot_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Snapshot task failed");
            }
        }
        while let Ok(completion) = self.done_rx.try_recv() {
            self.on_completion(completion);
        }

        let Some(job) = self.cache.take_snapshot() else {
            return;
        };
        if let Some((_, Err(e))) = write_snapshot(job).await {
            warn!(error = %e, "Failed to persist cache partitions on shutdown");
        }
    }

    fn route(&mut self, request: Request, reply: oneshot::Sender<RouterOutcome>) {
        let route = self.classifier.route(&request);

        if !request.is_get() || !self.ready {
            self.pass_through(request, route.class, reply);
            return;
        }

        let key = request.cache_key();
        let cached = self
            .cache
            .get(route.partition, &key)
            .map(|entry| entry.response.clone());

        match strategy::plan(route.strategy, cached) {
            Plan::Serve(response) => {
                let _ = reply.send(RouterOutcome::routed(response, ResponseSource::Cache, route));
            }
            Plan::ServeAndRevalidate(response) => {
                // Runs to completion on its own task; the result lands via on_completion.
                let _revalidation = self.shared_fetch(key, request, route.partition);
                let _ = reply.send(RouterOutcome::routed(response, ResponseSource::Cache, route));
            }
            Plan::Network { cached } => {
                let offline = self.offline_response(route, &request);
                let fetch = self.shared_fetch(key, request, route.partition);
                tokio::spawn(async move {
                    let (response, source) =
                        strategy::resolve_network(fetch, cached, offline).await;
                    let _ = reply.send(RouterOutcome::routed(response, source, route));
                });
            }
        }
    }

    /// Forward a request untouched. Nothing is read from or written to the cache.
    fn pass_through(
        &self,
        request: Request,
        class: RequestClass,
        reply: oneshot::Sender<RouterOutcome>,
    ) {
        let network = Arc::clone(&self.network);
        let offline = fallback::offline_response(class, None);
        tokio::spawn(async move {
            let outcome = match network.fetch(request).await {
                Ok(response) => RouterOutcome::bypassed(response, ResponseSource::Network, class),
                Err(e) => {
                    debug!(error = %e, "Pass-through request failed");
                    RouterOutcome::bypassed(offline, ResponseSource::Offline, class)
                }
            };
            let _ = reply.send(outcome);
        });
    }

    /// Join the in-flight fetch for `key` or start one.
    fn shared_fetch(&mut self, key: String, request: Request, partition: PartitionKind) -> SharedFetch {
        if let Some(existing) = self.inflight.get(&key) {
            debug!(%key, "Joining in-flight fetch");
            return existing.clone();
        }

        let network = Arc::clone(&self.network);
        let done_tx = self.done_tx.clone();
        let done_key = key.clone();
        let fut: BoxFuture<'static, Result<Response, FetchError>> = Box::pin(async move {
            let result = network.fetch(request).await;
            let response = match &result {
                Ok(response) if response.is_ok() => Some(response.clone()),
                _ => None,
            };
            let _ = done_tx.send(Completion::Fetched {
                key: done_key,
                partition,
                response,
            });
            result
        });
        let shared = fut.shared();

        // Drive to completion even if every caller goes away.
        tokio::spawn(shared.clone());
        self.inflight.insert(key, shared.clone());
        shared
    }

    fn offline_response(&self, route: Route, request: &Request) -> Response {
        let cached_root = match route.class {
            RequestClass::Other => {
                let mut root = request.url.clone();
                root.set_path("/");
                root.set_query(None);
                root.set_fragment(None);
                self.cache
                    .find(root.as_str())
                    .map(|entry| entry.response.clone())
            }
            _ => None,
        };
        fallback::offline_response(route.class, cached_root)
    }

    fn resolve(&self, path: &str) -> Result<Url, FetchError> {
        self.origin
            .join(path)
            .map_err(|e| FetchError::InvalidUrl(format!("{path}: {e}")))
    }

    /// Fetch critical then optional assets off the worker task. The commit
    /// happens in [`Self::commit_install`].
    fn install(&mut self, reply: oneshot::Sender<CacheResult<InstallReport>>) {
        let critical = match self
            .config
            .critical_assets
            .iter()
            .map(|path| self.resolve(path))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(urls) => urls,
            Err(e) => {
                let _ = reply.send(Err(CacheError::Install(e.to_string())));
                return;
            }
        };

        let mut unresolved = 0;
        let optional: Vec<Url> = self
            .config
            .optional_assets
            .iter()
            .take(self.config.max_optional_assets)
            .filter_map(|path| match self.resolve(path) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!(error = %e, "Skipping optional asset");
                    unresolved += 1;
                    None
                }
            })
            .collect();

        let network = Arc::clone(&self.network);
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let network: &dyn Network = &*network;
            let critical = fetch_critical(network, critical).await;
            let optional = match critical {
                Ok(_) => join_all(optional.into_iter().map(|url| async move {
                    let request = Request::new(Method::GET, url);
                    let key = request.cache_key();
                    (key, network.fetch(request).await)
                }))
                .await,
                Err(_) => Vec::new(),
            };
            let _ = done_tx.send(Completion::Installed {
                critical,
                optional,
                unresolved,
                reply,
            });
        });
    }

    fn commit_install(
        &mut self,
        critical: CacheResult<Vec<(String, Response)>>,
        optional: Vec<(String, Result<Response, FetchError>)>,
        unresolved: usize,
    ) -> CacheResult<InstallReport> {
        let staged = critical.map_err(|e| {
            error!(error = %e, "Critical asset precache failed");
            e
        })?;

        // Nothing is committed unless every critical asset fits.
        let critical = self
            .cache
            .put_all(PartitionKind::Static, staged)
            .map_err(|e| {
                error!(error = %e, "Critical assets do not fit the static partition");
                CacheError::Install(e.to_string())
            })?;

        let mut optional_cached = 0;
        let mut optional_skipped = unresolved;
        for (key, result) in optional {
            match result {
                Ok(response)
                    if response.is_ok()
                        && response.body.len() <= self.config.max_optional_asset_bytes =>
                {
                    match self.cache.put(PartitionKind::Static, &key, response) {
                        PutOutcome::Stored => optional_cached += 1,
                        PutOutcome::Dropped => optional_skipped += 1,
                    }
                }
                Ok(response) => {
                    debug!(%key, status = response.status, bytes = response.body.len(), "Skipping optional asset");
                    optional_skipped += 1;
                }
                Err(e) => {
                    debug!(%key, error = %e, "Optional asset unavailable");
                    optional_skipped += 1;
                }
            }
        }

        let report = InstallReport {
            critical,
            optional_cached,
            optional_skipped,
        };
        info!(?report, "Cache worker installed");
        Ok(report)
    }

    fn activate(&mut self) -> ActivateReport {
        let deleted = self.cache.delete_stale_partitions();
        self.ready = true;
        info!(deleted = deleted.len(), "Cache worker activated");
        ActivateReport { deleted }
    }

    fn on_message(&mut self, text: &str, reply: oneshot::Sender<CacheResult<ControlAck>>) {
        let message = match WorkerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Rejected control message");
                let _ = reply.send(Err(e));
                return;
            }
        };

        match message {
            WorkerMessage::CacheClear => {
                let entries = self.cache.clear();
                info!(entries, "Cache cleared");
                let _ = reply.send(Ok(ControlAck::Cleared { entries }));
            }
            WorkerMessage::CacheUpdate { urls } => {
                let paths = urls.unwrap_or_else(|| self.config.critical_assets.clone());
                let mut unresolved = 0;
                let requests: Vec<(Request, PartitionKind)> = paths
                    .iter()
                    .filter_map(|path| match self.resolve(path) {
                        Ok(url) => {
                            let request = Request::new(Method::GET, url);
                            let partition = self.classifier.route(&request).partition;
                            Some((request, partition))
                        }
                        Err(_) => {
                            unresolved += 1;
                            None
                        }
                    })
                    .collect();

                let network = Arc::clone(&self.network);
                let done_tx = self.done_tx.clone();
                tokio::spawn(async move {
                    let network: &dyn Network = &*network;
                    let fetched = join_all(requests.into_iter().map(|(request, partition)| async move {
                        let key = request.cache_key();
                        let response = match network.fetch(request).await {
                            Ok(response) if response.is_ok() => Some(response),
                            _ => None,
                        };
                        (key, partition, response)
                    }))
                    .await;
                    let _ = done_tx.send(Completion::Updated {
                        fetched,
                        unresolved,
                        reply,
                    });
                });
            }
        }
    }

    fn commit_update(
        &mut self,
        fetched: Vec<(String, PartitionKind, Option<Response>)>,
        unresolved: usize,
    ) -> ControlAck {
        let mut refreshed = 0;
        let mut failed = unresolved;
        for (key, partition, response) in fetched {
            match response.map(|response| self.cache.put(partition, &key, response)) {
                Some(PutOutcome::Stored) => refreshed += 1,
                Some(PutOutcome::Dropped) | None => failed += 1,
            }
        }
        info!(refreshed, failed, "Cache update handled");
        ControlAck::Updated { refreshed, failed }
    }
}

async fn fetch_critical(
    network: &dyn Network,
    urls: Vec<Url>,
) -> CacheResult<Vec<(String, Response)>> {
    let fetches = urls.into_iter().map(|url| async move {
        let request = Request::new(Method::GET, url);
        let key = request.cache_key();
        let response = network
            .fetch(request)
            .await
            .map_err(|e| CacheError::Install(e.to_string()))?;
        if !response.is_ok() {
            return Err(CacheError::Install(format!(
                "{key} returned {}",
                response.status
            )));
        }
        Ok((key, response))
    });
    try_join_all(fetches).await
}

/// Write `job` on the blocking pool. `None` if the writer panicked.
async fn write_snapshot(job: SnapshotJob) -> Option<(SnapshotJob, CacheResult<()>)> {
    let written = tokio::task::spawn_blocking(move || {
        let result = job.write();
        (job, result)
    })
    .await;
    match written {
        Ok(written) => Some(written),
        Err(e) => {
            error!(error = %e, "Snapshot writer panicked");
            None
        }
    }
}
