//! TTL query cache with stale-while-revalidate reads.
//!
//! Reads never block on the network when any data is cached. A stale hit
//! returns immediately and revalidates in the background; concurrent reads
//! of the same key attach to a single in-flight fetch.

use crate::entry::{QueryEntry, QueryStatus};
use crate::error::QueryResult;
use crate::key::QueryKey;
use crate::policy::{CachePolicy, DeviceProfile};
use crate::source::QuerySource;
use cmdty_core::{BoxFuture, Clock, Connectivity};
use futures_util::future::{FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type SharedFetch = Shared<BoxFuture<'static, QueryResult<Value>>>;

/// Query cache configuration.
#[derive(Debug, Clone)]
pub struct QueryCacheConfig {
    /// Aggregate size above which stale entries are evicted during a sweep.
    pub budget_bytes: usize,
    /// Interval between sweeps.
    pub sweep_interval: Duration,
    /// Error entries older than this are purged on every sweep.
    pub error_retention: Duration,
    /// How often the refetcher checks for entries with a due refetch interval.
    pub refetch_tick: Duration,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 5 * 1024 * 1024,
            sweep_interval: Duration::from_secs(300),
            error_retention: Duration::from_secs(300),
            refetch_tick: Duration::from_secs(5),
        }
    }
}

/// Where the returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOrigin {
    Cache { stale: bool },
    Network,
}

/// Result of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub data: Value,
    pub origin: DataOrigin,
    /// A background refetch was started or joined for this read.
    pub revalidating: bool,
}

/// What a sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub gc_removed: usize,
    pub stale_evicted: usize,
    pub errors_purged: usize,
    pub bytes_before: usize,
    pub bytes_after: usize,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheMetrics {
    pub total: usize,
    pub fresh: usize,
    pub stale: usize,
    pub pending: usize,
    pub error: usize,
    pub total_bytes: usize,
    /// Non-stale entries over total entries. 0.0 for an empty cache.
    pub hit_rate: f64,
    pub fetches: u64,
    pub evictions: u64,
}

struct Inner {
    config: QueryCacheConfig,
    profile: DeviceProfile,
    source: Arc<dyn QuerySource>,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, QueryEntry>>,
    inflight: Mutex<HashMap<String, SharedFetch>>,
    fetches: AtomicU64,
    evictions: AtomicU64,
}

impl Inner {
    fn record_result(&self, key: &QueryKey, policy: CachePolicy, result: &QueryResult<Value>) {
        let now = self.clock.now_ms();
        let mut entries = self.entries.write();
        let entry = entries
            .entry(key.id())
            .or_insert_with(|| QueryEntry::pending(key.clone(), policy, now));
        match result {
            Ok(data) => entry.complete(data.clone(), policy, now),
            Err(e) => {
                warn!(key = %key, error = %e, "Query fetch failed");
                entry.fail(e.to_string(), now);
            }
        }
    }
}

/// Shared handle to the query cache.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl QueryCache {
    pub fn new(
        config: QueryCacheConfig,
        profile: DeviceProfile,
        source: Arc<dyn QuerySource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                profile,
                source,
                clock,
                entries: RwLock::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                fetches: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    pub fn profile(&self) -> DeviceProfile {
        self.inner.profile
    }

    /// Default policy for `key` under the configured device profile.
    pub fn policy_for(&self, key: &QueryKey) -> CachePolicy {
        CachePolicy::for_resource(key.kind(), self.inner.profile)
    }

    /// Read `key`, fetching or revalidating as its freshness requires.
    pub async fn get(
        &self,
        key: &QueryKey,
        policy: Option<CachePolicy>,
    ) -> QueryResult<QueryOutcome> {
        let policy = policy.unwrap_or_else(|| self.policy_for(key));
        let now = self.inner.clock.now_ms();

        let cached = {
            let entries = self.inner.entries.read();
            entries
                .get(&key.id())
                .and_then(|e| e.data.clone().map(|data| (data, e.status(now))))
        };

        match cached {
            Some((data, QueryStatus::Fresh)) => Ok(QueryOutcome {
                data,
                origin: DataOrigin::Cache { stale: false },
                revalidating: false,
            }),
            Some((data, status)) => {
                debug!(key = %key, ?status, "Serving cached data, revalidating");
                self.start_fetch(key, policy);
                Ok(QueryOutcome {
                    data,
                    origin: DataOrigin::Cache { stale: true },
                    revalidating: true,
                })
            }
            None => {
                self.inner
                    .entries
                    .write()
                    .entry(key.id())
                    .or_insert_with(|| QueryEntry::pending(key.clone(), policy, now));
                let data = self.start_fetch(key, policy).await?;
                Ok(QueryOutcome {
                    data,
                    origin: DataOrigin::Network,
                    revalidating: false,
                })
            }
        }
    }

    /// Start a fetch for `key` unless one is already in flight, and return a
    /// handle to the (possibly existing) result. The fetch runs on its own
    /// task so it completes even if every caller stops waiting.
    fn start_fetch(&self, key: &QueryKey, policy: CachePolicy) -> SharedFetch {
        let id = key.id();
        let shared = {
            let mut inflight = self.inner.inflight.lock();
            if let Some(existing) = inflight.get(&id) {
                return existing.clone();
            }

            let inner = Arc::clone(&self.inner);
            let key = key.clone();
            let fut: BoxFuture<'static, QueryResult<Value>> = Box::pin(async move {
                inner.fetches.fetch_add(1, Ordering::Relaxed);
                let result = inner.source.fetch(&key).await;
                inner.record_result(&key, policy, &result);
                inner.inflight.lock().remove(&key.id());
                result
            });
            let shared = fut.shared();
            inflight.insert(id, shared.clone());
            shared
        };

        tokio::spawn(shared.clone());
        shared
    }

    /// Cached data for `key` without triggering a fetch.
    pub fn peek(&self, key: &QueryKey) -> Option<Value> {
        self.inner
            .entries
            .read()
            .get(&key.id())
            .and_then(|e| e.data.clone())
    }

    pub fn status(&self, key: &QueryKey) -> Option<QueryStatus> {
        let now = self.inner.clock.now_ms();
        self.inner.entries.read().get(&key.id()).map(|e| e.status(now))
    }

    pub fn is_fresh(&self, key: &QueryKey) -> bool {
        self.status(key) == Some(QueryStatus::Fresh)
    }

    /// Warm `key` in the background. Returns false when it is already fresh
    /// or a fetch is already running.
    pub fn prefetch(&self, key: &QueryKey) -> bool {
        if self.is_fresh(key) || self.inner.inflight.lock().contains_key(&key.id()) {
            return false;
        }
        let policy = self.policy_for(key);
        self.start_fetch(key, policy);
        true
    }

    /// Overwrite cached data, e.g. after a local mutation.
    pub fn set_query_data(&self, key: &QueryKey, data: Value, policy: Option<CachePolicy>) {
        let policy = policy.unwrap_or_else(|| self.policy_for(key));
        let now = self.inner.clock.now_ms();
        let mut entries = self.inner.entries.write();
        entries
            .entry(key.id())
            .or_insert_with(|| QueryEntry::pending(key.clone(), policy, now))
            .complete(data, policy, now);
    }

    /// Drop one entry. Returns whether it existed.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        self.inner.entries.write().remove(&key.id()).is_some()
    }

    /// Drop every entry for `resource`, whatever its parameters.
    pub fn invalidate_resource(&self, resource: &str) -> usize {
        let mut entries = self.inner.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.key.resource() != resource);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one sweep pass: gc expiry, budget eviction of stale entries, then
    /// purge of old errors.
    pub fn sweep(&self) -> SweepReport {
        let now = self.inner.clock.now_ms();
        let mut entries = self.inner.entries.write();
        let mut report = SweepReport::default();

        let before = entries.len();
        entries.retain(|_, e| e.gc_at > now);
        report.gc_removed = before - entries.len();

        report.bytes_before = entries.values().map(|e| e.size_bytes).sum();

        if report.bytes_before > self.inner.config.budget_bytes {
            let mut stale: Vec<(i64, String)> = entries
                .iter()
                .filter(|(_, e)| e.status(now) == QueryStatus::Stale)
                .map(|(id, e)| (e.fetched_at.unwrap_or(i64::MIN), id.clone()))
                .collect();
            stale.sort();

            let count = stale.len().div_ceil(4);
            for (_, id) in stale.into_iter().take(count) {
                entries.remove(&id);
            }
            report.stale_evicted = count;
            self.inner
                .evictions
                .fetch_add(count as u64, Ordering::Relaxed);
        }

        let retention = self.inner.config.error_retention.as_millis() as i64;
        let before = entries.len();
        entries.retain(|_, e| match (&e.error, e.error_at) {
            (Some(_), Some(at)) => now - at <= retention,
            _ => true,
        });
        report.errors_purged = before - entries.len();

        report.bytes_after = entries.values().map(|e| e.size_bytes).sum();

        if report.gc_removed + report.stale_evicted + report.errors_purged > 0 {
            info!(
                gc_removed = report.gc_removed,
                stale_evicted = report.stale_evicted,
                errors_purged = report.errors_purged,
                bytes_before = report.bytes_before,
                bytes_after = report.bytes_after,
                "Query cache sweep"
            );
        }
        report
    }

    pub fn metrics(&self) -> CacheMetrics {
        let now = self.inner.clock.now_ms();
        let entries = self.inner.entries.read();
        let mut m = CacheMetrics {
            total: entries.len(),
            fetches: self.inner.fetches.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            ..CacheMetrics::default()
        };
        for entry in entries.values() {
            m.total_bytes += entry.size_bytes;
            match entry.status(now) {
                QueryStatus::Fresh => m.fresh += 1,
                QueryStatus::Stale => m.stale += 1,
                QueryStatus::Pending => m.pending += 1,
                QueryStatus::Error => m.error += 1,
            }
        }
        if m.total > 0 {
            m.hit_rate = (m.total - m.stale) as f64 / m.total as f64;
        }
        m
    }

    /// Run [`sweep`](Self::sweep) on the configured interval until cancelled.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        let period = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Query cache sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        cache.sweep();
                    }
                }
            }
        })
    }

    /// Refetch entries whose policy carries a refetch interval, while online.
    pub fn spawn_refetcher(
        &self,
        connectivity: Arc<dyn Connectivity>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        let period = self.inner.config.refetch_tick;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Query cache refetcher stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if connectivity.is_online() {
                            cache.refetch_due();
                        }
                    }
                }
            }
        })
    }

    /// Start a fetch for every entry whose refetch interval has elapsed.
    pub fn refetch_due(&self) -> usize {
        let now = self.inner.clock.now_ms();
        let due: Vec<(QueryKey, CachePolicy)> = self
            .inner
            .entries
            .read()
            .values()
            .filter(|e| e.refetch_due(now))
            .map(|e| (e.key.clone(), e.policy))
            .collect();
        for (key, policy) in &due {
            self.start_fetch(key, *policy);
        }
        due.len()
    }
}
