//! Predictive prefetch of data adjacent to what the user is viewing.

use crate::cache::QueryCache;
use crate::key::QueryKey;
use cmdty_core::Connectivity;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Prefetch configuration.
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    /// Delay between consecutive prefetch requests.
    pub spacing: Duration,
    /// History ranges offered by the dashboard.
    pub ranges: Vec<String>,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            spacing: Duration::from_millis(500),
            ranges: ["1D", "1W", "1M", "3M", "1Y"]
                .iter()
                .map(|r| r.to_string())
                .collect(),
        }
    }
}

/// Schedules low-priority fetches when a commodity view opens.
pub struct Prefetcher {
    cache: QueryCache,
    connectivity: Arc<dyn Connectivity>,
    config: PrefetchConfig,
}

impl Prefetcher {
    pub fn new(
        cache: QueryCache,
        connectivity: Arc<dyn Connectivity>,
        config: PrefetchConfig,
    ) -> Self {
        Self {
            cache,
            connectivity,
            config,
        }
    }

    /// Keys likely to be requested next after viewing `viewed`: the other
    /// history ranges of the same symbol, then its news.
    pub fn adjacent_keys(&self, viewed: &QueryKey) -> Vec<QueryKey> {
        let Some(symbol) = viewed.param("symbol") else {
            return Vec::new();
        };
        let current_range = viewed.param("range");

        let mut keys: Vec<QueryKey> = self
            .config
            .ranges
            .iter()
            .filter(|r| Some(r.as_str()) != current_range)
            .map(|r| QueryKey::history(symbol, r))
            .collect();

        let news = QueryKey::news(symbol);
        if &news != viewed {
            keys.push(news);
        }
        keys
    }

    /// Start prefetching around `viewed`. Returns `None` when offline;
    /// otherwise the task resolves to the number of fetches issued.
    pub fn on_view(&self, viewed: &QueryKey) -> Option<JoinHandle<usize>> {
        if !self.connectivity.allow_non_critical() {
            debug!(key = %viewed, "Offline, skipping prefetch");
            return None;
        }

        let keys = self.adjacent_keys(viewed);
        let cache = self.cache.clone();
        let connectivity = Arc::clone(&self.connectivity);
        let spacing = self.config.spacing;

        Some(tokio::spawn(async move {
            let mut issued = 0;
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(spacing).await;
                }
                if !connectivity.allow_non_critical() {
                    debug!("Connectivity lost, abandoning prefetch");
                    break;
                }
                if cache.prefetch(key) {
                    issued += 1;
                }
            }
            debug!(issued, total = keys.len(), "Prefetch pass complete");
            issued
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::QueryCacheConfig;
    use crate::error::QueryResult;
    use crate::policy::DeviceProfile;
    use crate::source::QuerySource;
    use cmdty_core::{BoxFuture, ManualClock};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Source {
        calls: AtomicUsize,
    }

    impl QuerySource for Source {
        fn fetch(&self, _key: &QueryKey) -> BoxFuture<'_, QueryResult<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(json!([])) })
        }
    }

    struct Toggle(AtomicBool);

    impl Connectivity for Toggle {
        fn is_online(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn setup(online: bool) -> (Prefetcher, QueryCache, Arc<Source>, Arc<Toggle>) {
        let source = Arc::new(Source::default());
        let cache = QueryCache::new(
            QueryCacheConfig::default(),
            DeviceProfile::Desktop,
            source.clone(),
            Arc::new(ManualClock::new(0)),
        );
        let toggle = Arc::new(Toggle(AtomicBool::new(online)));
        let prefetcher = Prefetcher::new(cache.clone(), toggle.clone(), PrefetchConfig::default());
        (prefetcher, cache, source, toggle)
    }

    #[test]
    fn test_adjacent_keys() {
        let (prefetcher, _, _, _) = setup(true);

        let keys = prefetcher.adjacent_keys(&QueryKey::history("GC", "1M"));
        let ids: Vec<String> = keys.iter().map(QueryKey::id).collect();
        assert_eq!(
            ids,
            vec![
                "history?range=1D&symbol=GC",
                "history?range=1W&symbol=GC",
                "history?range=3M&symbol=GC",
                "history?range=1Y&symbol=GC",
                "news?symbol=GC",
            ]
        );
        assert!(prefetcher.adjacent_keys(&QueryKey::prices()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefetch_staggered_and_skips_fresh() {
        let (prefetcher, cache, source, _) = setup(true);
        cache.set_query_data(&QueryKey::news("GC"), json!([]), None);

        let handle = prefetcher.on_view(&QueryKey::history("GC", "1D")).unwrap();
        let issued = handle.await.unwrap();

        assert_eq!(issued, 4);
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_offline_skips_prefetch() {
        let (prefetcher, _, source, _) = setup(false);
        assert!(prefetcher.on_view(&QueryKey::history("GC", "1D")).is_none());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_going_offline_mid_pass_stops() {
        let (prefetcher, _, _, toggle) = setup(true);
        let handle = prefetcher.on_view(&QueryKey::history("SI", "1D")).unwrap();

        tokio::time::sleep(Duration::from_millis(750)).await;
        toggle.0.store(false, Ordering::SeqCst);

        let issued = handle.await.unwrap();
        assert_eq!(issued, 2);
    }
}
