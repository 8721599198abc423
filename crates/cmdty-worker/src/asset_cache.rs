//! Versioned, partitioned offline HTTP cache.
//!
//! Partitions are named `<prefix>-<kind>-<version>`. Each carries an item
//! and byte budget; writes that would exceed it first evict the oldest
//! quarter of eligible entries (entries younger than the cleanup interval
//! are never eligible), and fail with `QuotaExceeded` if still too large.

use crate::error::{CacheError, CacheResult};
use crate::http::Response;
use cmdty_core::Clock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Partition family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    Static,
    Dynamic,
    Api,
}

impl PartitionKind {
    pub const ALL: [PartitionKind; 3] = [Self::Static, Self::Dynamic, Self::Api];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
            Self::Api => "api",
        }
    }
}

/// Size limits for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionBudget {
    pub max_items: usize,
    pub max_bytes: usize,
}

/// Budgets per partition kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budgets {
    pub static_assets: PartitionBudget,
    pub dynamic: PartitionBudget,
    pub api: PartitionBudget,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            static_assets: PartitionBudget {
                max_items: 200,
                max_bytes: 50 * 1024 * 1024,
            },
            dynamic: PartitionBudget {
                max_items: 100,
                max_bytes: 25 * 1024 * 1024,
            },
            api: PartitionBudget {
                max_items: 100,
                max_bytes: 10 * 1024 * 1024,
            },
        }
    }
}

impl Budgets {
    pub fn for_kind(&self, kind: PartitionKind) -> PartitionBudget {
        match kind {
            PartitionKind::Static => self.static_assets,
            PartitionKind::Dynamic => self.dynamic,
            PartitionKind::Api => self.api,
        }
    }
}

/// One cached response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub response: Response,
    /// Epoch milliseconds.
    pub stored_at: i64,
    pub partition: PartitionKind,
}

/// Result of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// Did not fit even after eviction. Logged, never propagated.
    Dropped,
}

/// Point-in-time partition usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
    pub name: String,
    pub items: usize,
    pub bytes: usize,
    pub max_items: usize,
    pub max_bytes: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct PartitionSnapshot {
    name: String,
    kind: PartitionKind,
    entries: Vec<CacheEntry>,
}

/// Owned copy of every partition change since the last snapshot. Built on
/// the worker task, written off it.
#[derive(Debug)]
pub struct SnapshotJob {
    dir: PathBuf,
    removed: Vec<String>,
    partitions: Vec<PartitionSnapshot>,
}

impl SnapshotJob {
    /// Blocking. Run on `spawn_blocking`.
    pub fn write(&self) -> CacheResult<()> {
        for name in &self.removed {
            let path = self.dir.join(format!("{name}.json"));
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }

        for snapshot in &self.partitions {
            let path = self.dir.join(format!("{}.json", snapshot.name));
            let tmp = self.dir.join(format!("{}.json.tmp", snapshot.name));
            fs::write(&tmp, serde_json::to_vec(snapshot)?)?;
            fs::rename(&tmp, &path)?;
            debug!(partition = %snapshot.name, entries = snapshot.entries.len(), "Persisted cache partition");
        }
        Ok(())
    }

    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }
}

#[derive(Debug)]
struct Partition {
    kind: PartitionKind,
    budget: PartitionBudget,
    entries: BTreeMap<String, CacheEntry>,
    bytes: usize,
    dirty: bool,
}

impl Partition {
    fn new(kind: PartitionKind, budget: PartitionBudget) -> Self {
        Self {
            kind,
            budget,
            entries: BTreeMap::new(),
            bytes: 0,
            dirty: false,
        }
    }

    fn fits(&self, extra_items: usize, extra_bytes: usize) -> bool {
        self.entries.len() + extra_items <= self.budget.max_items
            && self.bytes + extra_bytes <= self.budget.max_bytes
    }

    fn within_budget(&self) -> bool {
        self.fits(0, 0)
    }

    fn insert(&mut self, entry: CacheEntry) {
        self.bytes += entry.response.size();
        if let Some(old) = self.entries.insert(entry.key.clone(), entry) {
            self.bytes -= old.response.size();
        }
        self.dirty = true;
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.remove(key)?;
        self.bytes -= removed.response.size();
        self.dirty = true;
        Some(removed)
    }

    /// Evict the oldest 25% (rounded up) of entries stored before `cutoff`.
    fn evict_quarter(&mut self, cutoff: i64) -> usize {
        let mut eligible: Vec<(i64, String)> = self
            .entries
            .values()
            .filter(|e| e.stored_at < cutoff)
            .map(|e| (e.stored_at, e.key.clone()))
            .collect();
        if eligible.is_empty() {
            return 0;
        }
        eligible.sort();

        let count = eligible.len().div_ceil(4);
        for (_, key) in eligible.into_iter().take(count) {
            self.remove(&key);
        }
        count
    }
}

/// Offline HTTP cache owned by the cache worker.
pub struct AssetCache {
    prefix: String,
    version: String,
    budgets: Budgets,
    cleanup_interval: Duration,
    snapshot_dir: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    partitions: BTreeMap<String, Partition>,
    /// Partitions deleted since the last persist.
    removed: BTreeSet<String>,
}

impl AssetCache {
    pub fn new(
        prefix: impl Into<String>,
        version: impl Into<String>,
        budgets: Budgets,
        cleanup_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            version: version.into(),
            budgets,
            cleanup_interval,
            snapshot_dir: None,
            clock,
            partitions: BTreeMap::new(),
            removed: BTreeSet::new(),
        }
    }

    /// Persist partitions under `dir` and load any snapshots already there.
    /// Loaded partitions are brought back within the current budgets.
    pub fn with_snapshot_dir(mut self, dir: PathBuf) -> CacheResult<Self> {
        fs::create_dir_all(&dir)?;
        self.snapshot_dir = Some(dir);
        self.load_snapshots()?;
        self.enforce_all();
        Ok(self)
    }

    pub fn partition_name(&self, kind: PartitionKind) -> String {
        format!("{}-{}-{}", self.prefix, kind.as_str(), self.version)
    }

    /// Names of the partitions belonging to the current version.
    pub fn allowed_names(&self) -> Vec<String> {
        PartitionKind::ALL
            .iter()
            .map(|k| self.partition_name(*k))
            .collect()
    }

    /// Every partition currently held, including other versions.
    pub fn partition_names(&self) -> Vec<String> {
        self.partitions.keys().cloned().collect()
    }

    pub fn get(&self, kind: PartitionKind, key: &str) -> Option<&CacheEntry> {
        self.partitions
            .get(&self.partition_name(kind))
            .and_then(|p| p.entries.get(key))
    }

    /// First match for `key` across the current partitions.
    pub fn find(&self, key: &str) -> Option<&CacheEntry> {
        PartitionKind::ALL.iter().find_map(|k| self.get(*k, key))
    }

    /// Write `response` under `key`. On quota failure runs one cleanup pass
    /// and retries once; if it still does not fit the write is dropped.
    pub fn put(&mut self, kind: PartitionKind, key: &str, response: Response) -> PutOutcome {
        let entry = CacheEntry {
            key: key.to_string(),
            response,
            stored_at: self.clock.now_ms(),
            partition: kind,
        };

        let result = match self.try_insert(kind, entry.clone()) {
            Err(CacheError::QuotaExceeded { .. }) => {
                let incoming = entry.response.size();
                let evicted = self.make_room(kind, key, incoming);
                debug!(partition = kind.as_str(), evicted, "Evicted to make room, retrying write");
                self.try_insert(kind, entry)
            }
            other => other,
        };

        match result {
            Ok(()) => {
                self.enforce(kind);
                PutOutcome::Stored
            }
            Err(e) => {
                warn!(key, error = %e, "Dropping cache write");
                PutOutcome::Dropped
            }
        }
    }

    /// Write every entry or none. The batch must fit the partition budget on
    /// its own; if a write is still dropped, the entries written so far are
    /// rolled back and the previous values restored.
    pub fn put_all(&mut self, kind: PartitionKind, batch: Vec<(String, Response)>) -> CacheResult<usize> {
        let name = self.partition_name(kind);
        let budget = self.budgets.for_kind(kind);
        let keys: BTreeSet<&str> = batch.iter().map(|(key, _)| key.as_str()).collect();
        let bytes: usize = batch.iter().map(|(_, response)| response.size()).sum();
        if keys.len() > budget.max_items || bytes > budget.max_bytes {
            return Err(CacheError::QuotaExceeded {
                partition: name,
                items: budget.max_items,
                bytes: budget.max_bytes,
            });
        }

        let mut written: Vec<(String, Option<CacheEntry>)> = Vec::with_capacity(batch.len());
        for (key, response) in batch {
            let previous = self.get(kind, &key).cloned();
            if self.put(kind, &key, response) == PutOutcome::Dropped {
                warn!(partition = %name, %key, rolled_back = written.len(), "Batch write did not fit, rolling back");
                let partition = self.partition_mut(kind);
                for (key, previous) in written.into_iter().rev() {
                    partition.remove(&key);
                    if let Some(entry) = previous {
                        partition.insert(entry);
                    }
                }
                return Err(CacheError::QuotaExceeded {
                    partition: name,
                    items: budget.max_items,
                    bytes: budget.max_bytes,
                });
            }
            written.push((key, previous));
        }
        Ok(written.len())
    }

    fn partition_mut(&mut self, kind: PartitionKind) -> &mut Partition {
        let name = self.partition_name(kind);
        let budget = self.budgets.for_kind(kind);
        self.removed.remove(&name);
        self.partitions
            .entry(name)
            .or_insert_with(|| Partition::new(kind, budget))
    }

    fn try_insert(&mut self, kind: PartitionKind, entry: CacheEntry) -> CacheResult<()> {
        let name = self.partition_name(kind);
        let partition = self.partition_mut(kind);

        let (extra_items, extra_bytes) = match partition.entries.get(&entry.key) {
            Some(old) => (0, entry.response.size().saturating_sub(old.response.size())),
            None => (1, entry.response.size()),
        };
        if !partition.fits(extra_items, extra_bytes) {
            return Err(CacheError::QuotaExceeded {
                partition: name,
                items: partition.budget.max_items,
                bytes: partition.budget.max_bytes,
            });
        }
        partition.insert(entry);
        Ok(())
    }

    /// Evict until a write of `incoming` bytes under `key` would fit, or
    /// nothing eligible remains.
    fn make_room(&mut self, kind: PartitionKind, key: &str, incoming: usize) -> usize {
        let cutoff = self.clock.now_ms() - self.cleanup_interval.as_millis() as i64;
        let partition = self.partition_mut(kind);
        let mut evicted = 0;
        loop {
            let (extra_items, extra_bytes) = match partition.entries.get(key) {
                Some(old) => (0, incoming.saturating_sub(old.response.size())),
                None => (1, incoming),
            };
            if partition.fits(extra_items, extra_bytes) {
                break;
            }
            match partition.evict_quarter(cutoff) {
                0 => break,
                n => evicted += n,
            }
        }
        evicted
    }

    /// Bring `kind` back within budget. Returns the number of evicted entries.
    pub fn enforce(&mut self, kind: PartitionKind) -> usize {
        let cutoff = self.clock.now_ms() - self.cleanup_interval.as_millis() as i64;
        let name = self.partition_name(kind);
        let Some(partition) = self.partitions.get_mut(&name) else {
            return 0;
        };

        let mut evicted = 0;
        while !partition.within_budget() {
            match partition.evict_quarter(cutoff) {
                0 => {
                    warn!(partition = %name, "Partition over budget with nothing eligible for eviction");
                    break;
                }
                n => evicted += n,
            }
        }
        if evicted > 0 {
            info!(partition = %name, evicted, items = partition.entries.len(), bytes = partition.bytes, "Partition cleanup");
        }
        evicted
    }

    /// Run a cleanup pass on every current partition.
    pub fn enforce_all(&mut self) -> usize {
        PartitionKind::ALL.iter().map(|k| self.enforce(*k)).sum()
    }

    /// Delete every partition not in the current allow-list.
    pub fn delete_stale_partitions(&mut self) -> Vec<String> {
        let allowed = self.allowed_names();
        let stale: Vec<String> = self
            .partitions
            .keys()
            .filter(|name| !allowed.contains(name))
            .cloned()
            .collect();
        for name in &stale {
            self.partitions.remove(name);
            self.removed.insert(name.clone());
            info!(partition = %name, "Deleted stale cache partition");
        }
        stale
    }

    /// Empty every partition. Returns the number of entries removed.
    pub fn clear(&mut self) -> usize {
        let mut removed = 0;
        for partition in self.partitions.values_mut() {
            removed += partition.entries.len();
            partition.entries.clear();
            partition.bytes = 0;
            partition.dirty = true;
        }
        removed
    }

    pub fn stats(&self) -> Vec<PartitionStats> {
        self.partitions
            .iter()
            .map(|(name, p)| PartitionStats {
                name: name.clone(),
                items: p.entries.len(),
                bytes: p.bytes,
                max_items: p.budget.max_items,
                max_bytes: p.budget.max_bytes,
            })
            .collect()
    }

    /// Take every dirty partition and every removed name, clearing the dirty
    /// flags. `None` when there is nothing to write.
    pub fn take_snapshot(&mut self) -> Option<SnapshotJob> {
        let Some(dir) = self.snapshot_dir.clone() else {
            self.removed.clear();
            return None;
        };

        let removed: Vec<String> = std::mem::take(&mut self.removed).into_iter().collect();
        let partitions: Vec<PartitionSnapshot> = self
            .partitions
            .iter_mut()
            .filter(|(_, p)| p.dirty)
            .map(|(name, partition)| {
                partition.dirty = false;
                PartitionSnapshot {
                    name: name.clone(),
                    kind: partition.kind,
                    entries: partition.entries.values().cloned().collect(),
                }
            })
            .collect();

        if removed.is_empty() && partitions.is_empty() {
            return None;
        }
        Some(SnapshotJob {
            dir,
            removed,
            partitions,
        })
    }

    /// A snapshot write failed. Mark its partitions for the next attempt.
    pub fn snapshot_failed(&mut self, job: SnapshotJob) {
        for name in job.removed {
            if !self.partitions.contains_key(&name) {
                self.removed.insert(name);
            }
        }
        for snapshot in job.partitions {
            if let Some(partition) = self.partitions.get_mut(&snapshot.name) {
                partition.dirty = true;
            }
        }
    }

    /// Snapshot dirty partitions and delete files of removed ones, blocking
    /// the caller.
    pub fn persist(&mut self) -> CacheResult<()> {
        let Some(job) = self.take_snapshot() else {
            return Ok(());
        };
        match job.write() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.snapshot_failed(job);
                Err(e)
            }
        }
    }

    fn load_snapshots(&mut self) -> CacheResult<()> {
        let Some(dir) = self.snapshot_dir.clone() else {
            return Ok(());
        };

        for dirent in fs::read_dir(&dir)? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let snapshot: PartitionSnapshot = match fs::read(&path)
                .map_err(CacheError::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(CacheError::from))
            {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable cache snapshot");
                    continue;
                }
            };

            let mut partition = Partition::new(snapshot.kind, self.budgets.for_kind(snapshot.kind));
            for entry in snapshot.entries {
                partition.insert(entry);
            }
            partition.dirty = false;
            info!(partition = %snapshot.name, entries = partition.entries.len(), "Loaded cache partition");
            self.partitions.insert(snapshot.name, partition);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmdty_core::ManualClock;
    use tempfile::TempDir;

    const MINUTE: Duration = Duration::from_secs(60);

    fn budgets(max_items: usize, max_bytes: usize) -> Budgets {
        let budget = PartitionBudget {
            max_items,
            max_bytes,
        };
        Budgets {
            static_assets: budget,
            dynamic: budget,
            api: budget,
        }
    }

    fn cache(clock: Arc<ManualClock>, max_items: usize, max_bytes: usize) -> AssetCache {
        AssetCache::new("cmdty", "v2", budgets(max_items, max_bytes), MINUTE, clock)
    }

    fn body(n: usize) -> Response {
        Response::new(200, vec![b'x'; n])
    }

    #[test]
    fn test_partition_names() {
        let c = cache(Arc::new(ManualClock::new(0)), 10, 1000);
        assert_eq!(c.partition_name(PartitionKind::Static), "cmdty-static-v2");
        assert_eq!(
            c.allowed_names(),
            vec!["cmdty-static-v2", "cmdty-dynamic-v2", "cmdty-api-v2"]
        );
    }

    #[test]
    fn test_evicts_oldest_quarter_of_eligible() {
        let clock = Arc::new(ManualClock::new(0));
        let mut c = cache(clock.clone(), 8, 1_000_000);

        for i in 0..8 {
            assert_eq!(c.put(PartitionKind::Api, &format!("k{i}"), body(10)), PutOutcome::Stored);
            clock.advance(Duration::from_secs(1));
        }
        clock.advance(MINUTE);

        assert_eq!(c.put(PartitionKind::Api, "k8", body(10)), PutOutcome::Stored);
        // 8 eligible -> 2 evicted, oldest first.
        assert!(c.get(PartitionKind::Api, "k0").is_none());
        assert!(c.get(PartitionKind::Api, "k1").is_none());
        assert!(c.get(PartitionKind::Api, "k2").is_some());
        assert!(c.get(PartitionKind::Api, "k8").is_some());

        let stats = c.stats();
        assert_eq!(stats[0].items, 7);
        assert!(stats[0].items <= stats[0].max_items);
    }

    #[test]
    fn test_recent_entries_are_protected() {
        let clock = Arc::new(ManualClock::new(0));
        let mut c = cache(clock.clone(), 2, 1_000_000);

        c.put(PartitionKind::Dynamic, "a", body(1));
        c.put(PartitionKind::Dynamic, "b", body(1));
        assert_eq!(c.put(PartitionKind::Dynamic, "c", body(1)), PutOutcome::Dropped);
        assert!(c.get(PartitionKind::Dynamic, "a").is_some());
        assert!(c.get(PartitionKind::Dynamic, "c").is_none());
    }

    #[test]
    fn test_byte_budget_holds_after_cleanup() {
        let clock = Arc::new(ManualClock::new(0));
        let mut c = cache(clock.clone(), 100, 100);

        for i in 0..4 {
            c.put(PartitionKind::Static, &format!("s{i}"), body(25));
        }
        clock.advance(MINUTE * 2);
        assert_eq!(c.put(PartitionKind::Static, "big", body(60)), PutOutcome::Stored);

        for s in c.stats() {
            assert!(s.bytes <= s.max_bytes, "{s:?}");
        }
        assert!(c.get(PartitionKind::Static, "big").is_some());
        assert_eq!(c.put(PartitionKind::Static, "huge", body(101)), PutOutcome::Dropped);
    }

    #[test]
    fn test_overwrite_same_key() {
        let clock = Arc::new(ManualClock::new(0));
        let mut c = cache(clock, 1, 100);
        c.put(PartitionKind::Api, "k", body(10));
        assert_eq!(c.put(PartitionKind::Api, "k", body(20)), PutOutcome::Stored);
        assert_eq!(c.get(PartitionKind::Api, "k").unwrap().response.body.len(), 20);
        assert_eq!(c.stats()[0].bytes, 20);
    }

    #[test]
    fn test_snapshot_roundtrip_and_stale_partition_cleanup() {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(0));

        {
            let mut old = AssetCache::new("cmdty", "v1", Budgets::default(), MINUTE, clock.clone())
                .with_snapshot_dir(temp_dir.path().to_path_buf())
                .unwrap();
            old.put(PartitionKind::Static, "https://app.test/", body(5));
            old.persist().unwrap();
        }
        assert!(temp_dir.path().join("cmdty-static-v1.json").exists());

        let mut new = AssetCache::new("cmdty", "v2", Budgets::default(), MINUTE, clock)
            .with_snapshot_dir(temp_dir.path().to_path_buf())
            .unwrap();
        assert_eq!(new.partition_names(), vec!["cmdty-static-v1"]);

        new.put(PartitionKind::Static, "https://app.test/", body(7));
        assert_eq!(new.delete_stale_partitions(), vec!["cmdty-static-v1"]);
        new.persist().unwrap();

        assert!(!temp_dir.path().join("cmdty-static-v1.json").exists());
        assert!(temp_dir.path().join("cmdty-static-v2.json").exists());
    }

    #[test]
    fn test_put_all_rejects_batch_over_budget() {
        let clock = Arc::new(ManualClock::new(0));
        let mut c = cache(clock, 1, 1000);

        let err = c
            .put_all(
                PartitionKind::Static,
                vec![("a".into(), body(1)), ("b".into(), body(1))],
            )
            .unwrap_err();
        assert!(matches!(err, CacheError::QuotaExceeded { .. }));
        assert!(c.get(PartitionKind::Static, "a").is_none());
        assert!(c.get(PartitionKind::Static, "b").is_none());
    }

    #[test]
    fn test_put_all_rolls_back_when_a_write_drops() {
        let clock = Arc::new(ManualClock::new(0));
        let mut c = cache(clock, 2, 1000);
        c.put(PartitionKind::Static, "a", body(3));
        c.put(PartitionKind::Static, "old", body(3));

        // Fits on its own, but "old" is too recent to evict.
        let err = c
            .put_all(
                PartitionKind::Static,
                vec![("a".into(), body(5)), ("b".into(), body(5))],
            )
            .unwrap_err();
        assert!(matches!(err, CacheError::QuotaExceeded { .. }));
        assert_eq!(c.get(PartitionKind::Static, "a").unwrap().response.body.len(), 3);
        assert!(c.get(PartitionKind::Static, "b").is_none());
        assert_eq!(c.stats()[0].bytes, 6);
    }

    #[test]
    fn test_put_all_stores_every_entry() {
        let clock = Arc::new(ManualClock::new(0));
        let mut c = cache(clock, 2, 1000);
        let stored = c
            .put_all(
                PartitionKind::Static,
                vec![("a".into(), body(1)), ("b".into(), body(1))],
            )
            .unwrap();
        assert_eq!(stored, 2);
        assert_eq!(c.stats()[0].items, 2);
    }

    #[test]
    fn test_loaded_snapshot_is_trimmed_to_budget() {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(0));

        {
            let mut roomy = cache(clock.clone(), 10, 1_000_000)
                .with_snapshot_dir(temp_dir.path().to_path_buf())
                .unwrap();
            for i in 0..4 {
                roomy.put(PartitionKind::Api, &format!("k{i}"), body(10));
                clock.advance(Duration::from_secs(1));
            }
            roomy.persist().unwrap();
        }
        clock.advance(MINUTE * 5);

        let tight = cache(clock, 2, 1_000_000)
            .with_snapshot_dir(temp_dir.path().to_path_buf())
            .unwrap();
        let stats = tight.stats();
        assert_eq!(stats[0].name, "cmdty-api-v2");
        assert!(stats[0].items <= 2, "{stats:?}");
        assert!(tight.get(PartitionKind::Api, "k0").is_none());
        assert!(tight.get(PartitionKind::Api, "k3").is_some());
    }

    #[test]
    fn test_take_snapshot_only_dirty_partitions() {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let mut c = cache(clock, 10, 1000)
            .with_snapshot_dir(temp_dir.path().to_path_buf())
            .unwrap();
        assert!(c.take_snapshot().is_none());

        c.put(PartitionKind::Api, "a", body(1));
        let job = c.take_snapshot().unwrap();
        assert_eq!(job.partitions(), 1);
        assert!(c.take_snapshot().is_none());

        c.snapshot_failed(job);
        let job = c.take_snapshot().unwrap();
        job.write().unwrap();

        let raw: serde_json::Value = serde_json::from_slice(
            &fs::read(temp_dir.path().join("cmdty-api-v2.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(raw["entries"][0]["response"]["body"], "eA==");
    }

    #[test]
    fn test_clear() {
        let clock = Arc::new(ManualClock::new(0));
        let mut c = cache(clock, 10, 1000);
        c.put(PartitionKind::Api, "a", body(1));
        c.put(PartitionKind::Static, "b", body(1));
        assert_eq!(c.clear(), 2);
        assert!(c.find("a").is_none());
    }
}
