//! Partitioned durable store with retention pruning.

use crate::error::{PersistenceError, PersistenceResult};
use crate::log::{self, LogEntry, PartitionLog};
use chrono::{DateTime, Utc};
use cmdty_core::{Clock, DurableRecord, EntityType};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Durable store configuration.
#[derive(Debug, Clone)]
pub struct DurableStoreConfig {
    /// Directory holding one `<partition>.jsonl` per entity type.
    /// `None` keeps everything in memory.
    pub dir: Option<PathBuf>,
    /// Records older than this are pruned (expiring partitions only).
    pub retention: Duration,
    /// Maximum records per partition.
    pub max_records_per_partition: usize,
}

impl Default for DurableStoreConfig {
    fn default() -> Self {
        Self {
            dir: None,
            retention: Duration::from_secs(24 * 60 * 60),
            max_records_per_partition: 10_000,
        }
    }
}

/// Result of a write that survived quota handling.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Written(DurableRecord),
    /// Partition stayed full after one eviction pass; the write was discarded.
    Dropped,
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written(_))
    }
}

#[derive(Default)]
struct Partition {
    records: HashMap<String, DurableRecord>,
    /// Secondary index on write time: (written_at_ms, key).
    by_written: BTreeSet<(i64, String)>,
    log: Option<PartitionLog>,
}

impl Partition {
    fn insert(&mut self, record: DurableRecord) {
        if let Some(old) = self.records.get(&record.key) {
            self.by_written
                .remove(&(old.written_at.timestamp_millis(), old.key.clone()));
        }
        self.by_written
            .insert((record.written_at.timestamp_millis(), record.key.clone()));
        self.records.insert(record.key.clone(), record);
    }

    fn remove(&mut self, key: &str) -> Option<DurableRecord> {
        let old = self.records.remove(key)?;
        self.by_written
            .remove(&(old.written_at.timestamp_millis(), old.key.clone()));
        Some(old)
    }

    /// Keys written strictly before `cutoff_ms`, oldest first.
    fn keys_before(&self, cutoff_ms: i64) -> Vec<String> {
        self.by_written
            .range(..(cutoff_ms, String::new()))
            .map(|(_, key)| key.clone())
            .collect()
    }

    fn oldest_keys(&self, n: usize) -> Vec<String> {
        self.by_written
            .iter()
            .take(n)
            .map(|(_, key)| key.clone())
            .collect()
    }

    fn compact(&mut self) -> PersistenceResult<()> {
        let Partition { records, log, .. } = self;
        if let Some(log) = log.as_mut() {
            log.compact(records.values())?;
        }
        Ok(())
    }
}

/// Durable keyed storage partitioned by entity type.
pub struct DurableStore {
    config: DurableStoreConfig,
    clock: Arc<dyn Clock>,
    partitions: Mutex<HashMap<EntityType, Partition>>,
}

impl DurableStore {
    /// Open the store, replaying every partition log, then prune expired records.
    pub fn open(config: DurableStoreConfig, clock: Arc<dyn Clock>) -> PersistenceResult<Self> {
        let mut partitions = HashMap::new();

        if let Some(dir) = &config.dir {
            std::fs::create_dir_all(dir)?;
        }

        for entity in EntityType::ALL {
            let mut partition = Partition::default();

            if let Some(dir) = &config.dir {
                let path = dir.join(format!("{}.jsonl", entity.partition_name()));
                for entry in log::replay(&path)? {
                    match entry {
                        LogEntry::Put(record) => partition.insert(record),
                        LogEntry::Delete { key, .. } => {
                            partition.remove(&key);
                        }
                    }
                }
                partition.log = Some(PartitionLog::open(&path)?);
            }

            debug!(partition = %entity, records = partition.records.len(), "Partition loaded");
            partitions.insert(entity, partition);
        }

        let store = Self {
            config,
            clock,
            partitions: Mutex::new(partitions),
        };

        let pruned = store.prune_expired()?;
        info!(pruned, dir = ?store.config.dir, "Durable store opened");
        Ok(store)
    }

    /// Open a store that never touches disk.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        let partitions = EntityType::ALL
            .into_iter()
            .map(|e| (e, Partition::default()))
            .collect();
        Self {
            config: DurableStoreConfig::default(),
            clock,
            partitions: Mutex::new(partitions),
        }
    }

    /// Upsert a record.
    ///
    /// A full partition gets one eviction pass and a single retry; if the
    /// retry still fails the write is dropped and reported as
    /// `WriteOutcome::Dropped` rather than an error.
    pub fn put(
        &self,
        entity: EntityType,
        key: &str,
        payload: serde_json::Value,
    ) -> PersistenceResult<WriteOutcome> {
        match self.try_put(entity, key, payload.clone()) {
            Err(PersistenceError::QuotaExceeded { partition, limit }) => {
                warn!(%partition, limit, "Partition full, running eviction pass");
                self.evict_for_quota(entity)?;

                match self.try_put(entity, key, payload) {
                    Err(PersistenceError::QuotaExceeded { partition, .. }) => {
                        warn!(%partition, %key, "Partition still full, dropping write");
                        Ok(WriteOutcome::Dropped)
                    }
                    other => other.map(WriteOutcome::Written),
                }
            }
            other => other.map(WriteOutcome::Written),
        }
    }

    fn try_put(
        &self,
        entity: EntityType,
        key: &str,
        payload: serde_json::Value,
    ) -> PersistenceResult<DurableRecord> {
        let mut partitions = self.partitions.lock();
        let partition = partitions.entry(entity).or_default();

        let limit = self.config.max_records_per_partition;
        if !partition.records.contains_key(key) && partition.records.len() >= limit {
            return Err(PersistenceError::QuotaExceeded {
                partition: entity.partition_name().to_string(),
                limit,
            });
        }

        let record = DurableRecord {
            entity_type: entity,
            key: key.to_string(),
            payload,
            written_at: self.clock.now(),
        };

        if let Some(log) = partition.log.as_mut() {
            log.append(&LogEntry::Put(record.clone()))?;
        }
        partition.insert(record.clone());

        Ok(record)
    }

    /// Get a record by key.
    pub fn get(&self, entity: EntityType, key: &str) -> Option<DurableRecord> {
        self.partitions
            .lock()
            .get(&entity)
            .and_then(|p| p.records.get(key).cloned())
    }

    /// Delete a record. Returns whether it existed.
    pub fn delete(&self, entity: EntityType, key: &str) -> PersistenceResult<bool> {
        let mut partitions = self.partitions.lock();
        let Some(partition) = partitions.get_mut(&entity) else {
            return Ok(false);
        };

        if partition.remove(key).is_none() {
            return Ok(false);
        }

        if let Some(log) = partition.log.as_mut() {
            log.append(&LogEntry::Delete {
                key: key.to_string(),
                at: self.clock.now(),
            })?;
        }
        Ok(true)
    }

    /// All records of a partition, ordered by key.
    pub fn list(&self, entity: EntityType) -> Vec<DurableRecord> {
        let partitions = self.partitions.lock();
        let mut records: Vec<DurableRecord> = partitions
            .get(&entity)
            .map(|p| p.records.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Records whose partition index field is at or after `since`, newest first.
    pub fn indexed_since(&self, entity: EntityType, since: DateTime<Utc>) -> Vec<DurableRecord> {
        let mut hits: Vec<(DateTime<Utc>, DurableRecord)> = self
            .list(entity)
            .into_iter()
            .filter_map(|r| r.indexed_at().filter(|t| *t >= since).map(|t| (t, r)))
            .collect();
        hits.sort_by(|a, b| b.0.cmp(&a.0));
        hits.into_iter().map(|(_, r)| r).collect()
    }

    /// Number of records in a partition.
    pub fn len(&self, entity: EntityType) -> usize {
        self.partitions
            .lock()
            .get(&entity)
            .map(|p| p.records.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, entity: EntityType) -> bool {
        self.len(entity) == 0
    }

    /// Delete records older than the retention window from expiring partitions.
    ///
    /// Returns the number of records removed.
    pub fn prune_expired(&self) -> PersistenceResult<usize> {
        let cutoff_ms = self.clock.now_ms() - self.config.retention.as_millis() as i64;
        let mut partitions = self.partitions.lock();
        let mut total = 0;

        for (entity, partition) in partitions.iter_mut() {
            if !entity.expires() {
                continue;
            }
            let expired = partition.keys_before(cutoff_ms);
            if expired.is_empty() {
                continue;
            }
            for key in &expired {
                partition.remove(key);
            }
            partition.compact()?;
            debug!(partition = %entity, pruned = expired.len(), "Pruned expired records");
            total += expired.len();
        }

        Ok(total)
    }

    /// One eviction pass for a full partition: expired records first, then
    /// the oldest quarter of an expiring partition.
    fn evict_for_quota(&self, entity: EntityType) -> PersistenceResult<usize> {
        let mut evicted = self.prune_expired()?;

        if entity.expires() {
            let mut partitions = self.partitions.lock();
            if let Some(partition) = partitions.get_mut(&entity) {
                if partition.records.len() >= self.config.max_records_per_partition {
                    let n = partition.records.len().div_ceil(4);
                    for key in partition.oldest_keys(n) {
                        partition.remove(&key);
                        evicted += 1;
                    }
                    partition.compact()?;
                }
            }
        }

        info!(partition = %entity, evicted, "Eviction pass complete");
        Ok(evicted)
    }

    /// Run `prune_expired` every `interval` until cancelled.
    pub fn spawn_expiry_sweep(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("Expiry sweep stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        match self.prune_expired() {
                            Ok(0) => {}
                            Ok(pruned) => info!(pruned, "Expiry sweep removed records"),
                            Err(e) => warn!(?e, "Expiry sweep failed"),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmdty_core::ManualClock;
    use serde_json::json;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn disk_config(dir: &TempDir) -> DurableStoreConfig {
        DurableStoreConfig {
            dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn test_put_get_delete() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = DurableStore::in_memory(clock);

        let outcome = store
            .put(EntityType::Commodities, "Gold Futures", json!({"price": 2001.5}))
            .unwrap();
        assert!(outcome.is_written());
        assert_eq!(store.len(EntityType::Commodities), 1);

        let record = store.get(EntityType::Commodities, "Gold Futures").unwrap();
        assert_eq!(record.payload["price"], 2001.5);

        assert!(store.delete(EntityType::Commodities, "Gold Futures").unwrap());
        assert!(!store.delete(EntityType::Commodities, "Gold Futures").unwrap());
        assert!(store.is_empty(EntityType::Commodities));
    }

    #[test]
    fn test_reopen_replays_log() {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));

        {
            let store = DurableStore::open(disk_config(&temp_dir), clock.clone()).unwrap();
            store.put(EntityType::Portfolio, "p1", json!({"qty": 1})).unwrap();
            store.put(EntityType::Portfolio, "p1", json!({"qty": 2})).unwrap();
            store.put(EntityType::Portfolio, "p2", json!({"qty": 5})).unwrap();
            store.delete(EntityType::Portfolio, "p2").unwrap();
        }

        let store = DurableStore::open(disk_config(&temp_dir), clock).unwrap();
        let records = store.list(EntityType::Portfolio);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload["qty"], 2);
    }

    #[test]
    fn test_prune_expired_respects_retention() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = DurableStore::in_memory(clock.clone());

        store.put(EntityType::News, "old", json!({})).unwrap();
        store.put(EntityType::UserSettings, "theme", json!("dark")).unwrap();
        clock.advance(23 * HOUR);
        store.put(EntityType::News, "recent", json!({})).unwrap();
        clock.advance(2 * HOUR);

        assert_eq!(store.prune_expired().unwrap(), 1);
        assert!(store.get(EntityType::News, "old").is_none());
        assert!(store.get(EntityType::News, "recent").is_some());
        assert!(store.get(EntityType::UserSettings, "theme").is_some());
    }

    #[test]
    fn test_open_prunes_at_startup() {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));

        {
            let store = DurableStore::open(disk_config(&temp_dir), clock.clone()).unwrap();
            store.put(EntityType::Commodities, "Silver", json!({})).unwrap();
        }

        clock.advance(25 * HOUR);
        let store = DurableStore::open(disk_config(&temp_dir), clock).unwrap();
        assert!(store.is_empty(EntityType::Commodities));
    }

    #[test]
    fn test_sync_queue_partition_never_expires() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = DurableStore::in_memory(clock.clone());

        store.put(EntityType::SyncQueue, "00000000000000000001", json!({})).unwrap();
        clock.advance(48 * HOUR);

        assert_eq!(store.prune_expired().unwrap(), 0);
        assert_eq!(store.len(EntityType::SyncQueue), 1);
    }

    #[test]
    fn test_quota_evicts_oldest_quarter_then_writes() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = DurableStore {
            config: DurableStoreConfig {
                max_records_per_partition: 4,
                ..Default::default()
            },
            ..DurableStore::in_memory(clock.clone())
        };

        for key in ["a", "b", "c", "d"] {
            store.put(EntityType::News, key, json!({})).unwrap();
            clock.advance(Duration::from_secs(1));
        }

        let outcome = store.put(EntityType::News, "e", json!({})).unwrap();
        assert!(outcome.is_written());
        assert!(store.get(EntityType::News, "a").is_none());
        assert!(store.get(EntityType::News, "e").is_some());
        assert_eq!(store.len(EntityType::News), 4);
    }

    #[test]
    fn test_quota_on_non_expiring_partition_drops_write() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = DurableStore {
            config: DurableStoreConfig {
                max_records_per_partition: 1,
                ..Default::default()
            },
            ..DurableStore::in_memory(clock)
        };

        store.put(EntityType::SyncQueue, "1", json!({})).unwrap();
        let outcome = store.put(EntityType::SyncQueue, "2", json!({})).unwrap();
        assert_eq!(outcome, WriteOutcome::Dropped);
        assert_eq!(store.len(EntityType::SyncQueue), 1);
    }

    #[test]
    fn test_indexed_since() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = DurableStore::in_memory(clock);

        store
            .put(EntityType::News, "n1", json!({"publishedAt": "2024-03-01T10:00:00Z"}))
            .unwrap();
        store
            .put(EntityType::News, "n2", json!({"publishedAt": "2024-03-02T10:00:00Z"}))
            .unwrap();
        store.put(EntityType::News, "n3", json!({})).unwrap();

        let since = DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let hits = store.indexed_since(EntityType::News, since);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "n2");
    }
}
