//! Query cache entries.

use crate::key::QueryKey;
use crate::policy::CachePolicy;
use serde_json::Value;

/// Entry status as observed at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    Fresh,
    Stale,
    /// First fetch has not completed yet.
    Pending,
    /// Last fetch failed. Earlier data, if any, is kept.
    Error,
}

/// One cached query result.
#[derive(Debug, Clone)]
pub struct QueryEntry {
    pub key: QueryKey,
    pub data: Option<Value>,
    pub fetched_at: Option<i64>,
    pub stale_at: i64,
    pub gc_at: i64,
    pub error: Option<String>,
    pub error_at: Option<i64>,
    /// Approximate size (serialized JSON bytes plus key).
    pub size_bytes: usize,
    pub policy: CachePolicy,
}

impl QueryEntry {
    /// Placeholder inserted when the first fetch starts.
    pub fn pending(key: QueryKey, policy: CachePolicy, now_ms: i64) -> Self {
        let size_bytes = key.id().len();
        Self {
            key,
            data: None,
            fetched_at: None,
            stale_at: now_ms,
            gc_at: now_ms + policy.gc_time().as_millis() as i64,
            error: None,
            error_at: None,
            size_bytes,
            policy,
        }
    }

    /// Status at `now_ms`.
    pub fn status(&self, now_ms: i64) -> QueryStatus {
        if self.error.is_some() {
            QueryStatus::Error
        } else if self.data.is_none() {
            QueryStatus::Pending
        } else if now_ms >= self.stale_at {
            QueryStatus::Stale
        } else {
            QueryStatus::Fresh
        }
    }

    pub fn is_fresh(&self, now_ms: i64) -> bool {
        self.status(now_ms) == QueryStatus::Fresh
    }

    /// Record a successful fetch.
    pub fn complete(&mut self, data: Value, policy: CachePolicy, now_ms: i64) {
        self.size_bytes = self.key.id().len() + serde_json::to_string(&data).map(|s| s.len()).unwrap_or(0);
        self.data = Some(data);
        self.fetched_at = Some(now_ms);
        self.stale_at = now_ms + policy.stale_time().as_millis() as i64;
        self.gc_at = now_ms + policy.gc_time().as_millis() as i64;
        self.error = None;
        self.error_at = None;
        self.policy = policy;
    }

    /// Record a failed fetch. Existing data is kept.
    pub fn fail(&mut self, error: String, now_ms: i64) {
        self.error = Some(error);
        self.error_at = Some(now_ms);
        self.gc_at = self
            .gc_at
            .max(now_ms + self.policy.gc_time().as_millis() as i64);
    }

    /// Whether a periodic refetch is due.
    pub fn refetch_due(&self, now_ms: i64) -> bool {
        match (self.policy.refetch_interval(), self.fetched_at) {
            (Some(interval), Some(fetched_at)) => now_ms - fetched_at >= interval.as_millis() as i64,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn policy() -> CachePolicy {
        CachePolicy::new(Duration::from_secs(60), Duration::from_secs(300))
    }

    #[test]
    fn test_status_transitions() {
        let mut entry = QueryEntry::pending(QueryKey::prices(), policy(), 0);
        assert_eq!(entry.status(0), QueryStatus::Pending);

        entry.complete(json!([1, 2, 3]), policy(), 1_000);
        assert_eq!(entry.status(30_000), QueryStatus::Fresh);
        assert_eq!(entry.status(61_000), QueryStatus::Stale);
        assert!(entry.stale_at <= entry.gc_at);

        entry.fail("boom".into(), 62_000);
        assert_eq!(entry.status(62_000), QueryStatus::Error);
        assert_eq!(entry.data, Some(json!([1, 2, 3])));
    }

    #[test]
    fn test_size_tracks_payload() {
        let mut entry = QueryEntry::pending(QueryKey::prices(), policy(), 0);
        let small = entry.size_bytes;
        entry.complete(json!({"payload": "x".repeat(100)}), policy(), 0);
        assert!(entry.size_bytes > small + 100);
    }

    #[test]
    fn test_refetch_due() {
        let with_interval = policy().with_refetch_interval(Duration::from_secs(30));
        let mut entry = QueryEntry::pending(QueryKey::prices(), with_interval, 0);
        assert!(!entry.refetch_due(100_000));

        entry.complete(json!(1), with_interval, 0);
        assert!(!entry.refetch_due(29_999));
        assert!(entry.refetch_due(30_000));
    }
}
