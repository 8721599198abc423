//! Data source behind the query cache.

use crate::error::QueryResult;
use crate::key::QueryKey;
use cmdty_core::BoxFuture;

/// Resolves any query key to fresh data.
///
/// The application wires this to the cache worker so every read passes
/// through the HTTP caching strategies.
pub trait QuerySource: Send + Sync {
    fn fetch(&self, key: &QueryKey) -> BoxFuture<'_, QueryResult<serde_json::Value>>;
}
