//! In-memory query cache for dashboard reads.
//!
//! Provides:
//! - Composite keys over (resource, parameters)
//! - Profile-dependent stale/gc times (desktop favours freshness, mobile conserves data)
//! - Stale-while-revalidate reads with one in-flight fetch per key
//! - Periodic sweep bounded by a byte budget, plus hit-rate metrics
//! - Staggered predictive prefetch, suppressed while offline

pub mod cache;
pub mod entry;
pub mod error;
pub mod key;
pub mod policy;
pub mod prefetch;
pub mod source;

pub use cache::{CacheMetrics, DataOrigin, QueryCache, QueryCacheConfig, QueryOutcome, SweepReport};
pub use entry::{QueryEntry, QueryStatus};
pub use error::{QueryError, QueryResult};
pub use key::{QueryKey, ResourceKind};
pub use policy::{CachePolicy, DeviceProfile};
pub use prefetch::{PrefetchConfig, Prefetcher};
pub use source::QuerySource;
