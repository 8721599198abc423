//! Prometheus metrics and structured logging.
//!
//! Provides:
//! - Prometheus metrics for the stream connection, query cache, asset cache,
//!   sync queue and network status
//! - Structured logging with tracing (JSON in production)

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
