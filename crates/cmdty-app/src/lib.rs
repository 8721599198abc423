//! Commodity dashboard client data layer.
//!
//! Wires every component together:
//! - Price stream client with a last-known price table
//! - Query cache with predictive prefetch, reading through the cache worker
//! - Offline cache worker (HTTP caching strategies and fallbacks)
//! - Durable entity store and offline mutation queue
//! - Network monitor driving stream gating and queue replay

pub mod app;
pub mod bridge;
pub mod config;
pub mod error;

pub use app::Application;
pub use bridge::{WorkerQuerySource, WorkerSyncTransport};
pub use config::AppConfig;
pub use error::{AppError, AppResult};
