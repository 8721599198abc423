//! Real-time price stream client.
//!
//! Provides:
//! - Pure reconnect state machine with capped exponential backoff
//! - Subscription buffering and restoration after reconnect
//! - Application-level heartbeat with pong liveness tracking
//! - Sliding-window rate limiting of outbound control messages
//! - Last-known price table fed by `price_update` messages

pub mod client;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod price_table;
pub mod rate_limiter;
pub mod state;
pub mod subscription;

pub use client::{StreamClient, StreamConfig, StreamHandle, StreamStatus};
pub use error::{StreamError, StreamResult};
pub use message::{ClientMessage, PriceUpdateData, ServerMessage};
pub use price_table::PriceTable;
pub use state::{ConnectionState, ReconnectPolicy, StreamCommand, StreamEvent, StreamMachine};
pub use subscription::SubscriptionSet;

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any WebSocket connections are made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
