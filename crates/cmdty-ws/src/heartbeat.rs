//! Heartbeat liveness for the price stream.
//!
//! Tracks ping/pong timing and message activity. A pong only proves the
//! socket is alive; it has no effect on reconnect backoff.

use parking_lot::RwLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Heartbeat monitor for one connection.
pub struct HeartbeatMonitor {
    /// How long to wait for a pong before declaring the socket dead.
    timeout: Duration,
    state: RwLock<HeartbeatState>,
}

#[derive(Debug, Clone, Copy)]
struct HeartbeatState {
    last_ping: Option<Instant>,
    last_pong: Option<Instant>,
    last_message: Instant,
    waiting_for_pong: bool,
}

impl HeartbeatMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: RwLock::new(HeartbeatState {
                last_ping: None,
                last_pong: None,
                last_message: Instant::now(),
                waiting_for_pong: false,
            }),
        }
    }

    /// Reset heartbeat state (called on connection).
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.last_ping = None;
        state.last_pong = None;
        state.last_message = Instant::now();
        state.waiting_for_pong = false;
    }

    pub fn record_ping(&self) {
        let mut state = self.state.write();
        if !state.waiting_for_pong {
            state.last_ping = Some(Instant::now());
            state.waiting_for_pong = true;
        }
    }

    pub fn record_pong(&self) {
        let now = Instant::now();
        let mut state = self.state.write();
        state.last_pong = Some(now);
        state.last_message = now;
        state.waiting_for_pong = false;

        if let Some(ping_time) = state.last_ping {
            debug!(rtt_ms = (now - ping_time).as_millis() as u64, "Received pong");
        }
    }

    /// Record that any message was received.
    pub fn record_message(&self) {
        self.state.write().last_message = Instant::now();
    }

    /// Whether the outstanding ping has gone unanswered for longer than the timeout.
    pub fn is_timed_out(&self) -> bool {
        let state = self.state.read();
        match (state.waiting_for_pong, state.last_ping) {
            (true, Some(ping_time)) => ping_time.elapsed() > self.timeout,
            _ => false,
        }
    }

    pub fn time_since_last_message(&self) -> Duration {
        self.state.read().last_message.elapsed()
    }

    pub fn stats(&self) -> HeartbeatStats {
        let state = *self.state.read();
        HeartbeatStats {
            waiting_for_pong: state.waiting_for_pong,
            since_last_pong: state.last_pong.map(|t| t.elapsed()),
            since_last_message: state.last_message.elapsed(),
        }
    }
}

/// Heartbeat statistics.
#[derive(Debug, Clone)]
pub struct HeartbeatStats {
    pub waiting_for_pong: bool,
    pub since_last_pong: Option<Duration>,
    pub since_last_message: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ping_pong_cycle() {
        let hb = HeartbeatMonitor::new(Duration::from_secs(10));
        assert!(!hb.is_timed_out());

        hb.record_ping();
        assert!(hb.stats().waiting_for_pong);

        tokio::time::advance(Duration::from_secs(5)).await;
        hb.record_pong();
        assert!(!hb.stats().waiting_for_pong);
        assert!(!hb.is_timed_out());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_pong() {
        let hb = HeartbeatMonitor::new(Duration::from_secs(10));
        hb.record_ping();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(hb.is_timed_out());

        hb.reset();
        assert!(!hb.is_timed_out());
    }
}
