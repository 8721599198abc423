//! Rate limiting for outbound control messages.
//!
//! Sliding window over send timestamps. Callers wait for capacity instead
//! of having messages dropped.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Sliding-window rate limiter.
pub struct RateLimiter {
    /// Maximum messages per window.
    max_messages: u32,
    window: Duration,
    /// Timestamps of recent sends.
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_messages: u32, window: Duration) -> Self {
        Self {
            max_messages: max_messages.max(1),
            window,
            timestamps: Mutex::new(VecDeque::with_capacity(max_messages as usize)),
        }
    }

    /// Limiter allowing `max_messages` per minute.
    pub fn per_minute(max_messages: u32) -> Self {
        Self::new(max_messages, Duration::from_secs(60))
    }

    pub fn can_send(&self) -> bool {
        self.cleanup_old_timestamps();
        self.timestamps.lock().len() < self.max_messages as usize
    }

    pub fn record_send(&self) {
        self.cleanup_old_timestamps();

        let mut timestamps = self.timestamps.lock();
        timestamps.push_back(Instant::now());

        if timestamps.len() >= self.max_messages as usize {
            warn!(
                count = timestamps.len(),
                max = self.max_messages,
                "Approaching rate limit"
            );
        }
    }

    pub fn current_count(&self) -> u32 {
        self.cleanup_old_timestamps();
        self.timestamps.lock().len() as u32
    }

    pub fn remaining_capacity(&self) -> u32 {
        self.max_messages.saturating_sub(self.current_count())
    }

    /// Wait until a message may be sent, then reserve the slot.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                self.cleanup_old_timestamps();
                let timestamps = self.timestamps.lock();
                if timestamps.len() < self.max_messages as usize {
                    None
                } else {
                    timestamps
                        .front()
                        .map(|oldest| (*oldest + self.window).saturating_duration_since(Instant::now()))
                }
            };

            match wait {
                None => break,
                Some(delay) => {
                    debug!(delay_ms = delay.as_millis() as u64, "Waiting for rate limit capacity");
                    tokio::time::sleep(delay.max(Duration::from_millis(1))).await;
                }
            }
        }
        self.record_send();
    }

    fn cleanup_old_timestamps(&self) {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock();
        while timestamps
            .front()
            .is_some_and(|&t| now.duration_since(t) >= self.window)
        {
            timestamps.pop_front();
        }
    }

    pub fn reset(&self) {
        self.timestamps.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_basic() {
        let limiter = RateLimiter::per_minute(10);

        assert!(limiter.can_send());
        assert_eq!(limiter.current_count(), 0);

        for _ in 0..5 {
            limiter.record_send();
        }

        assert!(limiter.can_send());
        assert_eq!(limiter.current_count(), 5);
        assert_eq!(limiter.remaining_capacity(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_at_limit() {
        let limiter = RateLimiter::per_minute(5);

        for _ in 0..5 {
            limiter.record_send();
        }

        assert!(!limiter.can_send());
        assert_eq!(limiter.remaining_capacity(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_window() {
        let limiter = RateLimiter::per_minute(2);
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(limiter.current_count(), 1);
    }
}
