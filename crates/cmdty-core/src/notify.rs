//! User-facing notifications.
//!
//! Components raise notifications through a `Notifier`; the UI layer
//! subscribes and renders them as toasts. Dropping a receiver unsubscribes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// A non-blocking message for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserNotification {
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl UserNotification {
    pub fn new(level: NotificationLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Broadcast notifier. Cloning shares the same channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<UserNotification>,
}

impl Notifier {
    /// Create a notifier buffering up to `capacity` undelivered notifications.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<UserNotification> {
        self.tx.subscribe()
    }

    /// Raise a notification. Sending with no subscribers is not an error.
    pub fn notify(&self, notification: UserNotification) {
        if self.tx.send(notification).is_err() {
            trace!("No notification subscribers");
        }
    }

    pub fn info(&self, title: &str, message: &str) {
        self.notify(UserNotification::new(NotificationLevel::Info, title, message));
    }

    pub fn warning(&self, title: &str, message: &str) {
        self.notify(UserNotification::new(NotificationLevel::Warning, title, message));
    }

    pub fn error(&self, title: &str, message: &str) {
        self.notify(UserNotification::new(NotificationLevel::Error, title, message));
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(64)
    }
}
