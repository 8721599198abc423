//! Network status monitor.
//!
//! Samples connectivity with a [`ConnectivityProbe`] on a fixed interval and
//! publishes transitions on a broadcast channel. Each transition also raises
//! a user notification.

use crate::error::{SyncError, SyncResult};
use cmdty_core::{BoxFuture, Connectivity, Notifier};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One connectivity sample.
pub trait ConnectivityProbe: Send + Sync {
    fn probe(&self) -> BoxFuture<'_, bool>;
}

/// HTTP HEAD against a fixed URL. Any response counts as online.
pub struct ReqwestProbe {
    client: reqwest::Client,
    url: String,
}

impl ReqwestProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Probe(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl ConnectivityProbe for ReqwestProbe {
    fn probe(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            match self.client.head(&self.url).send().await {
                Ok(resp) => {
                    debug!(url = %self.url, status = resp.status().as_u16(), "Connectivity probe answered");
                    true
                }
                Err(e) => {
                    debug!(url = %self.url, error = %e, "Connectivity probe failed");
                    false
                }
            }
        })
    }
}

/// Online/offline transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkEvent {
    Online { was_offline: bool },
    Offline,
}

/// Receiving end of the transition channel. Dropping it unsubscribes.
pub type NetworkSubscription = broadcast::Receiver<NetworkEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
    pub online: bool,
    /// Set while offline, cleared once the return to online is published.
    pub was_offline: bool,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self {
            online: true,
            was_offline: false,
        }
    }
}

pub struct NetworkMonitor {
    status: RwLock<NetworkStatus>,
    events: broadcast::Sender<NetworkEvent>,
    notifier: Notifier,
    probe: Arc<dyn ConnectivityProbe>,
    interval: Duration,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    /// Starts optimistic (online) until the first probe says otherwise.
    pub fn new(probe: Arc<dyn ConnectivityProbe>, notifier: Notifier, interval: Duration) -> Self {
        let (events, _rx) = broadcast::channel(16);
        Self {
            status: RwLock::new(NetworkStatus::default()),
            events,
            notifier,
            probe,
            interval,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> NetworkSubscription {
        self.events.subscribe()
    }

    pub fn status(&self) -> NetworkStatus {
        *self.status.read()
    }

    /// Apply an observation. Returns the published event on a transition.
    pub fn set_online(&self, online: bool) -> Option<NetworkEvent> {
        let event = {
            let mut status = self.status.write();
            if status.online == online {
                return None;
            }
            if online {
                let was_offline = status.was_offline;
                *status = NetworkStatus {
                    online: true,
                    was_offline: false,
                };
                NetworkEvent::Online { was_offline }
            } else {
                *status = NetworkStatus {
                    online: false,
                    was_offline: true,
                };
                NetworkEvent::Offline
            }
        };

        match event {
            NetworkEvent::Online { .. } => {
                info!("Network back online");
                self.notifier.info(
                    "Back online",
                    "Connection restored. Pending changes are syncing.",
                );
            }
            NetworkEvent::Offline => {
                warn!("Network offline");
                self.notifier.warning(
                    "You are offline",
                    "Showing cached data. Changes will sync when the connection returns.",
                );
            }
        }

        if self.events.send(event).is_err() {
            debug!("No network event subscribers");
        }
        Some(event)
    }

    /// Probe once and apply the result.
    pub async fn check(&self) -> bool {
        let online = self.probe.probe().await;
        self.set_online(online);
        online
    }

    /// Start the probe loop. The first probe runs immediately.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            debug!("Network monitor already started");
            return;
        }

        let monitor = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = monitor.shutdown.cancelled() => {
                        debug!("Network monitor stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        monitor.check().await;
                    }
                }
            }
        }));
        info!(interval_ms = self.interval.as_millis() as u64, "Network monitor started");
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Network monitor task failed");
            }
        }
    }
}

impl Connectivity for NetworkMonitor {
    fn is_online(&self) -> bool {
        self.status.read().online
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmdty_core::NotificationLevel;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FlagProbe {
        online: AtomicBool,
        probes: AtomicUsize,
    }

    impl FlagProbe {
        fn new(online: bool) -> Arc<Self> {
            Arc::new(Self {
                online: AtomicBool::new(online),
                probes: AtomicUsize::new(0),
            })
        }
    }

    impl ConnectivityProbe for FlagProbe {
        fn probe(&self) -> BoxFuture<'_, bool> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let online = self.online.load(Ordering::SeqCst);
            Box::pin(async move { online })
        }
    }

    #[tokio::test]
    async fn test_transitions_publish_events() {
        let notifier = Notifier::default();
        let mut notes = notifier.subscribe();
        let monitor = NetworkMonitor::new(FlagProbe::new(true), notifier, Duration::from_secs(30));
        let mut events = monitor.subscribe();

        assert_eq!(monitor.set_online(true), None);
        assert_eq!(monitor.set_online(false), Some(NetworkEvent::Offline));
        assert!(!monitor.is_online());
        assert!(!monitor.allow_non_critical());
        assert!(monitor.status().was_offline);

        assert_eq!(
            monitor.set_online(true),
            Some(NetworkEvent::Online { was_offline: true })
        );
        assert!(!monitor.status().was_offline);

        assert_eq!(events.recv().await.unwrap(), NetworkEvent::Offline);
        assert_eq!(
            events.recv().await.unwrap(),
            NetworkEvent::Online { was_offline: true }
        );
        assert_eq!(notes.recv().await.unwrap().level, NotificationLevel::Warning);
        assert_eq!(notes.recv().await.unwrap().level, NotificationLevel::Info);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_loop() {
        let probe = FlagProbe::new(false);
        let monitor = Arc::new(NetworkMonitor::new(
            Arc::clone(&probe) as Arc<dyn ConnectivityProbe>,
            Notifier::default(),
            Duration::from_secs(10),
        ));
        let mut events = monitor.subscribe();

        monitor.start();
        assert_eq!(events.recv().await.unwrap(), NetworkEvent::Offline);

        probe.online.store(true, Ordering::SeqCst);
        assert_eq!(
            events.recv().await.unwrap(),
            NetworkEvent::Online { was_offline: true }
        );
        assert!(probe.probes.load(Ordering::SeqCst) >= 2);

        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_released() {
        let monitor = NetworkMonitor::new(FlagProbe::new(true), Notifier::default(), Duration::from_secs(30));
        let events = monitor.subscribe();
        assert_eq!(monitor.events.receiver_count(), 1);
        drop(events);
        assert_eq!(monitor.events.receiver_count(), 0);
        monitor.set_online(false);
    }
}
