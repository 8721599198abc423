//! Persisted offline mutation queue.
//!
//! Tasks are written to the `syncQueue` partition before `enqueue` returns
//! and replayed in `seq` order. A failed replay stops the drain and leaves the
//! task at the head, so later mutations never overtake an earlier one.

use crate::error::{SyncError, SyncResult};
use crate::monitor::{NetworkEvent, NetworkSubscription};
use cmdty_core::{BoxFuture, Clock, Connectivity, EntityType, Notifier, SyncTask};
use cmdty_persistence::{DurableStore, WriteOutcome};
use cmdty_telemetry::Metrics;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sends one task upstream. The task id is the idempotency key.
pub trait SyncTransport: Send + Sync {
    fn send<'a>(&'a self, task: &'a SyncTask) -> BoxFuture<'a, SyncResult<()>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncQueueConfig {
    /// Failed attempts after which the user is told a change is stuck.
    pub notify_after_attempts: u32,
}

impl Default for SyncQueueConfig {
    fn default() -> Self {
        Self {
            notify_after_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    pub remaining: usize,
    /// Task that failed and stopped the drain.
    pub stalled_on: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained(DrainReport),
    AlreadyRunning,
    Offline,
}

/// Clears the in-progress flag when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncQueue {
    store: Arc<DurableStore>,
    transport: Arc<dyn SyncTransport>,
    connectivity: Arc<dyn Connectivity>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    config: SyncQueueConfig,
    tasks: Mutex<VecDeque<SyncTask>>,
    next_seq: AtomicU64,
    draining: AtomicBool,
}

impl SyncQueue {
    /// Build the queue and restore pending tasks from the store.
    pub fn new(
        store: Arc<DurableStore>,
        transport: Arc<dyn SyncTransport>,
        connectivity: Arc<dyn Connectivity>,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
        config: SyncQueueConfig,
    ) -> Self {
        let queue = Self {
            store,
            transport,
            connectivity,
            notifier,
            clock,
            config,
            tasks: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(1),
            draining: AtomicBool::new(false),
        };
        queue.load();
        queue
    }

    /// Reload pending tasks from the store, ordered by `seq`.
    ///
    /// Returns the number of tasks restored. Unreadable records are skipped.
    pub fn load(&self) -> usize {
        let mut restored: Vec<SyncTask> = self
            .store
            .list(EntityType::SyncQueue)
            .into_iter()
            .filter_map(|record| match serde_json::from_value::<SyncTask>(record.payload) {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!(key = %record.key, error = %e, "Skipping unreadable sync task");
                    None
                }
            })
            .collect();
        restored.sort_by_key(|t| t.seq);

        let next = restored.last().map(|t| t.seq + 1).unwrap_or(1);
        self.next_seq.fetch_max(next, Ordering::AcqRel);

        let count = restored.len();
        *self.tasks.lock() = restored.into();
        if count > 0 {
            info!(count, "Restored pending sync tasks");
        }
        count
    }

    /// Persist a mutation for later replay.
    pub fn enqueue(
        &self,
        action_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> SyncResult<SyncTask> {
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        let task = SyncTask::new(seq, action_type, payload, self.clock.now());

        let value = serde_json::to_value(&task)?;
        match self.store.put(EntityType::SyncQueue, &task.store_key(), value)? {
            WriteOutcome::Written(_) => {}
            WriteOutcome::Dropped => {
                return Err(SyncError::NotPersisted {
                    action_type: task.action_type,
                })
            }
        }

        self.tasks.lock().push_back(task.clone());
        debug!(id = %task.id, seq, action = %task.action_type, "Sync task queued");
        Ok(task)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of pending tasks in replay order.
    pub fn pending(&self) -> Vec<SyncTask> {
        self.tasks.lock().iter().cloned().collect()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Replay pending tasks in order until the queue is empty or one fails.
    pub async fn drain(&self) -> DrainOutcome {
        if !self.connectivity.is_online() {
            debug!("Skipping drain while offline");
            return DrainOutcome::Offline;
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Drain already in progress");
            return DrainOutcome::AlreadyRunning;
        }
        let _guard = DrainGuard(&self.draining);

        let mut sent = 0;
        while let Some(task) = self.head() {
            match self.transport.send(&task).await {
                Ok(()) => {
                    self.complete(&task);
                    Metrics::sync_replayed();
                    sent += 1;
                }
                Err(e) => {
                    let attempts = self.record_failure(&task);
                    Metrics::sync_failed(&task.action_type);
                    warn!(id = %task.id, action = %task.action_type, attempts, error = %e, "Sync task replay failed");
                    if attempts == self.config.notify_after_attempts {
                        self.notifier.warning(
                            "Sync delayed",
                            &format!(
                                "A pending change ({}) could not be saved after {attempts} attempts. It will be retried.",
                                task.action_type
                            ),
                        );
                    }
                    let report = DrainReport {
                        sent,
                        remaining: self.len(),
                        stalled_on: Some(task.id),
                    };
                    return DrainOutcome::Drained(report);
                }
            }
        }

        if sent > 0 {
            info!(sent, "Sync queue drained");
        }
        DrainOutcome::Drained(DrainReport {
            sent,
            remaining: self.len(),
            stalled_on: None,
        })
    }

    fn head(&self) -> Option<SyncTask> {
        self.tasks.lock().front().cloned()
    }

    fn complete(&self, task: &SyncTask) {
        if let Err(e) = self.store.delete(EntityType::SyncQueue, &task.store_key()) {
            warn!(id = %task.id, error = %e, "Failed to delete replayed sync task");
        }
        let mut tasks = self.tasks.lock();
        if tasks.front().map(|t| t.id) == Some(task.id) {
            tasks.pop_front();
        }
    }

    /// Bump the head task's attempt count and persist it.
    fn record_failure(&self, task: &SyncTask) -> u32 {
        let updated = {
            let mut tasks = self.tasks.lock();
            match tasks.front_mut() {
                Some(head) if head.id == task.id => {
                    head.attempts += 1;
                    head.clone()
                }
                _ => return task.attempts + 1,
            }
        };

        let persisted = serde_json::to_value(&updated)
            .map_err(SyncError::from)
            .and_then(|value| {
                self.store
                    .put(EntityType::SyncQueue, &updated.store_key(), value)
                    .map_err(SyncError::from)
            });
        if let Err(e) = persisted {
            warn!(id = %updated.id, error = %e, "Failed to persist sync task attempts");
        }
        updated.attempts
    }

    /// Drain whenever the network comes back.
    pub fn spawn_reconnect_drain(
        self: Arc<Self>,
        mut events: NetworkSubscription,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("Reconnect drain stopped");
                        return;
                    }
                    event = events.recv() => match event {
                        Ok(NetworkEvent::Online { was_offline }) => {
                            let outcome = self.drain().await;
                            debug!(was_offline, ?outcome, "Reconnect drain finished");
                        }
                        Ok(NetworkEvent::Offline) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Reconnect drain lagged behind network events");
                        }
                        Err(RecvError::Closed) => return,
                    }
                }
            }
        })
    }
}
