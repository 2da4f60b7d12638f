//! Timer-driven performance sampling of hosted work items.
//!
//! The monitor is bound to a snapshot of the work-item collection at
//! construction time; it cannot add a target afterwards. When the
//! collection changes, the bootstrap tears the monitor down and builds a
//! new one.

use crate::work_item::{WorkItem, WorkItemSample, WorkItemState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

/// Aggregated result of one sampling pass.
#[derive(Debug, Clone, Serialize)]
pub struct PerfSnapshot {
    /// When the pass ran
    pub collected_at: DateTime<Utc>,
    /// One sample per work item that was still running
    pub samples: Vec<WorkItemSample>,
    /// Sample from the server manager, if one is hosted
    pub manager_sample: Option<WorkItemSample>,
}

/// Samples every running work item on a fixed interval.
pub struct PerformanceMonitor {
    interval: Duration,
    servers: Vec<Arc<dyn WorkItem>>,
    manager: Option<Arc<dyn WorkItem>>,
    latest: Arc<RwLock<Option<PerfSnapshot>>>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl PerformanceMonitor {
    /// Bind a monitor to the given collection and optional server manager.
    pub fn new(
        interval: Duration,
        servers: Vec<Arc<dyn WorkItem>>,
        manager: Option<Arc<dyn WorkItem>>,
    ) -> Self {
        Self {
            interval,
            servers,
            manager,
            latest: Arc::new(RwLock::new(None)),
            shutdown: None,
            task: None,
        }
    }

    /// Start the sampling loop. Idempotent.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        let servers = self.servers.clone();
        let manager = self.manager.clone();
        let latest = Arc::clone(&self.latest);
        let interval = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the first tick completes immediately; consume it so the first
            // sample lands one interval after start
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = collect(&servers, manager.as_deref());
                        debug!(
                            servers = snapshot.samples.len(),
                            "Collected performance snapshot"
                        );
                        *latest.write().await = Some(snapshot);
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        self.shutdown = Some(tx);
        self.task = Some(task);
    }

    /// Stop the sampling loop. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        self.task.take();
    }

    /// Whether the sampling loop is running.
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// The most recent snapshot, if a pass has completed.
    pub async fn latest(&self) -> Option<PerfSnapshot> {
        self.latest.read().await.clone()
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        // stop the timer before the collection reference is released so a
        // pending pass never fires against a torn-down collection
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// One sampling pass over a collection snapshot. An item that left
/// `Running` since it was enumerated is skipped, never an error.
fn collect(servers: &[Arc<dyn WorkItem>], manager: Option<&dyn WorkItem>) -> PerfSnapshot {
    let mut samples = Vec::new();
    for server in servers {
        if server.state() != WorkItemState::Running {
            continue;
        }
        if let Some(sample) = server.sample() {
            samples.push(sample);
        }
    }

    let manager_sample = manager.and_then(|m| m.sample());

    PerfSnapshot {
        collected_at: Utc::now(),
        samples,
        manager_sample,
    }
}
