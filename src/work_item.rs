//! The contract between the bootstrap and the servers it hosts.
//!
//! A work item is one hosted network-service instance. The bootstrap never
//! reaches into an item's internals; it only drives the lifecycle calls
//! declared on [`WorkItem`] and observes [`WorkItemState`], fault events
//! and performance samples.

use crate::config::{GlobalSettings, ServerDeclaration};
use crate::error::Result;
use crate::factory::ProviderFactory;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Lifecycle state of a hosted work item.
///
/// Transitions are one-directional except `Running ⇄ NotRunning`, which may
/// repeat across the item's life. `Failed` is terminal; a failed item is
/// never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkItemState {
    /// Instance created, setup not yet run
    #[default]
    Created,
    /// Setup succeeded
    Initialized,
    /// Start succeeded
    Running,
    /// Stopped after running
    NotRunning,
    /// Setup or start failed
    Failed,
}

impl std::fmt::Display for WorkItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkItemState::Created => write!(f, "created"),
            WorkItemState::Initialized => write!(f, "initialized"),
            WorkItemState::Running => write!(f, "running"),
            WorkItemState::NotRunning => write!(f, "notrunning"),
            WorkItemState::Failed => write!(f, "failed"),
        }
    }
}

/// A fault raised inside a running work item, outside any lifecycle call.
#[derive(Debug, Clone)]
pub struct FaultEvent {
    /// Name of the server the fault was raised in
    pub server: String,
    /// Human-readable description of the fault
    pub message: String,
}

/// One performance sample taken from a running work item.
#[derive(Debug, Clone, Serialize)]
pub struct WorkItemSample {
    /// Name of the sampled server
    pub server: String,
    /// State at sampling time
    pub state: WorkItemState,
    /// Current connection count
    pub connection_count: usize,
    /// Total bytes received since start
    pub total_received_bytes: u64,
    /// Total bytes sent since start
    pub total_sent_bytes: u64,
    /// When the sample was taken
    pub collected_at: DateTime<Utc>,
}

/// Handle to the bootstrap passed to work items during setup.
#[derive(Debug, Clone)]
pub struct BootstrapHandle {
    settings: Arc<GlobalSettings>,
}

impl BootstrapHandle {
    pub(crate) fn new(settings: Arc<GlobalSettings>) -> Self {
        Self { settings }
    }

    /// The process-wide settings the bootstrap was initialized with.
    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }
}

/// A hosted network-service instance.
///
/// Implementations own their internal networking resources and concurrency;
/// lifecycle calls are expected to return promptly. An item reports its own
/// state and may expose a fault channel the bootstrap subscribes to for
/// crash isolation.
#[async_trait]
pub trait WorkItem: Send + Sync {
    /// Unique name of this server.
    fn name(&self) -> &str;

    /// Configure the item with its frozen declaration and provider
    /// factories. Called exactly once, before `start`.
    async fn setup(
        &self,
        bootstrap: BootstrapHandle,
        config: ServerDeclaration,
        providers: &[ProviderFactory],
    ) -> Result<()>;

    /// Start serving. A failure leaves the item in `Failed`.
    async fn start(&self) -> Result<()>;

    /// Stop serving. Best effort; never fails from the bootstrap's view.
    async fn stop(&self);

    /// Current lifecycle state.
    fn state(&self) -> WorkItemState;

    /// The declaration this item was set up with, once setup has run.
    fn config(&self) -> Option<ServerDeclaration> {
        None
    }

    /// Channel of faults raised by the item's internal machinery. The
    /// bootstrap subscribes once per item and logs every event with the
    /// item's name.
    fn fault_hook(&self) -> Option<broadcast::Receiver<FaultEvent>> {
        None
    }

    /// Cheap counters for the performance monitor.
    fn sample(&self) -> Option<WorkItemSample> {
        None
    }
}
