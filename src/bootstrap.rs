//! The bootstrap itself: owns the hosted work-item collection and drives
//! its lifecycle.
//!
//! Control calls (`initialize`, `start`, `stop`, `add_server`) take
//! `&mut self`, so a single control thread issuing them in order is the
//! expected usage and concurrent control calls cannot compile. Work items
//! run their own I/O on their own tasks; the bootstrap only awaits their
//! lifecycle calls.

use crate::config::{ConfigSource, ConfigWatcher, GlobalSettings, ServerDeclaration};
use crate::error::{Error, Result};
use crate::factory::{self, EndpointMap, FactoryRegistry, WorkItemFactoryInfo};
use crate::monitor::PerformanceMonitor;
use crate::work_item::{BootstrapHandle, WorkItem, WorkItemState};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How often a file-backed configuration is polled for external edits.
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Aggregate outcome of starting the whole collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartResult {
    /// Start was attempted before initialization
    Failed,
    /// Every work item started
    AllSucceeded,
    /// No work item started. Also returned for an initialized empty
    /// collection, where zero items started vacuously
    NoneSucceeded,
    /// Some but not all work items started
    PartialSuccess,
}

/// The process-level supervisor for hosted socket servers.
pub struct Bootstrap {
    config: ConfigSource,
    registry: FactoryRegistry,
    settings: Arc<GlobalSettings>,
    servers: Vec<Arc<dyn WorkItem>>,
    server_manager: Option<Arc<dyn WorkItem>>,
    monitor: Option<PerformanceMonitor>,
    watcher: Option<ConfigWatcher>,
    fault_tasks: Vec<JoinHandle<()>>,
    panic_hook_armed: Option<Arc<AtomicBool>>,
    initialized: bool,
}

impl Bootstrap {
    /// Create a bootstrap over a configuration source and a registry of
    /// server-type constructors. Nothing is instantiated until
    /// [`Bootstrap::initialize`] runs.
    pub fn new(config: ConfigSource, registry: FactoryRegistry) -> Self {
        let settings = Arc::new(config.settings.clone());
        Self {
            config,
            registry,
            settings,
            servers: Vec::new(),
            server_manager: None,
            monitor: None,
            watcher: None,
            fault_tasks: Vec::new(),
            panic_hook_armed: None,
            initialized: false,
        }
    }

    /// Resolve the configuration and set up every declared work item.
    ///
    /// All-or-nothing: a resolution failure or any instantiation/setup
    /// failure aborts the whole call, items created up to that point are
    /// discarded and the bootstrap stays uninitialized.
    pub async fn initialize(&mut self) -> Result<()> {
        self.initialize_inner(None).await
    }

    /// Like [`Bootstrap::initialize`], rewriting every declared bind
    /// endpoint from the replacement map before any work item is created.
    pub async fn initialize_with_endpoints(&mut self, endpoints: &EndpointMap) -> Result<()> {
        self.initialize_inner(Some(endpoints)).await
    }

    async fn initialize_inner(&mut self, endpoints: Option<&EndpointMap>) -> Result<()> {
        if self.initialized {
            error!("The bootstrap has been initialized already, you cannot initialize it again");
            return Err(Error::AlreadyInitialized);
        }

        if let Some(culture) = &self.settings.default_culture {
            info!(culture = %culture, "Applying default culture");
        }

        let factories = match factory::resolve(&self.config, &self.registry, endpoints) {
            Ok(factories) => factories,
            Err(e) => {
                error!(error = %e, "Failed to resolve work item factories");
                return Err(e);
            }
        };

        let mut servers: Vec<Arc<dyn WorkItem>> = Vec::with_capacity(factories.len());
        let mut server_manager = None;
        let mut fault_tasks = Vec::new();

        for info in &factories {
            let server = match self.setup_work_item(info, &mut fault_tasks).await {
                Ok(server) => server,
                Err(e) => {
                    error!(
                        server = %info.config.name,
                        error = %e,
                        "Failed to initialize server instance, discarding the whole set"
                    );
                    for task in fault_tasks {
                        task.abort();
                    }
                    return Err(e);
                }
            };

            if info.is_server_manager {
                server_manager = Some(Arc::clone(&server));
            }
            servers.push(server);
        }

        self.servers = servers;
        self.server_manager = server_manager;
        self.fault_tasks = fault_tasks;

        if !self.settings.disable_performance_data_collector {
            self.monitor = Some(PerformanceMonitor::new(
                self.settings.performance_data_collect_interval,
                self.servers.clone(),
                self.server_manager.clone(),
            ));
            debug!("The performance monitor has been initialized");
        }

        if !self.settings.disable_config_hot_reload {
            if let Some(path) = self.config.path() {
                self.watcher = Some(ConfigWatcher::spawn(path, CONFIG_POLL_INTERVAL));
                debug!(path = %path.display(), "The configuration watcher has been started");
            }
        }

        self.panic_hook_armed = Some(install_panic_hook());

        self.initialized = true;
        debug!(servers = self.servers.len(), "The bootstrap has been initialized");
        Ok(())
    }

    /// Instantiate one work item, subscribe its fault hook and run setup.
    async fn setup_work_item(
        &self,
        info: &WorkItemFactoryInfo,
        fault_tasks: &mut Vec<JoinHandle<()>>,
    ) -> Result<Arc<dyn WorkItem>> {
        let server = self.registry.construct(info)?;
        debug!(server = %info.config.name, "The server instance has been created");

        if let Some(mut faults) = server.fault_hook() {
            let name = info.config.name.clone();
            fault_tasks.push(tokio::spawn(async move {
                loop {
                    match faults.recv().await {
                        Ok(fault) => {
                            error!(
                                server = %name,
                                error = %fault.message,
                                "The server threw an exception"
                            );
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        let handle = BootstrapHandle::new(Arc::clone(&self.settings));
        server
            .setup(handle, info.config.clone(), &info.provider_factories)
            .await
            .map_err(|e| {
                error!(server = %info.config.name, error = %e, "Failed to setup server instance");
                Error::SetupFailed(info.config.name.clone())
            })?;

        debug!(server = %server.name(), "The server instance has been initialized");
        Ok(server)
    }

    /// Start every work item in collection order, then the performance
    /// monitor. Per-item failures are logged and isolated; the aggregate
    /// result distinguishes full, partial and zero success.
    pub async fn start(&mut self) -> StartResult {
        if !self.initialized {
            error!("You cannot invoke start before initializing the bootstrap");
            return StartResult::Failed;
        }

        let mut succeeded = 0;
        for server in &self.servers {
            match server.start().await {
                Ok(()) => {
                    debug!(server = %server.name(), "The server instance has been started");
                    succeeded += 1;
                }
                Err(e) => {
                    error!(
                        server = %server.name(),
                        error = %e,
                        "The server instance has failed to be started"
                    );
                }
            }
        }

        let result = aggregate_start_result(succeeded, self.servers.len());

        if let Some(monitor) = self.monitor.as_mut() {
            monitor.start();
            debug!("The performance monitor has been started");
        }

        result
    }

    /// Stop every running work item, then the performance monitor.
    ///
    /// When any item declared a non-zero startup order the whole collection
    /// is stopped in reverse declaration order, so dependents go down before
    /// the services they depend on. Items not currently running are skipped.
    /// Best effort: the loop always runs to completion.
    pub async fn stop(&mut self) {
        let snapshot: Vec<StopCandidate> = self
            .servers
            .iter()
            .map(|server| StopCandidate {
                startup_order: server.config().map_or(0, |c| c.startup_order),
                state: server.state(),
            })
            .collect();

        for index in shutdown_sequence(&snapshot) {
            let server = &self.servers[index];
            server.stop().await;
            debug!(server = %server.name(), "The server instance has been stopped");
        }

        if let Some(monitor) = self.monitor.as_mut() {
            monitor.stop();
            debug!("The performance monitor has been stopped");
        }
    }

    /// Add a new work item at runtime.
    ///
    /// The declaration is routed through the same resolution and setup path
    /// as bulk initialization. On success the item is appended to the
    /// collection, the performance monitor is rebuilt around the grown
    /// collection, and a file-backed configuration is persisted with the
    /// watcher paused around the write. The new item is not started.
    pub async fn add_server(&mut self, declaration: ServerDeclaration) -> Result<()> {
        if !self.initialized {
            error!("The bootstrap must be initialized before adding a server");
            return Err(Error::NotInitialized);
        }

        if declaration.name.trim().is_empty() {
            return Err(Error::EmptyServerName);
        }

        let name_taken = self
            .servers
            .iter()
            .any(|s| s.name().eq_ignore_ascii_case(&declaration.name))
            || self
                .config
                .servers
                .iter()
                .any(|d| d.name.eq_ignore_ascii_case(&declaration.name));
        if name_taken {
            error!(
                server = %declaration.name,
                "The new server's name has been taken by another server"
            );
            return Err(Error::DuplicateServerName(declaration.name));
        }

        if declaration.server_manager && self.server_manager.is_some() {
            return Err(Error::ConfigError(
                "a server manager is already hosted".to_string(),
            ));
        }

        let single = self.config.single_declaration_source(&declaration);
        let factories = match factory::resolve(&single, &self.registry, None) {
            Ok(factories) => factories,
            Err(e) => {
                error!(server = %declaration.name, error = %e, "Failed to resolve the new server");
                return Err(e);
            }
        };
        let Some(info) = factories.into_iter().next() else {
            return Err(Error::ConfigError(format!(
                "the server '{}' resolved to no work item",
                declaration.name
            )));
        };

        let mut fault_tasks = Vec::new();
        let server = match self.setup_work_item(&info, &mut fault_tasks).await {
            Ok(server) => server,
            Err(e) => {
                for task in fault_tasks {
                    task.abort();
                }
                return Err(e);
            }
        };

        if info.is_server_manager {
            self.server_manager = Some(Arc::clone(&server));
        }
        self.fault_tasks.append(&mut fault_tasks);
        self.servers.push(Arc::clone(&server));
        self.config.servers.push(declaration);

        if !self.settings.disable_performance_data_collector {
            self.reset_performance_monitor();
        }

        if self.config.is_file_backed() {
            if let Some(watcher) = &self.watcher {
                watcher.pause();
            }
            let persisted = self.config.save();
            if let Some(watcher) = &self.watcher {
                watcher.resume();
            }
            if let Err(e) = persisted {
                warn!(
                    server = %server.name(),
                    error = %e,
                    "Failed to persist the new server declaration"
                );
            }
        }

        info!(server = %server.name(), "The server has been added");
        Ok(())
    }

    /// Tear down the monitor and rebuild it around the current collection.
    /// A monitor cannot add a target after construction; replacement is the
    /// only supported mechanism.
    fn reset_performance_monitor(&mut self) {
        let was_running = self.monitor.as_ref().is_some_and(|m| m.is_running());
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }

        let mut monitor = PerformanceMonitor::new(
            self.settings.performance_data_collect_interval,
            self.servers.clone(),
            self.server_manager.clone(),
        );
        if was_running {
            monitor.start();
        }
        self.monitor = Some(monitor);
        debug!("The performance monitor has been reset for the new server");
    }

    /// Whether initialization has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// All hosted work items, in declaration order.
    pub fn servers(&self) -> &[Arc<dyn WorkItem>] {
        &self.servers
    }

    /// Look a hosted work item up by name, case-insensitively.
    pub fn server(&self, name: &str) -> Option<&Arc<dyn WorkItem>> {
        self.servers
            .iter()
            .find(|s| s.name().eq_ignore_ascii_case(name))
    }

    /// The designated server manager, if one is hosted.
    pub fn server_manager(&self) -> Option<&Arc<dyn WorkItem>> {
        self.server_manager.as_ref()
    }

    /// The performance monitor, unless collection is disabled.
    pub fn monitor(&self) -> Option<&PerformanceMonitor> {
        self.monitor.as_ref()
    }

    /// The configuration the bootstrap was built over.
    pub fn config(&self) -> &ConfigSource {
        &self.config
    }

    /// The watcher over a file-backed configuration, if one is running.
    pub fn config_watcher(&mut self) -> Option<&mut ConfigWatcher> {
        self.watcher.as_mut()
    }
}

impl Drop for Bootstrap {
    fn drop(&mut self) {
        // disarm the process-wide hook so it does not outlive this instance
        if let Some(armed) = self.panic_hook_armed.take() {
            armed.store(false, Ordering::SeqCst);
        }
        for task in self.fault_tasks.drain(..) {
            task.abort();
        }
    }
}

/// Classify an aggregate start outcome.
pub(crate) fn aggregate_start_result(succeeded: usize, total: usize) -> StartResult {
    if total == 0 {
        return StartResult::NoneSucceeded;
    }
    if succeeded == total {
        StartResult::AllSucceeded
    } else if succeeded == 0 {
        StartResult::NoneSucceeded
    } else {
        StartResult::PartialSuccess
    }
}

/// Snapshot of one work item for shutdown ordering.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StopCandidate {
    pub startup_order: i32,
    pub state: WorkItemState,
}

/// Indices of the items to stop, in stop order: reverse declaration order
/// when any item declared a non-zero startup order, declaration order
/// otherwise. Items not currently running are excluded.
pub(crate) fn shutdown_sequence(items: &[StopCandidate]) -> Vec<usize> {
    let mut sequence: Vec<usize> = (0..items.len())
        .filter(|&i| items[i].state == WorkItemState::Running)
        .collect();

    if items.iter().any(|c| c.startup_order != 0) {
        sequence.reverse();
    }
    sequence
}

/// Tracks how many times the process-wide hook was actually installed.
static PANIC_HOOK_INSTALLS: AtomicUsize = AtomicUsize::new(0);

/// Arm a process-wide panic hook for last-resort logging of faults that
/// escape every per-item boundary.
///
/// The hook itself is installed at most once per process and consults
/// the flag of the most recently initialized bootstrap, so repeated
/// create/drop cycles never grow the hook chain. The returned flag
/// disarms logging when the owning bootstrap is dropped.
fn install_panic_hook() -> Arc<AtomicBool> {
    static INSTALL: Once = Once::new();
    static ACTIVE: OnceLock<Mutex<Weak<AtomicBool>>> = OnceLock::new();

    let armed = Arc::new(AtomicBool::new(true));
    let active = ACTIVE.get_or_init(|| Mutex::new(Weak::new()));
    if let Ok(mut slot) = active.lock() {
        *slot = Arc::downgrade(&armed);
    }

    INSTALL.call_once(|| {
        PANIC_HOOK_INSTALLS.fetch_add(1, Ordering::SeqCst);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic_info| {
            let armed_now = ACTIVE
                .get()
                .and_then(|slot| slot.lock().ok())
                .and_then(|slot| slot.upgrade())
                .map_or(false, |flag| flag.load(Ordering::SeqCst));
            if armed_now {
                error!(panic = %panic_info, "The process crashed for an unhandled panic");
            }
            previous(panic_info);
        }));
    });

    armed
}
