//! Configuration model for the bootstrap.
//!
//! A [`ConfigSource`] holds the process-wide [`GlobalSettings`] plus the
//! ordered set of [`ServerDeclaration`] entries to host. It can be built
//! programmatically or loaded from a TOML file; a file-backed source can
//! persist runtime-added declarations back to disk and expose a
//! [`ConfigWatcher`] that reports external edits.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::debug;

/// Process-wide policy settings, immutable after initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Default locale applied when the bootstrap initializes (e.g. "en-US")
    #[serde(default)]
    pub default_culture: Option<String>,
    /// Disable the performance data collector entirely
    #[serde(default)]
    pub disable_performance_data_collector: bool,
    /// Disable hot reload of file-backed configuration
    #[serde(default)]
    pub disable_config_hot_reload: bool,
    /// Interval between performance sampling passes
    #[serde(default = "default_collect_interval")]
    #[serde(with = "secs_serde")]
    pub performance_data_collect_interval: Duration,
}

fn default_collect_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            default_culture: None,
            disable_performance_data_collector: false,
            disable_config_hot_reload: false,
            performance_data_collect_interval: default_collect_interval(),
        }
    }
}

/// One listen endpoint of a server that binds more than one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerDeclaration {
    /// Address to bind
    #[serde(default = "default_ip")]
    pub ip: String,
    /// Port to bind
    pub port: u16,
    /// Accept backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_backlog() -> u32 {
    128
}

/// Declaration of one work item in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDeclaration {
    /// Unique name of the server (case-insensitive)
    pub name: String,
    /// Registered type identifier of the implementation to instantiate
    pub server_type: String,
    /// Address to bind
    #[serde(default = "default_ip")]
    pub ip: String,
    /// Port to bind; 0 means the server only uses `listeners`
    #[serde(default)]
    pub port: u16,
    /// Additional listen endpoints
    #[serde(default)]
    pub listeners: Vec<ListenerDeclaration>,
    /// Startup order hint; 0 means unordered, non-zero values request
    /// reverse-declaration-order shutdown
    #[serde(default)]
    pub startup_order: i32,
    /// Receive buffer size in bytes
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: usize,
    /// Send buffer size in bytes
    #[serde(default = "default_send_buffer_size")]
    pub send_buffer_size: usize,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connection_number")]
    pub max_connection_number: usize,
    /// Skip this server at resolution time
    #[serde(default)]
    pub disabled: bool,
    /// Designate this server as the server manager (at most one)
    #[serde(default)]
    pub server_manager: bool,
}

fn default_receive_buffer_size() -> usize {
    4096
}

fn default_send_buffer_size() -> usize {
    4096
}

fn default_max_connection_number() -> usize {
    100
}

impl ServerDeclaration {
    /// Create a declaration with minimal configuration.
    pub fn new(name: impl Into<String>, server_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server_type: server_type.into(),
            ip: default_ip(),
            port: 0,
            listeners: Vec::new(),
            startup_order: 0,
            receive_buffer_size: default_receive_buffer_size(),
            send_buffer_size: default_send_buffer_size(),
            max_connection_number: default_max_connection_number(),
            disabled: false,
            server_manager: false,
        }
    }

    /// Set the bind port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the startup order hint.
    pub fn with_startup_order(mut self, order: i32) -> Self {
        self.startup_order = order;
        self
    }

    /// Mark this declaration as the server manager.
    pub fn as_server_manager(mut self) -> Self {
        self.server_manager = true;
        self
    }
}

/// The configuration consumed by the bootstrap: global settings plus the
/// ordered server declarations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigSource {
    /// Process-wide settings
    #[serde(default)]
    pub settings: GlobalSettings,
    /// Server declarations, in declaration order
    #[serde(default)]
    pub servers: Vec<ServerDeclaration>,
    #[serde(skip)]
    backing: Option<PathBuf>,
}

impl ConfigSource {
    /// Create an in-memory source with the given settings.
    pub fn new(settings: GlobalSettings) -> Self {
        Self {
            settings,
            servers: Vec::new(),
            backing: None,
        }
    }

    /// Append a server declaration.
    pub fn with_server(mut self, declaration: ServerDeclaration) -> Self {
        self.servers.push(declaration);
        self
    }

    /// Load a configuration source from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read {}: {}", path.display(), e)))?;

        let mut source: ConfigSource = toml::from_str(&content).map_err(|e| {
            Error::ConfigError(format!("Failed to parse TOML {}: {}", path.display(), e))
        })?;
        source.backing = Some(path.to_path_buf());
        Ok(source)
    }

    /// Whether this source was loaded from a file and can be persisted.
    pub fn is_file_backed(&self) -> bool {
        self.backing.is_some()
    }

    /// The backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.backing.as_deref()
    }

    /// Persist the current configuration to the backing file.
    pub fn save(&self) -> Result<()> {
        let path = self
            .backing
            .as_ref()
            .ok_or_else(|| Error::ConfigError("The configuration source is not file backed".to_string()))?;

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Build an in-memory source holding a single declaration, keeping the
    /// current global settings. Used to route runtime-added servers through
    /// the same resolution path as bulk initialization.
    pub(crate) fn single_declaration_source(&self, declaration: &ServerDeclaration) -> Self {
        Self {
            settings: self.settings.clone(),
            servers: vec![declaration.clone()],
            backing: None,
        }
    }
}

/// Watches a file-backed configuration source for external edits.
///
/// The watcher polls the file's modification time on its own tokio task
/// and reports changes through [`ConfigWatcher::changed`]. It can be
/// paused around writes the process performs itself; [`ConfigWatcher::resume`]
/// refreshes the baseline so the watcher does not react to a write made
/// while it was paused.
pub struct ConfigWatcher {
    path: PathBuf,
    paused: Arc<AtomicBool>,
    last_modified: Arc<Mutex<Option<SystemTime>>>,
    rx: mpsc::UnboundedReceiver<()>,
    task: tokio::task::JoinHandle<()>,
}

impl ConfigWatcher {
    /// Spawn a watcher polling `path` at `poll_interval`.
    pub fn spawn(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        let path = path.into();
        let paused = Arc::new(AtomicBool::new(false));
        let last_modified = Arc::new(Mutex::new(modified_time(&path)));
        let (tx, rx) = mpsc::unbounded_channel();

        let flag = Arc::clone(&paused);
        let last = Arc::clone(&last_modified);
        let watched = path.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;

                let Some(modified) = modified_time(&watched) else {
                    continue;
                };

                let changed = {
                    let Ok(mut guard) = last.lock() else {
                        break;
                    };
                    let changed = guard.map_or(true, |seen| modified > seen);
                    if changed {
                        *guard = Some(modified);
                    }
                    changed
                };

                if !changed {
                    continue;
                }

                if flag.load(Ordering::SeqCst) {
                    debug!(
                        path = %watched.display(),
                        "Configuration change ignored while the watcher is paused"
                    );
                    continue;
                }

                if tx.send(()).is_err() {
                    break;
                }
            }
        });

        Self {
            path,
            paused,
            last_modified,
            rx,
            task,
        }
    }

    /// Stop reporting changes until [`ConfigWatcher::resume`] is called.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume reporting changes. The baseline is refreshed first, so writes
    /// made while paused do not produce an event.
    pub fn resume(&self) {
        if let Ok(mut guard) = self.last_modified.lock() {
            *guard = modified_time(&self.path);
        }
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Wait for the next change to the watched file.
    pub async fn changed(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Module for integer-seconds duration serialization.
mod secs_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
