//! Process-level bootstrap for hosted socket servers.
//!
//! One process hosts a set of independently addressable network-service
//! instances ("work items"): long-running servers with their own accept
//! loops and protocol handling. This crate supervises them: it creates,
//! configures, starts, monitors and tears work items down according to a
//! declarative configuration, without implementing any networking itself.
//!
//! # Overview
//!
//! - [`config`]: global settings, server declarations, TOML-backed
//!   configuration sources and the change watcher
//! - [`factory`]: resolution of declarations into creation recipes,
//!   including endpoint replacement
//! - [`work_item`]: the lifecycle contract hosted servers implement
//! - [`monitor`]: timer-driven performance sampling of the collection
//! - [`bootstrap`]: the supervisor driving initialize/start/stop and
//!   runtime addition of servers
//!
//! # Quick start
//!
//! ```rust,no_run
//! use sockhost::{Bootstrap, ConfigSource, FactoryRegistry, ServerDeclaration};
//!
//! # async fn run(registry: FactoryRegistry) -> sockhost::Result<()> {
//! let config = ConfigSource::from_file("sockhost.toml")?;
//! let mut bootstrap = Bootstrap::new(config, registry);
//!
//! bootstrap.initialize().await?;
//! let result = bootstrap.start().await;
//! println!("start result: {:?}", result);
//!
//! bootstrap
//!     .add_server(ServerDeclaration::new("echo2", "echo-server").with_port(2022))
//!     .await?;
//!
//! bootstrap.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod factory;
pub mod monitor;
pub mod work_item;

pub use bootstrap::{Bootstrap, StartResult};
pub use config::{
    ConfigSource, ConfigWatcher, GlobalSettings, ListenerDeclaration, ServerDeclaration,
};
pub use error::{Error, Result};
pub use factory::{
    endpoint_key, EndpointMap, FactoryRegistry, ProviderFactory, ProviderKind, WorkItemFactoryInfo,
};
pub use monitor::{PerfSnapshot, PerformanceMonitor};
pub use work_item::{BootstrapHandle, FaultEvent, WorkItem, WorkItemSample, WorkItemState};
