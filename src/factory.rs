//! Work-item factory resolution.
//!
//! Turns a [`ConfigSource`] into creation recipes: validates declarations,
//! applies endpoint replacement and binds each declaration to a constructor
//! registered in the [`FactoryRegistry`]. Resolution is synchronous,
//! idempotent and fails before any work item is touched.

use crate::config::{ConfigSource, ServerDeclaration};
use crate::error::{Error, Result};
use crate::work_item::WorkItem;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

/// Kinds of auxiliary providers a work item may be handed at setup time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Produces receive filters for incoming byte streams
    ReceiveFilter,
    /// Produces log sinks
    Log,
    /// Produces connection filters
    ConnectionFilter,
    /// Produces command loaders
    CommandLoader,
}

/// Named factory for one auxiliary provider.
///
/// The bootstrap never understands what a provider produces; it only
/// carries the factory, in order, to the item's setup call.
#[derive(Clone)]
pub struct ProviderFactory {
    name: String,
    kind: ProviderKind,
    construct: Arc<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>,
}

impl ProviderFactory {
    /// Create a provider factory.
    pub fn new<F>(name: impl Into<String>, kind: ProviderKind, construct: F) -> Self
    where
        F: Fn() -> Box<dyn Any + Send> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind,
            construct: Arc::new(construct),
        }
    }

    /// Name of this factory.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind of provider this factory produces.
    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    /// Construct one provider instance.
    pub fn create(&self) -> Box<dyn Any + Send> {
        (self.construct)()
    }
}

impl std::fmt::Debug for ProviderFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderFactory")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Resolved creation recipe for one work item.
#[derive(Debug, Clone)]
pub struct WorkItemFactoryInfo {
    /// Registered type identifier to instantiate
    pub server_type: String,
    /// Frozen per-item configuration snapshot
    pub config: ServerDeclaration,
    /// Auxiliary provider factories, in registration order
    pub provider_factories: Vec<ProviderFactory>,
    /// Whether this item is the designated server manager
    pub is_server_manager: bool,
}

/// Endpoint replacement map, keyed `"{name}_{declaredPort}"`.
pub type EndpointMap = HashMap<String, SocketAddr>;

/// Build the key a declaration's endpoint is replaced under.
pub fn endpoint_key(name: &str, port: u16) -> String {
    format!("{}_{}", name, port)
}

type Constructor = Arc<dyn Fn(&ServerDeclaration) -> Arc<dyn WorkItem> + Send + Sync>;

/// Registry mapping server type identifiers to work-item constructors and
/// the provider factories each type is set up with.
#[derive(Clone, Default)]
pub struct FactoryRegistry {
    constructors: HashMap<String, Constructor>,
    providers: HashMap<String, Vec<ProviderFactory>>,
}

impl FactoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for a server type.
    pub fn register<F>(&mut self, server_type: impl Into<String>, construct: F)
    where
        F: Fn(&ServerDeclaration) -> Arc<dyn WorkItem> + Send + Sync + 'static,
    {
        self.constructors
            .insert(server_type.into(), Arc::new(construct));
    }

    /// Append a provider factory handed to every instance of a server type.
    pub fn register_provider(&mut self, server_type: impl Into<String>, factory: ProviderFactory) {
        self.providers
            .entry(server_type.into())
            .or_default()
            .push(factory);
    }

    /// Whether a constructor is registered for the given type.
    pub fn contains(&self, server_type: &str) -> bool {
        self.constructors.contains_key(server_type)
    }

    /// Instantiate the work item a recipe describes.
    pub fn construct(&self, info: &WorkItemFactoryInfo) -> Result<Arc<dyn WorkItem>> {
        let construct = self
            .constructors
            .get(&info.server_type)
            .ok_or_else(|| Error::UnknownServerType(info.server_type.clone()))?;
        Ok(construct(&info.config))
    }

    fn providers_for(&self, server_type: &str) -> Vec<ProviderFactory> {
        self.providers.get(server_type).cloned().unwrap_or_default()
    }
}

impl std::fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryRegistry")
            .field("server_types", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Resolve a configuration source into creation recipes.
///
/// Validates that every declared name is non-empty and unique
/// (case-insensitively), that at most one declaration is marked as the
/// server manager, and applies the endpoint replacement map when one is
/// given. Declarations marked `disabled` are validated but produce no
/// recipe. Any failure aborts the whole resolution; nothing is partially
/// resolved.
pub fn resolve(
    config: &ConfigSource,
    registry: &FactoryRegistry,
    endpoints: Option<&EndpointMap>,
) -> Result<Vec<WorkItemFactoryInfo>> {
    let mut seen = HashSet::new();
    for declaration in &config.servers {
        if declaration.name.trim().is_empty() {
            return Err(Error::EmptyServerName);
        }
        if !seen.insert(declaration.name.to_lowercase()) {
            return Err(Error::DuplicateServerName(declaration.name.clone()));
        }
    }

    let mut manager_seen = false;
    let mut infos = Vec::new();

    for declaration in config.servers.iter().filter(|d| !d.disabled) {
        if declaration.server_manager {
            if manager_seen {
                return Err(Error::ConfigError(
                    "more than one server is declared as the server manager".to_string(),
                ));
            }
            manager_seen = true;
        }

        let item_config = match endpoints {
            Some(map) => replace_endpoints(declaration, map)?,
            None => declaration.clone(),
        };

        infos.push(WorkItemFactoryInfo {
            server_type: declaration.server_type.clone(),
            config: item_config,
            provider_factories: registry.providers_for(&declaration.server_type),
            is_server_manager: declaration.server_manager,
        });
    }

    Ok(infos)
}

/// Rewrite a declaration's bind endpoints from the replacement map. A
/// declared endpoint without a map entry is a hard error, never a silent
/// fallback to the declared port.
fn replace_endpoints(
    declaration: &ServerDeclaration,
    endpoints: &EndpointMap,
) -> Result<ServerDeclaration> {
    let mut config = declaration.clone();

    if declaration.port > 0 {
        let key = endpoint_key(&declaration.name, declaration.port);
        let endpoint = endpoints
            .get(&key)
            .ok_or(Error::MissingEndpoint(key))?;
        config.ip = endpoint.ip().to_string();
        config.port = endpoint.port();
    }

    for listener in &mut config.listeners {
        let key = endpoint_key(&declaration.name, listener.port);
        let endpoint = endpoints
            .get(&key)
            .ok_or(Error::MissingEndpoint(key))?;
        listener.ip = endpoint.ip().to_string();
        listener.port = endpoint.port();
    }

    Ok(config)
}
