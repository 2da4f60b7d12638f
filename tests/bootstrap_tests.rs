//! End-to-end tests for the bootstrap lifecycle, using an in-crate test
//! server that records every lifecycle call it receives.

use async_trait::async_trait;
use sockhost::{
    Bootstrap, ConfigSource, EndpointMap, Error, FactoryRegistry, FaultEvent, GlobalSettings,
    ProviderFactory, Result, ServerDeclaration, StartResult, WorkItem, WorkItemSample,
    WorkItemState,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

struct RecordingServer {
    name: String,
    state: Mutex<WorkItemState>,
    config: Mutex<Option<ServerDeclaration>>,
    fail_setup: bool,
    fail_start: bool,
    events: Arc<Mutex<Vec<String>>>,
    faults: broadcast::Sender<FaultEvent>,
}

impl RecordingServer {
    fn record(&self, call: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{}:{}", call, self.name));
    }
}

#[async_trait]
impl WorkItem for RecordingServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn setup(
        &self,
        _bootstrap: sockhost::BootstrapHandle,
        config: ServerDeclaration,
        _providers: &[ProviderFactory],
    ) -> Result<()> {
        if self.fail_setup {
            *self.state.lock().unwrap() = WorkItemState::Failed;
            return Err(Error::SetupFailed(self.name.clone()));
        }
        *self.config.lock().unwrap() = Some(config);
        *self.state.lock().unwrap() = WorkItemState::Initialized;
        self.record("setup");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        if self.fail_start {
            *self.state.lock().unwrap() = WorkItemState::Failed;
            return Err(Error::StartFailed(self.name.clone()));
        }
        *self.state.lock().unwrap() = WorkItemState::Running;
        self.record("start");
        Ok(())
    }

    async fn stop(&self) {
        *self.state.lock().unwrap() = WorkItemState::NotRunning;
        self.record("stop");
    }

    fn state(&self) -> WorkItemState {
        *self.state.lock().unwrap()
    }

    fn config(&self) -> Option<ServerDeclaration> {
        self.config.lock().unwrap().clone()
    }

    fn fault_hook(&self) -> Option<broadcast::Receiver<FaultEvent>> {
        Some(self.faults.subscribe())
    }

    fn sample(&self) -> Option<WorkItemSample> {
        Some(WorkItemSample {
            server: self.name.clone(),
            state: self.state(),
            connection_count: 0,
            total_received_bytes: 0,
            total_sent_bytes: 0,
            collected_at: chrono::Utc::now(),
        })
    }
}

/// Shared bookkeeping for every server the registry constructs.
#[derive(Clone, Default)]
struct Harness {
    events: Arc<Mutex<Vec<String>>>,
    created: Arc<AtomicUsize>,
    fail_setup: Arc<Mutex<HashSet<String>>>,
    fail_start: Arc<Mutex<HashSet<String>>>,
    faults: Arc<Mutex<HashMap<String, broadcast::Sender<FaultEvent>>>>,
}

/// Route bootstrap logging through the test writer, honoring `RUST_LOG`.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Harness {
    fn registry(&self) -> FactoryRegistry {
        init_logging();
        let mut registry = FactoryRegistry::new();
        let harness = self.clone();
        registry.register("test-server", move |declaration: &ServerDeclaration| {
            harness.created.fetch_add(1, Ordering::SeqCst);
            let (faults, _) = broadcast::channel(16);
            harness
                .faults
                .lock()
                .unwrap()
                .insert(declaration.name.clone(), faults.clone());
            Arc::new(RecordingServer {
                name: declaration.name.clone(),
                state: Mutex::new(WorkItemState::Created),
                config: Mutex::new(None),
                fail_setup: harness
                    .fail_setup
                    .lock()
                    .unwrap()
                    .contains(&declaration.name),
                fail_start: harness
                    .fail_start
                    .lock()
                    .unwrap()
                    .contains(&declaration.name),
                events: Arc::clone(&harness.events),
                faults,
            }) as Arc<dyn WorkItem>
        });
        registry
    }

    fn fail_setup_of(&self, name: &str) {
        self.fail_setup.lock().unwrap().insert(name.to_string());
    }

    fn fail_start_of(&self, name: &str) {
        self.fail_start.lock().unwrap().insert(name.to_string());
    }

    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn raise_fault(&self, server: &str, message: &str) {
        let senders = self.faults.lock().unwrap();
        senders
            .get(server)
            .expect("unknown server")
            .send(FaultEvent {
                server: server.to_string(),
                message: message.to_string(),
            })
            .expect("no fault subscriber");
    }
}

fn declaration(name: &str) -> ServerDeclaration {
    ServerDeclaration::new(name, "test-server")
}

fn config_with(names: &[&str]) -> ConfigSource {
    let mut config = ConfigSource::new(GlobalSettings::default());
    for name in names.iter().copied() {
        config = config.with_server(declaration(name));
    }
    config
}

#[tokio::test]
async fn initializing_twice_always_fails() {
    let harness = Harness::default();
    let mut bootstrap = Bootstrap::new(config_with(&["echo"]), harness.registry());

    bootstrap.initialize().await.unwrap();
    assert!(bootstrap.is_initialized());
    assert_eq!(bootstrap.servers().len(), 1);

    let second = bootstrap.initialize().await;
    assert!(matches!(second, Err(Error::AlreadyInitialized)));

    // the first call's state is unchanged by the second attempt
    assert!(bootstrap.is_initialized());
    assert_eq!(bootstrap.servers().len(), 1);
    assert_eq!(harness.created(), 1);
}

#[tokio::test]
async fn initialize_creates_items_in_declaration_order() {
    let harness = Harness::default();
    let mut bootstrap = Bootstrap::new(config_with(&["a", "b", "c"]), harness.registry());

    bootstrap.initialize().await.unwrap();

    let names: Vec<_> = bootstrap.servers().iter().map(|s| s.name().to_string()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    for server in bootstrap.servers() {
        assert_eq!(server.state(), WorkItemState::Initialized);
    }
    assert_eq!(harness.events(), vec!["setup:a", "setup:b", "setup:c"]);
}

#[tokio::test]
async fn setup_failure_during_bulk_initialize_is_all_or_nothing() {
    let harness = Harness::default();
    harness.fail_setup_of("b");
    let mut bootstrap = Bootstrap::new(config_with(&["a", "b", "c"]), harness.registry());

    let result = bootstrap.initialize().await;
    assert!(matches!(result, Err(Error::SetupFailed(_))));
    assert!(!bootstrap.is_initialized());
    assert!(bootstrap.servers().is_empty());

    // "a" and "b" were created before the abort, "c" never was
    assert_eq!(harness.created(), 2);

    // nothing can be started afterwards
    assert_eq!(bootstrap.start().await, StartResult::Failed);
}

#[tokio::test]
async fn start_before_initialize_fails_without_side_effects() {
    let harness = Harness::default();
    let mut bootstrap = Bootstrap::new(config_with(&["a"]), harness.registry());

    assert_eq!(bootstrap.start().await, StartResult::Failed);
    assert_eq!(harness.created(), 0);
    assert!(harness.events().is_empty());
}

#[tokio::test]
async fn start_reports_all_succeeded() {
    let harness = Harness::default();
    let mut bootstrap = Bootstrap::new(config_with(&["a", "b", "c"]), harness.registry());

    bootstrap.initialize().await.unwrap();
    assert_eq!(bootstrap.start().await, StartResult::AllSucceeded);
    for server in bootstrap.servers() {
        assert_eq!(server.state(), WorkItemState::Running);
    }
}

#[tokio::test]
async fn start_reports_partial_success() {
    let harness = Harness::default();
    harness.fail_start_of("b");
    let mut bootstrap = Bootstrap::new(config_with(&["a", "b", "c"]), harness.registry());

    bootstrap.initialize().await.unwrap();
    assert_eq!(bootstrap.start().await, StartResult::PartialSuccess);

    // the failed item does not abort the others
    assert_eq!(bootstrap.server("a").unwrap().state(), WorkItemState::Running);
    assert_eq!(bootstrap.server("b").unwrap().state(), WorkItemState::Failed);
    assert_eq!(bootstrap.server("c").unwrap().state(), WorkItemState::Running);
}

#[tokio::test]
async fn start_reports_none_succeeded() {
    let harness = Harness::default();
    harness.fail_start_of("a");
    harness.fail_start_of("b");
    let mut bootstrap = Bootstrap::new(config_with(&["a", "b"]), harness.registry());

    bootstrap.initialize().await.unwrap();
    assert_eq!(bootstrap.start().await, StartResult::NoneSucceeded);
}

#[tokio::test]
async fn stop_reverses_declaration_order_when_any_order_hint_is_set() {
    let harness = Harness::default();
    let config = ConfigSource::new(GlobalSettings::default())
        .with_server(declaration("a").with_startup_order(1))
        .with_server(declaration("b").with_startup_order(2))
        .with_server(declaration("c"));
    let mut bootstrap = Bootstrap::new(config, harness.registry());

    bootstrap.initialize().await.unwrap();
    bootstrap.start().await;
    bootstrap.stop().await;

    let stops: Vec<_> = harness
        .events()
        .into_iter()
        .filter(|e| e.starts_with("stop:"))
        .collect();
    assert_eq!(stops, vec!["stop:c", "stop:b", "stop:a"]);
}

#[tokio::test]
async fn stop_skips_items_that_are_not_running() {
    let harness = Harness::default();
    harness.fail_start_of("c");
    let config = ConfigSource::new(GlobalSettings::default())
        .with_server(declaration("a").with_startup_order(1))
        .with_server(declaration("b").with_startup_order(2))
        .with_server(declaration("c"));
    let mut bootstrap = Bootstrap::new(config, harness.registry());

    bootstrap.initialize().await.unwrap();
    bootstrap.start().await;
    bootstrap.stop().await;

    let stops: Vec<_> = harness
        .events()
        .into_iter()
        .filter(|e| e.starts_with("stop:"))
        .collect();
    assert_eq!(stops, vec!["stop:b", "stop:a"]);
    assert_eq!(bootstrap.server("c").unwrap().state(), WorkItemState::Failed);
}

#[tokio::test]
async fn stop_works_in_declaration_order_without_hints() {
    let harness = Harness::default();
    let mut bootstrap = Bootstrap::new(config_with(&["a", "b"]), harness.registry());

    bootstrap.initialize().await.unwrap();
    bootstrap.start().await;
    bootstrap.stop().await;

    let stops: Vec<_> = harness
        .events()
        .into_iter()
        .filter(|e| e.starts_with("stop:"))
        .collect();
    assert_eq!(stops, vec!["stop:a", "stop:b"]);
}

#[tokio::test]
async fn add_server_requires_initialization() {
    let harness = Harness::default();
    let mut bootstrap = Bootstrap::new(config_with(&[]), harness.registry());

    let result = bootstrap.add_server(declaration("late")).await;
    assert!(matches!(result, Err(Error::NotInitialized)));
}

#[tokio::test]
async fn add_server_rejects_duplicate_names_case_insensitively() {
    let harness = Harness::default();
    let mut bootstrap = Bootstrap::new(config_with(&["echo"]), harness.registry());

    bootstrap.initialize().await.unwrap();
    let result = bootstrap.add_server(declaration("ECHO")).await;

    assert!(matches!(result, Err(Error::DuplicateServerName(_))));
    assert_eq!(bootstrap.servers().len(), 1);
    assert_eq!(harness.created(), 1);
}

#[tokio::test]
async fn add_server_appends_without_starting() {
    let harness = Harness::default();
    let mut bootstrap = Bootstrap::new(config_with(&["a", "b"]), harness.registry());

    bootstrap.initialize().await.unwrap();
    assert_eq!(bootstrap.start().await, StartResult::AllSucceeded);

    bootstrap.add_server(declaration("relay")).await.unwrap();

    assert_eq!(bootstrap.servers().len(), 3);
    assert_eq!(
        bootstrap.server("relay").unwrap().state(),
        WorkItemState::Initialized
    );

    // pre-existing items are untouched
    assert_eq!(bootstrap.server("a").unwrap().state(), WorkItemState::Running);
    assert_eq!(bootstrap.server("b").unwrap().state(), WorkItemState::Running);

    // the monitor was rebuilt around the grown collection and kept running
    assert!(bootstrap.monitor().unwrap().is_running());
}

#[tokio::test]
async fn missing_endpoint_aborts_before_any_instantiation() {
    let harness = Harness::default();
    let config = ConfigSource::new(GlobalSettings::default())
        .with_server(declaration("echo").with_port(2012))
        .with_server(declaration("chat").with_port(2013));
    let mut bootstrap = Bootstrap::new(config, harness.registry());

    let mut endpoints = EndpointMap::new();
    endpoints.insert("echo_2012".to_string(), "10.0.0.9:31012".parse().unwrap());

    let result = bootstrap.initialize_with_endpoints(&endpoints).await;
    assert!(matches!(result, Err(Error::MissingEndpoint(_))));
    assert_eq!(harness.created(), 0);
    assert!(!bootstrap.is_initialized());
}

#[tokio::test]
async fn endpoint_replacement_rewrites_the_item_configuration() {
    let harness = Harness::default();
    let config = ConfigSource::new(GlobalSettings::default())
        .with_server(declaration("echo").with_port(2012));
    let mut bootstrap = Bootstrap::new(config, harness.registry());

    let mut endpoints = EndpointMap::new();
    endpoints.insert("echo_2012".to_string(), "10.0.0.9:31012".parse().unwrap());

    bootstrap.initialize_with_endpoints(&endpoints).await.unwrap();

    let item_config = bootstrap.server("echo").unwrap().config().unwrap();
    assert_eq!(item_config.ip, "10.0.0.9");
    assert_eq!(item_config.port, 31012);
}

#[tokio::test]
async fn server_manager_is_recorded_and_kept_in_the_collection() {
    let harness = Harness::default();
    let config = ConfigSource::new(GlobalSettings::default())
        .with_server(declaration("echo"))
        .with_server(declaration("manager").as_server_manager());
    let mut bootstrap = Bootstrap::new(config, harness.registry());

    bootstrap.initialize().await.unwrap();

    assert_eq!(bootstrap.servers().len(), 2);
    assert_eq!(bootstrap.server_manager().unwrap().name(), "manager");
}

#[tokio::test]
async fn fault_in_one_item_does_not_disturb_the_others() {
    let harness = Harness::default();
    let mut bootstrap = Bootstrap::new(config_with(&["a", "b"]), harness.registry());

    bootstrap.initialize().await.unwrap();
    bootstrap.start().await;

    harness.raise_fault("a", "connection handler panicked");
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the fault is logged, never propagated: both items keep running
    assert_eq!(bootstrap.server("a").unwrap().state(), WorkItemState::Running);
    assert_eq!(bootstrap.server("b").unwrap().state(), WorkItemState::Running);
}

#[tokio::test]
async fn disabling_the_collector_leaves_no_monitor() {
    let harness = Harness::default();
    let settings = GlobalSettings {
        disable_performance_data_collector: true,
        ..GlobalSettings::default()
    };
    let config = ConfigSource::new(settings).with_server(declaration("echo"));
    let mut bootstrap = Bootstrap::new(config, harness.registry());

    bootstrap.initialize().await.unwrap();
    assert!(bootstrap.monitor().is_none());

    bootstrap.start().await;
    bootstrap.add_server(declaration("late")).await.unwrap();
    assert!(bootstrap.monitor().is_none());
}

#[tokio::test]
async fn add_server_persists_to_a_file_backed_configuration() {
    let harness = Harness::default();
    let dir = tempdir::TempDir::new("sockhost-boot").unwrap();
    let path = dir.path().join("sockhost.toml");
    std::fs::write(
        &path,
        r#"
        [[servers]]
        name = "echo"
        server_type = "test-server"
        port = 2012
    "#,
    )
    .unwrap();

    let config = ConfigSource::from_file(&path).unwrap();
    let mut bootstrap = Bootstrap::new(config, harness.registry());

    bootstrap.initialize().await.unwrap();
    bootstrap
        .add_server(declaration("relay").with_port(2014))
        .await
        .unwrap();

    let reloaded = ConfigSource::from_file(&path).unwrap();
    assert_eq!(reloaded.servers.len(), 2);
    assert_eq!(reloaded.servers[1].name, "relay");
    assert_eq!(reloaded.servers[1].port, 2014);

    // the watcher must not report the write the bootstrap itself made
    let watcher = bootstrap.config_watcher().unwrap();
    let event = tokio::time::timeout(Duration::from_millis(1500), watcher.changed()).await;
    assert!(event.is_err());
}
