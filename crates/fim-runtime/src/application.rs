//! Application: generators, configuration, containers and their lifecycle.
//!
//! ```rust,ignore
//! let mut app = ApplicationBuilder::new()
//!     .with_config(RuntimeConfig::load(None)?)
//!     .with_source_generator(Arc::new(HttpGenerator::default()))
//!     .with_configure_manager(settings)
//!     .build()?;
//!
//! let mut users = app.spawn_container("users")?;
//! users.load_merged(&std::fs::read_to_string("users.toml")?)?;
//! app.add_container(users)?;
//! app.startup().await?;
//! ```
//!
//! Startup runs generators, then sub-generators, then containers (dispatcher before
//! connectors), then lifecycle listeners. Shutdown runs in reverse, and a failed startup
//! unwinds whatever it had already started.

use crate::container::Container;
use crate::dispatch::{BusFlowInvoker, LocalFlowInvoker, SingleDispatchDecider};
use crate::error::{RuntimeError, RuntimeResult};
use crate::generator::{GeneratorRegistry, target_name};
use crate::pipeline::connector_options;
use async_trait::async_trait;
use error_stack::Report;
use fim_kernel::bus::RequestReplyBus;
use fim_kernel::config::{
    ConfigureManager, DispatchMode, EnvConfigureManager, NestedConfigureManager, RuntimeConfig,
    definition,
};
use fim_kernel::connector::{
    ConnectorError, SourceConnectorGenerator, SubGeneratorRequest, TargetConnectorGenerator,
};
use fim_kernel::dispatch::FlowInvoker;
use fim_kernel::{DefinitionError, DefinitionResult};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

pub const KEY_PARENT: &str = "@parent";

pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Hook run after every container has started, and before any is stopped.
#[async_trait]
pub trait LifecycleListener: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn on_start(&self) -> ListenerResult;

    async fn on_stop(&self) -> ListenerResult {
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GeneratorDefinitionsRaw {
    #[serde(default)]
    source_generators: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    target_generators: BTreeMap<String, BTreeMap<String, Value>>,
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Default)]
pub struct ApplicationBuilder {
    config: RuntimeConfig,
    sources: Vec<Arc<dyn SourceConnectorGenerator>>,
    targets: Vec<Arc<dyn TargetConnectorGenerator>>,
    configure: Vec<Arc<dyn ConfigureManager>>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
    generator_definitions: Vec<String>,
    bus: Option<Arc<dyn RequestReplyBus>>,
}

impl ApplicationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_source_generator(mut self, generator: Arc<dyn SourceConnectorGenerator>) -> Self {
        self.sources.push(generator);
        self
    }

    pub fn with_target_generator(mut self, generator: Arc<dyn TargetConnectorGenerator>) -> Self {
        self.targets.push(generator);
        self
    }

    /// Managers are consulted in the order they were added; environment variables come last.
    pub fn with_configure_manager(mut self, manager: Arc<dyn ConfigureManager>) -> Self {
        self.configure.push(manager);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn LifecycleListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// A document of `[source_generators.<name>]` / `[target_generators.<name>]` tables, each
    /// deriving a generator from its `"@parent"`.
    pub fn with_generator_definitions(mut self, content: impl Into<String>) -> Self {
        self.generator_definitions.push(content.into());
        self
    }

    /// Transport for `dispatch.mode = "bus"`.
    pub fn with_bus(mut self, bus: Arc<dyn RequestReplyBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> DefinitionResult<Application> {
        let mut configure = NestedConfigureManager::new();
        for manager in self.configure {
            configure.add_sub_configure_manager(manager);
        }
        configure.add_sub_configure_manager(Arc::new(EnvConfigureManager));

        let mut generators = GeneratorRegistry::new();
        for generator in self.sources {
            generators.add_source(generator)?;
        }
        for generator in self.targets {
            generators.add_target(generator)?;
        }

        let mut sub_sources = Vec::new();
        let mut sub_targets = Vec::new();
        for content in &self.generator_definitions {
            let raw: GeneratorDefinitionsRaw = definition::parse_definition(content)
                .map_err(|r| r.attach("generator definitions"))?;
            for (name, entry) in &raw.source_generators {
                let generator = derive_source(&generators, &configure, name, entry)
                    .map_err(|r| r.attach(format!("source generator {name}")))?;
                generators.insert_source(name, generator.clone())?;
                sub_sources.push((name.clone(), generator));
            }
            for (name, entry) in &raw.target_generators {
                let generator = derive_target(&generators, &configure, name, entry)
                    .map_err(|r| r.attach(format!("target generator {name}")))?;
                generators.insert_target(name, generator.clone())?;
                sub_targets.push((target_name(name), generator));
            }
        }

        Ok(Application {
            config: self.config,
            generators,
            sub_sources,
            sub_targets,
            configure,
            listeners: self.listeners,
            bus: self.bus,
            containers: Vec::new(),
            running: Vec::new(),
            started: false,
        })
    }
}

fn sub_generator_request(
    configure: &NestedConfigureManager,
    name: &str,
    entry: &BTreeMap<String, Value>,
) -> DefinitionResult<(String, SubGeneratorRequest)> {
    let parent = match entry.get(KEY_PARENT) {
        Some(Value::String(parent)) => parent.clone(),
        _ => {
            return Err(Report::new(DefinitionError::MissingConfiguration(
                KEY_PARENT.to_string(),
            )));
        }
    };
    let options = connector_options(entry, &[KEY_PARENT])?;
    let request = SubGeneratorRequest {
        name: name.to_string(),
        options: configure.resolve_options(&options),
    };
    Ok((parent, request))
}

fn connector_failure(e: ConnectorError) -> Report<DefinitionError> {
    Report::new(DefinitionError::Connector(e.to_string()))
}

fn derive_source(
    generators: &GeneratorRegistry,
    configure: &NestedConfigureManager,
    name: &str,
    entry: &BTreeMap<String, Value>,
) -> DefinitionResult<Arc<dyn SourceConnectorGenerator>> {
    let (parent, request) = sub_generator_request(configure, name, entry)?;
    generators
        .source(&parent)?
        .initialize_sub_generator(request)
        .map_err(connector_failure)
}

fn derive_target(
    generators: &GeneratorRegistry,
    configure: &NestedConfigureManager,
    name: &str,
    entry: &BTreeMap<String, Value>,
) -> DefinitionResult<Arc<dyn TargetConnectorGenerator>> {
    let (parent, request) = sub_generator_request(configure, name, entry)?;
    generators
        .target(&parent)?
        .initialize_sub_generator(request)
        .map_err(connector_failure)
}

// ============================================================================
// Application
// ============================================================================

/// A started unit, kept so shutdown can run in reverse.
enum Component {
    Source(String, Arc<dyn SourceConnectorGenerator>),
    Target(String, Arc<dyn TargetConnectorGenerator>),
    Container(usize),
    Listener(Arc<dyn LifecycleListener>),
}

pub struct Application {
    config: RuntimeConfig,
    generators: GeneratorRegistry,
    sub_sources: Vec<(String, Arc<dyn SourceConnectorGenerator>)>,
    sub_targets: Vec<(String, Arc<dyn TargetConnectorGenerator>)>,
    configure: NestedConfigureManager,
    listeners: Vec<Arc<dyn LifecycleListener>>,
    bus: Option<Arc<dyn RequestReplyBus>>,
    containers: Vec<Container>,
    running: Vec<Component>,
    started: bool,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("config", &self.config)
            .field("generators", &self.generators)
            .field("containers", &self.containers)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl Application {
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::new()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn generators(&self) -> &GeneratorRegistry {
        &self.generators
    }

    pub fn configure(&self) -> &NestedConfigureManager {
        &self.configure
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Creates an empty container wired to this application's generators and configuration.
    /// The dispatcher follows `dispatch.mode`.
    pub fn spawn_container(&self, service: &str) -> DefinitionResult<Container> {
        let invoker: Arc<dyn FlowInvoker> = match self.config.dispatch.mode {
            DispatchMode::Local => Arc::new(LocalFlowInvoker::new()),
            DispatchMode::Bus => {
                let bus = self.bus.clone().ok_or_else(|| {
                    Report::new(DefinitionError::MissingConfiguration("request/reply bus".into()))
                        .attach("dispatch.mode = \"bus\"")
                })?;
                Arc::new(BusFlowInvoker::new(bus, self.config.dispatch.request_timeout()))
            }
        };
        Ok(Container::new(
            service,
            self.generators.clone(),
            self.configure.clone(),
            Arc::new(SingleDispatchDecider::with_invoker(invoker)),
        ))
    }

    /// Container named after `service_name` in the runtime configuration.
    pub fn spawn_default_container(&self) -> DefinitionResult<Container> {
        self.spawn_container(&self.config.service_name)
    }

    pub fn add_container(&mut self, container: Container) -> DefinitionResult<()> {
        if self.started {
            return Err(Report::new(DefinitionError::InvalidPipeline(format!(
                "application is running, cannot add container {}",
                container.service_name()
            ))));
        }
        if self.container(container.service_name()).is_some() {
            return Err(Report::new(DefinitionError::Duplicate(format!(
                "container {}",
                container.service_name()
            ))));
        }
        self.containers.push(container);
        Ok(())
    }

    pub fn container(&self, service: &str) -> Option<&Container> {
        self.containers.iter().find(|c| c.service_name() == service)
    }

    pub fn container_mut(&mut self, service: &str) -> Option<&mut Container> {
        self.containers
            .iter_mut()
            .find(|c| c.service_name() == service)
    }

    pub async fn startup(&mut self) -> RuntimeResult<()> {
        if self.started {
            return Err(Report::new(RuntimeError::AlreadyStarted));
        }
        let mut running = Vec::new();
        if let Err(report) = self.start_components(&mut running).await {
            warn!(error = %report.current_context(), "startup failed, unwinding");
            let _ = self.stop_components(running).await;
            return Err(report);
        }
        self.running = running;
        self.started = true;
        info!(
            service = %self.config.service_name,
            containers = self.containers.len(),
            "application started"
        );
        Ok(())
    }

    async fn start_components(&mut self, running: &mut Vec<Component>) -> RuntimeResult<()> {
        for generator in self.generators.sources() {
            let name = generator.generator_names().join(",");
            generator
                .startup()
                .await
                .map_err(|e| Report::new(RuntimeError::generator(&name, e)))?;
            running.push(Component::Source(name, generator.clone()));
        }
        for generator in self.generators.targets() {
            let name = generator.generator_names().join(",");
            generator
                .startup()
                .await
                .map_err(|e| Report::new(RuntimeError::generator(&name, e)))?;
            running.push(Component::Target(name, generator.clone()));
        }
        for (name, generator) in &self.sub_sources {
            generator
                .startup()
                .await
                .map_err(|e| Report::new(RuntimeError::generator(name, e)))?;
            running.push(Component::Source(name.clone(), generator.clone()));
        }
        for (name, generator) in &self.sub_targets {
            generator
                .startup()
                .await
                .map_err(|e| Report::new(RuntimeError::generator(name, e)))?;
            running.push(Component::Target(name.clone(), generator.clone()));
        }
        for idx in 0..self.containers.len() {
            self.containers[idx].start().await?;
            running.push(Component::Container(idx));
        }
        for listener in &self.listeners {
            listener.on_start().await.map_err(|e| {
                Report::new(RuntimeError::Listener {
                    name: listener.name().to_string(),
                    reason: e.to_string(),
                })
            })?;
            running.push(Component::Listener(listener.clone()));
        }
        Ok(())
    }

    /// Stops components newest first. Every component is stopped even when some fail; the
    /// first failure is returned.
    async fn stop_components(&mut self, running: Vec<Component>) -> RuntimeResult<()> {
        let mut first: Option<Report<RuntimeError>> = None;
        for component in running.into_iter().rev() {
            let result = match component {
                Component::Listener(listener) => listener.on_stop().await.map_err(|e| {
                    Report::new(RuntimeError::Listener {
                        name: listener.name().to_string(),
                        reason: e.to_string(),
                    })
                }),
                Component::Container(idx) => self.containers[idx].stop().await,
                Component::Source(name, generator) => generator
                    .stop()
                    .await
                    .map_err(|e| Report::new(RuntimeError::generator(&name, e))),
                Component::Target(name, generator) => generator
                    .stop()
                    .await
                    .map_err(|e| Report::new(RuntimeError::generator(&name, e))),
            };
            if let Err(report) = result {
                warn!(error = %report.current_context(), "shutdown step failed");
                if first.is_none() {
                    first = Some(report);
                }
            }
        }
        match first {
            Some(report) => Err(report),
            None => Ok(()),
        }
    }

    pub async fn stop(&mut self) -> RuntimeResult<()> {
        if !self.started {
            return Err(Report::new(RuntimeError::NotStarted));
        }
        self.started = false;
        let running = std::mem::take(&mut self.running);
        let result = self.stop_components(running).await;
        info!(service = %self.config.service_name, "application stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fim_kernel::config::SettableConfigureManager;
    use fim_kernel::connector::{
        Connector, ConnectorRequest, ConnectorResult, SharedProcess, SourceConnector,
    };
    use parking_lot::Mutex;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Gen {
        name: String,
        journal: Journal,
        options: BTreeMap<String, String>,
    }

    impl Gen {
        fn new(name: &str, journal: &Journal) -> Self {
            Self {
                name: name.to_string(),
                journal: journal.clone(),
                options: BTreeMap::new(),
            }
        }
    }

    struct Conn(String);

    #[async_trait]
    impl Connector for Conn {
        fn name(&self) -> &str {
            &self.0
        }

        async fn start(&self) -> ConnectorResult<()> {
            Ok(())
        }

        async fn stop(&self) -> ConnectorResult<()> {
            Ok(())
        }
    }

    impl SourceConnector for Conn {
        fn bind(&self, _process: SharedProcess) -> ConnectorResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl SourceConnectorGenerator for Gen {
        fn generator_names(&self) -> Vec<String> {
            vec![self.name.clone()]
        }

        fn generate_source_connector(
            &self,
            request: ConnectorRequest,
        ) -> ConnectorResult<Arc<dyn SourceConnector>> {
            Ok(Arc::new(Conn(request.instance_name)))
        }

        fn initialize_sub_generator(
            &self,
            request: SubGeneratorRequest,
        ) -> ConnectorResult<Arc<dyn SourceConnectorGenerator>> {
            self.journal.lock().push(format!(
                "derive {} port={}",
                request.name,
                request.options.get("port").cloned().unwrap_or_default()
            ));
            Ok(Arc::new(Gen {
                name: request.name,
                journal: self.journal.clone(),
                options: request.options,
            }))
        }

        async fn startup(&self) -> ConnectorResult<()> {
            if self.options.get("fail").map(String::as_str) == Some("true") {
                return Err(ConnectorError::Other("cannot bind".into()));
            }
            self.journal.lock().push(format!("start {}", self.name));
            Ok(())
        }

        async fn stop(&self) -> ConnectorResult<()> {
            self.journal.lock().push(format!("stop {}", self.name));
            Ok(())
        }
    }

    struct Listener(Journal);

    #[async_trait]
    impl LifecycleListener for Listener {
        fn name(&self) -> &str {
            "listener"
        }

        async fn on_start(&self) -> ListenerResult {
            self.0.lock().push("listener up".into());
            Ok(())
        }

        async fn on_stop(&self) -> ListenerResult {
            self.0.lock().push("listener down".into());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_startup_and_reverse_shutdown() {
        let journal = Journal::default();
        let settings = Arc::new(SettableConfigureManager::new());
        settings.set_configure("ADMIN_PORT", "8081");

        let mut app = ApplicationBuilder::new()
            .with_source_generator(Arc::new(Gen::new("http", &journal)))
            .with_configure_manager(settings)
            .with_generator_definitions(
                r#"
                [source_generators.http_admin]
                "@parent" = "http"
                port = "configure-static://ADMIN_PORT"
                "#,
            )
            .with_listener(Arc::new(Listener(journal.clone())))
            .build()
            .unwrap();
        assert!(app.generators().source("http_admin").is_ok());

        let container = app.spawn_container("svc").unwrap();
        app.add_container(container).unwrap();
        assert!(app.add_container(app.spawn_container("svc").unwrap()).is_err());

        app.startup().await.unwrap();
        app.stop().await.unwrap();

        assert_eq!(
            *journal.lock(),
            vec![
                "derive http_admin port=8081",
                "start http",
                "start http_admin",
                "listener up",
                "listener down",
                "stop http_admin",
                "stop http",
            ]
        );
        assert!(matches!(
            app.stop().await.unwrap_err().current_context(),
            RuntimeError::NotStarted
        ));
    }

    #[tokio::test]
    async fn test_failed_startup_unwinds() {
        let journal = Journal::default();
        let mut app = ApplicationBuilder::new()
            .with_source_generator(Arc::new(Gen::new("http", &journal)))
            .with_generator_definitions(
                r#"
                [source_generators.broken]
                "@parent" = "http"
                fail = true
                "#,
            )
            .with_listener(Arc::new(Listener(journal.clone())))
            .build()
            .unwrap();

        let err = app.startup().await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            RuntimeError::Generator { name, .. } if name == "broken"
        ));
        assert!(!app.is_started());
        assert_eq!(
            *journal.lock(),
            vec!["derive broken port=", "start http", "stop http"]
        );
    }

    #[test]
    fn test_generator_definition_errors() {
        let journal = Journal::default();
        let err = ApplicationBuilder::new()
            .with_source_generator(Arc::new(Gen::new("http", &journal)))
            .with_generator_definitions("[source_generators.x]\nport = 1")
            .build()
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            DefinitionError::MissingConfiguration(_)
        ));

        let err = ApplicationBuilder::new()
            .with_generator_definitions("[source_generators.x]\n\"@parent\" = \"nope\"")
            .build()
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            DefinitionError::GeneratorNotFound(_)
        ));

        let err = ApplicationBuilder::new()
            .with_source_generator(Arc::new(Gen::new("http", &journal)))
            .with_source_generator(Arc::new(Gen::new("http", &journal)))
            .build()
            .unwrap_err();
        assert!(matches!(err.current_context(), DefinitionError::Duplicate(_)));
    }

    #[test]
    fn test_bus_mode_requires_a_bus() {
        let mut config = RuntimeConfig::default();
        config.dispatch.mode = DispatchMode::Bus;
        let app = ApplicationBuilder::new()
            .with_config(config.clone())
            .build()
            .unwrap();
        let err = app.spawn_container("svc").unwrap_err();
        assert!(matches!(
            err.current_context(),
            DefinitionError::MissingConfiguration(_)
        ));

        let app = ApplicationBuilder::new()
            .with_config(config)
            .with_bus(Arc::new(crate::bus::InProcessBus::new()))
            .build()
            .unwrap();
        assert_eq!(app.spawn_default_container().unwrap().service_name(), "fim");
    }
}
