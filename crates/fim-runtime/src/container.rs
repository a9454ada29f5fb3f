//! Containers.
//!
//! A container is one service: a schema, the flows and pipelines compiled against it, and the
//! connectors those pipelines created. Definitions are loaded while the container is stopped;
//! [`Container::start`] wires the pipelines into the dispatcher and starts the connectors.

use crate::error::{RuntimeError, RuntimeResult};
use crate::flow::{Flow, FlowDefinitionRaw};
use crate::function::{FlowFunction, FunctionRegistry};
use crate::generator::GeneratorRegistry;
use crate::pipeline::{Pipeline, PipelineContext, PipelineDefinitionRaw};
use error_stack::Report;
use fim_kernel::config::{NestedConfigureManager, definition};
use fim_kernel::connector::{ConnectorResult, SharedProcess, SourceConnector, TargetConnector};
use fim_kernel::dispatch::DispatchDecider;
use fim_kernel::model::{ModelFactory, ModelInstance};
use fim_kernel::path;
use fim_kernel::schema::SchemaTree;
use fim_kernel::{DefinitionError, DefinitionResult};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ============================================================================
// Connector lifecycle
// ============================================================================

/// A connector instance owned by a container.
#[derive(Clone)]
pub enum ConnectorHandle {
    Source(Arc<dyn SourceConnector>),
    Target(Arc<dyn TargetConnector>),
}

impl ConnectorHandle {
    pub fn name(&self) -> &str {
        match self {
            Self::Source(c) => c.name(),
            Self::Target(c) => c.name(),
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(self, Self::Source(_))
    }

    pub async fn start(&self) -> ConnectorResult<()> {
        match self {
            Self::Source(c) => c.start().await,
            Self::Target(c) => c.start().await,
        }
    }

    pub async fn stop(&self) -> ConnectorResult<()> {
        match self {
            Self::Source(c) => c.stop().await,
            Self::Target(c) => c.stop().await,
        }
    }
}

impl std::fmt::Debug for ConnectorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_source() { "Source" } else { "Target" };
        f.debug_tuple(kind).field(&self.name()).finish()
    }
}

/// Connectors in registration order, unique by instance name.
#[derive(Debug, Default)]
pub struct ConnectorSet {
    entries: Vec<ConnectorHandle>,
}

impl ConnectorSet {
    /// Returns `false` when a connector with the same name is already registered.
    pub fn register(&mut self, connector: ConnectorHandle) -> bool {
        if self.entries.iter().any(|c| c.name() == connector.name()) {
            return false;
        }
        self.entries.push(connector);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(ConnectorHandle::name).collect()
    }

    fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }

    /// Starts every connector in registration order. On failure the connectors already
    /// started are stopped again, newest first.
    pub async fn start_all(&self) -> RuntimeResult<()> {
        for (idx, connector) in self.entries.iter().enumerate() {
            if let Err(e) = connector.start().await {
                warn!(connector = connector.name(), error = %e, "connector failed to start");
                Self::stop_each(&self.entries[..idx]).await;
                return Err(Report::new(RuntimeError::connector(connector.name(), e)));
            }
            debug!(connector = connector.name(), "connector started");
        }
        Ok(())
    }

    /// Stops every connector, newest first. Failures are logged and the first one returned.
    pub async fn stop_all(&self) -> RuntimeResult<()> {
        match Self::stop_each(&self.entries).await {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn stop_each(entries: &[ConnectorHandle]) -> Option<Report<RuntimeError>> {
        let mut first = None;
        for connector in entries.iter().rev() {
            if let Err(e) = connector.stop().await {
                warn!(connector = connector.name(), error = %e, "connector failed to stop");
                if first.is_none() {
                    first = Some(Report::new(RuntimeError::connector(connector.name(), e)));
                }
            }
        }
        first
    }
}

// ============================================================================
// Definition documents
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FlowModelRaw {
    #[serde(default)]
    model: BTreeMap<String, String>,
}

/// Schema, flows and pipelines of a service in one document:
///
/// ```toml
/// [model]
/// "user/username" = "string"
///
/// [flows.register]
/// in = [["user/username", "username"]]
///
/// [pipelines.register]
/// steps = [{ "@flow" = "register" }]
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MergedDefinitionRaw {
    #[serde(default)]
    model: BTreeMap<String, String>,
    #[serde(default)]
    flows: BTreeMap<String, FlowDefinitionRaw>,
    #[serde(default)]
    pipelines: BTreeMap<String, PipelineDefinitionRaw>,
}

// ============================================================================
// Container
// ============================================================================

pub struct Container {
    service: String,
    schema: Option<Arc<SchemaTree>>,
    functions: FunctionRegistry,
    flows: HashMap<String, Arc<Flow>>,
    pipelines: BTreeMap<String, Arc<Pipeline>>,
    connectors: ConnectorSet,
    generators: GeneratorRegistry,
    configure: NestedConfigureManager,
    dispatcher: Arc<dyn DispatchDecider>,
    /// Pipelines already injected into the dispatcher.
    injected: BTreeSet<String>,
    started: bool,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut flows: Vec<_> = self.flows.keys().collect();
        flows.sort();
        f.debug_struct("Container")
            .field("service", &self.service)
            .field("flows", &flows)
            .field("pipelines", &self.pipelines.keys().collect::<Vec<_>>())
            .field("connectors", &self.connectors)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl Container {
    pub fn new(
        service: impl Into<String>,
        generators: GeneratorRegistry,
        configure: NestedConfigureManager,
        dispatcher: Arc<dyn DispatchDecider>,
    ) -> Self {
        Self {
            service: service.into(),
            schema: None,
            functions: FunctionRegistry::with_builtins(),
            flows: HashMap::new(),
            pipelines: BTreeMap::new(),
            connectors: ConnectorSet::default(),
            generators,
            configure,
            dispatcher,
            injected: BTreeSet::new(),
            started: false,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn register_builtin_fn<F>(&mut self, name: &str, generator: F) -> DefinitionResult<()>
    where
        F: Fn(&[Value]) -> DefinitionResult<FlowFunction> + Send + Sync + 'static,
    {
        self.functions.register_builtin(name, generator)
    }

    pub fn register_custom_fn<F>(&mut self, name: &str, generator: F) -> DefinitionResult<()>
    where
        F: Fn(&[Value]) -> DefinitionResult<FlowFunction> + Send + Sync + 'static,
    {
        self.functions.register_custom(name, generator)
    }

    pub fn schema(&self) -> Option<&Arc<SchemaTree>> {
        self.schema.as_ref()
    }

    /// Adds the `[model]` table of `content` to the schema. Definitions loaded earlier keep
    /// the schema they were compiled against.
    pub fn load_flow_model(&mut self, content: &str) -> DefinitionResult<()> {
        let raw: FlowModelRaw = definition::parse_definition(content)
            .map_err(|r| r.attach(format!("flow model of {}", self.service)))?;
        self.add_model(&raw.model)
    }

    fn add_model(&mut self, model: &BTreeMap<String, String>) -> DefinitionResult<()> {
        if model.is_empty() {
            return Ok(());
        }
        let mut schema = self
            .schema
            .as_deref()
            .cloned()
            .unwrap_or_else(SchemaTree::new);
        schema
            .add_type_definitions(model)
            .map_err(|r| r.attach(format!("flow model of {}", self.service)))?;
        self.schema = Some(Arc::new(schema));
        Ok(())
    }

    pub fn load_flow(&mut self, name: &str, content: &str) -> DefinitionResult<()> {
        let raw: FlowDefinitionRaw = definition::parse_definition(content)
            .map_err(|r| r.attach(format!("flow {name}")))?;
        self.add_flow(name, &raw)
    }

    fn add_flow(&mut self, name: &str, raw: &FlowDefinitionRaw) -> DefinitionResult<()> {
        if self.flows.contains_key(name) {
            return Err(Report::new(DefinitionError::Duplicate(format!("flow {name}"))));
        }
        let flow = Flow::compile(name, raw, self.schema.as_deref(), &self.functions)?;
        debug!(container = %self.service, flow = name, "flow loaded");
        self.flows.insert(name.to_string(), Arc::new(flow));
        Ok(())
    }

    pub fn load_pipeline(&mut self, name: &str, content: &str) -> DefinitionResult<()> {
        let raw: PipelineDefinitionRaw = definition::parse_definition(content)
            .map_err(|r| r.attach(format!("pipeline {name}")))?;
        self.add_pipeline(name, &raw)
    }

    fn add_pipeline(&mut self, name: &str, raw: &PipelineDefinitionRaw) -> DefinitionResult<()> {
        if self.started {
            return Err(Report::new(DefinitionError::InvalidPipeline(format!(
                "container {} is running, cannot load pipeline {name}",
                self.service
            ))));
        }
        if self.pipelines.contains_key(name) {
            return Err(Report::new(DefinitionError::Duplicate(format!(
                "pipeline {name}"
            ))));
        }

        let models = self.model_factory();
        let registered = self.connectors.len();
        let mut ctx = PipelineContext {
            service: &self.service,
            flows: &self.flows,
            generators: &self.generators,
            configure: &self.configure,
            models: &models,
            connectors: &mut self.connectors,
        };
        match Pipeline::compile(name, raw, &mut ctx) {
            Ok(pipeline) => {
                debug!(
                    container = %self.service,
                    pipeline = pipeline.full_name(),
                    steps = pipeline.step_count(),
                    "pipeline loaded"
                );
                self.pipelines.insert(name.to_string(), Arc::new(pipeline));
                Ok(())
            }
            Err(report) => {
                self.connectors.truncate(registered);
                Err(report)
            }
        }
    }

    /// Loads a document holding `[model]`, `[flows.*]` and `[pipelines.*]`, in that order.
    pub fn load_merged(&mut self, content: &str) -> DefinitionResult<()> {
        let raw: MergedDefinitionRaw = definition::parse_definition(content)
            .map_err(|r| r.attach(format!("definitions of {}", self.service)))?;
        self.add_model(&raw.model)?;
        for (name, flow) in &raw.flows {
            self.add_flow(name, flow)?;
        }
        for (name, pipeline) in &raw.pipelines {
            self.add_pipeline(name, pipeline)?;
        }
        Ok(())
    }

    pub fn flow(&self, name: &str) -> Option<&Arc<Flow>> {
        self.flows.get(name)
    }

    pub fn pipeline(&self, name: &str) -> Option<&Arc<Pipeline>> {
        self.pipelines.get(name)
    }

    pub fn connectors(&self) -> &ConnectorSet {
        &self.connectors
    }

    pub fn model_factory(&self) -> ModelFactory {
        ModelFactory::new(self.schema.clone())
    }

    /// A fresh model bound to this container's schema.
    pub fn new_model(&self) -> ModelInstance {
        self.model_factory().new_model()
    }

    /// The process source connectors of `pipeline` are bound to.
    pub fn dispatch(&self, pipeline: &str) -> DefinitionResult<SharedProcess> {
        if !self.pipelines.contains_key(pipeline) {
            return Err(Report::new(DefinitionError::PipelineNotFound(
                pipeline.to_string(),
            )));
        }
        self.dispatcher
            .pipeline_dispatcher(&path::concat_full_pipeline_name(&self.service, pipeline))
    }

    /// Injects pipelines not yet known to the dispatcher and binds every source connector.
    /// Safe to repeat after a partial failure.
    fn wire(&mut self) -> DefinitionResult<()> {
        for (name, pipeline) in &self.pipelines {
            if !self.injected.contains(name) {
                self.dispatcher
                    .inject_local_pipeline(pipeline.full_name(), pipeline.to_pipeline_fn())?;
                self.injected.insert(name.clone());
            }
            for source in pipeline.source_connectors() {
                let dispatcher = self.dispatcher.pipeline_dispatcher(pipeline.full_name())?;
                source.bind(dispatcher).map_err(|e| {
                    Report::new(DefinitionError::Connector(e.to_string()))
                        .attach(format!("binding {} to {}", source.name(), pipeline.full_name()))
                })?;
            }
        }
        Ok(())
    }

    /// Wires pipelines into the dispatcher, then starts the dispatcher and the connectors.
    /// A failure stops whatever was already started.
    pub async fn start(&mut self) -> RuntimeResult<()> {
        if self.started {
            return Err(Report::new(RuntimeError::AlreadyStarted)
                .attach(format!("container {}", self.service)));
        }
        self.wire().map_err(|r| {
            r.change_context(RuntimeError::Definition)
                .attach(format!("container {}", self.service))
        })?;

        self.dispatcher
            .start_dispatcher()
            .await
            .map_err(|e| Report::new(RuntimeError::Dispatcher(e)))?;

        if let Err(report) = self.connectors.start_all().await {
            if let Err(e) = self.dispatcher.stop_dispatcher().await {
                warn!(container = %self.service, error = %e, "dispatcher failed to stop");
            }
            return Err(report.attach(format!("container {}", self.service)));
        }

        self.started = true;
        info!(
            container = %self.service,
            pipelines = self.pipelines.len(),
            connectors = self.connectors.len(),
            "container started"
        );
        Ok(())
    }

    /// Stops connectors newest first, then the dispatcher.
    pub async fn stop(&mut self) -> RuntimeResult<()> {
        if !self.started {
            return Err(Report::new(RuntimeError::NotStarted)
                .attach(format!("container {}", self.service)));
        }
        self.started = false;
        let connectors = self.connectors.stop_all().await;
        let dispatcher = self
            .dispatcher
            .stop_dispatcher()
            .await
            .map_err(|e| Report::new(RuntimeError::Dispatcher(e)));
        info!(container = %self.service, "container stopped");
        connectors.and(dispatcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{LocalFlowInvoker, SingleDispatchDecider};
    use crate::function::flow_function;
    use async_trait::async_trait;
    use fim_kernel::connector::{
        Connector, ConnectorError, ConnectorRequest, SourceConnectorGenerator,
    };
    use fim_kernel::model::DataInstance;
    use fim_kernel::PrimitiveValue;
    use parking_lot::Mutex;
    use serde_json::json;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct JournalSource {
        name: String,
        fail_start: bool,
        refused_binds: Mutex<u32>,
        journal: Journal,
        process: Mutex<Option<SharedProcess>>,
    }

    #[async_trait]
    impl Connector for JournalSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&self) -> ConnectorResult<()> {
            if self.fail_start {
                return Err(ConnectorError::Other("refused".into()));
            }
            self.journal.lock().push(format!("start {}", self.name));
            Ok(())
        }

        async fn stop(&self) -> ConnectorResult<()> {
            self.journal.lock().push(format!("stop {}", self.name));
            Ok(())
        }
    }

    impl SourceConnector for JournalSource {
        fn bind(&self, process: SharedProcess) -> ConnectorResult<()> {
            let mut refused = self.refused_binds.lock();
            if *refused > 0 {
                *refused -= 1;
                return Err(ConnectorError::Other("bind refused".into()));
            }
            *self.process.lock() = Some(process);
            Ok(())
        }
    }

    struct JournalGenerator {
        journal: Journal,
    }

    impl SourceConnectorGenerator for JournalGenerator {
        fn generator_names(&self) -> Vec<String> {
            vec!["journal".into()]
        }

        fn generate_source_connector(
            &self,
            request: ConnectorRequest,
        ) -> ConnectorResult<Arc<dyn SourceConnector>> {
            Ok(Arc::new(JournalSource {
                name: request.instance_name.clone(),
                fail_start: request.option("fail") == Some("true"),
                refused_binds: Mutex::new(
                    request
                        .option("refuse_binds")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0),
                ),
                journal: self.journal.clone(),
                process: Mutex::new(None),
            }))
        }
    }

    fn container(journal: &Journal) -> Container {
        let mut generators = GeneratorRegistry::new();
        generators
            .add_source(Arc::new(JournalGenerator {
                journal: journal.clone(),
            }))
            .unwrap();
        Container::new(
            "svc",
            generators,
            NestedConfigureManager::new(),
            Arc::new(SingleDispatchDecider::with_invoker(Arc::new(
                LocalFlowInvoker::new(),
            ))),
        )
    }

    const DEFINITIONS: &str = r#"
        [model]
        "user/username" = "string"
        "user/user_id" = "int"

        [flows.register]
        in = [["user/username", "username"]]
        out = [["user_id", "user/user_id"]]
        steps = [{ "@assign" = ["user_id", 123] }]

        [pipelines.register]
        steps = [{ "@flow" = "register" }]
        source_connectors = [
            { "@connector" = "journal", "@mapping" = "m", "@name" = "first" },
            { "@connector" = "journal", "@mapping" = "m", "@name" = "second" },
        ]

        [pipelines.register.connector_mapping.m]
    "#;

    #[tokio::test]
    async fn test_merged_definitions_end_to_end() {
        let journal = Journal::default();
        let mut container = container(&journal);
        container.load_merged(DEFINITIONS).unwrap();
        assert!(container.flow("register").is_some());
        assert_eq!(container.connectors().names(), vec!["first", "second"]);

        container.start().await.unwrap();
        assert_eq!(*journal.lock(), vec!["start first", "start second"]);

        let mut model = container.new_model();
        model
            .add_or_update_field("user/username", Some("alice".into()))
            .unwrap();
        container
            .dispatch("register")
            .unwrap()
            .process(&mut model)
            .await
            .unwrap();
        assert_eq!(model.get_field("user/user_id"), Some(PrimitiveValue::Int(123)));

        container.stop().await.unwrap();
        assert_eq!(
            journal.lock()[2..],
            ["stop second".to_string(), "stop first".to_string()]
        );
    }

    #[tokio::test]
    async fn test_start_unwinds_on_connector_failure() {
        let journal = Journal::default();
        let mut container = container(&journal);
        container
            .load_pipeline(
                "p",
                r#"
                source_connectors = [
                    { "@connector" = "journal", "@mapping" = "m", "@name" = "ok" },
                    { "@connector" = "journal", "@mapping" = "m", "@name" = "bad", fail = true },
                ]
                [connector_mapping.m]
                "#,
            )
            .unwrap();

        let err = container.start().await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            RuntimeError::Connector { name, .. } if name == "bad"
        ));
        assert_eq!(*journal.lock(), vec!["start ok", "stop ok"]);
        assert!(!container.is_started());
    }

    #[test]
    fn test_failed_pipeline_releases_its_connectors() {
        let journal = Journal::default();
        let mut container = container(&journal);
        let err = container
            .load_pipeline(
                "p",
                r#"
                source_connectors = [{ "@connector" = "journal", "@mapping" = "m" }]
                steps = [{ "@flow" = "missing" }]
                [connector_mapping.m]
                "#,
            )
            .unwrap_err();
        assert!(matches!(err.current_context(), DefinitionError::FlowNotFound(_)));
        assert!(container.connectors().is_empty());
        assert!(container.pipeline("p").is_none());
    }

    #[test]
    fn test_duplicate_source_connector_name() {
        let journal = Journal::default();
        let mut container = container(&journal);
        let err = container
            .load_pipeline(
                "p",
                r#"
                source_connectors = [
                    { "@connector" = "journal", "@mapping" = "m", "@name" = "same" },
                    { "@connector" = "journal", "@mapping" = "m", "@name" = "same" },
                ]
                [connector_mapping.m]
                "#,
            )
            .unwrap_err();
        assert!(matches!(err.current_context(), DefinitionError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_custom_function_and_schema_checks() {
        let journal = Journal::default();
        let mut container = container(&journal);
        container
            .register_custom_fn("#shout", |_: &[Value]| {
                Ok(flow_function(|m| {
                    let name = m.get_field("name").and_then(|v| v.as_str().map(str::to_uppercase));
                    m.add_or_update_field("name", name.map(PrimitiveValue::from))?;
                    Ok(())
                }))
            })
            .unwrap();
        container
            .load_flow_model(r#"model = { "user/username" = "string", "user/age" = "int" }"#)
            .unwrap();
        container
            .load_flow(
                "shout",
                r##"
                in = [["user/username", "name"]]
                out = [["name", "user/username"]]
                steps = [{ "#shout" = [] }]
                "##,
            )
            .unwrap();
        container
            .load_pipeline("p", r#"steps = [{ "@flow" = "shout" }]"#)
            .unwrap();
        container.start().await.unwrap();

        let mut model = container.new_model();
        model
            .add_or_update_field("user/username", Some("bob".into()))
            .unwrap();
        container
            .dispatch("p")
            .unwrap()
            .process(&mut model)
            .await
            .unwrap();
        assert_eq!(model.to_general_object(), json!({"user": {"username": "BOB"}}));

        assert!(matches!(
            model.add_or_update_field("user/age", Some("old".into())),
            Err(fim_kernel::model::ModelError::TypeMismatch { .. })
        ));
        let err = container
            .load_flow("bad", r#"in = [["user/nickname", "n"]]"#)
            .unwrap_err();
        assert!(matches!(err.current_context(), DefinitionError::UndeclaredPath(_)));
        assert!(container.dispatch("missing").is_err());
        container.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_state() {
        let journal = Journal::default();
        let mut container = container(&journal);
        assert!(matches!(
            container.stop().await.unwrap_err().current_context(),
            RuntimeError::NotStarted
        ));
        container.start().await.unwrap();
        assert!(matches!(
            container.start().await.unwrap_err().current_context(),
            RuntimeError::AlreadyStarted
        ));
        assert!(container
            .load_pipeline("late", "steps = []")
            .is_err());
        container.stop().await.unwrap();

        // a stopped container restarts without wiring its pipelines twice
        container.start().await.unwrap();
        container.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_retries_after_failed_wiring() {
        let journal = Journal::default();
        let mut container = container(&journal);
        container
            .load_pipeline(
                "a",
                r#"
                steps = []
                source_connectors = [{ "@connector" = "journal", "@mapping" = "m", "@name" = "a-in" }]
                [connector_mapping.m]
                "#,
            )
            .unwrap();
        container
            .load_pipeline(
                "b",
                r#"
                steps = []
                source_connectors = [
                    { "@connector" = "journal", "@mapping" = "m", "@name" = "b-in", refuse_binds = 1 },
                ]
                [connector_mapping.m]
                "#,
            )
            .unwrap();

        let err = container.start().await.unwrap_err();
        assert!(matches!(err.current_context(), RuntimeError::Definition));
        assert!(!container.is_started());
        assert!(journal.lock().is_empty());

        container.start().await.unwrap();
        assert_eq!(*journal.lock(), vec!["start a-in", "start b-in"]);
        container.dispatch("a").unwrap();
        container.stop().await.unwrap();

        container.load_pipeline("c", "steps = []").unwrap();
        container.start().await.unwrap();
        let mut model = container.new_model();
        container
            .dispatch("c")
            .unwrap()
            .process(&mut model)
            .await
            .unwrap();
        container.stop().await.unwrap();
    }
}
