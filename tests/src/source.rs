use crate::{OPTION_FAIL_START, start_failure};
use async_trait::async_trait;
use fim_kernel::connector::{
    Connector, ConnectorError, ConnectorRequest, ConnectorResult, MappingDefinition, ResolvedError,
    SharedProcess, SourceConnector, SourceConnectorGenerator, SubGeneratorRequest,
};
use fim_kernel::model::{DataInstance, ModelFactory, ModelInstance, ReadonlyInstance};
use fim_kernel::{ProcessError, ProcessResult};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// What a protocol connector would send back.
#[derive(Debug, Clone, PartialEq)]
pub struct MockResponse {
    pub status: u16,
    pub body: Value,
    /// Set when the pipeline failed.
    pub error: Option<ResolvedError>,
}

impl MockResponse {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Inbound connector driven by [`Self::trigger`].
#[derive(Clone)]
pub struct MockSourceConnector {
    name: String,
    options: BTreeMap<String, String>,
    definition: Arc<MappingDefinition>,
    models: ModelFactory,
    process: Arc<RwLock<Option<SharedProcess>>>,
    running: Arc<RwLock<bool>>,
    /// Payloads received by [`Self::trigger`], in order
    pub call_history: Arc<RwLock<Vec<Value>>>,
}

impl MockSourceConnector {
    pub fn new(request: ConnectorRequest) -> Self {
        Self {
            name: request.instance_name,
            options: request.options,
            definition: request.definition,
            models: request.models,
            process: Arc::new(RwLock::new(None)),
            running: Arc::new(RwLock::new(false)),
            call_history: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.name
    }

    /// Options after `configure-static://` resolution.
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn history(&self) -> Vec<Value> {
        self.call_history.read().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.call_history.read().await.len()
    }

    /// Runs one unit of work: request mapping, the bound process, then the response mapping
    /// or the error table. Fails only when the connector cannot accept work at all.
    pub async fn trigger(&self, payload: Value) -> ProcessResult<MockResponse> {
        self.call_history.write().await.push(payload.clone());
        if !self.is_running().await {
            return Err(ProcessError::Connector(format!("{} is not running", self.name)));
        }
        let process = self
            .process
            .read()
            .await
            .clone()
            .ok_or_else(|| ProcessError::Connector(format!("{} is not bound", self.name)))?;

        let request = ReadonlyInstance::from_value(payload)?;
        let mut model = self.models.new_model();
        self.definition
            .req
            .transfer(request.source(), model.root_mut())?;

        let mut response = ModelInstance::new();
        match process.process(&mut model).await {
            Ok(()) => {
                self.definition
                    .res
                    .transfer(model.source(), response.root_mut())?;
                Ok(MockResponse {
                    status: 200,
                    body: response.to_general_object(),
                    error: None,
                })
            }
            Err(err) => {
                let resolved = self.definition.write_error(&err, &mut response)?;
                Ok(MockResponse {
                    status: resolved.status,
                    body: response.to_general_object(),
                    error: Some(resolved),
                })
            }
        }
    }
}

#[async_trait]
impl Connector for MockSourceConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> ConnectorResult<()> {
        if self.options.get(OPTION_FAIL_START).map(String::as_str) == Some("true") {
            return Err(start_failure(&self.name));
        }
        *self.running.write().await = true;
        Ok(())
    }

    async fn stop(&self) -> ConnectorResult<()> {
        *self.running.write().await = false;
        Ok(())
    }
}

impl SourceConnector for MockSourceConnector {
    fn bind(&self, process: SharedProcess) -> ConnectorResult<()> {
        let mut slot = self
            .process
            .try_write()
            .map_err(|_| ConnectorError::Other(format!("{} is busy", self.name)))?;
        *slot = Some(process);
        Ok(())
    }
}

/// Generates [`MockSourceConnector`]s and keeps a handle to each of them.
#[derive(Clone)]
pub struct MockSourceGenerator {
    names: Vec<String>,
    defaults: BTreeMap<String, String>,
    connectors: Arc<Mutex<Vec<MockSourceConnector>>>,
}

impl MockSourceGenerator {
    pub fn new(name: &str) -> Self {
        Self {
            names: vec![name.to_string()],
            defaults: BTreeMap::new(),
            connectors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The connector generated under `instance_name`, if any.
    pub fn connector(&self, instance_name: &str) -> Option<MockSourceConnector> {
        self.connectors
            .lock()
            .iter()
            .find(|c| c.name == instance_name)
            .cloned()
    }

    pub fn connectors(&self) -> Vec<MockSourceConnector> {
        self.connectors.lock().clone()
    }
}

#[async_trait]
impl SourceConnectorGenerator for MockSourceGenerator {
    fn generator_names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn generate_source_connector(
        &self,
        mut request: ConnectorRequest,
    ) -> ConnectorResult<Arc<dyn SourceConnector>> {
        for (key, value) in &self.defaults {
            request
                .options
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        let connector = MockSourceConnector::new(request);
        self.connectors.lock().push(connector.clone());
        Ok(Arc::new(connector))
    }

    /// Derives a generator whose connectors default to the given options. Generated
    /// connectors stay visible through the parent.
    fn initialize_sub_generator(
        &self,
        request: SubGeneratorRequest,
    ) -> ConnectorResult<Arc<dyn SourceConnectorGenerator>> {
        let mut defaults = self.defaults.clone();
        defaults.extend(request.options);
        Ok(Arc::new(Self {
            names: vec![request.name],
            defaults,
            connectors: self.connectors.clone(),
        }))
    }
}
