use crate::{OPTION_FAIL_START, start_failure};
use async_trait::async_trait;
use fim_kernel::connector::{
    Connector, ConnectorRequest, ConnectorResult, MappingDefinition, TargetConnector,
    TargetConnectorGenerator,
};
use fim_kernel::model::{DataInstance, ModelInstance, ReadonlyInstance};
use fim_kernel::{FlowError, ProcessResult};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Outbound connector that records every request and answers with a stubbed reply.
///
/// The request is the step's model put through the `req` mapping; the reply is written back
/// through the `res` mapping.
#[derive(Clone)]
pub struct MockTargetConnector {
    name: String,
    options: BTreeMap<String, String>,
    definition: Arc<MappingDefinition>,
    /// Reply returned by every invocation
    pub stubbed_reply: Arc<RwLock<Value>>,
    /// When set, invocations fail with this error instead of replying
    pub stubbed_error: Arc<RwLock<Option<FlowError>>>,
    /// Requests received, in order
    pub call_history: Arc<RwLock<Vec<Value>>>,
}

impl MockTargetConnector {
    pub fn new(request: ConnectorRequest) -> Self {
        Self {
            name: request.instance_name,
            options: request.options,
            definition: request.definition,
            stubbed_reply: Arc::new(RwLock::new(json!({}))),
            stubbed_error: Arc::new(RwLock::new(None)),
            call_history: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    pub async fn set_reply(&self, reply: Value) {
        *self.stubbed_reply.write().await = reply;
    }

    pub async fn set_error(&self, error: FlowError) {
        *self.stubbed_error.write().await = Some(error);
    }

    pub async fn history(&self) -> Vec<Value> {
        self.call_history.read().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.call_history.read().await.len()
    }
}

#[async_trait]
impl Connector for MockTargetConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> ConnectorResult<()> {
        if self.options.get(OPTION_FAIL_START).map(String::as_str) == Some("true") {
            return Err(start_failure(&self.name));
        }
        Ok(())
    }

    async fn stop(&self) -> ConnectorResult<()> {
        Ok(())
    }
}

#[async_trait]
impl TargetConnector for MockTargetConnector {
    async fn invoke_flow(
        &self,
        source: &dyn DataInstance,
        destination: &mut dyn DataInstance,
    ) -> ProcessResult<()> {
        let mut request = ModelInstance::new();
        self.definition
            .req
            .transfer(source.source(), request.root_mut())?;
        debug!(connector = %self.name, request = %request.to_general_object(), "invoked");
        self.call_history
            .write()
            .await
            .push(request.to_general_object());

        if let Some(error) = self.stubbed_error.read().await.clone() {
            return Err(error.into());
        }
        let reply = ReadonlyInstance::from_value(self.stubbed_reply.read().await.clone())?;
        self.definition.res.transfer(reply.source(), destination.target()?)?;
        Ok(())
    }
}

/// Generates [`MockTargetConnector`]s. Instances sharing a name are generated once.
#[derive(Clone)]
pub struct MockTargetGenerator {
    names: Vec<String>,
    connectors: Arc<Mutex<Vec<MockTargetConnector>>>,
}

impl MockTargetGenerator {
    pub fn new(name: &str) -> Self {
        Self {
            names: vec![name.to_string()],
            connectors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn connector(&self, instance_name: &str) -> Option<MockTargetConnector> {
        self.connectors
            .lock()
            .iter()
            .find(|c| c.name == instance_name)
            .cloned()
    }

    pub fn connectors(&self) -> Vec<MockTargetConnector> {
        self.connectors.lock().clone()
    }
}

#[async_trait]
impl TargetConnectorGenerator for MockTargetGenerator {
    fn generator_names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn generate_target_connector(
        &self,
        request: ConnectorRequest,
    ) -> ConnectorResult<Arc<dyn TargetConnector>> {
        let mut connectors = self.connectors.lock();
        if let Some(existing) = connectors.iter().find(|c| c.name == request.instance_name) {
            return Ok(Arc::new(existing.clone()));
        }
        let connector = MockTargetConnector::new(request);
        connectors.push(connector.clone());
        Ok(Arc::new(connector))
    }
}
