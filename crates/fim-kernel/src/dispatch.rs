//! Dispatch contracts.
//!
//! A container never binds its source connectors to a compiled pipeline directly. It injects
//! the pipeline into a [`DispatchDecider`] and binds the connectors to the dispatcher returned
//! by [`DispatchDecider::pipeline_dispatcher`], which decides whether the call runs in-process
//! or on another node.

use crate::connector::SharedProcess;
use crate::error::{DefinitionResult, ProcessResult};
use crate::model::ModelInstance;
use async_trait::async_trait;
use std::sync::Arc;

/// Describes a flow invoker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowInvokerMeta {
    name: String,
    remote: bool,
}

impl FlowInvokerMeta {
    pub fn new(name: impl Into<String>, remote: bool) -> Self {
        Self {
            name: name.into(),
            remote,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remote(&self) -> bool {
        self.remote
    }
}

/// Executes pipelines by full name (`service/pipeline`).
#[async_trait]
pub trait FlowInvoker: Send + Sync + 'static {
    fn metadata(&self) -> FlowInvokerMeta;

    /// Registers a pipeline served by this node. Duplicates are rejected.
    fn add_pipeline(&self, full_name: &str, process: SharedProcess) -> DefinitionResult<()>;

    async fn invoke(&self, full_name: &str, model: &mut ModelInstance) -> ProcessResult<()>;

    /// Called once every pipeline has been added.
    async fn start(&self) -> ProcessResult<()>;

    async fn stop(&self) -> ProcessResult<()>;
}

/// Routes pipeline invocations to flow invokers.
#[async_trait]
pub trait DispatchDecider: Send + Sync + 'static {
    fn add_flow_invoker(&self, invoker: Arc<dyn FlowInvoker>) -> DefinitionResult<()>;

    fn inject_local_pipeline(&self, full_name: &str, process: SharedProcess)
    -> DefinitionResult<()>;

    /// Process that source connectors bind to in place of the pipeline itself.
    fn pipeline_dispatcher(&self, full_name: &str) -> DefinitionResult<SharedProcess>;

    async fn start_dispatcher(&self) -> ProcessResult<()>;

    async fn stop_dispatcher(&self) -> ProcessResult<()>;
}
