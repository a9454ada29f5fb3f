use async_trait::async_trait;
use error_stack::Report;
use fim_kernel::connector::SharedProcess;
use fim_kernel::dispatch::{FlowInvoker, FlowInvokerMeta};
use fim_kernel::model::ModelInstance;
use fim_kernel::{DefinitionError, DefinitionResult, ProcessError, ProcessResult};
use parking_lot::RwLock;
use std::collections::HashMap;

pub const LOCAL_INVOKER: &str = "local";

/// In-process pipeline table.
#[derive(Default)]
pub struct LocalFlowInvoker {
    pipelines: RwLock<HashMap<String, SharedProcess>>,
}

impl LocalFlowInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pipelines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.read().is_empty()
    }
}

#[async_trait]
impl FlowInvoker for LocalFlowInvoker {
    fn metadata(&self) -> FlowInvokerMeta {
        FlowInvokerMeta::new(LOCAL_INVOKER, false)
    }

    fn add_pipeline(&self, full_name: &str, process: SharedProcess) -> DefinitionResult<()> {
        let mut pipelines = self.pipelines.write();
        if pipelines.contains_key(full_name) {
            return Err(Report::new(DefinitionError::Duplicate(format!(
                "pipeline {full_name}"
            ))));
        }
        pipelines.insert(full_name.to_string(), process);
        Ok(())
    }

    async fn invoke(&self, full_name: &str, model: &mut ModelInstance) -> ProcessResult<()> {
        let process = self
            .pipelines
            .read()
            .get(full_name)
            .cloned()
            .ok_or_else(|| ProcessError::PipelineNotFound(full_name.to_string()))?;
        process.process(model).await
    }

    async fn start(&self) -> ProcessResult<()> {
        Ok(())
    }

    async fn stop(&self) -> ProcessResult<()> {
        Ok(())
    }
}
