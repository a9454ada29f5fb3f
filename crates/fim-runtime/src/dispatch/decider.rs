use async_trait::async_trait;
use error_stack::Report;
use fim_kernel::connector::{PipelineProcess, SharedProcess};
use fim_kernel::dispatch::{DispatchDecider, FlowInvoker};
use fim_kernel::model::ModelInstance;
use fim_kernel::{DefinitionError, DefinitionResult, ProcessError, ProcessResult};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

/// Sends every pipeline through the one configured invoker.
#[derive(Default)]
pub struct SingleDispatchDecider {
    invoker: RwLock<Option<Arc<dyn FlowInvoker>>>,
}

impl SingleDispatchDecider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_invoker(invoker: Arc<dyn FlowInvoker>) -> Self {
        Self {
            invoker: RwLock::new(Some(invoker)),
        }
    }

    fn invoker(&self) -> Option<Arc<dyn FlowInvoker>> {
        self.invoker.read().clone()
    }

    fn require_invoker(&self) -> DefinitionResult<Arc<dyn FlowInvoker>> {
        self.invoker().ok_or_else(|| {
            Report::new(DefinitionError::MissingConfiguration("flow invoker".into()))
        })
    }
}

#[async_trait]
impl DispatchDecider for SingleDispatchDecider {
    fn add_flow_invoker(&self, invoker: Arc<dyn FlowInvoker>) -> DefinitionResult<()> {
        let mut slot = self.invoker.write();
        if let Some(existing) = slot.as_ref() {
            return Err(Report::new(DefinitionError::Duplicate(format!(
                "flow invoker (already using {})",
                existing.metadata().name()
            ))));
        }
        *slot = Some(invoker);
        Ok(())
    }

    fn inject_local_pipeline(&self, full_name: &str, process: SharedProcess) -> DefinitionResult<()> {
        self.require_invoker()?.add_pipeline(full_name, process)
    }

    fn pipeline_dispatcher(&self, full_name: &str) -> DefinitionResult<SharedProcess> {
        Ok(Arc::new(Dispatch {
            full_name: full_name.to_string(),
            invoker: self.require_invoker()?,
        }))
    }

    async fn start_dispatcher(&self) -> ProcessResult<()> {
        let invoker = self
            .invoker()
            .ok_or_else(|| ProcessError::Internal("no flow invoker configured".into()))?;
        let meta = invoker.metadata();
        invoker.start().await?;
        info!(invoker = meta.name(), remote = meta.remote(), "dispatcher started");
        Ok(())
    }

    async fn stop_dispatcher(&self) -> ProcessResult<()> {
        match self.invoker() {
            Some(invoker) => invoker.stop().await,
            None => Ok(()),
        }
    }
}

/// What a source connector is bound to: a pipeline name resolved through the invoker on
/// every call.
struct Dispatch {
    full_name: String,
    invoker: Arc<dyn FlowInvoker>,
}

#[async_trait]
impl PipelineProcess for Dispatch {
    async fn process(&self, model: &mut ModelInstance) -> ProcessResult<()> {
        self.invoker.invoke(&self.full_name, model).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::LocalFlowInvoker;
    use fim_kernel::PrimitiveValue;
    use fim_kernel::connector::sync_process;
    use fim_kernel::model::DataInstance;

    #[tokio::test]
    async fn test_dispatcher_routes_to_injected_pipeline() {
        let decider = SingleDispatchDecider::new();
        decider
            .add_flow_invoker(Arc::new(LocalFlowInvoker::new()))
            .unwrap();
        decider
            .inject_local_pipeline(
                "svc/p",
                sync_process(|m| {
                    m.add_or_update_field("hit", Some(PrimitiveValue::Int(1)))?;
                    Ok(())
                }),
            )
            .unwrap();
        decider.start_dispatcher().await.unwrap();

        let dispatcher = decider.pipeline_dispatcher("svc/p").unwrap();
        let mut model = ModelInstance::new();
        dispatcher.process(&mut model).await.unwrap();
        assert_eq!(model.get_field("hit"), Some(PrimitiveValue::Int(1)));

        let missing = decider.pipeline_dispatcher("svc/none").unwrap();
        assert!(matches!(
            missing.process(&mut model).await,
            Err(ProcessError::PipelineNotFound(_))
        ));
    }

    #[test]
    fn test_single_invoker_only() {
        let decider = SingleDispatchDecider::with_invoker(Arc::new(LocalFlowInvoker::new()));
        let err = decider
            .add_flow_invoker(Arc::new(LocalFlowInvoker::new()))
            .unwrap_err();
        assert!(matches!(err.current_context(), DefinitionError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_missing_invoker() {
        let decider = SingleDispatchDecider::new();
        let err = decider
            .inject_local_pipeline("svc/p", sync_process(|_| Ok(())))
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            DefinitionError::MissingConfiguration(_)
        ));
        assert!(decider.start_dispatcher().await.is_err());
        assert!(decider.stop_dispatcher().await.is_ok());
    }
}
