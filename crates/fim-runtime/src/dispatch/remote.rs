//! Pipeline invocation over request/reply messaging.
//!
//! The subject of a request is the pipeline's full name. Models travel as JSON objects. A failed
//! reply carries the [`HEADER_ERROR_CODE`] header:
//!
//! | code   | payload                     |
//! |--------|-----------------------------|
//! | `9999` | JSON [`FlowError`]          |
//! | `9998` | JSON [`FlowStop`]           |
//! | other  | empty, see [`HEADER_ERROR`] |

use async_trait::async_trait;
use error_stack::Report;
use fim_kernel::bus::{
    BusError, HEADER_ERROR, HEADER_ERROR_CODE, MessageEnvelope, RequestHandler, RequestReplyBus,
};
use fim_kernel::connector::SharedProcess;
use fim_kernel::dispatch::{FlowInvoker, FlowInvokerMeta};
use fim_kernel::model::ModelInstance;
use fim_kernel::{
    DefinitionError, DefinitionResult, FlowError, FlowStop, ProcessError, ProcessResult,
};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const BUS_INVOKER: &str = "bus";

pub const CODE_FLOW_ERROR: &str = "9999";
pub const CODE_FLOW_STOP: &str = "9998";
pub const CODE_INTERNAL_ERROR: &str = "500";

/// Invokes pipelines on whichever node serves them, and serves the pipelines of this node.
pub struct BusFlowInvoker {
    node_id: String,
    bus: Arc<dyn RequestReplyBus>,
    timeout: Duration,
    pipelines: RwLock<BTreeMap<String, SharedProcess>>,
    served: Mutex<Vec<String>>,
}

impl BusFlowInvoker {
    pub fn new(bus: Arc<dyn RequestReplyBus>, timeout: Duration) -> Self {
        Self {
            node_id: uuid::Uuid::now_v7().to_string(),
            bus,
            timeout,
            pipelines: RwLock::new(BTreeMap::new()),
            served: Mutex::new(Vec::new()),
        }
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn unserve_all(&self) {
        let served = std::mem::take(&mut *self.served.lock());
        for subject in served.iter().rev() {
            if let Err(e) = self.bus.unserve(subject).await {
                warn!(subject = %subject, error = %e, "failed to unserve pipeline");
            }
        }
    }
}

#[async_trait]
impl FlowInvoker for BusFlowInvoker {
    fn metadata(&self) -> FlowInvokerMeta {
        FlowInvokerMeta::new(BUS_INVOKER, true)
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
        let request = MessageEnvelope::new(&self.node_id, model.encode()?).with_subject(full_name);
        let reply = match self.bus.request(full_name, request, self.timeout).await {
            Ok(reply) => reply,
            Err(BusError::Timeout { .. }) => return Err(ProcessError::Timeout(self.timeout)),
            Err(e) => return Err(e.into()),
        };

        if let Some(code) = reply.error_code() {
            return Err(reply_error(code, &reply));
        }
        let result = ModelInstance::decode(&reply.payload)?;
        model.root_mut().merge_from(result.root())?;
        Ok(())
    }

    async fn start(&self) -> ProcessResult<()> {
        let pipelines: Vec<_> = self
            .pipelines
            .read()
            .iter()
            .map(|(name, process)| (name.clone(), process.clone()))
            .collect();

        for (full_name, process) in pipelines {
            let handler = Arc::new(PipelineHandler::new(&self.node_id, &full_name, process));
            if let Err(e) = self.bus.serve(&full_name, handler).await {
                self.unserve_all().await;
                return Err(e.into());
            }
            self.served.lock().push(full_name);
        }
        info!(
            node = %self.node_id,
            pipelines = self.served.lock().len(),
            "serving pipelines over bus"
        );
        Ok(())
    }

    async fn stop(&self) -> ProcessResult<()> {
        self.unserve_all().await;
        Ok(())
    }
}

/// Serves one pipeline. Panics in the pipeline become [`CODE_INTERNAL_ERROR`] replies.
pub struct PipelineHandler {
    node_id: String,
    full_name: String,
    process: SharedProcess,
}

impl PipelineHandler {
    pub fn new(node_id: &str, full_name: &str, process: SharedProcess) -> Self {
        Self {
            node_id: node_id.to_string(),
            full_name: full_name.to_string(),
            process,
        }
    }

    async fn run(&self, payload: &[u8]) -> ProcessResult<Vec<u8>> {
        let mut model = ModelInstance::decode(payload)?;
        self.process.process(&mut model).await?;
        Ok(model.encode()?)
    }

    fn failure(&self, request: &MessageEnvelope, err: &ProcessError) -> MessageEnvelope {
        let (code, payload) = match err {
            ProcessError::Flow(e) => (CODE_FLOW_ERROR, serde_json::to_vec(e)),
            ProcessError::Stop(s) => (CODE_FLOW_STOP, serde_json::to_vec(s)),
            _ => {
                warn!(pipeline = %self.full_name, error = %err, "remote pipeline failed");
                (CODE_INTERNAL_ERROR, Ok(Vec::new()))
            }
        };
        match payload {
            Ok(payload) => {
                MessageEnvelope::error_reply(request, &self.node_id, code, &err.to_string(), payload)
            }
            Err(e) => MessageEnvelope::error_reply(
                request,
                &self.node_id,
                CODE_INTERNAL_ERROR,
                &e.to_string(),
                Vec::new(),
            ),
        }
    }
}

#[async_trait]
impl RequestHandler for PipelineHandler {
    async fn handle(&self, request: MessageEnvelope) -> MessageEnvelope {
        let outcome = AssertUnwindSafe(self.run(&request.payload))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(payload)) => MessageEnvelope::reply_to(&request, &self.node_id, payload),
            Ok(Err(err)) => {
                debug!(pipeline = %self.full_name, error = %err, "remote invocation failed");
                self.failure(&request, &err)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(pipeline = %self.full_name, panic = %message, "pipeline panicked");
                MessageEnvelope::error_reply(
                    &request,
                    &self.node_id,
                    CODE_INTERNAL_ERROR,
                    &format!("pipeline panicked: {message}"),
                    Vec::new(),
                )
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn reply_error(code: &str, reply: &MessageEnvelope) -> ProcessError {
    let decoded = match code {
        CODE_FLOW_ERROR => serde_json::from_slice::<FlowError>(&reply.payload).map(ProcessError::from),
        CODE_FLOW_STOP => serde_json::from_slice::<FlowStop>(&reply.payload).map(ProcessError::from),
        _ => {
            return ProcessError::Remote(format!(
                "{code}:{}",
                reply.header(HEADER_ERROR).unwrap_or_default()
            ));
        }
    };
    decoded.unwrap_or_else(|e| {
        ProcessError::Remote(format!("{code}:undecodable error payload: {e}"))
    })
}
