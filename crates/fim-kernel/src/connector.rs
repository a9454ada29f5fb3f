//! Connector contracts.
//!
//! Source connectors turn inbound work (HTTP requests, scheduled jobs, subscriptions) into
//! pipeline invocations; target connectors perform outbound I/O as a pipeline step. Both are
//! produced by generators registered with the application and receive a compiled
//! [`MappingDefinition`] describing how to shape their request and response.

use crate::error::{DefinitionError, DefinitionResult, ProcessError, ProcessResult};
use crate::mapping::{MappingRuleRaw, ModelConverter};
use crate::model::{DataInstance, ModelFactory, ModelInstance, ModelResult, PrimitiveValue};
use crate::path;
use async_trait::async_trait;
use error_stack::Report;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Status reported for failures that have no entry in the error table.
pub const DEFAULT_ERROR_STATUS: u16 = 500;

/// Errors raised by connectors and generators outside of a pipeline invocation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectorError {
    #[error("connector {0} has no bound process")]
    NotBound(String),

    #[error("connector {0} is already bound")]
    AlreadyBound(String),

    #[error("invalid option `{option}` for {name}: {reason}")]
    InvalidOption {
        name: String,
        option: String,
        reason: String,
    },

    #[error("generator {0} does not support sub generators")]
    SubGeneratorUnsupported(String),

    #[error("failed to start {name}: {reason}")]
    Start { name: String, reason: String },

    #[error("failed to stop {name}: {reason}")]
    Stop { name: String, reason: String },

    #[error("{0}")]
    Other(String),
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// A compiled pipeline (or a dispatcher standing in for one).
#[async_trait]
pub trait PipelineProcess: Send + Sync + 'static {
    async fn process(&self, model: &mut ModelInstance) -> ProcessResult<()>;
}

pub type SharedProcess = Arc<dyn PipelineProcess>;

/// Adapts a synchronous closure into a [`PipelineProcess`].
pub struct FnProcess<F>(F);

#[async_trait]
impl<F> PipelineProcess for FnProcess<F>
where
    F: Fn(&mut ModelInstance) -> ProcessResult<()> + Send + Sync + 'static,
{
    async fn process(&self, model: &mut ModelInstance) -> ProcessResult<()> {
        (self.0)(model)
    }
}

pub fn sync_process<F>(f: F) -> SharedProcess
where
    F: Fn(&mut ModelInstance) -> ProcessResult<()> + Send + Sync + 'static,
{
    Arc::new(FnProcess(f))
}

/// Lifecycle shared by every connector instance.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Instance name, unique within a container.
    fn name(&self) -> &str;

    async fn start(&self) -> ConnectorResult<()>;

    async fn stop(&self) -> ConnectorResult<()>;
}

/// Inbound side of a pipeline.
///
/// Implementations invoke the bound process exactly once per unit of work with a fresh model
/// and translate flow errors and flow stops through [`MappingDefinition::resolve_error`].
pub trait SourceConnector: Connector {
    fn bind(&self, process: SharedProcess) -> ConnectorResult<()>;
}

/// Outbound pipeline step.
#[async_trait]
pub trait TargetConnector: Connector {
    async fn invoke_flow(
        &self,
        source: &dyn DataInstance,
        destination: &mut dyn DataInstance,
    ) -> ProcessResult<()>;
}

/// One entry of the simple error table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMapping {
    /// Path the error message is written to.
    pub message: String,
    #[serde(default = "default_status")]
    pub status: u16,
}

fn default_status() -> u16 {
    DEFAULT_ERROR_STATUS
}

/// Connector mapping as declared under `connector_mapping.<name>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingDefinitionRaw {
    #[serde(default)]
    pub req: MappingRuleRaw,
    #[serde(default)]
    pub res: MappingRuleRaw,
    #[serde(default)]
    pub errors: BTreeMap<String, ErrorMapping>,
}

impl MappingDefinitionRaw {
    pub fn compile(&self) -> DefinitionResult<MappingDefinition> {
        let req = self
            .req
            .to_converter()
            .map_err(|r| r.attach("compiling request mapping"))?;
        let res = self
            .res
            .to_converter()
            .map_err(|r| r.attach("compiling response mapping"))?;
        for (key, entry) in &self.errors {
            if !path::validate_full_path(&entry.message) {
                return Err(Report::new(DefinitionError::InvalidPath(entry.message.clone()))
                    .attach(format!("error table entry {key}")));
            }
        }
        Ok(MappingDefinition {
            req,
            res,
            errors: self.errors.clone(),
        })
    }
}

/// Compiled connector mapping handed to generators.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingDefinition {
    pub req: ModelConverter,
    pub res: ModelConverter,
    pub errors: BTreeMap<String, ErrorMapping>,
}

/// Protocol-level view of a pipeline failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedError {
    pub status: u16,
    pub key: Option<String>,
    pub message: String,
    /// Where the message belongs in the response model, if the key is mapped.
    pub message_path: Option<String>,
}

impl MappingDefinition {
    /// Looks up the error table for a flow error or flow stop. Anything else, and any
    /// unmapped key, resolves to [`DEFAULT_ERROR_STATUS`].
    pub fn resolve_error(&self, err: &ProcessError) -> ResolvedError {
        let business = match err {
            ProcessError::Flow(e) => Some((&e.key, &e.message)),
            ProcessError::Stop(s) => Some((&s.key, &s.message)),
            _ => None,
        };
        match business {
            Some((key, message)) => {
                let entry = self.errors.get(key);
                ResolvedError {
                    status: entry.map_or(DEFAULT_ERROR_STATUS, |e| e.status),
                    key: Some(key.clone()),
                    message: message.clone(),
                    message_path: entry.map(|e| e.message.clone()),
                }
            }
            None => ResolvedError {
                status: DEFAULT_ERROR_STATUS,
                key: None,
                message: err.to_string(),
                message_path: None,
            },
        }
    }

    /// Resolves `err` and writes its message into `response` when the key is mapped.
    pub fn write_error(
        &self,
        err: &ProcessError,
        response: &mut dyn DataInstance,
    ) -> ModelResult<ResolvedError> {
        let resolved = self.resolve_error(err);
        if let Some(message_path) = &resolved.message_path {
            response.add_or_update_field(
                message_path,
                Some(PrimitiveValue::String(resolved.message.clone())),
            )?;
        }
        Ok(resolved)
    }
}

/// Everything a generator needs to build one connector instance.
#[derive(Clone)]
pub struct ConnectorRequest {
    pub instance_name: String,
    pub options: BTreeMap<String, String>,
    pub definition: Arc<MappingDefinition>,
    pub models: ModelFactory,
}

impl fmt::Debug for ConnectorRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorRequest")
            .field("instance_name", &self.instance_name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ConnectorRequest {
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn required_option(&self, key: &str) -> ConnectorResult<&str> {
        self.option(key).ok_or_else(|| ConnectorError::InvalidOption {
            name: self.instance_name.clone(),
            option: key.to_string(),
            reason: "missing".to_string(),
        })
    }
}

/// Options for deriving a pre-configured generator from a registered one.
#[derive(Debug, Clone)]
pub struct SubGeneratorRequest {
    pub name: String,
    pub options: BTreeMap<String, String>,
}

#[async_trait]
pub trait SourceConnectorGenerator: Send + Sync + 'static {
    /// Names this generator is registered under.
    fn generator_names(&self) -> Vec<String>;

    fn generate_source_connector(
        &self,
        request: ConnectorRequest,
    ) -> ConnectorResult<Arc<dyn SourceConnector>>;

    fn initialize_sub_generator(
        &self,
        request: SubGeneratorRequest,
    ) -> ConnectorResult<Arc<dyn SourceConnectorGenerator>> {
        Err(ConnectorError::SubGeneratorUnsupported(request.name))
    }

    async fn startup(&self) -> ConnectorResult<()> {
        Ok(())
    }

    async fn stop(&self) -> ConnectorResult<()> {
        Ok(())
    }
}

#[async_trait]
pub trait TargetConnectorGenerator: Send + Sync + 'static {
    /// Names this generator is registered under; an `&` prefix is added when missing.
    fn generator_names(&self) -> Vec<String>;

    fn generate_target_connector(
        &self,
        request: ConnectorRequest,
    ) -> ConnectorResult<Arc<dyn TargetConnector>>;

    fn initialize_sub_generator(
        &self,
        request: SubGeneratorRequest,
    ) -> ConnectorResult<Arc<dyn TargetConnectorGenerator>> {
        Err(ConnectorError::SubGeneratorUnsupported(request.name))
    }

    async fn startup(&self) -> ConnectorResult<()> {
        Ok(())
    }

    async fn stop(&self) -> ConnectorResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FlowError, FlowStop};
    use serde_json::json;

    fn definition() -> MappingDefinition {
        let raw: MappingDefinitionRaw = serde_json::from_value(json!({
            "req": [["body", "", [["username", "user/username"]]]],
            "res": [["user/user_id", "user_id"]],
            "errors": {
                "E1": {"message": "error/message", "status": 400},
                "STOP": {"message": "error/reason"},
            },
        }))
        .unwrap();
        raw.compile().unwrap()
    }

    #[test]
    fn test_compile_definition() {
        let def = definition();
        assert_eq!(def.req.target_leaf_paths(), ["user/username"]);
        assert_eq!(def.res.source_leaf_paths(), ["user/user_id"]);
        assert_eq!(def.errors["STOP"].status, DEFAULT_ERROR_STATUS);
    }

    #[test]
    fn test_compile_rejects_bad_error_path() {
        let raw: MappingDefinitionRaw = serde_json::from_value(json!({
            "errors": {"E1": {"message": "a//b", "status": 400}},
        }))
        .unwrap();
        assert!(raw.compile().is_err());
    }

    #[test]
    fn test_resolve_flow_error() {
        let def = definition();
        let resolved = def.resolve_error(&FlowError::new("E1", "bad input").into());
        assert_eq!(resolved.status, 400);
        assert_eq!(resolved.key.as_deref(), Some("E1"));
        assert_eq!(resolved.message_path.as_deref(), Some("error/message"));

        let unknown = def.resolve_error(&FlowError::new("E404", "nope").into());
        assert_eq!(unknown.status, DEFAULT_ERROR_STATUS);
        assert_eq!(unknown.message_path, None);

        let stop = def.resolve_error(&FlowStop::new("STOP", "halt").into());
        assert_eq!(stop.message_path.as_deref(), Some("error/reason"));
    }

    #[test]
    fn test_resolve_system_error() {
        let def = definition();
        let resolved = def.resolve_error(&ProcessError::Internal("db down".into()));
        assert_eq!(resolved.status, DEFAULT_ERROR_STATUS);
        assert_eq!(resolved.key, None);
        assert_eq!(resolved.message, "db down");
    }

    #[test]
    fn test_write_error_into_response() {
        let def = definition();
        let mut response = ModelInstance::new();
        let resolved = def
            .write_error(&FlowError::new("E1", "bad input").into(), &mut response)
            .unwrap();
        assert_eq!(resolved.status, 400);
        assert_eq!(
            response.get_field("error/message"),
            Some(PrimitiveValue::String("bad input".into()))
        );
    }

    #[tokio::test]
    async fn test_sync_process_adapter() {
        let process = sync_process(|m| {
            m.add_or_update_field("done", Some(PrimitiveValue::Bool(true)))?;
            Ok(())
        });
        let mut model = ModelInstance::new();
        process.process(&mut model).await.unwrap();
        assert_eq!(model.get_field("done"), Some(PrimitiveValue::Bool(true)));
    }
}
