//! Crate-level error types for `fim-kernel`.
//!
//! Two families live here:
//!
//! - [`DefinitionError`] for load-time failures (broken paths, schema conflicts, bad mapping
//!   rules, duplicate registrations). These abort startup and travel as
//!   [`error_stack::Report`]s through [`DefinitionResult`] so loaders can attach the flow or
//!   pipeline being processed.
//! - [`ProcessError`] for per-invocation failures, including the two expected business outcomes
//!   [`FlowError`] and [`FlowStop`].
//!
//! ```rust,ignore
//! use error_stack::ResultExt;
//! use fim_kernel::error::{DefinitionResult, IntoDefinitionReport};
//!
//! fn load(path: &str) -> DefinitionResult<()> {
//!     fim_kernel::schema::SchemaTree::new()
//!         .add_type_definition(path, "int")
//!         .into_report()
//!         .attach("loading schema")?;
//!     Ok(())
//! }
//! ```

use crate::bus::BusError;
use crate::model::ModelError;
use error_stack::Report;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading definitions.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DefinitionError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("path already defined: {0}")]
    DuplicatePath(String),

    #[error("kind conflict at {path}: expected {expected}, found {found}")]
    KindConflict {
        path: String,
        expected: String,
        found: String,
    },

    #[error("unknown data type `{data_type}` for path {path}")]
    UnknownDataType { path: String, data_type: String },

    #[error("path not declared in schema: {0}")]
    UndeclaredPath(String),

    #[error("invalid mapping rule: {0}")]
    InvalidRule(String),

    #[error("local parameter types of in and out do not match: {0}")]
    ParameterTypeMismatch(String),

    #[error("unknown function prefix: {0}")]
    UnknownPrefix(String),

    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("invalid parameters for {name}: {reason}")]
    InvalidParameters { name: String, reason: String },

    #[error("duplicate registration: {0}")]
    Duplicate(String),

    #[error("generator not found: {0}")]
    GeneratorNotFound(String),

    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    #[error("missing configuration: {0}")]
    MissingConfiguration(String),

    #[error("connector error: {0}")]
    Connector(String),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DefinitionError {
    pub fn invalid_parameters(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidParameters {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Error-stack–backed result alias for load-time operations.
pub type DefinitionResult<T> = Result<T, Report<DefinitionError>>;

/// Extension trait to convert `Result<T, DefinitionError>` into [`DefinitionResult<T>`].
pub trait IntoDefinitionReport<T> {
    /// Wrap the error in an `error_stack::Report`.
    fn into_report(self) -> DefinitionResult<T>;
}

impl<T> IntoDefinitionReport<T> for Result<T, DefinitionError> {
    #[inline]
    fn into_report(self) -> DefinitionResult<T> {
        self.map_err(Report::new)
    }
}

/// Business-rule failure raised by a flow function.
///
/// Carries a stable key that connectors map to protocol responses.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{key}::{message}")]
pub struct FlowError {
    pub key: String,
    pub message: String,
}

impl FlowError {
    pub fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Intentional short-circuit of a pipeline. Same shape as [`FlowError`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{key}::{message}")]
pub struct FlowStop {
    pub key: String,
    pub message: String,
}

impl FlowStop {
    pub fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Errors surfaced by a pipeline or flow invocation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessError {
    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error("flow stopped: {0}")]
    Stop(#[from] FlowStop),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("connector error: {0}")]
    Connector(String),

    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("remote invocation failed: {0}")]
    Remote(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("{0}")]
    Internal(String),
}

impl ProcessError {
    /// Returns the flow error carried by this value, if any.
    pub fn as_flow_error(&self) -> Option<&FlowError> {
        match self {
            Self::Flow(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_flow_stop(&self) -> Option<&FlowStop> {
        match self {
            Self::Stop(e) => Some(e),
            _ => None,
        }
    }

    /// True for flow errors and flow stops.
    pub fn is_business(&self) -> bool {
        matches!(self, Self::Flow(_) | Self::Stop(_))
    }
}

pub type ProcessResult<T> = Result<T, ProcessError>;
