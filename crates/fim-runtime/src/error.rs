//! Lifecycle errors of the runtime.
//!
//! Definition loading reports through [`fim_kernel::DefinitionResult`]; invocations through
//! [`fim_kernel::ProcessResult`]. [`RuntimeError`] covers what is left: starting and stopping
//! generators, dispatchers, connectors and lifecycle listeners.
//! Definition failures found while starting are carried over with
//! [`Report::change_context`] into [`RuntimeError::Definition`].

use error_stack::Report;
use fim_kernel::ProcessError;
use fim_kernel::connector::ConnectorError;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    #[error("generator {name} failed: {source}")]
    Generator {
        name: String,
        #[source]
        source: ConnectorError,
    },

    #[error("connector {name} failed: {source}")]
    Connector {
        name: String,
        #[source]
        source: ConnectorError,
    },

    #[error("dispatcher failed: {0}")]
    Dispatcher(#[from] ProcessError),

    /// A definition could not be wired into the dispatcher.
    #[error("invalid definition")]
    Definition,

    #[error("lifecycle listener {name} failed: {reason}")]
    Listener { name: String, reason: String },

    #[error("application is not started")]
    NotStarted,

    #[error("application is already started")]
    AlreadyStarted,
}

impl RuntimeError {
    pub fn generator(name: &str, source: ConnectorError) -> Self {
        Self::Generator {
            name: name.to_string(),
            source,
        }
    }

    pub fn connector(name: &str, source: ConnectorError) -> Self {
        Self::Connector {
            name: name.to_string(),
            source,
        }
    }
}

pub type RuntimeResult<T> = Result<T, Report<RuntimeError>>;
