//! Runtime configuration.
//!
//! [`RuntimeConfig`] is layered with the `config` crate: built-in defaults, then an optional
//! file (format detected from the extension), then `FIM_`-prefixed environment variables using
//! `__` for nesting (`FIM_DISPATCH__MODE=bus`).
//!
//! Definition documents are handled by [`definition`], option placeholders by [`configure`].

pub mod configure;
pub mod definition;

pub use configure::{
    CONFIGURE_STATIC_PREFIX, ConfigureManager, EnvConfigureManager, NestedConfigureManager,
    SettableConfigureManager,
};
pub use definition::{parse_definition, parse_document, substitute_env, substitute_env_recursive};

use config::{Config as Cfg, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "FIM";

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Detects the configuration format from a file extension.
pub fn detect_format(path: &Path) -> ConfigResult<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

/// How pipelines are reached by their source connectors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// In-process invocation.
    #[default]
    Local,
    /// Request/reply over a message bus.
    Bus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub mode: DispatchMode,
    pub request_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Local,
            request_timeout_ms: 10_000,
        }
    }
}

impl DispatchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub service_name: String,
    pub dispatch: DispatchConfig,
    /// `EnvFilter` directive used when installing the log subscriber.
    pub log_filter: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            service_name: "fim".to_string(),
            dispatch: DispatchConfig::default(),
            log_filter: "info".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Loads defaults, then `path` if given, then `FIM_*` environment overrides.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder = Cfg::builder().add_source(
            Cfg::try_from(&Self::default()).map_err(|e| ConfigError::Parse(e.to_string()))?,
        );
        if let Some(path) = path {
            let format = detect_format(path)?;
            builder = builder.add_source(File::from(path).format(format).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config
            .try_deserialize()
            .map_err(|e| ConfigError::Serialization(e.to_string()))
    }

    /// Parses a TOML string on top of the defaults, without environment overrides.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config = Cfg::builder()
            .add_source(
                Cfg::try_from(&Self::default()).map_err(|e| ConfigError::Parse(e.to_string()))?,
            )
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config
            .try_deserialize()
            .map_err(|e| ConfigError::Serialization(e.to_string()))
    }
}
