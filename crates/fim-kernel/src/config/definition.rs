//! Definition document parsing.
//!
//! Schema, flow, pipeline and generator definitions are TOML documents. They are read into a
//! [`serde_json::Value`], every string goes through `${VAR}` environment substitution, and the
//! result is deserialized into the target type.

use crate::error::{DefinitionError, DefinitionResult};
use error_stack::Report;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

static ENV_VAR_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Replaces `${VAR_NAME}` with the value of the environment variable.
/// Unset variables are left unchanged.
pub fn substitute_env(input: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| {
                tracing::debug!(variable = var_name, "environment variable not set, left as is");
                caps[0].to_string()
            })
        })
        .to_string()
}

/// Applies [`substitute_env`] to every string value. Keys are left untouched.
pub fn substitute_env_recursive(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_env(s)),
        Value::Array(arr) => arr.iter().map(substitute_env_recursive).collect(),
        Value::Object(obj) => obj
            .iter()
            .map(|(k, v)| (k.clone(), substitute_env_recursive(v)))
            .collect(),
        _ => value.clone(),
    }
}

/// Parses a TOML document into a generic value with environment substitution applied.
pub fn parse_document(content: &str) -> DefinitionResult<Value> {
    let raw: Value = toml::from_str(content)
        .map_err(|e| Report::new(DefinitionError::TomlParse(e)))?;
    Ok(substitute_env_recursive(&raw))
}

/// Parses a TOML definition into `T`.
pub fn parse_definition<T: DeserializeOwned>(content: &str) -> DefinitionResult<T> {
    from_document(parse_document(content)?)
}

/// Deserializes an already parsed document (or a section of one).
pub fn from_document<T: DeserializeOwned>(document: Value) -> DefinitionResult<T> {
    serde_json::from_value(document).map_err(|e| Report::new(DefinitionError::Json(e)))
}
