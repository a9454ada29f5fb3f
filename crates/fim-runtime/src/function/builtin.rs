//! Builtin functions available to every container.

use super::{check, crypto};
use super::{FlowFunction, FunctionRegistry, expect_len, flow_function, param_path};
use error_stack::Report;
use fim_kernel::model::DataInstance;
use fim_kernel::{DefinitionError, DefinitionResult, PrimitiveValue};
use serde_json::Value;
use std::sync::Arc;

pub const ASSIGN: &str = "@assign";
pub const UUID: &str = "@uuid";
pub const SET_CURRENT_UNIX_TIMESTAMP: &str = "@set_current_unix_timestamp";

pub(crate) fn register_builtins(registry: &mut FunctionRegistry) {
    registry.insert_builtin(ASSIGN, Arc::new(assign));
    registry.insert_builtin(UUID, Arc::new(uuid));
    registry.insert_builtin(SET_CURRENT_UNIX_TIMESTAMP, Arc::new(set_current_unix_timestamp));
    check::register_checks(registry);
    crypto::register_crypto(registry);
}

/// `@assign = [path, value]`
fn assign(params: &[Value]) -> DefinitionResult<FlowFunction> {
    expect_len(ASSIGN, params, 2)?;
    let field = param_path(ASSIGN, params, 0)?;
    let value = PrimitiveValue::from_json(&params[1])
        .map_err(|e| {
            Report::new(DefinitionError::invalid_parameters(ASSIGN, e.to_string()))
        })?
        .ok_or_else(|| {
            Report::new(DefinitionError::invalid_parameters(
                ASSIGN,
                "value must not be null",
            ))
        })?;

    Ok(flow_function(move |model| {
        model.add_or_update_field(&field, Some(value.clone()))?;
        Ok(())
    }))
}

/// `@uuid = [path]`, writes a random v4 UUID string.
fn uuid(params: &[Value]) -> DefinitionResult<FlowFunction> {
    expect_len(UUID, params, 1)?;
    let field = param_path(UUID, params, 0)?;

    Ok(flow_function(move |model| {
        let id = uuid::Uuid::new_v4().to_string();
        model.add_or_update_field(&field, Some(PrimitiveValue::String(id)))?;
        Ok(())
    }))
}

/// `@set_current_unix_timestamp = [path]`, writes epoch milliseconds.
fn set_current_unix_timestamp(params: &[Value]) -> DefinitionResult<FlowFunction> {
    expect_len(SET_CURRENT_UNIX_TIMESTAMP, params, 1)?;
    let field = param_path(SET_CURRENT_UNIX_TIMESTAMP, params, 0)?;

    Ok(flow_function(move |model| {
        let now = chrono::Utc::now().timestamp_millis();
        model.add_or_update_field(&field, Some(PrimitiveValue::Int(now)))?;
        Ok(())
    }))
}
