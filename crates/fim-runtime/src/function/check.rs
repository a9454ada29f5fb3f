//! `@check_*_break` assertions.
//!
//! Each check returns a [`FlowError`] built from its `key` and `message` parameters when the
//! assertion fails, which stops the flow. A value of the wrong kind is a model error instead.

use super::{FlowFunction, FunctionRegistry, expect_len, flow_function, param_path, param_str};
use fim_kernel::model::{DataInstance, ModelError, ModelInstance};
use fim_kernel::schema::DataType;
use fim_kernel::{DefinitionResult, FlowError, ProcessResult};
use serde_json::Value;
use std::sync::Arc;

pub const CHECK_EMPTY_BREAK: &str = "@check_empty_break";
pub const CHECK_NOT_BLANK_BREAK: &str = "@check_not_blank_break";
pub const CHECK_EXIST_BREAK: &str = "@check_exist_break";
pub const CHECK_NOT_EXIST_BREAK: &str = "@check_not_exist_break";
pub const CHECK_ALWAYS_BREAK: &str = "@check_always_break";

pub(crate) fn register_checks(registry: &mut FunctionRegistry) {
    registry.insert_builtin(
        CHECK_EMPTY_BREAK,
        Arc::new(|p: &[Value]| path_check(CHECK_EMPTY_BREAK, p, passes_empty)),
    );
    registry.insert_builtin(
        CHECK_NOT_BLANK_BREAK,
        Arc::new(|p: &[Value]| path_check(CHECK_NOT_BLANK_BREAK, p, passes_not_blank)),
    );
    registry.insert_builtin(
        CHECK_EXIST_BREAK,
        Arc::new(|p: &[Value]| path_check(CHECK_EXIST_BREAK, p, |_, v| Ok(v.is_some()))),
    );
    registry.insert_builtin(
        CHECK_NOT_EXIST_BREAK,
        Arc::new(|p: &[Value]| path_check(CHECK_NOT_EXIST_BREAK, p, |_, v| Ok(v.is_none()))),
    );
    registry.insert_builtin(CHECK_ALWAYS_BREAK, Arc::new(always_break));
}

type Assertion = fn(&str, Option<Value>) -> ProcessResult<bool>;

/// `[path, key, message]`
fn path_check(name: &str, params: &[Value], passes: Assertion) -> DefinitionResult<FlowFunction> {
    expect_len(name, params, 3)?;
    let field = param_path(name, params, 0)?;
    let error = FlowError::new(param_str(name, params, 1)?, param_str(name, params, 2)?);

    Ok(flow_function(move |model: &mut ModelInstance| {
        if passes(&field, model.get_value(&field))? {
            Ok(())
        } else {
            Err(error.clone().into())
        }
    }))
}

/// `[key, message]`
fn always_break(params: &[Value]) -> DefinitionResult<FlowFunction> {
    expect_len(CHECK_ALWAYS_BREAK, params, 2)?;
    let error = FlowError::new(
        param_str(CHECK_ALWAYS_BREAK, params, 0)?,
        param_str(CHECK_ALWAYS_BREAK, params, 1)?,
    );
    Ok(flow_function(move |_| Err(error.clone().into())))
}

fn passes_empty(field: &str, value: Option<Value>) -> ProcessResult<bool> {
    match value {
        None => Ok(true),
        Some(Value::String(s)) => Ok(s.is_empty()),
        Some(_) => Err(not_string(field)),
    }
}

fn passes_not_blank(field: &str, value: Option<Value>) -> ProcessResult<bool> {
    match value {
        None => Ok(false),
        Some(Value::String(s)) => Ok(!s.trim().is_empty()),
        Some(_) => Err(not_string(field)),
    }
}

pub(crate) fn not_string(field: &str) -> fim_kernel::ProcessError {
    ModelError::UnexpectedValue {
        path: field.to_string(),
        expected: DataType::String,
    }
    .into()
}
