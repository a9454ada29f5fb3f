//! bcrypt hashing builtins.

use super::check::not_string;
use super::{FlowFunction, FunctionRegistry, expect_len, flow_function, param_path};
use error_stack::Report;
use fim_kernel::model::{DataInstance, ModelInstance};
use fim_kernel::{DefinitionError, DefinitionResult, PrimitiveValue, ProcessError, ProcessResult};
use serde_json::Value;
use std::sync::Arc;

pub const CRYPTO_BCRYPT: &str = "@crypto_bcrypt";
pub const CRYPTO_BCRYPT_VERIFY: &str = "@crypto_bcrypt_verify";

pub(crate) fn register_crypto(registry: &mut FunctionRegistry) {
    registry.insert_builtin(CRYPTO_BCRYPT, Arc::new(crypto_bcrypt));
    registry.insert_builtin(CRYPTO_BCRYPT_VERIFY, Arc::new(crypto_bcrypt_verify));
}

/// `@crypto_bcrypt = [path]` or `[path, cost]`, replaces the string at `path` with its hash.
fn crypto_bcrypt(params: &[Value]) -> DefinitionResult<FlowFunction> {
    if params.is_empty() || params.len() > 2 {
        return Err(Report::new(DefinitionError::invalid_parameters(
            CRYPTO_BCRYPT,
            format!("expected 1 or 2 parameters, got {}", params.len()),
        )));
    }
    let field = param_path(CRYPTO_BCRYPT, params, 0)?;
    let cost = match params.get(1) {
        None => bcrypt::DEFAULT_COST,
        Some(value) => value
            .as_u64()
            .and_then(|c| u32::try_from(c).ok())
            .filter(|c| (4..=31).contains(c))
            .ok_or_else(|| {
                Report::new(DefinitionError::invalid_parameters(
                    CRYPTO_BCRYPT,
                    "cost must be an integer between 4 and 31",
                ))
            })?,
    };

    Ok(flow_function(move |model| {
        let Some(plain) = string_field(model, &field)? else {
            return Ok(());
        };
        let hashed = bcrypt::hash(plain, cost).map_err(bcrypt_failure)?;
        model.add_or_update_field(&field, Some(PrimitiveValue::String(hashed)))?;
        Ok(())
    }))
}

/// `@crypto_bcrypt_verify = [hash_path, input_path, result_path]`, writes whether the input
/// matches the hash as a bool.
fn crypto_bcrypt_verify(params: &[Value]) -> DefinitionResult<FlowFunction> {
    expect_len(CRYPTO_BCRYPT_VERIFY, params, 3)?;
    let hash_field = param_path(CRYPTO_BCRYPT_VERIFY, params, 0)?;
    let input_field = param_path(CRYPTO_BCRYPT_VERIFY, params, 1)?;
    let result_field = param_path(CRYPTO_BCRYPT_VERIFY, params, 2)?;

    Ok(flow_function(move |model| {
        let Some(hashed) = string_field(model, &hash_field)? else {
            return Ok(());
        };
        let Some(input) = string_field(model, &input_field)? else {
            return Ok(());
        };
        let matched = bcrypt::verify(input, &hashed).map_err(bcrypt_failure)?;
        model.add_or_update_field(&result_field, Some(PrimitiveValue::Bool(matched)))?;
        Ok(())
    }))
}

fn string_field(model: &ModelInstance, field: &str) -> ProcessResult<Option<String>> {
    match model.get_value(field) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(not_string(field)),
    }
}

fn bcrypt_failure(err: bcrypt::BcryptError) -> ProcessError {
    ProcessError::Internal(format!("bcrypt: {err}"))
}
