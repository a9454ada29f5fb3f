//! Case clauses.
//!
//! A clause wraps exactly one function and skips it when its condition does not hold:
//!
//! ```toml
//! steps = [
//!     { "@case-true" = ["is_admin", { "@assign" = ["role", "admin"] }] },
//!     { "@case-equals" = ["a", "b", { "@assign" = ["same", true] }] },
//! ]
//! ```
//!
//! Pipelines use the same conditions without a wrapped function to gate whole steps.

use super::{FlowFunction, FunctionRegistry, flow_function};
use error_stack::Report;
use fim_kernel::model::{DataInstance, ModelError};
use fim_kernel::path;
use fim_kernel::schema::DataType;
use fim_kernel::{DefinitionError, DefinitionResult, ProcessResult};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseClause {
    True,
    False,
    Equals,
    NotEquals,
    Empty,
    NonEmpty,
}

impl CaseClause {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "@case-true" => Some(Self::True),
            "@case-false" => Some(Self::False),
            "@case-equals" => Some(Self::Equals),
            "@case-not-equals" => Some(Self::NotEquals),
            "@case-empty" => Some(Self::Empty),
            "@case-non-empty" => Some(Self::NonEmpty),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::True => "@case-true",
            Self::False => "@case-false",
            Self::Equals => "@case-equals",
            Self::NotEquals => "@case-not-equals",
            Self::Empty => "@case-empty",
            Self::NonEmpty => "@case-non-empty",
        }
    }

    /// Number of paths the condition reads.
    pub fn path_count(self) -> usize {
        match self {
            Self::Equals | Self::NotEquals => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for CaseClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A clause together with the paths it reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseCondition {
    clause: CaseClause,
    paths: Vec<String>,
}

impl CaseCondition {
    /// Builds a condition from exactly [`CaseClause::path_count`] path parameters.
    pub fn parse(clause: CaseClause, params: &[Value]) -> DefinitionResult<Self> {
        if params.len() != clause.path_count() {
            return Err(Report::new(DefinitionError::invalid_parameters(
                clause.name(),
                format!(
                    "expected {} path parameters, got {}",
                    clause.path_count(),
                    params.len()
                ),
            )));
        }
        let paths = params
            .iter()
            .map(|p| match p.as_str() {
                Some(s) if path::validate_full_path(s) => Ok(s.to_string()),
                _ => Err(Report::new(DefinitionError::InvalidPath(p.to_string()))
                    .attach(format!("condition of {clause}"))),
            })
            .collect::<DefinitionResult<Vec<_>>>()?;
        Ok(Self { clause, paths })
    }

    pub fn clause(&self) -> CaseClause {
        self.clause
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Evaluates the condition. A value of the wrong kind is an error, never a skip.
    pub fn evaluate(&self, model: &dyn DataInstance) -> ProcessResult<bool> {
        let first = &self.paths[0];
        match self.clause {
            CaseClause::True => expect_bool(first, model.get_value(first)),
            CaseClause::False => expect_bool(first, model.get_value(first)).map(|b| !b),
            CaseClause::Equals | CaseClause::NotEquals => {
                let second = &self.paths[1];
                let equal = values_equal(
                    model.get_value(first).as_ref(),
                    model.get_value(second).as_ref(),
                );
                Ok(equal == (self.clause == CaseClause::Equals))
            }
            CaseClause::Empty => is_empty(first, model.get_value(first)),
            CaseClause::NonEmpty => is_empty(first, model.get_value(first)).map(|b| !b),
        }
    }
}

fn expect_bool(field: &str, value: Option<Value>) -> ProcessResult<bool> {
    match value {
        Some(Value::Bool(b)) => Ok(b),
        _ => Err(ModelError::UnexpectedValue {
            path: field.to_string(),
            expected: DataType::Bool,
        }
        .into()),
    }
}

fn is_empty(field: &str, value: Option<Value>) -> ProcessResult<bool> {
    match value {
        None => Ok(true),
        Some(Value::String(s)) => Ok(s.is_empty()),
        Some(_) => Err(ModelError::UnexpectedValue {
            path: field.to_string(),
            expected: DataType::String,
        }
        .into()),
    }
}

/// Integers compare as `i64` whatever their width; everything else structurally.
fn values_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (a, b) => a == b,
    }
}

/// `[path.., { inner = params }]`
pub(crate) fn compile_case(
    registry: &FunctionRegistry,
    clause: CaseClause,
    params: &[Value],
) -> DefinitionResult<FlowFunction> {
    let count = clause.path_count();
    if params.len() != count + 1 {
        return Err(Report::new(DefinitionError::invalid_parameters(
            clause.name(),
            format!("expected {count} paths followed by one function"),
        )));
    }
    let condition = CaseCondition::parse(clause, &params[..count])?;
    let inner = registry.compile_step(&params[count])?;

    Ok(flow_function(move |model| {
        if condition.evaluate(&*model)? {
            inner(model)
        } else {
            Ok(())
        }
    }))
}
