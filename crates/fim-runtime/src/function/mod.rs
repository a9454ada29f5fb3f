//! Flow functions.
//!
//! A flow step is a one-entry table `{ "<name>" = [params...] }`. Names prefixed with `@` are
//! builtins, names prefixed with `#` are custom functions registered by the embedding
//! application, and `@case-*` names wrap another step in a condition (see [`case`]).
//!
//! Generators run once at load time and return a [`FlowFunction`] that is called on every
//! invocation with the flow's local model.

pub mod builtin;
pub mod case;
pub mod check;
pub mod crypto;

pub use case::{CaseClause, CaseCondition};

use error_stack::Report;
use fim_kernel::model::ModelInstance;
use fim_kernel::path;
use fim_kernel::{DefinitionError, DefinitionResult, IntoDefinitionReport, ProcessResult};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Compiled function applied to a flow's local model.
pub type FlowFunction = Arc<dyn Fn(&mut ModelInstance) -> ProcessResult<()> + Send + Sync>;

/// Builds a [`FlowFunction`] from the parameters declared in a flow.
pub type FunctionGenerator = Arc<dyn Fn(&[Value]) -> DefinitionResult<FlowFunction> + Send + Sync>;

/// Boxes a closure as a [`FlowFunction`].
pub fn flow_function<F>(f: F) -> FlowFunction
where
    F: Fn(&mut ModelInstance) -> ProcessResult<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Prefix-qualified function name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FunctionRef {
    /// `@name`
    Builtin(String),
    /// `#name`
    Custom(String),
}

impl FunctionRef {
    pub fn parse(name: &str) -> Result<Self, DefinitionError> {
        if name.len() > 1 && name.starts_with('@') {
            Ok(Self::Builtin(name.to_string()))
        } else if name.len() > 1 && name.starts_with('#') {
            Ok(Self::Custom(name.to_string()))
        } else {
            Err(DefinitionError::UnknownPrefix(name.to_string()))
        }
    }

    /// Full name including the prefix.
    pub fn name(&self) -> &str {
        match self {
            Self::Builtin(name) | Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Builtin and custom generator tables of one container.
///
/// Registration needs `&mut self`; once the container starts loading flows the registry is
/// only read.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    builtin: HashMap<String, FunctionGenerator>,
    custom: HashMap<String, FunctionGenerator>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builtin: Vec<_> = self.builtin.keys().collect();
        builtin.sort();
        let mut custom: Vec<_> = self.custom.keys().collect();
        custom.sort();
        f.debug_struct("FunctionRegistry")
            .field("builtin", &builtin)
            .field("custom", &custom)
            .finish()
    }
}

impl FunctionRegistry {
    /// Empty registry, without builtins.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with every builtin function.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_builtins(&mut registry);
        registry
    }

    pub fn register_builtin<F>(&mut self, name: &str, generator: F) -> DefinitionResult<()>
    where
        F: Fn(&[Value]) -> DefinitionResult<FlowFunction> + Send + Sync + 'static,
    {
        match FunctionRef::parse(name).into_report()? {
            FunctionRef::Builtin(name) => insert_unique(&mut self.builtin, name, Arc::new(generator)),
            FunctionRef::Custom(_) => Err(Report::new(DefinitionError::UnknownPrefix(
                name.to_string(),
            ))
            .attach("builtin functions use the `@` prefix")),
        }
    }

    pub fn register_custom<F>(&mut self, name: &str, generator: F) -> DefinitionResult<()>
    where
        F: Fn(&[Value]) -> DefinitionResult<FlowFunction> + Send + Sync + 'static,
    {
        match FunctionRef::parse(name).into_report()? {
            FunctionRef::Custom(name) => insert_unique(&mut self.custom, name, Arc::new(generator)),
            FunctionRef::Builtin(_) => Err(Report::new(DefinitionError::UnknownPrefix(
                name.to_string(),
            ))
            .attach("custom functions use the `#` prefix")),
        }
    }

    pub(crate) fn insert_builtin(&mut self, name: &str, generator: FunctionGenerator) {
        self.builtin.insert(name.to_string(), generator);
    }

    pub fn contains(&self, function: &FunctionRef) -> bool {
        match function {
            FunctionRef::Builtin(name) => self.builtin.contains_key(name),
            FunctionRef::Custom(name) => self.custom.contains_key(name),
        }
    }

    pub fn lookup(&self, function: &FunctionRef) -> DefinitionResult<&FunctionGenerator> {
        let table = match function {
            FunctionRef::Builtin(_) => &self.builtin,
            FunctionRef::Custom(_) => &self.custom,
        };
        table
            .get(function.name())
            .ok_or_else(|| Report::new(DefinitionError::FunctionNotFound(function.to_string())))
    }

    /// Compiles one step table `{ name = params }`.
    pub fn compile_step(&self, step: &Value) -> DefinitionResult<FlowFunction> {
        let table = step.as_object().ok_or_else(|| {
            Report::new(DefinitionError::invalid_parameters(
                "<step>",
                format!("step is not a table: {step}"),
            ))
        })?;
        let mut entries = table.iter();
        match (entries.next(), entries.next()) {
            (Some((name, params)), None) => self.compile_call(name, params),
            _ => Err(Report::new(DefinitionError::invalid_parameters(
                "<step>",
                format!("step must name exactly one function: {step}"),
            ))),
        }
    }

    /// Compiles a call to `name`. Case clauses are resolved here, other names go through
    /// the builtin or custom table.
    pub fn compile_call(&self, name: &str, params: &Value) -> DefinitionResult<FlowFunction> {
        let params = params.as_array().ok_or_else(|| {
            Report::new(DefinitionError::invalid_parameters(
                name,
                "parameters must be an array",
            ))
        })?;

        if let Some(clause) = CaseClause::parse(name) {
            return case::compile_case(self, clause, params)
                .map_err(|r| r.attach(format!("case clause {name}")));
        }

        let function = FunctionRef::parse(name).into_report()?;
        let generator = self.lookup(&function)?;
        generator(params).map_err(|r| r.attach(format!("function {function}")))
    }
}

fn insert_unique(
    table: &mut HashMap<String, FunctionGenerator>,
    name: String,
    generator: FunctionGenerator,
) -> DefinitionResult<()> {
    if table.contains_key(&name) {
        return Err(Report::new(DefinitionError::Duplicate(name)));
    }
    table.insert(name, generator);
    Ok(())
}

// ============================================================================
// Parameter helpers shared by the builtins
// ============================================================================

pub(crate) fn expect_len(name: &str, params: &[Value], len: usize) -> DefinitionResult<()> {
    if params.len() != len {
        return Err(Report::new(DefinitionError::invalid_parameters(
            name,
            format!("expected {len} parameters, got {}", params.len()),
        )));
    }
    Ok(())
}

pub(crate) fn param_str<'a>(name: &str, params: &'a [Value], idx: usize) -> DefinitionResult<&'a str> {
    params.get(idx).and_then(Value::as_str).ok_or_else(|| {
        Report::new(DefinitionError::invalid_parameters(
            name,
            format!("parameter #{idx} must be a string"),
        ))
    })
}

/// String parameter that must be a valid runtime path.
pub(crate) fn param_path(name: &str, params: &[Value], idx: usize) -> DefinitionResult<String> {
    let full_path = param_str(name, params, idx)?;
    if !path::validate_full_path(full_path) {
        return Err(Report::new(DefinitionError::InvalidPath(full_path.to_string()))
            .attach(format!("parameter #{idx} of {name}")));
    }
    Ok(full_path.to_string())
}
