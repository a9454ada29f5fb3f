//! Flows.
//!
//! A flow is one mapped unit of business logic:
//!
//! 1. `in` maps fields of the caller's (global) model into a fresh local model,
//! 2. `steps` run in order against the local model,
//! 3. `pre_out` removes subtrees from the destination,
//! 4. `out` maps local fields back into the destination.
//!
//! ```toml
//! in = [["user/username", "username"]]
//! out = [["user_id", "user/user_id"]]
//! pre_out = [{ "@remove" = "user/password" }]
//! steps = [{ "@assign" = ["user_id", 123] }]
//! ```
//!
//! The destination is the caller's model for [`Flow::invoke`] and a throwaway model for
//! [`Flow::trigger`]. Any failure stops the flow before the out-mapping runs.

use crate::function::{FlowFunction, FunctionRegistry, flow_function};
use error_stack::Report;
use fim_kernel::config::definition;
use fim_kernel::mapping::{MappingRuleRaw, ModelConverter};
use fim_kernel::model::{DataInstance, ModelInstance};
use fim_kernel::path;
use fim_kernel::schema::SchemaTree;
use fim_kernel::{DefinitionError, DefinitionResult, ProcessResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::trace;

pub const PRE_OUT_REMOVE: &str = "@remove";

/// Flow as declared in a definition document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowDefinitionRaw {
    #[serde(default, rename = "in")]
    pub input: MappingRuleRaw,
    #[serde(default)]
    pub out: MappingRuleRaw,
    #[serde(default)]
    pub pre_out: Vec<BTreeMap<String, String>>,
    #[serde(default)]
    pub steps: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PreOutOperation {
    Remove(String),
}

/// Compiled flow. Immutable and shared by every invocation.
pub struct Flow {
    name: String,
    input: ModelConverter,
    output: ModelConverter,
    pre_out: Vec<PreOutOperation>,
    functions: Vec<FlowFunction>,
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("pre_out", &self.pre_out)
            .field("functions", &self.functions.len())
            .finish_non_exhaustive()
    }
}

impl Flow {
    /// Parses and compiles a flow document.
    pub fn from_toml(
        name: &str,
        content: &str,
        schema: Option<&SchemaTree>,
        registry: &FunctionRegistry,
    ) -> DefinitionResult<Self> {
        let raw: FlowDefinitionRaw = definition::parse_definition(content)
            .map_err(|r| r.attach(format!("flow {name}")))?;
        Self::compile(name, &raw, schema, registry)
    }

    /// Compiles a flow. When a schema is given, every global path must be declared in it.
    pub fn compile(
        name: &str,
        raw: &FlowDefinitionRaw,
        schema: Option<&SchemaTree>,
        registry: &FunctionRegistry,
    ) -> DefinitionResult<Self> {
        Self::compile_inner(raw, schema, registry)
            .map(|(input, output, pre_out, functions)| Self {
                name: name.to_string(),
                input,
                output,
                pre_out,
                functions,
            })
            .map_err(|r| r.attach(format!("flow {name}")))
    }

    #[allow(clippy::type_complexity)]
    fn compile_inner(
        raw: &FlowDefinitionRaw,
        schema: Option<&SchemaTree>,
        registry: &FunctionRegistry,
    ) -> DefinitionResult<(ModelConverter, ModelConverter, Vec<PreOutOperation>, Vec<FlowFunction>)>
    {
        let input = raw
            .input
            .to_converter()
            .map_err(|r| r.attach("compiling in mapping"))?;
        let output = raw
            .out
            .to_converter()
            .map_err(|r| r.attach("compiling out mapping"))?;
        let pre_out = compile_pre_out(&raw.pre_out)?;

        if let Some(schema) = schema {
            for global in input.source_leaf_paths() {
                ensure_declared(schema, global).map_err(|r| r.attach("in mapping"))?;
            }
            for global in output.target_leaf_paths() {
                ensure_declared(schema, global).map_err(|r| r.attach("out mapping"))?;
            }
            for PreOutOperation::Remove(global) in &pre_out {
                ensure_declared(schema, global).map_err(|r| r.attach("pre_out"))?;
            }
            validate_local_parameters(schema, &input, &output)?;
        }

        let functions = raw
            .steps
            .iter()
            .enumerate()
            .map(|(idx, step)| {
                registry
                    .compile_step(step)
                    .map_err(|r| r.attach(format!("step #{idx}")))
            })
            .collect::<DefinitionResult<Vec<_>>>()?;

        Ok((input, output, pre_out, functions))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sync invocation: the out-mapping writes into `global`.
    pub fn invoke(&self, global: &mut ModelInstance) -> ProcessResult<()> {
        let local = self.execute(global)?;
        self.write_output(&local, global)
    }

    /// Fire-and-forget invocation: `global` is only read, the out-mapping writes into a
    /// throwaway model.
    pub fn trigger(&self, global: &ModelInstance) -> ProcessResult<()> {
        let local = self.execute(global)?;
        let mut dummy = ModelInstance::new();
        self.write_output(&local, &mut dummy)
    }

    pub fn flow_fn(self: &Arc<Self>) -> FlowFunction {
        let flow = Arc::clone(self);
        flow_function(move |global| flow.invoke(global))
    }

    pub fn flow_fn_no_resp(self: &Arc<Self>) -> FlowFunction {
        let flow = Arc::clone(self);
        flow_function(move |global| flow.trigger(global))
    }

    fn execute(&self, global: &ModelInstance) -> ProcessResult<ModelInstance> {
        let mut local = ModelInstance::new();
        self.input.transfer(global.source(), local.root_mut())?;
        for function in &self.functions {
            function(&mut local)?;
        }
        trace!(flow = %self.name, "flow steps finished");
        Ok(local)
    }

    fn write_output(&self, local: &ModelInstance, destination: &mut ModelInstance) -> ProcessResult<()> {
        for op in &self.pre_out {
            match op {
                PreOutOperation::Remove(global) => destination.remove_object_by_path(global)?,
            }
        }
        self.output
            .transfer(local.source(), destination.root_mut())?;
        Ok(())
    }
}

fn compile_pre_out(entries: &[BTreeMap<String, String>]) -> DefinitionResult<Vec<PreOutOperation>> {
    let mut ops = Vec::with_capacity(entries.len());
    let mut seen = Vec::<&str>::new();
    for entry in entries {
        for (op, target) in entry {
            if op != PRE_OUT_REMOVE {
                return Err(Report::new(DefinitionError::InvalidRule(format!(
                    "unknown pre_out operation: {op}"
                ))));
            }
            if !path::validate_full_path(target) {
                return Err(Report::new(DefinitionError::InvalidPath(target.clone()))
                    .attach("pre_out"));
            }
            if seen.contains(&target.as_str()) {
                return Err(Report::new(DefinitionError::Duplicate(format!(
                    "pre_out path {target}"
                ))));
            }
            seen.push(target);
            ops.push(PreOutOperation::Remove(target.clone()));
        }
    }
    Ok(ops)
}

fn ensure_declared(schema: &SchemaTree, global: &str) -> DefinitionResult<()> {
    schema
        .type_of_path(global)
        .map(|_| ())
        .map_err(|_| Report::new(DefinitionError::UndeclaredPath(global.to_string())))
}

/// A local parameter filled by `in` and read by `out` must have the same type on both
/// global ends.
fn validate_local_parameters(
    schema: &SchemaTree,
    input: &ModelConverter,
    output: &ModelConverter,
) -> DefinitionResult<()> {
    let inbound: HashMap<&str, &str> = input
        .leaf_pairs()
        .map(|(global, local)| (local, global))
        .collect();

    for (local, global_out) in output.leaf_pairs() {
        let Some(global_in) = inbound.get(local) else {
            continue;
        };
        let type_in = schema.type_of_path(global_in).map_err(Report::new)?;
        let type_out = schema.type_of_path(global_out).map_err(Report::new)?;
        if type_in != type_out {
            return Err(Report::new(DefinitionError::ParameterTypeMismatch(
                local.to_string(),
            ))
            .attach(format!(
                "{global_in} is {}/{}, {global_out} is {}/{}",
                type_in.0, type_in.1, type_out.0, type_out.1
            )));
        }
    }
    Ok(())
}
