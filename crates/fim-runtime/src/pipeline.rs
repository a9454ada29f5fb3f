//! Pipelines.
//!
//! A pipeline binds source connectors to an ordered list of steps:
//!
//! ```toml
//! source_connectors = [{ "@connector" = "http", "@mapping" = "http_in", path = "/register" }]
//! steps = [
//!     { "@flow" = "register" },
//!     { "#flow" = "&audit", "@mapping" = "audit_out", "@case-non-empty" = ["user/username"] },
//! ]
//!
//! [connector_mapping.http_in]
//! req = [["body", "", [["username", "user/username"]]]]
//! res = [["user/user_id", "user_id"]]
//! errors = { E1 = { message = "error/message", status = 400 } }
//! ```
//!
//! `@flow` steps run synchronously, `#flow` steps fire and forget. A value starting with `&`
//! names a target connector generator instead of a flow. Keys without a prefix are options for
//! the connector; `configure-static://` placeholders in them are resolved at load time.

use crate::container::{ConnectorHandle, ConnectorSet};
use crate::flow::Flow;
use crate::function::{CaseClause, CaseCondition};
use crate::generator::{GeneratorRegistry, TARGET_PREFIX};
use async_trait::async_trait;
use error_stack::Report;
use fim_kernel::config::{NestedConfigureManager, definition};
use fim_kernel::connector::{
    ConnectorRequest, MappingDefinition, MappingDefinitionRaw, PipelineProcess, SharedProcess,
    SourceConnector, TargetConnector,
};
use fim_kernel::model::{ModelFactory, ModelInstance};
use fim_kernel::path;
use fim_kernel::{DefinitionError, DefinitionResult, ProcessResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

pub const KEY_SYNC_FLOW: &str = "@flow";
pub const KEY_ASYNC_FLOW: &str = "#flow";
pub const KEY_CONNECTOR: &str = "@connector";
pub const KEY_MAPPING: &str = "@mapping";
pub const KEY_NAME: &str = "@name";

/// Pipeline as declared in a definition document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinitionRaw {
    #[serde(default)]
    pub source_connectors: Vec<BTreeMap<String, Value>>,
    #[serde(default)]
    pub steps: Vec<BTreeMap<String, Value>>,
    #[serde(default)]
    pub connector_mapping: BTreeMap<String, MappingDefinitionRaw>,
}

/// What a pipeline needs from its container while it is compiled.
pub struct PipelineContext<'a> {
    pub service: &'a str,
    pub flows: &'a HashMap<String, Arc<Flow>>,
    pub generators: &'a GeneratorRegistry,
    pub configure: &'a NestedConfigureManager,
    pub models: &'a ModelFactory,
    pub connectors: &'a mut ConnectorSet,
}

enum StepKind {
    Flow(Arc<Flow>),
    Target {
        connector: Arc<dyn TargetConnector>,
        /// Top-level model fields the request mapping reads.
        inputs: Vec<String>,
    },
}

struct PipelineStep {
    label: String,
    sync: bool,
    gate: Option<CaseCondition>,
    kind: StepKind,
}

/// Compiled pipeline.
pub struct Pipeline {
    name: String,
    full_name: String,
    steps: Arc<[PipelineStep]>,
    sources: Vec<Arc<dyn SourceConnector>>,
    models: ModelFactory,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let steps: Vec<_> = self.steps.iter().map(|s| s.label.as_str()).collect();
        let sources: Vec<_> = self.sources.iter().map(|s| s.name()).collect();
        f.debug_struct("Pipeline")
            .field("full_name", &self.full_name)
            .field("steps", &steps)
            .field("sources", &sources)
            .finish()
    }
}

impl Pipeline {
    pub fn from_toml(name: &str, content: &str, ctx: &mut PipelineContext<'_>) -> DefinitionResult<Self> {
        let raw: PipelineDefinitionRaw = definition::parse_definition(content)
            .map_err(|r| r.attach(format!("pipeline {name}")))?;
        Self::compile(name, &raw, ctx)
    }

    /// Compiles the steps and instantiates the source and target connectors. Connectors are
    /// registered with `ctx.connectors` for lifecycle management.
    pub fn compile(
        name: &str,
        raw: &PipelineDefinitionRaw,
        ctx: &mut PipelineContext<'_>,
    ) -> DefinitionResult<Self> {
        let full_name = path::concat_full_pipeline_name(ctx.service, name);
        Self::compile_inner(name, &full_name, raw, ctx)
            .map_err(|r| r.attach(format!("pipeline {full_name}")))
    }

    fn compile_inner(
        name: &str,
        full_name: &str,
        raw: &PipelineDefinitionRaw,
        ctx: &mut PipelineContext<'_>,
    ) -> DefinitionResult<Self> {
        let mut sources = Vec::with_capacity(raw.source_connectors.len());
        for (idx, entry) in raw.source_connectors.iter().enumerate() {
            let connector = compile_source(full_name, idx, entry, raw, ctx)
                .map_err(|r| r.attach(format!("source connector #{idx}")))?;
            sources.push(connector);
        }

        let mut steps = Vec::with_capacity(raw.steps.len());
        for (idx, entry) in raw.steps.iter().enumerate() {
            let step = compile_step(full_name, idx, entry, raw, ctx)
                .map_err(|r| r.attach(format!("step #{idx}")))?;
            steps.push(step);
        }

        Ok(Self {
            name: name.to_string(),
            full_name: full_name.to_string(),
            steps: steps.into(),
            sources,
            models: ctx.models.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `service/pipeline`
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn source_connectors(&self) -> &[Arc<dyn SourceConnector>] {
        &self.sources
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Composes the steps into one process. Steps run in order and the first error stops
    /// the pipeline; the model keeps whatever earlier steps wrote.
    pub fn to_pipeline_fn(&self) -> SharedProcess {
        Arc::new(PipelineFn {
            full_name: self.full_name.clone(),
            steps: self.steps.clone(),
            models: self.models.clone(),
        })
    }
}

struct PipelineFn {
    full_name: String,
    steps: Arc<[PipelineStep]>,
    models: ModelFactory,
}

#[async_trait]
impl PipelineProcess for PipelineFn {
    async fn process(&self, model: &mut ModelInstance) -> ProcessResult<()> {
        for (idx, step) in self.steps.iter().enumerate() {
            if let Some(gate) = &step.gate {
                if !gate.evaluate(&*model)? {
                    debug!(pipeline = %self.full_name, step = idx, label = %step.label, "step skipped");
                    continue;
                }
            }
            match (&step.kind, step.sync) {
                (StepKind::Flow(flow), true) => flow.invoke(model)?,
                (StepKind::Flow(flow), false) => flow.trigger(model)?,
                (StepKind::Target { connector, inputs }, true) => {
                    // the connector reads a snapshot while it writes the live model
                    let source =
                        ModelInstance::from_root(model.root().project(inputs.iter().map(String::as_str)));
                    connector.invoke_flow(&source, model).await?;
                }
                (StepKind::Target { connector, .. }, false) => {
                    let mut scratch = self.models.new_model();
                    connector.invoke_flow(&*model, &mut scratch).await?;
                }
            }
        }
        Ok(())
    }
}

fn compile_source(
    full_name: &str,
    idx: usize,
    entry: &BTreeMap<String, Value>,
    raw: &PipelineDefinitionRaw,
    ctx: &mut PipelineContext<'_>,
) -> DefinitionResult<Arc<dyn SourceConnector>> {
    let generator_name = required_str(entry, KEY_CONNECTOR)?;
    let definition = compile_mapping(raw, required_str(entry, KEY_MAPPING)?)?;
    let options = connector_options(entry, &[KEY_CONNECTOR, KEY_MAPPING, KEY_NAME])?;
    let instance_name = match optional_str(entry, KEY_NAME)? {
        Some(name) => name.to_string(),
        None => format!("{full_name}#{generator_name}#{idx}"),
    };

    let request = ConnectorRequest {
        instance_name,
        options: ctx.configure.resolve_options(&options),
        definition: Arc::new(definition),
        models: ctx.models.clone(),
    };
    let connector = ctx
        .generators
        .source(generator_name)?
        .generate_source_connector(request)
        .map_err(|e| Report::new(DefinitionError::Connector(e.to_string())))?;

    if !ctx
        .connectors
        .register(ConnectorHandle::Source(connector.clone()))
    {
        return Err(Report::new(DefinitionError::Duplicate(format!(
            "source connector {}",
            connector.name()
        ))));
    }
    Ok(connector)
}

fn compile_step(
    full_name: &str,
    idx: usize,
    entry: &BTreeMap<String, Value>,
    raw: &PipelineDefinitionRaw,
    ctx: &mut PipelineContext<'_>,
) -> DefinitionResult<PipelineStep> {
    let (target, sync) = match (
        optional_str(entry, KEY_SYNC_FLOW)?,
        optional_str(entry, KEY_ASYNC_FLOW)?,
    ) {
        (Some(_), Some(_)) => {
            return Err(Report::new(DefinitionError::InvalidPipeline(
                "a step cannot both invoke (@flow) and trigger (#flow)".into(),
            )));
        }
        (Some(target), None) => (target, true),
        (None, Some(target)) => (target, false),
        (None, None) => {
            return Err(Report::new(DefinitionError::InvalidPipeline(
                "no flow name defined in step".into(),
            )));
        }
    };
    let gate = compile_gate(entry)?;

    let kind = if target.starts_with(TARGET_PREFIX) {
        let definition = compile_mapping(raw, required_str(entry, KEY_MAPPING)?)?;
        let inputs = request_inputs(&definition);
        let mut reserved = vec![KEY_SYNC_FLOW, KEY_ASYNC_FLOW, KEY_MAPPING, KEY_NAME];
        reserved.extend(gate.iter().map(|g| g.clause().name()));
        let options = connector_options(entry, &reserved)?;
        let instance_name = match optional_str(entry, KEY_NAME)? {
            Some(name) => name.to_string(),
            None => format!("{full_name}#{target}#{idx}"),
        };
        let request = ConnectorRequest {
            instance_name,
            options: ctx.configure.resolve_options(&options),
            definition: Arc::new(definition),
            models: ctx.models.clone(),
        };
        let connector = ctx
            .generators
            .target(target)?
            .generate_target_connector(request)
            .map_err(|e| Report::new(DefinitionError::Connector(e.to_string())))?;
        // generators may hand out one shared instance name; its lifecycle is registered once
        ctx.connectors
            .register(ConnectorHandle::Target(connector.clone()));
        StepKind::Target { connector, inputs }
    } else {
        let mut reserved = vec![KEY_SYNC_FLOW, KEY_ASYNC_FLOW];
        reserved.extend(gate.iter().map(|g| g.clause().name()));
        if let Some(key) = entry.keys().find(|k| !reserved.contains(&k.as_str())) {
            return Err(Report::new(DefinitionError::InvalidPipeline(format!(
                "unexpected key `{key}` in flow step"
            ))));
        }
        let flow = ctx
            .flows
            .get(target)
            .ok_or_else(|| Report::new(DefinitionError::FlowNotFound(target.to_string())))?;
        StepKind::Flow(flow.clone())
    };

    Ok(PipelineStep {
        label: target.to_string(),
        sync,
        gate,
        kind,
    })
}

/// At most one `@case-*` key per step.
fn compile_gate(entry: &BTreeMap<String, Value>) -> DefinitionResult<Option<CaseCondition>> {
    let mut gate = None;
    for (key, value) in entry {
        let Some(clause) = CaseClause::parse(key) else {
            continue;
        };
        if gate.is_some() {
            return Err(Report::new(DefinitionError::InvalidPipeline(
                "a step accepts a single case clause".into(),
            )));
        }
        let params = value.as_array().ok_or_else(|| {
            Report::new(DefinitionError::invalid_parameters(
                key,
                "case clause parameters must be an array",
            ))
        })?;
        gate = Some(CaseCondition::parse(clause, params)?);
    }
    Ok(gate)
}

fn compile_mapping(raw: &PipelineDefinitionRaw, name: &str) -> DefinitionResult<MappingDefinition> {
    raw.connector_mapping
        .get(name)
        .ok_or_else(|| {
            Report::new(DefinitionError::InvalidPipeline(format!(
                "connector mapping cannot be found: {name}"
            )))
        })?
        .compile()
        .map_err(|r| r.attach(format!("connector mapping {name}")))
}

fn request_inputs(definition: &MappingDefinition) -> Vec<String> {
    definition
        .req
        .source_roots()
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn required_str<'a>(entry: &'a BTreeMap<String, Value>, key: &str) -> DefinitionResult<&'a str> {
    optional_str(entry, key)?.ok_or_else(|| {
        Report::new(DefinitionError::InvalidPipeline(format!("no {key} defined")))
    })
}

fn optional_str<'a>(entry: &'a BTreeMap<String, Value>, key: &str) -> DefinitionResult<Option<&'a str>> {
    match entry.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(Report::new(DefinitionError::InvalidPipeline(format!(
            "{key} must be a string, got {other}"
        )))),
    }
}

/// Plain keys become connector options. Unknown `@`/`#` keys are rejected.
pub(crate) fn connector_options(
    entry: &BTreeMap<String, Value>,
    reserved: &[&str],
) -> DefinitionResult<BTreeMap<String, String>> {
    let mut options = BTreeMap::new();
    for (key, value) in entry {
        if reserved.contains(&key.as_str()) {
            continue;
        }
        if key.starts_with('@') || key.starts_with('#') {
            return Err(Report::new(DefinitionError::InvalidPipeline(format!(
                "unexpected key `{key}`"
            ))));
        }
        let value = match value {
            Value::String(s) => s.clone(),
            Value::Bool(_) | Value::Number(_) => value.to_string(),
            _ => {
                return Err(Report::new(DefinitionError::InvalidPipeline(format!(
                    "option `{key}` must be a scalar"
                ))));
            }
        };
        options.insert(key.clone(), value);
    }
    Ok(options)
}
