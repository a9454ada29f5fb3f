//! Connector generator registry.

use error_stack::Report;
use fim_kernel::connector::{SourceConnectorGenerator, TargetConnectorGenerator};
use fim_kernel::{DefinitionError, DefinitionResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Prefix of target connector names in pipeline steps.
pub const TARGET_PREFIX: char = '&';

/// Adds the `&` prefix to a target generator name when missing.
pub fn target_name(name: &str) -> String {
    if name.starts_with(TARGET_PREFIX) {
        name.to_string()
    } else {
        format!("{TARGET_PREFIX}{name}")
    }
}

/// Source and target generators by name.
///
/// A generator registered under several names is still one lifecycle unit; [`Self::sources`]
/// and [`Self::targets`] list every generator once, in registration order.
#[derive(Default, Clone)]
pub struct GeneratorRegistry {
    source: HashMap<String, Arc<dyn SourceConnectorGenerator>>,
    target: HashMap<String, Arc<dyn TargetConnectorGenerator>>,
    source_order: Vec<Arc<dyn SourceConnectorGenerator>>,
    target_order: Vec<Arc<dyn TargetConnectorGenerator>>,
}

impl fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut source: Vec<_> = self.source.keys().collect();
        source.sort();
        let mut target: Vec<_> = self.target.keys().collect();
        target.sort();
        f.debug_struct("GeneratorRegistry")
            .field("source", &source)
            .field("target", &target)
            .finish()
    }
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `generator` under every name it reports.
    pub fn add_source(&mut self, generator: Arc<dyn SourceConnectorGenerator>) -> DefinitionResult<()> {
        let names = generator.generator_names();
        for name in &names {
            if self.source.contains_key(name) {
                return Err(Report::new(DefinitionError::Duplicate(format!(
                    "source connector generator {name}"
                ))));
            }
        }
        for name in names {
            self.source.insert(name, generator.clone());
        }
        self.source_order.push(generator);
        Ok(())
    }

    /// Registers `generator` under every name it reports, prefixed with `&`.
    pub fn add_target(&mut self, generator: Arc<dyn TargetConnectorGenerator>) -> DefinitionResult<()> {
        let names: Vec<String> = generator
            .generator_names()
            .iter()
            .map(|n| target_name(n))
            .collect();
        for name in &names {
            if self.target.contains_key(name) {
                return Err(Report::new(DefinitionError::Duplicate(format!(
                    "target connector generator {name}"
                ))));
            }
        }
        for name in names {
            self.target.insert(name, generator.clone());
        }
        self.target_order.push(generator);
        Ok(())
    }

    /// Registers a derived generator under one explicit name.
    pub fn insert_source(
        &mut self,
        name: &str,
        generator: Arc<dyn SourceConnectorGenerator>,
    ) -> DefinitionResult<()> {
        if self.source.contains_key(name) {
            return Err(Report::new(DefinitionError::Duplicate(format!(
                "source connector generator {name}"
            ))));
        }
        self.source.insert(name.to_string(), generator);
        Ok(())
    }

    pub fn insert_target(
        &mut self,
        name: &str,
        generator: Arc<dyn TargetConnectorGenerator>,
    ) -> DefinitionResult<()> {
        let name = target_name(name);
        if self.target.contains_key(&name) {
            return Err(Report::new(DefinitionError::Duplicate(format!(
                "target connector generator {name}"
            ))));
        }
        self.target.insert(name, generator);
        Ok(())
    }

    pub fn source(&self, name: &str) -> DefinitionResult<&Arc<dyn SourceConnectorGenerator>> {
        self.source.get(name).ok_or_else(|| {
            Report::new(DefinitionError::GeneratorNotFound(name.to_string()))
                .attach("source connector generator")
        })
    }

    /// Looks up a target generator; `name` may omit the `&` prefix.
    pub fn target(&self, name: &str) -> DefinitionResult<&Arc<dyn TargetConnectorGenerator>> {
        self.target.get(&target_name(name)).ok_or_else(|| {
            Report::new(DefinitionError::GeneratorNotFound(name.to_string()))
                .attach("target connector generator")
        })
    }

    /// Directly registered source generators, each once.
    pub fn sources(&self) -> &[Arc<dyn SourceConnectorGenerator>] {
        &self.source_order
    }

    pub fn targets(&self) -> &[Arc<dyn TargetConnectorGenerator>] {
        &self.target_order
    }
}
