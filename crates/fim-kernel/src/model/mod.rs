//! Runtime data model.
//!
//! A [`ModelInstance`] is an owned tree of [`Node`]s rooted at an object; it is created per
//! invocation and never shared. A [`ReadonlyInstance`] wraps a decoded JSON payload so inbound
//! data can be mapped without first copying it into a tree. Both implement [`DataInstance`].

mod node;
mod primitive;
mod source;

pub use node::{
    MAX_ARRAY_INDEX, Node, ObjectNode, ensure_array_element, ensure_array_element_with_index,
};
pub use primitive::PrimitiveValue;
pub use source::{SourceArray, SourceRef};

use crate::schema::{DataType, SchemaTree};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Structural and runtime errors raised by model operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ModelError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("sub field=[{0}] is not object")]
    NotObject(String),

    #[error("sub field=[{0}] is not primitive")]
    NotPrimitive(String),

    #[error("sub field=[{0}] is not primitive array")]
    NotPrimitiveArray(String),

    #[error("sub field=[{0}] is not object array")]
    NotObjectArray(String),

    #[error("array index {0} exceeds the sparse write limit")]
    IndexOutOfRange(usize),

    #[error("unsupported primitive: {0}")]
    UnsupportedPrimitive(String),

    #[error("operation unsupported")]
    Unsupported,

    #[error("path not declared in schema: {0}")]
    UndeclaredPath(String),

    #[error("type mismatch at {path}: expected {expected}, got {actual}")]
    TypeMismatch {
        path: String,
        expected: DataType,
        actual: DataType,
    },

    #[error("value at {path} is not {expected}")]
    UnexpectedValue { path: String, expected: DataType },

    #[error("model serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ModelResult<T> = Result<T, ModelError>;

/// Common interface of every model flowing through flows, pipelines and connectors.
pub trait DataInstance: Send + Sync + fmt::Debug {
    /// Read view of the root object.
    fn source(&self) -> SourceRef<'_>;

    /// Writable root object. Read-only instances fail with [`ModelError::Unsupported`].
    fn target(&mut self) -> ModelResult<&mut ObjectNode>;

    /// Writes a primitive at a runtime path. `None` is a no-op.
    fn add_or_update_field(&mut self, full_path: &str, value: Option<PrimitiveValue>) -> ModelResult<()>;

    /// Removes the subtree at a runtime path.
    fn remove_object_by_path(&mut self, full_path: &str) -> ModelResult<()> {
        self.target()?.remove_object_by_path(full_path)
    }

    fn get_field(&self, full_path: &str) -> Option<PrimitiveValue> {
        self.source().get_field(full_path)
    }

    /// General value (primitive or subtree) at a runtime path.
    fn get_value(&self, full_path: &str) -> Option<Value> {
        self.source().lookup(full_path)
    }

    fn to_general_object(&self) -> Value {
        self.source().to_general_object()
    }

    /// Independent copy of this instance.
    fn snapshot(&self) -> Box<dyn DataInstance>;
}

/// Mutable model tree, optionally checked against a schema.
#[derive(Debug, Clone, Default)]
pub struct ModelInstance {
    root: ObjectNode,
    schema: Option<Arc<SchemaTree>>,
}

impl ModelInstance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instance whose path writes must conform to `schema`.
    pub fn with_schema(schema: Arc<SchemaTree>) -> Self {
        Self {
            root: ObjectNode::new(),
            schema: Some(schema),
        }
    }

    pub fn schema(&self) -> Option<&Arc<SchemaTree>> {
        self.schema.as_ref()
    }

    pub fn root(&self) -> &ObjectNode {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut ObjectNode {
        &mut self.root
    }

    /// Schema-less instance over an existing tree.
    pub fn from_root(root: ObjectNode) -> Self {
        Self { root, schema: None }
    }

    /// Builds an instance from a JSON object by full-model copy.
    pub fn from_general_object(value: &Value) -> ModelResult<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| ModelError::NotObject("<root>".to_string()))?;
        let mut inst = Self::new();
        SourceRef::Map(map).merge_into(&mut inst.root)?;
        Ok(inst)
    }

    /// Portable byte encoding used on the wire.
    pub fn encode(&self) -> ModelResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.root.to_general_object())?)
    }

    pub fn decode(bytes: &[u8]) -> ModelResult<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_general_object(&value)
    }

    fn check_schema(&self, full_path: &str, value: &PrimitiveValue) -> ModelResult<()> {
        let Some(schema) = &self.schema else {
            return Ok(());
        };
        let (expected, _) = schema
            .type_of_path(full_path)
            .map_err(|_| ModelError::UndeclaredPath(full_path.to_string()))?;
        let actual = value.data_type();
        if expected != actual {
            return Err(ModelError::TypeMismatch {
                path: full_path.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }
}

impl DataInstance for ModelInstance {
    fn source(&self) -> SourceRef<'_> {
        SourceRef::Tree(&self.root)
    }

    fn target(&mut self) -> ModelResult<&mut ObjectNode> {
        Ok(&mut self.root)
    }

    fn add_or_update_field(&mut self, full_path: &str, value: Option<PrimitiveValue>) -> ModelResult<()> {
        let Some(value) = value else {
            return Ok(());
        };
        self.check_schema(full_path, &value)?;
        self.root.add_or_update_field(full_path, value)
    }

    fn snapshot(&self) -> Box<dyn DataInstance> {
        Box::new(self.clone())
    }
}

/// Read-only wrapper over a decoded payload. Every mutation fails.
#[derive(Debug, Clone, Default)]
pub struct ReadonlyInstance {
    data: Map<String, Value>,
}

impl ReadonlyInstance {
    pub fn wrap(data: Map<String, Value>) -> Self {
        Self { data }
    }

    pub fn from_value(value: Value) -> ModelResult<Self> {
        match value {
            Value::Object(data) => Ok(Self { data }),
            _ => Err(ModelError::NotObject("<root>".to_string())),
        }
    }

    /// Full-model copy into a mutable instance.
    pub fn transfer(&self, dst: &mut dyn DataInstance) -> ModelResult<()> {
        self.source().merge_into(dst.target()?)
    }
}

impl DataInstance for ReadonlyInstance {
    fn source(&self) -> SourceRef<'_> {
        SourceRef::Map(&self.data)
    }

    fn target(&mut self) -> ModelResult<&mut ObjectNode> {
        Err(ModelError::Unsupported)
    }

    fn add_or_update_field(&mut self, _full_path: &str, _value: Option<PrimitiveValue>) -> ModelResult<()> {
        Err(ModelError::Unsupported)
    }

    fn snapshot(&self) -> Box<dyn DataInstance> {
        Box::new(self.clone())
    }
}

/// Creates fresh models bound to a container's schema.
#[derive(Debug, Clone, Default)]
pub struct ModelFactory {
    schema: Option<Arc<SchemaTree>>,
}

impl ModelFactory {
    pub fn new(schema: Option<Arc<SchemaTree>>) -> Self {
        Self { schema }
    }

    pub fn new_model(&self) -> ModelInstance {
        match &self.schema {
            Some(schema) => ModelInstance::with_schema(schema.clone()),
            None => ModelInstance::new(),
        }
    }
}
