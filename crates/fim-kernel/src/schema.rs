//! Schema tree built from declarative `path = "type"` entries.
//!
//! The tree is built once at load time and shared read-only afterwards. Intermediate
//! `name[]` segments declare arrays of objects; a terminal `name[]` declares an array of the
//! given primitive type.

use crate::error::{DefinitionError, DefinitionResult, IntoDefinitionReport};
use crate::path::{self, ArrayIndex, SegmentKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Data kinds known to the schema and the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Unavailable,
    Int,
    String,
    Bool,
    Float,
    Array,
    Object,
}

impl DataType {
    /// Parses a primitive type name as used in schema definitions.
    pub fn parse_primitive(name: &str) -> Option<Self> {
        match name {
            "int" => Some(Self::Int),
            "string" => Some(Self::String),
            "bool" => Some(Self::Bool),
            "float" => Some(Self::Float),
            _ => None,
        }
    }

    pub fn is_primitive(self) -> bool {
        matches!(self, Self::Int | Self::String | Self::Bool | Self::Float)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unavailable => "unavailable",
            Self::Int => "int",
            Self::String => "string",
            Self::Bool => "bool",
            Self::Float => "float",
            Self::Array => "array",
            Self::Object => "object",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
struct SchemaNode {
    data_type: DataType,
    element_type: DataType,
    children: BTreeMap<String, SchemaNode>,
}

impl SchemaNode {
    fn new(data_type: DataType, element_type: DataType) -> Self {
        Self {
            data_type,
            element_type,
            children: BTreeMap::new(),
        }
    }

    fn describe(&self) -> String {
        match self.data_type {
            DataType::Array => format!("array<{}>", self.element_type),
            other => other.to_string(),
        }
    }

    /// Object node, or array node whose elements are objects.
    fn holds_fields(&self) -> bool {
        self.data_type == DataType::Object
            || (self.data_type == DataType::Array && self.element_type == DataType::Object)
    }
}

/// Immutable-after-load type tree.
#[derive(Debug, Clone)]
pub struct SchemaTree {
    root: SchemaNode,
}

impl Default for SchemaTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaTree {
    pub fn new() -> Self {
        Self {
            root: SchemaNode::new(DataType::Object, DataType::Unavailable),
        }
    }

    /// Adds every `(path, type)` entry, failing on the first conflict.
    pub fn add_type_definitions<I, K, V>(&mut self, definitions: I) -> DefinitionResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (path, data_type) in definitions {
            self.add_type_definition(path.as_ref(), data_type.as_ref())
                .into_report()?;
        }
        Ok(())
    }

    pub fn add_type_definition(
        &mut self,
        full_path: &str,
        data_type: &str,
    ) -> Result<(), DefinitionError> {
        let segments = path::parse_full_path(full_path, true)
            .ok_or_else(|| DefinitionError::InvalidPath(full_path.to_string()))?;
        if segments
            .iter()
            .any(|s| matches!(s.index, Some(ArrayIndex::Access(_))))
        {
            return Err(DefinitionError::InvalidPath(full_path.to_string()));
        }
        let primitive =
            DataType::parse_primitive(data_type).ok_or_else(|| DefinitionError::UnknownDataType {
                path: full_path.to_string(),
                data_type: data_type.to_string(),
            })?;

        let (last, intermediates) = segments
            .split_last()
            .ok_or_else(|| DefinitionError::InvalidPath(full_path.to_string()))?;

        let mut node = &mut self.root;
        for seg in intermediates {
            let expected = if seg.is_array() {
                SchemaNode::new(DataType::Array, DataType::Object)
            } else {
                SchemaNode::new(DataType::Object, DataType::Unavailable)
            };
            let key = segment_key(seg);
            let child = node
                .children
                .entry(key)
                .or_insert_with(|| expected.clone());
            if child.data_type != expected.data_type || child.element_type != expected.element_type
            {
                return Err(DefinitionError::KindConflict {
                    path: full_path.to_string(),
                    expected: expected.describe(),
                    found: child.describe(),
                });
            }
            node = child;
        }

        let leaf = if last.is_array() {
            SchemaNode::new(DataType::Array, primitive)
        } else {
            SchemaNode::new(primitive, DataType::Unavailable)
        };
        let key = segment_key(last);
        if let Some(existing) = node.children.get(&key) {
            if existing.data_type == leaf.data_type {
                return Err(DefinitionError::DuplicatePath(full_path.to_string()));
            }
            return Err(DefinitionError::KindConflict {
                path: full_path.to_string(),
                expected: leaf.describe(),
                found: existing.describe(),
            });
        }
        node.children.insert(key, leaf);
        Ok(())
    }

    /// Resolves the type at a path as `(type, element type)`.
    ///
    /// `name[i]` (or an intermediate `name[]`) steps into the element; a terminal `name[i]`
    /// yields the element kind with `Unavailable` as its own element type. A terminal
    /// `name[]` yields the array itself.
    pub fn type_of_path(&self, full_path: &str) -> Result<(DataType, DataType), DefinitionError> {
        let segments = path::parse_full_path(full_path, true)
            .ok_or_else(|| DefinitionError::InvalidPath(full_path.to_string()))?;
        let last = segments.len() - 1;

        let mut node = &self.root;
        for (i, seg) in segments.iter().enumerate() {
            if !node.holds_fields() {
                return Err(DefinitionError::UndeclaredPath(full_path.to_string()));
            }
            let child = node
                .children
                .get(&segment_key(seg))
                .ok_or_else(|| DefinitionError::UndeclaredPath(full_path.to_string()))?;

            match seg.index {
                None if i == last => return Ok((child.data_type, child.element_type)),
                None => {
                    if child.data_type != DataType::Object {
                        return Err(DefinitionError::KindConflict {
                            path: full_path.to_string(),
                            expected: DataType::Object.to_string(),
                            found: child.describe(),
                        });
                    }
                }
                Some(index) => {
                    if child.data_type != DataType::Array {
                        return Err(DefinitionError::KindConflict {
                            path: full_path.to_string(),
                            expected: DataType::Array.to_string(),
                            found: child.describe(),
                        });
                    }
                    if i == last {
                        return Ok(match index {
                            ArrayIndex::Definition => (DataType::Array, child.element_type),
                            ArrayIndex::Access(_) => (child.element_type, DataType::Unavailable),
                        });
                    }
                }
            }
            node = child;
        }
        Ok((node.data_type, node.element_type))
    }

    /// True when the path resolves to a declared node.
    pub fn contains(&self, full_path: &str) -> bool {
        self.type_of_path(full_path).is_ok()
    }
}

fn segment_key(seg: &path::Segment<'_>) -> String {
    match seg.kind {
        SegmentKind::Data => seg.name.to_string(),
        SegmentKind::Attribute => format!("#{}", seg.name),
        SegmentKind::Namespace => format!("@{}", seg.name),
    }
}
