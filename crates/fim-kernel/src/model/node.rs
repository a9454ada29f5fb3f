use super::{ModelError, ModelResult, PrimitiveValue};
use crate::path::{self, ArrayIndex};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Largest array index a sparse write may extend an array to.
pub const MAX_ARRAY_INDEX: usize = u16::MAX as usize;

/// A node of a mutable model tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Primitive(PrimitiveValue),
    Object(ObjectNode),
    /// Array whose elements are objects.
    Array(Vec<ObjectNode>),
    PrimitiveArray(Vec<PrimitiveValue>),
    /// Array with no elements yet. Becomes an object or primitive array on first write.
    EmptyArray,
}

impl Node {
    pub fn to_general_object(&self) -> Value {
        match self {
            Node::Primitive(v) => v.to_json(),
            Node::Object(obj) => obj.to_general_object(),
            Node::Array(arr) => Value::Array(arr.iter().map(ObjectNode::to_general_object).collect()),
            Node::PrimitiveArray(arr) => Value::Array(arr.iter().map(PrimitiveValue::to_json).collect()),
            Node::EmptyArray => Value::Array(Vec::new()),
        }
    }
}

/// Object level of a model tree. The root of every model is an `ObjectNode`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectNode {
    fields: BTreeMap<String, Node>,
}

impl ObjectNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn remove(&mut self, name: &str) -> Option<Node> {
        self.fields.remove(name)
    }

    /// Writes a primitive. An existing container under the same name is not overwritten.
    pub fn put_primitive_value(&mut self, name: &str, value: PrimitiveValue) -> ModelResult<()> {
        match self.fields.get(name) {
            Some(Node::Primitive(_)) | None => {
                self.fields.insert(name.to_string(), Node::Primitive(value));
                Ok(())
            }
            Some(_) => Err(ModelError::NotPrimitive(name.to_string())),
        }
    }

    /// Replaces the primitive array under `name` with a copy of `values`.
    pub fn put_primitive_array(&mut self, name: &str, values: Vec<PrimitiveValue>) -> ModelResult<()> {
        match self.fields.get(name) {
            Some(Node::PrimitiveArray(_)) | Some(Node::EmptyArray) | None => {
                self.fields
                    .insert(name.to_string(), Node::PrimitiveArray(values));
                Ok(())
            }
            Some(_) => Err(ModelError::NotPrimitiveArray(name.to_string())),
        }
    }

    /// Sets one element of a primitive array, extending it with zero values of the written
    /// kind when `index` is beyond the current length.
    pub fn set_primitive_array_index(
        &mut self,
        name: &str,
        index: usize,
        value: PrimitiveValue,
    ) -> ModelResult<()> {
        let node = self
            .fields
            .entry(name.to_string())
            .or_insert_with(|| Node::PrimitiveArray(Vec::new()));
        if matches!(node, Node::EmptyArray) {
            *node = Node::PrimitiveArray(Vec::new());
        }
        let Node::PrimitiveArray(arr) = node else {
            return Err(ModelError::NotPrimitiveArray(name.to_string()));
        };
        if index >= arr.len() {
            arr.resize(grown_len(index)?, value.default_of());
        }
        arr[index] = value;
        Ok(())
    }

    pub fn ensure_sub_object(&mut self, name: &str) -> ModelResult<&mut ObjectNode> {
        let node = self
            .fields
            .entry(name.to_string())
            .or_insert_with(|| Node::Object(ObjectNode::new()));
        match node {
            Node::Object(obj) => Ok(obj),
            _ => Err(ModelError::NotObject(name.to_string())),
        }
    }

    /// Returns the sub-object, `None` when absent.
    pub fn get_sub_object(&self, name: &str) -> ModelResult<Option<&ObjectNode>> {
        match self.fields.get(name) {
            None => Ok(None),
            Some(Node::Object(obj)) => Ok(Some(obj)),
            Some(_) => Err(ModelError::NotObject(name.to_string())),
        }
    }

    pub fn get_sub_object_mut(&mut self, name: &str) -> ModelResult<Option<&mut ObjectNode>> {
        match self.fields.get_mut(name) {
            None => Ok(None),
            Some(Node::Object(obj)) => Ok(Some(obj)),
            Some(_) => Err(ModelError::NotObject(name.to_string())),
        }
    }

    pub fn ensure_sub_array_with_object_elem(
        &mut self,
        name: &str,
    ) -> ModelResult<&mut Vec<ObjectNode>> {
        let node = self
            .fields
            .entry(name.to_string())
            .or_insert_with(|| Node::Array(Vec::new()));
        if matches!(node, Node::EmptyArray) {
            *node = Node::Array(Vec::new());
        }
        match node {
            Node::Array(arr) => Ok(arr),
            _ => Err(ModelError::NotObjectArray(name.to_string())),
        }
    }

    pub fn get_sub_array_with_object_elem(&self, name: &str) -> ModelResult<Option<&[ObjectNode]>> {
        match self.fields.get(name) {
            None => Ok(None),
            Some(Node::Array(arr)) => Ok(Some(arr)),
            Some(Node::EmptyArray) => Ok(Some(&[])),
            Some(_) => Err(ModelError::NotObjectArray(name.to_string())),
        }
    }

    /// Empty arrays are typed as object arrays by this call.
    pub fn get_sub_array_with_object_elem_mut(
        &mut self,
        name: &str,
    ) -> ModelResult<Option<&mut Vec<ObjectNode>>> {
        let Some(node) = self.fields.get_mut(name) else {
            return Ok(None);
        };
        if matches!(node, Node::EmptyArray) {
            *node = Node::Array(Vec::new());
        }
        match node {
            Node::Array(arr) => Ok(Some(arr)),
            _ => Err(ModelError::NotObjectArray(name.to_string())),
        }
    }

    /// Writes a primitive at a multi-segment path, creating intermediate levels.
    ///
    /// `name[i]` at an intermediate level addresses an object array element, at the last level
    /// a primitive array element. Both extend the array up to `i`.
    pub fn add_or_update_field(&mut self, full_path: &str, value: PrimitiveValue) -> ModelResult<()> {
        let segments = parse_runtime_path(full_path)?;
        let Some((last, intermediates)) = segments.split_last() else {
            return Err(ModelError::InvalidPath(full_path.to_string()));
        };

        let mut parent = self;
        for (name, index) in intermediates {
            parent = match index {
                None => parent.ensure_sub_object(name)?,
                Some(i) => {
                    let arr = parent.ensure_sub_array_with_object_elem(name)?;
                    ensure_array_element_with_index(arr, *i)?
                }
            };
        }

        let (name, index) = last;
        match index {
            None => parent.put_primitive_value(name, value),
            Some(i) => parent.set_primitive_array_index(name, *i, value),
        }
    }

    /// Removes the node at `full_path`. A missing intermediate level ends the walk silently.
    pub fn remove_object_by_path(&mut self, full_path: &str) -> ModelResult<()> {
        let segments = parse_runtime_path(full_path)?;
        let Some(((name, index), intermediates)) = segments.split_last() else {
            return Err(ModelError::InvalidPath(full_path.to_string()));
        };

        let mut parent = self;
        for (seg_name, seg_index) in intermediates {
            let next = match seg_index {
                None => match parent.fields.get_mut(*seg_name) {
                    None => return Ok(()),
                    Some(Node::Object(obj)) => obj,
                    Some(_) => return Err(ModelError::NotObject(seg_name.to_string())),
                },
                Some(i) => match parent.fields.get_mut(*seg_name) {
                    None => return Ok(()),
                    Some(Node::Array(arr)) => match arr.get_mut(*i) {
                        Some(elem) => elem,
                        None => return Ok(()),
                    },
                    Some(_) => return Err(ModelError::NotObjectArray(seg_name.to_string())),
                },
            };
            parent = next;
        }

        match index {
            None => {
                parent.fields.remove(*name);
            }
            Some(i) => match parent.fields.get_mut(*name) {
                Some(Node::Array(arr)) if *i < arr.len() => {
                    arr.remove(*i);
                }
                Some(Node::PrimitiveArray(arr)) if *i < arr.len() => {
                    arr.remove(*i);
                }
                _ => {}
            },
        }
        Ok(())
    }

    /// Copy holding only the named top-level fields. Missing names are skipped.
    pub fn project<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> ObjectNode {
        let fields = names
            .into_iter()
            .filter_map(|name| self.fields.get_key_value(name))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        ObjectNode { fields }
    }

    /// Puts an empty array under `name`. Existing arrays are emptied, primitive array or not.
    pub fn put_empty_array(&mut self, name: &str) -> ModelResult<()> {
        match self.fields.get_mut(name) {
            None => {
                self.fields.insert(name.to_string(), Node::EmptyArray);
                Ok(())
            }
            Some(Node::Array(arr)) => {
                arr.clear();
                Ok(())
            }
            Some(Node::PrimitiveArray(arr)) => {
                arr.clear();
                Ok(())
            }
            Some(Node::EmptyArray) => Ok(()),
            Some(_) => Err(ModelError::NotObjectArray(name.to_string())),
        }
    }

    pub fn to_general_object(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_general_object()))
                .collect::<Map<String, Value>>(),
        )
    }

    /// Copies every field of `other` into `self` without dropping existing fields.
    ///
    /// Objects merge recursively, object arrays merge element by element, primitives and
    /// primitive arrays are replaced. An empty array only adds the field when it is missing.
    pub fn merge_from(&mut self, other: &ObjectNode) -> ModelResult<()> {
        for (name, node) in &other.fields {
            match node {
                Node::Primitive(v) => self.put_primitive_value(name, v.clone())?,
                Node::PrimitiveArray(arr) => self.put_primitive_array(name, arr.clone())?,
                Node::Object(obj) => self.ensure_sub_object(name)?.merge_from(obj)?,
                Node::Array(elems) => {
                    let dst = self.ensure_sub_array_with_object_elem(name)?;
                    for (i, elem) in elems.iter().enumerate() {
                        ensure_array_element_with_index(dst, i)?.merge_from(elem)?;
                    }
                }
                Node::EmptyArray => match self.fields.get(name) {
                    None => {
                        self.fields.insert(name.to_string(), Node::EmptyArray);
                    }
                    Some(Node::Array(_)) | Some(Node::PrimitiveArray(_)) | Some(Node::EmptyArray) => {}
                    Some(_) => return Err(ModelError::NotObjectArray(name.to_string())),
                },
            }
        }
        Ok(())
    }
}

/// Appends an empty element and returns it.
pub fn ensure_array_element(arr: &mut Vec<ObjectNode>) -> &mut ObjectNode {
    arr.push(ObjectNode::new());
    let last = arr.len() - 1;
    &mut arr[last]
}

/// Returns the element at `index`, appending empty elements until it exists.
pub fn ensure_array_element_with_index(
    arr: &mut Vec<ObjectNode>,
    index: usize,
) -> ModelResult<&mut ObjectNode> {
    if index >= arr.len() {
        arr.resize_with(grown_len(index)?, ObjectNode::new);
    }
    Ok(&mut arr[index])
}

fn grown_len(index: usize) -> ModelResult<usize> {
    index
        .checked_add(1)
        .filter(|_| index <= MAX_ARRAY_INDEX)
        .ok_or(ModelError::IndexOutOfRange(index))
}

/// Splits a runtime path into `(name, access index)` pairs.
///
/// Namespace and attribute segments keep their prefix as the field name.
pub(crate) fn parse_runtime_path(full_path: &str) -> ModelResult<Vec<(&str, Option<usize>)>> {
    if !path::validate_full_path(full_path) {
        return Err(ModelError::InvalidPath(full_path.to_string()));
    }
    Ok(path::split_full_path(full_path)
        .into_iter()
        .map(|seg| match path::extract_array_path(seg) {
            (name, Some(ArrayIndex::Access(i))) => (name, Some(i)),
            (name, _) => (name, None),
        })
        .collect())
}
