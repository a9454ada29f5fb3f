use super::node::{Node, ObjectNode};
use super::{ModelError, ModelResult, PrimitiveValue};
use crate::path::{self, ArrayIndex};
use serde_json::{Map, Value};

/// Read view over one object level of either a model tree or a raw JSON map.
///
/// This is the source side of every transfer; destinations are always [`ObjectNode`]s.
#[derive(Debug, Clone, Copy)]
pub enum SourceRef<'a> {
    Tree(&'a ObjectNode),
    Map(&'a Map<String, Value>),
}

/// Read view over an object array.
#[derive(Debug, Clone, Copy)]
pub enum SourceArray<'a> {
    Tree(&'a [ObjectNode]),
    Json(&'a [Value]),
}

impl<'a> SourceRef<'a> {
    /// Reads a primitive field; absent (or `null`) fields yield `None`.
    pub fn primitive(&self, name: &str) -> ModelResult<Option<PrimitiveValue>> {
        match self {
            SourceRef::Tree(obj) => match obj.get(name) {
                None => Ok(None),
                Some(Node::Primitive(v)) => Ok(Some(v.clone())),
                Some(_) => Err(ModelError::NotPrimitive(name.to_string())),
            },
            SourceRef::Map(map) => match map.get(name) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::Array(_)) | Some(Value::Object(_)) => {
                    Err(ModelError::NotPrimitive(name.to_string()))
                }
                Some(v) => PrimitiveValue::from_json(v),
            },
        }
    }

    /// Reads a primitive array field. `null` elements of a JSON array are skipped.
    pub fn primitive_array(&self, name: &str) -> ModelResult<Option<Vec<PrimitiveValue>>> {
        match self {
            SourceRef::Tree(obj) => match obj.get(name) {
                None => Ok(None),
                Some(Node::PrimitiveArray(arr)) => Ok(Some(arr.clone())),
                Some(Node::EmptyArray) => Ok(Some(Vec::new())),
                Some(_) => Err(ModelError::NotPrimitiveArray(name.to_string())),
            },
            SourceRef::Map(map) => match map.get(name) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::Array(items)) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        if item.is_array() || item.is_object() {
                            return Err(ModelError::NotPrimitiveArray(name.to_string()));
                        }
                        if let Some(v) = PrimitiveValue::from_json(item)? {
                            out.push(v);
                        }
                    }
                    Ok(Some(out))
                }
                Some(_) => Err(ModelError::NotPrimitiveArray(name.to_string())),
            },
        }
    }

    /// Returns the sub-object, `None` when absent.
    pub fn sub_object(&self, name: &str) -> ModelResult<Option<SourceRef<'a>>> {
        match *self {
            SourceRef::Tree(obj) => Ok(obj.get_sub_object(name)?.map(SourceRef::Tree)),
            SourceRef::Map(map) => match map.get(name) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::Object(sub)) => Ok(Some(SourceRef::Map(sub))),
                Some(_) => Err(ModelError::NotObject(name.to_string())),
            },
        }
    }

    /// Returns the object array, `None` when absent.
    ///
    /// For JSON input only the first non-null element is checked to be an object.
    pub fn sub_array(&self, name: &str) -> ModelResult<Option<SourceArray<'a>>> {
        match *self {
            SourceRef::Tree(obj) => Ok(obj
                .get_sub_array_with_object_elem(name)?
                .map(SourceArray::Tree)),
            SourceRef::Map(map) => match map.get(name) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::Array(items)) => {
                    match items.iter().find(|v| !v.is_null()) {
                        None | Some(Value::Object(_)) => Ok(Some(SourceArray::Json(items))),
                        Some(_) => Err(ModelError::NotObjectArray(name.to_string())),
                    }
                }
                Some(_) => Err(ModelError::NotObjectArray(name.to_string())),
            },
        }
    }

    pub fn transfer_value(
        &self,
        src_name: &str,
        dst_name: &str,
        dst: &mut ObjectNode,
    ) -> ModelResult<()> {
        match self.primitive(src_name)? {
            Some(v) => dst.put_primitive_value(dst_name, v),
            None => Ok(()),
        }
    }

    pub fn transfer_primitive_array(
        &self,
        src_name: &str,
        dst_name: &str,
        dst: &mut ObjectNode,
    ) -> ModelResult<()> {
        match self.primitive_array(src_name)? {
            Some(arr) => dst.put_primitive_array(dst_name, arr),
            None => Ok(()),
        }
    }

    /// Looks up the general value at a runtime path.
    pub fn lookup(&self, full_path: &str) -> Option<Value> {
        let segments = path::split_full_path(full_path);
        let (last, intermediates) = segments.split_last()?;

        let mut current = *self;
        for seg in intermediates {
            current = match path::extract_array_path(seg) {
                (name, None) => current.sub_object(name).ok()??,
                (name, Some(ArrayIndex::Access(i))) => current.sub_array(name).ok()??.get(i)?,
                (_, Some(ArrayIndex::Definition)) => return None,
            };
        }

        match path::extract_array_path(last) {
            (name, None) => current.field_value(name),
            (name, Some(ArrayIndex::Access(i))) => match current.field_value(name)? {
                Value::Array(items) => items.into_iter().nth(i),
                _ => None,
            },
            (_, Some(ArrayIndex::Definition)) => None,
        }
    }

    /// Reads a primitive at a runtime path, `None` when absent or not primitive.
    pub fn get_field(&self, full_path: &str) -> Option<PrimitiveValue> {
        self.lookup(full_path)
            .and_then(|v| PrimitiveValue::from_json(&v).ok().flatten())
    }

    fn field_value(&self, name: &str) -> Option<Value> {
        match self {
            SourceRef::Tree(obj) => obj.get(name).map(Node::to_general_object),
            SourceRef::Map(map) => map.get(name).filter(|v| !v.is_null()).cloned(),
        }
    }

    pub fn to_general_object(&self) -> Value {
        match self {
            SourceRef::Tree(obj) => obj.to_general_object(),
            SourceRef::Map(map) => Value::Object((*map).clone()),
        }
    }

    /// Copies every field into `dst`, keeping fields of `dst` that the source lacks.
    pub fn merge_into(&self, dst: &mut ObjectNode) -> ModelResult<()> {
        match self {
            SourceRef::Tree(obj) => dst.merge_from(obj),
            SourceRef::Map(map) => merge_json_object(map, dst),
        }
    }
}

impl<'a> SourceArray<'a> {
    /// Element at `index`. `null` JSON elements read as absent.
    pub fn get(&self, index: usize) -> Option<SourceRef<'a>> {
        match *self {
            SourceArray::Tree(items) => items.get(index).map(SourceRef::Tree),
            SourceArray::Json(items) => match items.get(index)? {
                Value::Object(map) => Some(SourceRef::Map(map)),
                _ => None,
            },
        }
    }

    /// Visits every element in order. `null` JSON elements are skipped.
    pub fn for_each_element<F>(&self, mut f: F) -> ModelResult<()>
    where
        F: FnMut(SourceRef<'a>) -> ModelResult<()>,
    {
        match *self {
            SourceArray::Tree(items) => items.iter().try_for_each(|item| f(SourceRef::Tree(item))),
            SourceArray::Json(items) => items.iter().try_for_each(|item| match item {
                Value::Null => Ok(()),
                Value::Object(map) => f(SourceRef::Map(map)),
                _ => Err(ModelError::NotObjectArray("element".to_string())),
            }),
        }
    }
}

fn merge_json_object(map: &Map<String, Value>, dst: &mut ObjectNode) -> ModelResult<()> {
    for (name, value) in map {
        match value {
            Value::Null => {}
            Value::Object(sub) => merge_json_object(sub, dst.ensure_sub_object(name)?)?,
            Value::Array(items) => match items.iter().find(|v| !v.is_null()) {
                None => dst.put_empty_array(name)?,
                Some(Value::Object(_)) => {
                    let arr = dst.ensure_sub_array_with_object_elem(name)?;
                    for (i, item) in items.iter().enumerate() {
                        let elem = super::node::ensure_array_element_with_index(arr, i)?;
                        if let Value::Object(sub) = item {
                            merge_json_object(sub, elem)?;
                        }
                    }
                }
                Some(_) => {
                    let values = SourceRef::Map(map)
                        .primitive_array(name)?
                        .unwrap_or_default();
                    dst.put_primitive_array(name, values)?;
                }
            },
            scalar => {
                if let Some(v) = PrimitiveValue::from_json(scalar)? {
                    dst.put_primitive_value(name, v)?;
                }
            }
        }
    }
    Ok(())
}
