use super::ModelError;
use crate::schema::DataType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Canonical primitive stored in a model.
///
/// Every write is normalized into one of these four kinds. Conversions from native integer
/// types narrower than 64 bits are infallible; unsigned 64-bit (and wider) inputs are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimitiveValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl PrimitiveValue {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Bool(_) => DataType::Bool,
            Self::Int(_) => DataType::Int,
            Self::Float(_) => DataType::Float,
            Self::String(_) => DataType::String,
        }
    }

    /// Zero value of the same kind, used when extending primitive arrays.
    pub fn default_of(&self) -> Self {
        match self {
            Self::Bool(_) => Self::Bool(false),
            Self::Int(_) => Self::Int(0),
            Self::Float(_) => Self::Float(0.0),
            Self::String(_) => Self::String(String::new()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::String(s) => Value::String(s.clone()),
        }
    }

    /// Converts a JSON scalar. `null` yields `None`; containers are rejected.
    pub fn from_json(value: &Value) -> Result<Option<Self>, ModelError> {
        match value {
            Value::Null => Ok(None),
            Value::Bool(b) => Ok(Some(Self::Bool(*b))),
            Value::String(s) => Ok(Some(Self::String(s.clone()))),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Some(Self::Int(i)))
                } else if n.is_u64() {
                    Err(ModelError::UnsupportedPrimitive(format!(
                        "unsigned integer {n} exceeds 64-bit signed range"
                    )))
                } else {
                    n.as_f64().map(|f| Some(Self::Float(f))).ok_or_else(|| {
                        ModelError::UnsupportedPrimitive(format!("number {n}"))
                    })
                }
            }
            Value::Array(_) | Value::Object(_) => Err(ModelError::UnsupportedPrimitive(
                "container value is not primitive".to_string(),
            )),
        }
    }
}

impl fmt::Display for PrimitiveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

macro_rules! from_lossless {
    ($variant:ident, $target:ty; $($t:ty),*) => {
        $(
            impl From<$t> for PrimitiveValue {
                fn from(v: $t) -> Self {
                    Self::$variant(<$target>::from(v))
                }
            }
        )*
    };
}

from_lossless!(Int, i64; i8, i16, i32, i64, u8, u16, u32);
from_lossless!(Float, f64; f32, f64);

impl From<bool> for PrimitiveValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<String> for PrimitiveValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for PrimitiveValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<isize> for PrimitiveValue {
    fn from(v: isize) -> Self {
        // isize is at most 64 bits on supported targets
        Self::Int(v as i64)
    }
}

macro_rules! reject_unsigned {
    ($($t:ty),*) => {
        $(
            impl TryFrom<$t> for PrimitiveValue {
                type Error = ModelError;

                fn try_from(_: $t) -> Result<Self, Self::Error> {
                    Err(ModelError::UnsupportedPrimitive(
                        concat!("currently ", stringify!($t), " is not supported for conversion")
                            .to_string(),
                    ))
                }
            }
        )*
    };
}

reject_unsigned!(u64, usize, u128, i128);

impl TryFrom<&Value> for PrimitiveValue {
    type Error = ModelError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        Self::from_json(value)?.ok_or_else(|| {
            ModelError::UnsupportedPrimitive("null is not a primitive value".to_string())
        })
    }
}
