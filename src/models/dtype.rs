//! Element types and values for typed arrays.
//!
//! Every array has a scalar `DType` and an item shape (trailing dimensions,
//! empty for scalar elements). Values are coerced into that layout on
//! assignment and stored with a fixed-width little-endian encoding.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Scalar element type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    /// Fixed-width UTF-8 byte string, zero padded.
    Str(usize),
}

impl DType {
    /// Encoded width of one scalar in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
            Self::Str(width) => *width,
        }
    }

    /// Encoded width of one element with the given item shape, `None` on overflow.
    pub fn item_size(&self, shape: &[usize]) -> Option<usize> {
        shape
            .iter()
            .try_fold(self.size(), |acc, &dim| acc.checked_mul(dim))
    }

    /// Zero value of one element with the given item shape.
    pub fn zero(&self, shape: &[usize]) -> Value {
        match shape.split_first() {
            None => match self {
                Self::Bool => Value::Bool(false),
                Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64 => Value::Int(0),
                Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64 => Value::UInt(0),
                Self::Float32 | Self::Float64 => Value::Float(0.0),
                Self::Str(_) => Value::Str(String::new()),
            },
            Some((&n, rest)) => Value::List((0..n).map(|_| self.zero(rest)).collect()),
        }
    }

    fn signed_range(&self) -> Option<(i64, i64)> {
        match self {
            Self::Int8 => Some((i8::MIN as i64, i8::MAX as i64)),
            Self::Int16 => Some((i16::MIN as i64, i16::MAX as i64)),
            Self::Int32 => Some((i32::MIN as i64, i32::MAX as i64)),
            Self::Int64 => Some((i64::MIN, i64::MAX)),
            _ => None,
        }
    }

    fn unsigned_max(&self) -> Option<u64> {
        match self {
            Self::UInt8 => Some(u8::MAX as u64),
            Self::UInt16 => Some(u16::MAX as u64),
            Self::UInt32 => Some(u32::MAX as u64),
            Self::UInt64 => Some(u64::MAX),
            _ => None,
        }
    }

    /// Coerce a scalar value into this dtype.
    ///
    /// The result is the canonical variant for the dtype: `Int` for signed
    /// integers, `UInt` for unsigned, `Float` for floats.
    pub fn coerce(&self, value: &Value) -> Result<Value, TypeError> {
        let mismatch = || TypeError::Mismatch {
            dtype: *self,
            found: value.kind(),
        };
        let out_of_range = || TypeError::OutOfRange {
            dtype: *self,
            value: value.to_string(),
        };

        if let Some((min, max)) = self.signed_range() {
            let v = match value {
                Value::Bool(b) => *b as i64,
                Value::Int(i) => *i,
                Value::UInt(u) => i64::try_from(*u).map_err(|_| out_of_range())?,
                Value::Float(f) => {
                    let f = float_to_integer(*f).ok_or_else(out_of_range)?;
                    if f < i64::MIN as f64 || f >= i64::MAX as f64 {
                        return Err(out_of_range());
                    }
                    f as i64
                }
                _ => return Err(mismatch()),
            };
            if v < min || v > max {
                return Err(out_of_range());
            }
            return Ok(Value::Int(v));
        }

        if let Some(max) = self.unsigned_max() {
            let v = match value {
                Value::Bool(b) => *b as u64,
                Value::Int(i) => u64::try_from(*i).map_err(|_| out_of_range())?,
                Value::UInt(u) => *u,
                Value::Float(f) => {
                    let f = float_to_integer(*f).ok_or_else(out_of_range)?;
                    if f < 0.0 || f >= u64::MAX as f64 {
                        return Err(out_of_range());
                    }
                    f as u64
                }
                _ => return Err(mismatch()),
            };
            if v > max {
                return Err(out_of_range());
            }
            return Ok(Value::UInt(v));
        }

        match self {
            Self::Bool => match value {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::Int(0) | Value::UInt(0) => Ok(Value::Bool(false)),
                Value::Int(1) | Value::UInt(1) => Ok(Value::Bool(true)),
                Value::Int(_) | Value::UInt(_) => Err(out_of_range()),
                _ => Err(mismatch()),
            },
            Self::Float32 | Self::Float64 => {
                let f = match value {
                    Value::Bool(b) => *b as u8 as f64,
                    Value::Int(i) => *i as f64,
                    Value::UInt(u) => *u as f64,
                    Value::Float(f) => *f,
                    _ => return Err(mismatch()),
                };
                if *self == Self::Float32 {
                    if f.is_finite() && f.abs() > f32::MAX as f64 {
                        return Err(out_of_range());
                    }
                    Ok(Value::Float(f as f32 as f64))
                } else {
                    Ok(Value::Float(f))
                }
            }
            Self::Str(width) => match value {
                // Padding is NUL, so a NUL in the text would not read back.
                Value::Str(s) if s.contains('\0') => Err(TypeError::EmbeddedNul { dtype: *self }),
                Value::Str(s) if s.len() <= *width => Ok(Value::Str(s.clone())),
                Value::Str(s) => Err(TypeError::StringTooLong {
                    dtype: *self,
                    len: s.len(),
                }),
                _ => Err(mismatch()),
            },
            _ => Err(TypeError::Internal(format!("unhandled dtype {self}"))),
        }
    }

    /// Coerce a value into one element of the given item shape.
    pub fn coerce_element(&self, shape: &[usize], value: &Value) -> Result<Value, TypeError> {
        match shape.split_first() {
            None => self.coerce(value),
            Some((&n, rest)) => match value {
                Value::List(items) if items.len() == n => items
                    .iter()
                    .map(|item| self.coerce_element(rest, item))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::List),
                Value::List(items) => Err(TypeError::Shape {
                    expected: n,
                    found: items.len(),
                }),
                other => Err(TypeError::Mismatch {
                    dtype: *self,
                    found: other.kind(),
                }),
            },
        }
    }

    /// Append the encoding of an already coerced element to `buf`.
    pub fn encode(&self, shape: &[usize], value: &Value, buf: &mut Vec<u8>) -> Result<(), TypeError> {
        if let Some((_, rest)) = shape.split_first() {
            let Value::List(items) = value else {
                return Err(TypeError::Mismatch {
                    dtype: *self,
                    found: value.kind(),
                });
            };
            for item in items {
                self.encode(rest, item, buf)?;
            }
            return Ok(());
        }

        match (self, value) {
            (Self::Bool, Value::Bool(b)) => buf.push(*b as u8),
            (Self::Int8, Value::Int(i)) => buf.extend_from_slice(&(*i as i8).to_le_bytes()),
            (Self::Int16, Value::Int(i)) => buf.extend_from_slice(&(*i as i16).to_le_bytes()),
            (Self::Int32, Value::Int(i)) => buf.extend_from_slice(&(*i as i32).to_le_bytes()),
            (Self::Int64, Value::Int(i)) => buf.extend_from_slice(&i.to_le_bytes()),
            (Self::UInt8, Value::UInt(u)) => buf.push(*u as u8),
            (Self::UInt16, Value::UInt(u)) => buf.extend_from_slice(&(*u as u16).to_le_bytes()),
            (Self::UInt32, Value::UInt(u)) => buf.extend_from_slice(&(*u as u32).to_le_bytes()),
            (Self::UInt64, Value::UInt(u)) => buf.extend_from_slice(&u.to_le_bytes()),
            (Self::Float32, Value::Float(f)) => buf.extend_from_slice(&(*f as f32).to_le_bytes()),
            (Self::Float64, Value::Float(f)) => buf.extend_from_slice(&f.to_le_bytes()),
            (Self::Str(width), Value::Str(s)) if s.len() <= *width => {
                buf.extend_from_slice(s.as_bytes());
                buf.resize(buf.len() + width - s.len(), 0);
            }
            _ => {
                return Err(TypeError::Mismatch {
                    dtype: *self,
                    found: value.kind(),
                });
            }
        }
        Ok(())
    }

    /// Decode one element of the given item shape.
    pub fn decode(&self, shape: &[usize], bytes: &[u8]) -> Result<Value, TypeError> {
        let Some(expected) = self.item_size(shape) else {
            return Err(TypeError::Internal(format!("{self}{shape:?} is too large to decode")));
        };
        if bytes.len() != expected {
            return Err(TypeError::Internal(format!(
                "expected {expected} bytes for {self}{shape:?}, got {}",
                bytes.len()
            )));
        }
        Ok(self.decode_unchecked(shape, bytes))
    }

    fn decode_unchecked(&self, shape: &[usize], bytes: &[u8]) -> Value {
        if let Some((&n, rest)) = shape.split_first() {
            // Only an empty leading dimension can hide an overflowing remainder.
            let step = self.item_size(rest).unwrap_or(0);
            return Value::List(
                (0..n)
                    .map(|k| self.decode_unchecked(rest, &bytes[k * step..(k + 1) * step]))
                    .collect(),
            );
        }

        // Lengths are checked by the caller, so the conversions below cannot fail.
        let arr = |n: usize| -> [u8; 8] {
            let mut out = [0u8; 8];
            out[..n].copy_from_slice(&bytes[..n]);
            out
        };
        match self {
            Self::Bool => Value::Bool(bytes[0] != 0),
            Self::Int8 => Value::Int(bytes[0] as i8 as i64),
            Self::Int16 => Value::Int(i16::from_le_bytes([bytes[0], bytes[1]]) as i64),
            Self::Int32 => {
                Value::Int(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64)
            }
            Self::Int64 => Value::Int(i64::from_le_bytes(arr(8))),
            Self::UInt8 => Value::UInt(bytes[0] as u64),
            Self::UInt16 => Value::UInt(u16::from_le_bytes([bytes[0], bytes[1]]) as u64),
            Self::UInt32 => {
                Value::UInt(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64)
            }
            Self::UInt64 => Value::UInt(u64::from_le_bytes(arr(8))),
            Self::Float32 => Value::Float(
                f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
            ),
            Self::Float64 => Value::Float(f64::from_le_bytes(arr(8))),
            Self::Str(_) => {
                let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
                Value::Str(String::from_utf8_lossy(&bytes[..end]).into_owned())
            }
        }
    }
}

fn float_to_integer(f: f64) -> Option<f64> {
    (f.is_finite() && f.fract() == 0.0).then_some(f)
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Int8 => write!(f, "int8"),
            Self::Int16 => write!(f, "int16"),
            Self::Int32 => write!(f, "int32"),
            Self::Int64 => write!(f, "int64"),
            Self::UInt8 => write!(f, "uint8"),
            Self::UInt16 => write!(f, "uint16"),
            Self::UInt32 => write!(f, "uint32"),
            Self::UInt64 => write!(f, "uint64"),
            Self::Float32 => write!(f, "float32"),
            Self::Float64 => write!(f, "float64"),
            Self::Str(width) => write!(f, "str{width}"),
        }
    }
}

impl FromStr for DType {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dtype = match s.trim().to_ascii_lowercase().as_str() {
            "bool" => Self::Bool,
            "int8" | "i8" => Self::Int8,
            "int16" | "i16" => Self::Int16,
            "int32" | "i32" => Self::Int32,
            "int64" | "i64" | "int" => Self::Int64,
            "uint8" | "u8" => Self::UInt8,
            "uint16" | "u16" => Self::UInt16,
            "uint32" | "u32" => Self::UInt32,
            "uint64" | "u64" => Self::UInt64,
            "float32" | "f32" => Self::Float32,
            "float64" | "f64" | "float" => Self::Float64,
            other => {
                let width = other
                    .strip_prefix("str")
                    .and_then(|w| w.parse::<usize>().ok())
                    .filter(|w| *w > 0)
                    .ok_or_else(|| TypeError::UnknownDType(s.to_string()))?;
                Self::Str(width)
            }
        };
        Ok(dtype)
    }
}

impl TryFrom<String> for DType {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DType> for String {
    fn from(dtype: DType) -> Self {
        dtype.to_string()
    }
}

/// A value produced by an item function or read back from an array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::List(_) => "list",
        }
    }

    /// Convert from JSON. `null` and objects have no array representation.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, TypeError> {
        match json {
            serde_json::Value::Bool(b) => Ok(Self::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Int(i))
                } else if let Some(u) = n.as_u64() {
                    Ok(Self::UInt(u))
                } else {
                    n.as_f64()
                        .map(Self::Float)
                        .ok_or_else(|| TypeError::Unrepresentable(n.to_string()))
                }
            }
            serde_json::Value::String(s) => Ok(Self::Str(s.clone())),
            serde_json::Value::Array(items) => items
                .iter()
                .map(Self::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            serde_json::Value::Null => Err(TypeError::Unrepresentable("null".to_string())),
            serde_json::Value::Object(_) => Err(TypeError::Unrepresentable("object".to_string())),
        }
    }

    /// Convert to JSON. Non-finite floats become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::UInt(u) => serde_json::Value::from(*u),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) if !v.is_finite() => write!(f, "{v}"),
            _ => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::UInt(v as u64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Self::UInt(v as u64)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(v as f64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

/// A value that does not fit an array's element layout.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TypeError {
    #[error("cannot store {found} as {dtype}")]
    Mismatch { dtype: DType, found: &'static str },

    #[error("{value} is out of range for {dtype}")]
    OutOfRange { dtype: DType, value: String },

    #[error("string of {len} bytes does not fit {dtype}")]
    StringTooLong { dtype: DType, len: usize },

    #[error("{dtype} cannot hold a string containing NUL")]
    EmbeddedNul { dtype: DType },

    #[error("expected {expected} elements, found {found}")]
    Shape { expected: usize, found: usize },

    #[error("unknown dtype '{0}'")]
    UnknownDType(String),

    #[error("{0} has no array representation")]
    Unrepresentable(String),

    #[error("{0}")]
    Internal(String),
}
