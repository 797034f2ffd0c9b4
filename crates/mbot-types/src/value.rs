//! [`Value`] – the generic, schema-agnostic structured value.
//!
//! A decoded binary record is turned into a `Value` before it crosses the
//! JSON boundary, and JSON coming from a client is turned into a `Value`
//! before it is checked against a schema.  Conversion to and from
//! [`serde_json::Value`] is lossless except for non-finite floats, which JSON
//! cannot express and which are rendered as `null`.

use serde_json::{Map, Number};

use crate::BridgeError;

/// A single leaf value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Tagged structured value: a scalar, a sequence, or an ordered record.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(Scalar),
    Seq(Vec<Value>),
    Record(Record),
}

/// Ordered mapping from field name to [`Value`].
///
/// Field order is preserved so that a record renders with its fields in
/// schema declaration order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` under `name`, replacing (in place) any existing entry.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Builder-style [`Record::insert`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Value {
    /// Short description of the value's shape, used in mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Scalar(Scalar::Bool(_)) => "boolean",
            Value::Scalar(Scalar::Int(_)) => "integer",
            Value::Scalar(Scalar::Float(_)) => "float",
            Value::Scalar(Scalar::Str(_)) => "string",
            Value::Seq(_) => "sequence",
            Value::Record(_) => "record",
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Scalar(Scalar::Int(i)) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view: integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Scalar(Scalar::Int(i)) => Some(*i as f64),
            Value::Scalar(Scalar::Float(f)) => Some(*f),
            _ => None,
        }
    }

    /// Render as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Scalar(Scalar::Bool(b)) => serde_json::Value::Bool(*b),
            Value::Scalar(Scalar::Int(i)) => serde_json::Value::Number((*i).into()),
            Value::Scalar(Scalar::Float(f)) => Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Scalar(Scalar::Str(s)) => serde_json::Value::String(s.clone()),
            Value::Seq(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Record(record) => {
                let mut map = Map::with_capacity(record.len());
                for (name, value) in record.iter() {
                    map.insert(name.to_string(), value.to_json());
                }
                serde_json::Value::Object(map)
            }
        }
    }

    /// Build from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ProtocolParse`] for `null`, which has no
    /// counterpart in a binary record.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, BridgeError> {
        Ok(match json {
            serde_json::Value::Null => {
                return Err(BridgeError::parse("null is not a valid field value"));
            }
            serde_json::Value::Bool(b) => Value::Scalar(Scalar::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Scalar(Scalar::Int(i)),
                // u64 above i64::MAX and every non-integral number.
                None => Value::Scalar(Scalar::Float(n.as_f64().unwrap_or(f64::NAN))),
            },
            serde_json::Value::String(s) => Value::Scalar(Scalar::Str(s.clone())),
            serde_json::Value::Array(items) => {
                Value::Seq(items.iter().map(Value::from_json).collect::<Result<_, _>>()?)
            }
            serde_json::Value::Object(map) => {
                let mut record = Record::new();
                for (name, value) in map {
                    record.insert(name.clone(), Value::from_json(value)?);
                }
                Value::Record(record)
            }
        })
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Scalar(Scalar::Bool(b))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Scalar(Scalar::Int(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Scalar(Scalar::Float(f))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Scalar(Scalar::Str(s.to_string()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Scalar(Scalar::Str(s))
    }
}

impl From<Record> for Value {
    fn from(r: Record) -> Self {
        Value::Record(r)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Seq(items)
    }
}
