//! Conversion between typed [`LcmRecord`]s and schema-agnostic [`Value`]s.
//!
//! [`to_structured`] cannot fail.  [`from_structured`] is schema-directed:
//! it fills omitted fields with the type's zero value, derives the size
//! field of a variable-length array when the caller left it out, and
//! rejects anything the schema does not describe.

use mbot_types::{BridgeError, Record, Scalar, Value};

use crate::directory::{TypeDirectory, TypeEntry};
use crate::record::{Field, LcmRecord};
use crate::schema::{Dimension, FieldSchema, FieldType, Primitive};

/// Nesting limit for zero-filling, guards against self-referencing schemas.
const MAX_DEPTH: usize = 32;

/// Render a record as an ordered structured value.
pub fn to_structured(record: &LcmRecord) -> Value {
    let mut out = Record::new();
    for (name, field) in &record.fields {
        out.insert(name.clone(), field_to_value(field));
    }
    Value::Record(out)
}

fn field_to_value(field: &Field) -> Value {
    match field {
        Field::I8(v) => Value::Scalar(Scalar::Int(i64::from(*v))),
        Field::I16(v) => Value::Scalar(Scalar::Int(i64::from(*v))),
        Field::I32(v) => Value::Scalar(Scalar::Int(i64::from(*v))),
        Field::I64(v) => Value::Scalar(Scalar::Int(*v)),
        Field::Byte(v) => Value::Scalar(Scalar::Int(i64::from(*v))),
        Field::F32(v) => Value::Scalar(Scalar::Float(f64::from(*v))),
        Field::F64(v) => Value::Scalar(Scalar::Float(*v)),
        Field::Str(s) => Value::Scalar(Scalar::Str(s.clone())),
        Field::Bool(b) => Value::Scalar(Scalar::Bool(*b)),
        Field::Struct(nested) => to_structured(nested),
        Field::Array(items) => Value::Seq(items.iter().map(field_to_value).collect()),
    }
}

/// Build a record of type `entry` from `value`.
///
/// # Errors
///
/// Returns [`BridgeError::SchemaMismatch`] when `value` is not a record,
/// names a field the type lacks, carries a value of the wrong shape or out
/// of range, or disagrees with an array's dimension.
pub fn from_structured(dir: &TypeDirectory, entry: &TypeEntry, value: &Value) -> Result<LcmRecord, BridgeError> {
    let record = value.as_record().ok_or_else(|| {
        BridgeError::mismatch(entry.name(), format!("expected a record, got {}", value.kind()))
    })?;
    build_record(dir, entry, record)
}

fn build_record(dir: &TypeDirectory, entry: &TypeEntry, value: &Record) -> Result<LcmRecord, BridgeError> {
    let schema = &entry.schema;
    if let Some((extra, _)) = value.iter().find(|(name, _)| schema.field_named(name).is_none()) {
        return Err(BridgeError::mismatch(entry.name(), format!("no field named {extra}")));
    }

    let mut record = LcmRecord::new(schema.name.clone());
    for fs in &schema.fields {
        let field = match (&fs.dim, value.get(&fs.name)) {
            (None, Some(v)) => convert(dir, entry, fs, &fs.ty, v)?,
            (None, None) => match derived_size(entry, fs, value)? {
                Some(len) => integer_field(entry, fs, prim_of(fs), len)?,
                None => zero_value(dir, entry, &fs.ty, 0)?,
            },
            (Some(dim), given) => build_array(dir, entry, fs, dim, given, &record)?,
        };
        record.fields.push((fs.name.clone(), field));
    }
    Ok(record)
}

/// When `fs` sizes one or more variable-length arrays present in `value`,
/// return the length those arrays agree on.
fn derived_size(entry: &TypeEntry, fs: &FieldSchema, value: &Record) -> Result<Option<i64>, BridgeError> {
    let mut derived: Option<(usize, &str)> = None;
    for sized in entry.schema.fields.iter().filter(|f| sizes(f, &fs.name)) {
        let Some(items) = value.get(&sized.name).and_then(Value::as_seq) else {
            continue;
        };
        match derived {
            Some((len, other)) if len != items.len() => {
                return Err(BridgeError::mismatch(
                    entry.name(),
                    format!(
                        "{other} has {len} elements but {} has {}, both sized by {}",
                        sized.name,
                        items.len(),
                        fs.name
                    ),
                ));
            }
            Some(_) => {}
            None => derived = Some((items.len(), sized.name.as_str())),
        }
    }
    Ok(derived.map(|(len, _)| len as i64))
}

fn sizes(field: &FieldSchema, size_field: &str) -> bool {
    matches!(&field.dim, Some(Dimension::Variable(name)) if name == size_field)
}

fn prim_of(fs: &FieldSchema) -> Primitive {
    match fs.ty {
        FieldType::Primitive(p) => p,
        // Size fields are validated as integer primitives at registration.
        FieldType::Struct(_) => Primitive::Int32,
    }
}

fn build_array(
    dir: &TypeDirectory,
    entry: &TypeEntry,
    fs: &FieldSchema,
    dim: &Dimension,
    given: Option<&Value>,
    built: &LcmRecord,
) -> Result<Field, BridgeError> {
    let expected = match dim {
        Dimension::Fixed(n) => *n,
        Dimension::Variable(size_field) => {
            let len = built.get(size_field).and_then(Field::as_len).unwrap_or(0);
            usize::try_from(len).map_err(|_| {
                BridgeError::mismatch(entry.name(), format!("{size_field} is negative ({len})"))
            })?
        }
    };

    let Some(given) = given else {
        let items = (0..expected)
            .map(|_| zero_value(dir, entry, &fs.ty, 0))
            .collect::<Result<_, _>>()?;
        return Ok(Field::Array(items));
    };

    let items = given.as_seq().ok_or_else(|| {
        BridgeError::mismatch(
            entry.name(),
            format!("{} must be a sequence, got {}", fs.name, given.kind()),
        )
    })?;
    if items.len() != expected {
        let bound = match dim {
            Dimension::Fixed(n) => format!("fixed length {n}"),
            Dimension::Variable(size_field) => format!("{size_field} = {expected}"),
        };
        return Err(BridgeError::mismatch(
            entry.name(),
            format!("{} has {} elements, expected {bound}", fs.name, items.len()),
        ));
    }
    items
        .iter()
        .map(|item| convert(dir, entry, fs, &fs.ty, item))
        .collect::<Result<_, _>>()
        .map(Field::Array)
}

fn convert(
    dir: &TypeDirectory,
    entry: &TypeEntry,
    fs: &FieldSchema,
    ty: &FieldType,
    value: &Value,
) -> Result<Field, BridgeError> {
    let wrong_shape = |expected: &str| {
        BridgeError::mismatch(
            entry.name(),
            format!("{} expects {expected}, got {}", fs.name, value.kind()),
        )
    };

    match ty {
        FieldType::Struct(name) => {
            let nested = nested_entry(dir, entry, name)?;
            let record = value.as_record().ok_or_else(|| wrong_shape("a record"))?;
            build_record(dir, nested, record).map(Field::Struct)
        }
        FieldType::Primitive(prim) if prim.is_integer() => {
            let v = value.as_i64().ok_or_else(|| wrong_shape(prim.lcm_name()))?;
            integer_field(entry, fs, *prim, v)
        }
        FieldType::Primitive(Primitive::Float) => value
            .as_f64()
            .map(|v| Field::F32(v as f32))
            .ok_or_else(|| wrong_shape("float")),
        FieldType::Primitive(Primitive::Double) => value
            .as_f64()
            .map(Field::F64)
            .ok_or_else(|| wrong_shape("double")),
        FieldType::Primitive(Primitive::Boolean) => match value {
            Value::Scalar(Scalar::Bool(b)) => Ok(Field::Bool(*b)),
            _ => Err(wrong_shape("boolean")),
        },
        FieldType::Primitive(Primitive::String) => match value {
            Value::Scalar(Scalar::Str(s)) => Ok(Field::Str(s.clone())),
            _ => Err(wrong_shape("string")),
        },
        FieldType::Primitive(_) => Err(wrong_shape("an integer")),
    }
}

fn integer_field(entry: &TypeEntry, fs: &FieldSchema, prim: Primitive, v: i64) -> Result<Field, BridgeError> {
    let out_of_range = || {
        BridgeError::mismatch(
            entry.name(),
            format!("{} value {v} is out of range for {}", fs.name, prim.lcm_name()),
        )
    };
    Ok(match prim {
        Primitive::Int8 => Field::I8(i8::try_from(v).map_err(|_| out_of_range())?),
        Primitive::Int16 => Field::I16(i16::try_from(v).map_err(|_| out_of_range())?),
        Primitive::Int32 => Field::I32(i32::try_from(v).map_err(|_| out_of_range())?),
        Primitive::Int64 => Field::I64(v),
        Primitive::Byte => Field::Byte(u8::try_from(v).map_err(|_| out_of_range())?),
        _ => return Err(out_of_range()),
    })
}

fn nested_entry<'a>(dir: &'a TypeDirectory, parent: &TypeEntry, name: &str) -> Result<&'a TypeEntry, BridgeError> {
    dir.lookup(&parent.namespace, name)
        .ok_or_else(|| BridgeError::mismatch(parent.name(), format!("unknown nested type {name}")))
}

/// The value a freshly constructed record holds in a field of type `ty`.
fn zero_value(dir: &TypeDirectory, parent: &TypeEntry, ty: &FieldType, depth: usize) -> Result<Field, BridgeError> {
    Ok(match ty {
        FieldType::Primitive(Primitive::Int8) => Field::I8(0),
        FieldType::Primitive(Primitive::Int16) => Field::I16(0),
        FieldType::Primitive(Primitive::Int32) => Field::I32(0),
        FieldType::Primitive(Primitive::Int64) => Field::I64(0),
        FieldType::Primitive(Primitive::Byte) => Field::Byte(0),
        FieldType::Primitive(Primitive::Float) => Field::F32(0.0),
        FieldType::Primitive(Primitive::Double) => Field::F64(0.0),
        FieldType::Primitive(Primitive::String) => Field::Str(String::new()),
        FieldType::Primitive(Primitive::Boolean) => Field::Bool(false),
        FieldType::Struct(name) => {
            if depth >= MAX_DEPTH {
                return Err(BridgeError::mismatch(
                    parent.name(),
                    format!("{name} nests too deeply to default"),
                ));
            }
            let entry = nested_entry(dir, parent, name)?;
            let mut record = LcmRecord::new(entry.schema.name.clone());
            for fs in &entry.schema.fields {
                let field = match &fs.dim {
                    None => zero_value(dir, entry, &fs.ty, depth + 1)?,
                    Some(Dimension::Fixed(n)) => Field::Array(
                        (0..*n)
                            .map(|_| zero_value(dir, entry, &fs.ty, depth + 1))
                            .collect::<Result<_, _>>()?,
                    ),
                    Some(Dimension::Variable(_)) => Field::Array(Vec::new()),
                };
                record.fields.push((fs.name.clone(), field));
            }
            Field::Struct(record)
        }
    })
}
