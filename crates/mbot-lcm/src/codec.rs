//! LCM wire encoding.
//!
//! A payload is an 8-byte big-endian fingerprint followed by the record's
//! fields in declaration order, all big-endian.  Nested records are written
//! inline without their own fingerprint.  Strings are an `int32` length that
//! counts the trailing NUL, the UTF-8 bytes, then the NUL.  Booleans take one
//! byte.

use mbot_types::BridgeError;

use crate::directory::{TypeDirectory, TypeEntry};
use crate::record::{Field, LcmRecord};
use crate::schema::{Dimension, FieldType, Primitive, TypeSchema};

const BASE_HASH: i64 = 0x1234_5678;

fn hash_update(v: i64, c: i8) -> i64 {
    ((v << 8) ^ (v >> 55)).wrapping_add(i64::from(c))
}

fn hash_string_update(mut v: i64, s: &str) -> i64 {
    v = hash_update(v, s.len() as i8);
    for b in s.bytes() {
        v = hash_update(v, b as i8);
    }
    v
}

/// Hash over this schema alone: field names, primitive type names and array
/// dimensions.  Nested types contribute through [`fold_fingerprint`].
pub(crate) fn base_hash(schema: &TypeSchema) -> i64 {
    let mut v = BASE_HASH;
    for field in &schema.fields {
        v = hash_string_update(v, &field.name);
        if let FieldType::Primitive(prim) = field.ty {
            v = hash_string_update(v, prim.lcm_name());
        }
        match &field.dim {
            None => v = hash_update(v, 0),
            Some(dim) => {
                v = hash_update(v, 1);
                v = hash_update(v, dim.mode() as i8);
                v = hash_string_update(v, &dim.size_string());
            }
        }
    }
    v
}

/// Combine a base hash with the fingerprints of the nested types and rotate
/// left by one bit.
pub(crate) fn fold_fingerprint(base: i64, nested: impl IntoIterator<Item = u64>) -> u64 {
    let sum = nested
        .into_iter()
        .fold(base as u64, |acc, h| acc.wrapping_add(h));
    sum.rotate_left(1)
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────────────────

/// Encode `record` as a complete payload of type `entry`.
///
/// # Errors
///
/// Returns [`BridgeError::Encode`] when a field is missing, has the wrong
/// width, or an array length disagrees with its dimension.
pub fn encode(dir: &TypeDirectory, entry: &TypeEntry, record: &LcmRecord) -> Result<Vec<u8>, BridgeError> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&entry.fingerprint.to_be_bytes());
    encode_one(dir, entry, record, &mut out)?;
    Ok(out)
}

fn encode_one(
    dir: &TypeDirectory,
    entry: &TypeEntry,
    record: &LcmRecord,
    out: &mut Vec<u8>,
) -> Result<(), BridgeError> {
    let schema = &entry.schema;
    for fs in &schema.fields {
        let field = record.get(&fs.name).ok_or_else(|| {
            BridgeError::Encode(format!("{}.{} is missing", schema.name, fs.name))
        })?;
        match &fs.dim {
            None => encode_field(dir, entry, &fs.ty, field, out)?,
            Some(dim) => {
                let Field::Array(items) = field else {
                    return Err(BridgeError::Encode(format!(
                        "{}.{} must be an array",
                        schema.name, fs.name
                    )));
                };
                let expected = match dim {
                    Dimension::Fixed(n) => *n as i64,
                    Dimension::Variable(size_field) => record
                        .get(size_field)
                        .and_then(Field::as_len)
                        .ok_or_else(|| {
                            BridgeError::Encode(format!(
                                "{}.{} has no integer size field {size_field}",
                                schema.name, fs.name
                            ))
                        })?,
                };
                if items.len() as i64 != expected {
                    return Err(BridgeError::Encode(format!(
                        "{}.{} has {} elements, expected {expected}",
                        schema.name,
                        fs.name,
                        items.len()
                    )));
                }
                for item in items {
                    encode_field(dir, entry, &fs.ty, item, out)?;
                }
            }
        }
    }
    Ok(())
}

fn encode_field(
    dir: &TypeDirectory,
    parent: &TypeEntry,
    ty: &FieldType,
    field: &Field,
    out: &mut Vec<u8>,
) -> Result<(), BridgeError> {
    match (ty, field) {
        (FieldType::Primitive(Primitive::Int8), Field::I8(v)) => out.extend_from_slice(&v.to_be_bytes()),
        (FieldType::Primitive(Primitive::Int16), Field::I16(v)) => out.extend_from_slice(&v.to_be_bytes()),
        (FieldType::Primitive(Primitive::Int32), Field::I32(v)) => out.extend_from_slice(&v.to_be_bytes()),
        (FieldType::Primitive(Primitive::Int64), Field::I64(v)) => out.extend_from_slice(&v.to_be_bytes()),
        (FieldType::Primitive(Primitive::Byte), Field::Byte(v)) => out.push(*v),
        (FieldType::Primitive(Primitive::Float), Field::F32(v)) => out.extend_from_slice(&v.to_be_bytes()),
        (FieldType::Primitive(Primitive::Double), Field::F64(v)) => out.extend_from_slice(&v.to_be_bytes()),
        (FieldType::Primitive(Primitive::Boolean), Field::Bool(v)) => out.push(u8::from(*v)),
        (FieldType::Primitive(Primitive::String), Field::Str(s)) => {
            let len = i32::try_from(s.len() + 1)
                .map_err(|_| BridgeError::Encode(format!("string of {} bytes is too long", s.len())))?;
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
        (FieldType::Struct(name), Field::Struct(nested)) => {
            let entry = dir.lookup(&parent.namespace, name).ok_or_else(|| {
                BridgeError::Encode(format!("unknown nested type {name}"))
            })?;
            encode_one(dir, entry, nested, out)?;
        }
        (ty, field) => {
            return Err(BridgeError::Encode(format!(
                "cannot write {field:?} as {}",
                type_label(ty)
            )));
        }
    }
    Ok(())
}

fn type_label(ty: &FieldType) -> &str {
    match ty {
        FieldType::Primitive(p) => p.lcm_name(),
        FieldType::Struct(name) => name,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────────────────────────

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], BridgeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                BridgeError::Decode(format!(
                    "unexpected end of buffer: need {n} bytes at offset {}, have {}",
                    self.pos,
                    self.buf.len() - self.pos
                ))
            })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], BridgeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Decode a complete payload as type `entry`.
///
/// # Errors
///
/// Returns [`BridgeError::Decode`] on fingerprint mismatch, truncation,
/// malformed strings or negative array sizes.
pub fn decode(dir: &TypeDirectory, entry: &TypeEntry, bytes: &[u8]) -> Result<LcmRecord, BridgeError> {
    let mut reader = Reader { buf: bytes, pos: 0 };
    let fingerprint = u64::from_be_bytes(reader.array::<8>()?);
    if fingerprint != entry.fingerprint {
        return Err(BridgeError::Decode(format!(
            "fingerprint {fingerprint:#018x} does not match {} ({:#018x})",
            entry.qualified_name(),
            entry.fingerprint
        )));
    }
    decode_one(dir, entry, &mut reader)
}

fn decode_one(dir: &TypeDirectory, entry: &TypeEntry, reader: &mut Reader<'_>) -> Result<LcmRecord, BridgeError> {
    let schema = &entry.schema;
    let mut record = LcmRecord::new(schema.name.clone());
    for fs in &schema.fields {
        let field = match &fs.dim {
            None => decode_field(dir, entry, &fs.ty, reader)?,
            Some(dim) => {
                let len = match dim {
                    Dimension::Fixed(n) => *n,
                    Dimension::Variable(size_field) => {
                        let len = record.get(size_field).and_then(Field::as_len).ok_or_else(|| {
                            BridgeError::Decode(format!(
                                "{}.{} has no integer size field {size_field}",
                                schema.name, fs.name
                            ))
                        })?;
                        usize::try_from(len).map_err(|_| {
                            BridgeError::Decode(format!("{}.{} has negative length {len}", schema.name, fs.name))
                        })?
                    }
                };
                let mut items = Vec::with_capacity(len.min(reader.remaining()));
                for _ in 0..len {
                    items.push(decode_field(dir, entry, &fs.ty, reader)?);
                }
                Field::Array(items)
            }
        };
        record.fields.push((fs.name.clone(), field));
    }
    Ok(record)
}

fn decode_field(
    dir: &TypeDirectory,
    parent: &TypeEntry,
    ty: &FieldType,
    reader: &mut Reader<'_>,
) -> Result<Field, BridgeError> {
    Ok(match ty {
        FieldType::Primitive(Primitive::Int8) => Field::I8(i8::from_be_bytes(reader.array()?)),
        FieldType::Primitive(Primitive::Int16) => Field::I16(i16::from_be_bytes(reader.array()?)),
        FieldType::Primitive(Primitive::Int32) => Field::I32(i32::from_be_bytes(reader.array()?)),
        FieldType::Primitive(Primitive::Int64) => Field::I64(i64::from_be_bytes(reader.array()?)),
        FieldType::Primitive(Primitive::Byte) => Field::Byte(u8::from_be_bytes(reader.array()?)),
        FieldType::Primitive(Primitive::Float) => Field::F32(f32::from_be_bytes(reader.array()?)),
        FieldType::Primitive(Primitive::Double) => Field::F64(f64::from_be_bytes(reader.array()?)),
        FieldType::Primitive(Primitive::Boolean) => Field::Bool(i8::from_be_bytes(reader.array()?) != 0),
        FieldType::Primitive(Primitive::String) => {
            let len = i32::from_be_bytes(reader.array()?);
            let len = usize::try_from(len)
                .ok()
                .filter(|n| *n >= 1)
                .ok_or_else(|| BridgeError::Decode(format!("invalid string length {len}")))?;
            let bytes = reader.take(len)?;
            let (text, nul) = bytes.split_at(len - 1);
            if nul != [0] {
                return Err(BridgeError::Decode("string is not NUL-terminated".to_string()));
            }
            let text = std::str::from_utf8(text)
                .map_err(|e| BridgeError::Decode(format!("string is not UTF-8: {e}")))?;
            Field::Str(text.to_string())
        }
        FieldType::Struct(name) => {
            let entry = dir
                .lookup(&parent.namespace, name)
                .ok_or_else(|| BridgeError::Decode(format!("unknown nested type {name}")))?;
            Field::Struct(decode_one(dir, entry, reader)?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::BUILTIN_NAMESPACE;

    fn directory() -> TypeDirectory {
        TypeDirectory::builtin().unwrap()
    }

    fn pose(x: f32, y: f32, theta: f32) -> LcmRecord {
        LcmRecord::new("pose2D")
            .with("x", Field::F32(x))
            .with("y", Field::F32(y))
            .with("theta", Field::F32(theta))
    }

    #[test]
    fn pose_layout_is_fingerprint_then_big_endian_floats() {
        let dir = directory();
        let entry = dir.lookup(BUILTIN_NAMESPACE, "pose2D").unwrap();
        let bytes = encode(&dir, entry, &pose(1.0, 2.0, 0.5)).unwrap();

        assert_eq!(bytes.len(), 8 + 3 * 4);
        assert_eq!(&bytes[..8], &entry.fingerprint.to_be_bytes());
        assert_eq!(&bytes[8..12], &1.0f32.to_be_bytes());
        assert_eq!(&bytes[16..20], &0.5f32.to_be_bytes());
    }

    #[test]
    fn nested_array_roundtrip() {
        let dir = directory();
        let entry = dir.lookup(BUILTIN_NAMESPACE, "path2D").unwrap();
        let record = LcmRecord::new("path2D")
            .with("utime", Field::I64(99))
            .with("path_length", Field::I32(2))
            .with(
                "path",
                Field::Array(vec![
                    Field::Struct(pose(0.0, 0.0, 0.0)),
                    Field::Struct(pose(1.0, -1.0, 3.0)),
                ]),
            );
        let bytes = encode(&dir, entry, &record).unwrap();
        assert_eq!(decode(&dir, entry, &bytes).unwrap(), record);
    }

    #[test]
    fn strings_carry_length_and_nul() {
        let dir = directory();
        let entry = dir.lookup(BUILTIN_NAMESPACE, "mbot_message_received").unwrap();
        let record = LcmRecord::new("mbot_message_received")
            .with("utime", Field::I64(1))
            .with("creation_time", Field::I64(2))
            .with("channel", Field::Str("ODOM".to_string()));
        let bytes = encode(&dir, entry, &record).unwrap();

        let tail = &bytes[bytes.len() - 9..];
        assert_eq!(&tail[..4], &5i32.to_be_bytes());
        assert_eq!(&tail[4..], b"ODOM\0");
        assert_eq!(decode(&dir, entry, &bytes).unwrap(), record);
    }

    #[test]
    fn wrong_fingerprint_is_rejected() {
        let dir = directory();
        let pose_entry = dir.lookup(BUILTIN_NAMESPACE, "pose2D").unwrap();
        let twist_entry = dir.lookup(BUILTIN_NAMESPACE, "twist2D").unwrap();
        let bytes = encode(&dir, pose_entry, &pose(1.0, 2.0, 3.0)).unwrap();

        let err = decode(&dir, twist_entry, &bytes).unwrap_err();
        assert!(err.to_string().contains("fingerprint"));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let dir = directory();
        let entry = dir.lookup(BUILTIN_NAMESPACE, "pose2D").unwrap();
        let bytes = encode(&dir, entry, &pose(1.0, 2.0, 3.0)).unwrap();

        let err = decode(&dir, entry, &bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, BridgeError::Decode(_)));
        assert!(decode(&dir, entry, &[]).is_err());
    }

    #[test]
    fn array_length_must_match_size_field() {
        let dir = directory();
        let entry = dir.lookup(BUILTIN_NAMESPACE, "path2D").unwrap();
        let record = LcmRecord::new("path2D")
            .with("utime", Field::I64(0))
            .with("path_length", Field::I32(3))
            .with("path", Field::Array(vec![Field::Struct(pose(0.0, 0.0, 0.0))]));
        assert!(matches!(encode(&dir, entry, &record), Err(BridgeError::Encode(_))));
    }

    #[test]
    fn negative_array_length_is_rejected() {
        let dir = directory();
        let entry = dir.lookup(BUILTIN_NAMESPACE, "path2D").unwrap();
        let mut bytes = entry.fingerprint.to_be_bytes().to_vec();
        bytes.extend_from_slice(&0i64.to_be_bytes());
        bytes.extend_from_slice(&(-1i32).to_be_bytes());
        let err = decode(&dir, entry, &bytes).unwrap_err();
        assert!(err.to_string().contains("negative"));
    }

    #[test]
    fn base_hash_depends_on_field_names() {
        let a = TypeSchema::new("a").field("x", Primitive::Float);
        let b = TypeSchema::new("b").field("y", Primitive::Float);
        let a_renamed = TypeSchema::new("renamed").field("x", Primitive::Float);
        assert_ne!(base_hash(&a), base_hash(&b));
        // The type's own name does not take part, only its layout.
        assert_eq!(base_hash(&a), base_hash(&a_renamed));
    }
}
