//! [`LcmRecord`] – a decoded binary record.
//!
//! Unlike [`Value`][mbot_types::Value], a record is strongly typed: every
//! field carries the exact width its schema declares, so encoding it again
//! reproduces the original bytes.

#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Byte(u8),
    F32(f32),
    F64(f64),
    Str(String),
    Bool(bool),
    Struct(LcmRecord),
    Array(Vec<Field>),
}

impl Field {
    /// Integer view, used to read the size of variable-length arrays.
    pub fn as_len(&self) -> Option<i64> {
        match self {
            Field::I8(v) => Some(i64::from(*v)),
            Field::I16(v) => Some(i64::from(*v)),
            Field::I32(v) => Some(i64::from(*v)),
            Field::I64(v) => Some(*v),
            Field::Byte(v) => Some(i64::from(*v)),
            _ => None,
        }
    }
}

/// A typed record: the type name plus its fields in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct LcmRecord {
    pub type_name: String,
    pub fields: Vec<(String, Field)>,
}

impl LcmRecord {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    /// Builder-style field append.
    pub fn with(mut self, name: &str, field: Field) -> Self {
        self.fields.push((name.to_string(), field));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.iter_mut().find(|(n, _)| n == name).map(|(_, f)| f)
    }
}
