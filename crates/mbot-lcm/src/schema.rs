//! Field schemas for bus record types.
//!
//! A [`TypeSchema`] is the runtime description of one LCM struct: its name
//! and its fields in declaration order.  Struct-typed fields refer to other
//! schemas by name; the [`TypeDirectory`][crate::TypeDirectory] resolves
//! those references.

/// LCM primitive types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Int8,
    Int16,
    Int32,
    Int64,
    Byte,
    Float,
    Double,
    String,
    Boolean,
}

impl Primitive {
    /// The LCM type keyword, which also feeds the fingerprint.
    pub fn lcm_name(self) -> &'static str {
        match self {
            Primitive::Int8 => "int8_t",
            Primitive::Int16 => "int16_t",
            Primitive::Int32 => "int32_t",
            Primitive::Int64 => "int64_t",
            Primitive::Byte => "byte",
            Primitive::Float => "float",
            Primitive::Double => "double",
            Primitive::String => "string",
            Primitive::Boolean => "boolean",
        }
    }

    /// Integer primitives can size a variable-length array.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Primitive::Int8 | Primitive::Int16 | Primitive::Int32 | Primitive::Int64 | Primitive::Byte
        )
    }
}

/// Element type of a field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Primitive(Primitive),
    /// Another record type, by (possibly namespace-qualified) name.
    Struct(String),
}

/// Array dimension of a field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dimension {
    Fixed(usize),
    /// Length carried by a previously declared integer field of the record.
    Variable(String),
}

impl Dimension {
    /// LCM size mode: 0 for constant, 1 for variable.
    pub(crate) fn mode(&self) -> u8 {
        match self {
            Dimension::Fixed(_) => 0,
            Dimension::Variable(_) => 1,
        }
    }

    /// The size string as written in an `.lcm` file.
    pub(crate) fn size_string(&self) -> String {
        match self {
            Dimension::Fixed(n) => n.to_string(),
            Dimension::Variable(field) => field.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldSchema {
    pub name: String,
    pub ty: FieldType,
    /// `None` for a scalar field; one-dimensional arrays otherwise.
    pub dim: Option<Dimension>,
}

/// Schema of one record type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeSchema {
    pub name: String,
    pub fields: Vec<FieldSchema>,
}

impl TypeSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Append a scalar primitive field.
    pub fn field(self, name: &str, prim: Primitive) -> Self {
        self.push(name, FieldType::Primitive(prim), None)
    }

    /// Append a primitive array of constant length.
    pub fn fixed_array(self, name: &str, prim: Primitive, len: usize) -> Self {
        self.push(name, FieldType::Primitive(prim), Some(Dimension::Fixed(len)))
    }

    /// Append a primitive array sized by the integer field `size_field`.
    pub fn var_array(self, name: &str, prim: Primitive, size_field: &str) -> Self {
        self.push(
            name,
            FieldType::Primitive(prim),
            Some(Dimension::Variable(size_field.to_string())),
        )
    }

    /// Append a nested record field.
    pub fn nested(self, name: &str, type_name: &str) -> Self {
        self.push(name, FieldType::Struct(type_name.to_string()), None)
    }

    /// Append an array of nested records sized by the integer field `size_field`.
    pub fn nested_array(self, name: &str, type_name: &str, size_field: &str) -> Self {
        self.push(
            name,
            FieldType::Struct(type_name.to_string()),
            Some(Dimension::Variable(size_field.to_string())),
        )
    }

    fn push(mut self, name: &str, ty: FieldType, dim: Option<Dimension>) -> Self {
        self.fields.push(FieldSchema {
            name: name.to_string(),
            ty,
            dim,
        });
        self
    }

    pub fn field_named(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Position of the field called `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Names of the record types this schema references directly.
    pub fn struct_refs(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().filter_map(|f| match &f.ty {
            FieldType::Struct(name) => Some(name.as_str()),
            FieldType::Primitive(_) => None,
        })
    }

    /// Check that every variable-length array is sized by an integer field
    /// declared before it.
    pub fn validate(&self) -> Result<(), String> {
        for (idx, field) in self.fields.iter().enumerate() {
            if let Some(Dimension::Variable(size_field)) = &field.dim {
                let Some(size_idx) = self.index_of(size_field) else {
                    return Err(format!(
                        "{}.{} is sized by unknown field {size_field}",
                        self.name, field.name
                    ));
                };
                let size = &self.fields[size_idx];
                let is_int = matches!(size.ty, FieldType::Primitive(p) if p.is_integer());
                if size_idx >= idx || !is_int || size.dim.is_some() {
                    return Err(format!(
                        "{}.{} must be sized by a preceding scalar integer field, not {size_field}",
                        self.name, field.name
                    ));
                }
            }
        }
        Ok(())
    }
}
