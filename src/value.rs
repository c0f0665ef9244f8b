//! Tagged provider values.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};

use crate::provider::NativeObject;

/// CIM type codes reported alongside every property.
pub mod cim {
    pub const CIM_EMPTY: i32 = 0;
    pub const CIM_SINT16: i32 = 2;
    pub const CIM_SINT32: i32 = 3;
    pub const CIM_REAL32: i32 = 4;
    pub const CIM_REAL64: i32 = 5;
    pub const CIM_STRING: i32 = 8;
    pub const CIM_BOOLEAN: i32 = 11;
    pub const CIM_OBJECT: i32 = 13;
    pub const CIM_SINT8: i32 = 16;
    pub const CIM_UINT8: i32 = 17;
    pub const CIM_UINT16: i32 = 18;
    pub const CIM_UINT32: i32 = 19;
    pub const CIM_SINT64: i32 = 20;
    pub const CIM_UINT64: i32 = 21;
    pub const CIM_DATETIME: i32 = 101;
    pub const CIM_REFERENCE: i32 = 102;
    pub const CIM_CHAR16: i32 = 103;
    pub const CIM_FLAG_ARRAY: i32 = 0x2000;
}

/// Scalar kind of a tagged value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum VarKind {
    Byte,
    Char,
    Boolean,
    Short,
    Int,
    Long,
    Float,
    Double,
    String,
    Date,
    Object,
}

impl VarKind {
    pub const ALL: [VarKind; 11] = [
        VarKind::Byte,
        VarKind::Char,
        VarKind::Boolean,
        VarKind::Short,
        VarKind::Int,
        VarKind::Long,
        VarKind::Float,
        VarKind::Double,
        VarKind::String,
        VarKind::Date,
        VarKind::Object,
    ];

    /// The CIM type a provider would declare for this kind.
    pub fn cim_type(self) -> i32 {
        match self {
            VarKind::Byte => cim::CIM_UINT8,
            VarKind::Char => cim::CIM_CHAR16,
            VarKind::Boolean => cim::CIM_BOOLEAN,
            VarKind::Short => cim::CIM_SINT16,
            VarKind::Int => cim::CIM_SINT32,
            VarKind::Long => cim::CIM_SINT64,
            VarKind::Float => cim::CIM_REAL32,
            VarKind::Double => cim::CIM_REAL64,
            VarKind::String => cim::CIM_STRING,
            VarKind::Date => cim::CIM_DATETIME,
            VarKind::Object => cim::CIM_OBJECT,
        }
    }
}

/// Declared shape of a value: a scalar kind, optionally as an array.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ValueType {
    pub kind: VarKind,
    pub array: bool,
}

impl ValueType {
    pub const fn scalar(kind: VarKind) -> Self {
        Self { kind, array: false }
    }

    pub const fn array_of(kind: VarKind) -> Self {
        Self { kind, array: true }
    }

    /// Maps a CIM type code onto the value shape the bridge expects for it.
    ///
    /// Unsigned CIM types widen to the next signed kind except `UINT8`, which keeps the
    /// byte representation. `UINT64`, `DATETIME` and `REFERENCE` travel as strings, the
    /// way providers deliver them.
    pub fn from_cim(cim_type: i32) -> Option<Self> {
        let array = cim_type & cim::CIM_FLAG_ARRAY != 0;
        let kind = match cim_type & !cim::CIM_FLAG_ARRAY {
            cim::CIM_SINT8 | cim::CIM_UINT8 => VarKind::Byte,
            cim::CIM_SINT16 => VarKind::Short,
            cim::CIM_UINT16 | cim::CIM_SINT32 => VarKind::Int,
            cim::CIM_UINT32 | cim::CIM_SINT64 => VarKind::Long,
            cim::CIM_REAL32 => VarKind::Float,
            cim::CIM_REAL64 => VarKind::Double,
            cim::CIM_BOOLEAN => VarKind::Boolean,
            cim::CIM_CHAR16 => VarKind::Char,
            cim::CIM_STRING | cim::CIM_UINT64 | cim::CIM_DATETIME | cim::CIM_REFERENCE => {
                VarKind::String
            }
            cim::CIM_OBJECT => VarKind::Object,
            _ => return None,
        };
        Some(Self { kind, array })
    }
}

/// A dynamically typed provider value.
#[derive(Clone)]
pub enum TaggedValue {
    Null,
    Byte(u8),
    Char(u16),
    Boolean(bool),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Date(DateTime<Utc>),
    Object(Arc<dyn NativeObject>),
    /// Homogeneous array; every item has scalar kind `kind`.
    Array {
        kind: VarKind,
        items: Vec<TaggedValue>,
    },
}

impl TaggedValue {
    /// Shape of this value, `None` for null.
    pub fn value_type(&self) -> Option<ValueType> {
        let kind = match self {
            TaggedValue::Null => return None,
            TaggedValue::Byte(_) => VarKind::Byte,
            TaggedValue::Char(_) => VarKind::Char,
            TaggedValue::Boolean(_) => VarKind::Boolean,
            TaggedValue::Short(_) => VarKind::Short,
            TaggedValue::Int(_) => VarKind::Int,
            TaggedValue::Long(_) => VarKind::Long,
            TaggedValue::Float(_) => VarKind::Float,
            TaggedValue::Double(_) => VarKind::Double,
            TaggedValue::String(_) => VarKind::String,
            TaggedValue::Date(_) => VarKind::Date,
            TaggedValue::Object(_) => VarKind::Object,
            TaggedValue::Array { kind, .. } => return Some(ValueType::array_of(*kind)),
        };
        Some(ValueType::scalar(kind))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TaggedValue::Null)
    }
}

impl PartialEq for TaggedValue {
    fn eq(&self, other: &Self) -> bool {
        use TaggedValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Byte(a), Byte(b)) => a == b,
            (Char(a), Char(b)) => a == b,
            (Boolean(a), Boolean(b)) => a == b,
            (Short(a), Short(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Long(a), Long(b)) => a == b,
            // bitwise so NaN payloads compare equal to themselves
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (Double(a), Double(b)) => a.to_bits() == b.to_bits(),
            (String(a), String(b)) => a == b,
            (Date(a), Date(b)) => a == b,
            (Object(a), Object(b)) => Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const (),
            (Array { kind: ka, items: a }, Array { kind: kb, items: b }) => ka == kb && a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for TaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaggedValue::Null => f.write_str("Null"),
            TaggedValue::Byte(v) => write!(f, "Byte({v})"),
            TaggedValue::Char(v) => write!(f, "Char({v:#06x})"),
            TaggedValue::Boolean(v) => write!(f, "Boolean({v})"),
            TaggedValue::Short(v) => write!(f, "Short({v})"),
            TaggedValue::Int(v) => write!(f, "Int({v})"),
            TaggedValue::Long(v) => write!(f, "Long({v})"),
            TaggedValue::Float(v) => write!(f, "Float({v})"),
            TaggedValue::Double(v) => write!(f, "Double({v})"),
            TaggedValue::String(v) => write!(f, "String({v:?})"),
            TaggedValue::Date(v) => write!(f, "Date({})", v.to_rfc3339()),
            TaggedValue::Object(o) => write!(f, "Object({})", o.class_name()),
            TaggedValue::Array { kind, items } => {
                write!(f, "Array<{kind:?}>")?;
                f.debug_list().entries(items).finish()
            }
        }
    }
}
