//! Host-resident, typed values passed to and returned from called functions

use std::fmt;

use crate::types::{CType, FloatType, IntType, RecordType};

/// A debugger value
///
/// Scalars are held inline. Aggregates carry their raw bytes and are passed by
/// reference when they cross into the target.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Result of a function that returns nothing
    Void,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    /// A target address together with what it points at
    Pointer { pointee: CType, address: u64 },
    /// Opaque aggregate contents
    Aggregate { record: RecordType, bytes: Vec<u8> },
}

impl Value {
    /// An untyped pointer
    #[must_use]
    pub fn pointer(address: u64) -> Self {
        Value::Pointer {
            pointee: CType::Void,
            address,
        }
    }

    /// An aggregate of `record` type holding `bytes`
    #[must_use]
    pub fn aggregate(record: RecordType, bytes: Vec<u8>) -> Self {
        Value::Aggregate { record, bytes }
    }

    /// The semantic type of this value
    #[must_use]
    pub fn ty(&self) -> CType {
        match self {
            Value::Void => CType::Void,
            Value::Bool(_) => CType::Bool,
            Value::I8(_) => CType::Int(IntType::I8),
            Value::I16(_) => CType::Int(IntType::I16),
            Value::I32(_) => CType::Int(IntType::I32),
            Value::I64(_) => CType::Int(IntType::I64),
            Value::U8(_) => CType::Int(IntType::U8),
            Value::U16(_) => CType::Int(IntType::U16),
            Value::U32(_) => CType::Int(IntType::U32),
            Value::U64(_) => CType::Int(IntType::U64),
            Value::F32(_) => CType::Float(FloatType::F32),
            Value::F64(_) => CType::Float(FloatType::F64),
            Value::Pointer { pointee, .. } => CType::pointer_to(pointee.clone()),
            Value::Aggregate { record, .. } => CType::Record(record.clone()),
        }
    }

    /// The type of the argument slot this value occupies
    ///
    /// Aggregates travel by reference, so their slot is a pointer. A pointer
    /// to a function already is the function's slot type.
    #[must_use]
    pub fn slot_type(&self) -> CType {
        match self {
            Value::Aggregate { record, .. } => CType::pointer_to(CType::Record(record.clone())),
            Value::Pointer {
                pointee: pointee @ CType::Function(_),
                ..
            } => pointee.clone(),
            other => other.ty(),
        }
    }

    /// Short name of the value's kind
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Bool(_) => "bool",
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::U8(_) => "u8",
            Value::U16(_) => "u16",
            Value::U32(_) => "u32",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Pointer { .. } => "pointer",
            Value::Aggregate { .. } => "aggregate",
        }
    }

    /// Integer payload widened to i128, for integer-typed values
    #[must_use]
    pub fn as_integer(&self) -> Option<i128> {
        match *self {
            Value::I8(v) => Some(v.into()),
            Value::I16(v) => Some(v.into()),
            Value::I32(v) => Some(v.into()),
            Value::I64(v) => Some(v.into()),
            Value::U8(v) => Some(v.into()),
            Value::U16(v) => Some(v.into()),
            Value::U32(v) => Some(v.into()),
            Value::U64(v) => Some(v.into()),
            _ => None,
        }
    }

    /// Compare two values bit-for-bit
    ///
    /// Unlike `==`, NaN payloads compare equal to themselves and `-0.0`
    /// differs from `0.0`.
    #[must_use]
    pub fn bit_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::F32(a), Value::F32(b)) => a.to_bits() == b.to_bits(),
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => write!(f, "(void)"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::I8(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::U8(v) => write!(f, "{v}"),
            Value::U16(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Pointer { pointee, address } => write!(f, "({}) {address:#x}", CType::pointer_to(pointee.clone())),
            Value::Aggregate { record, bytes } => {
                write!(f, "{} {{", record.name)?;
                for (i, byte) in bytes.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{byte:02x}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_occupy_pointer_slots() {
        let record = RecordType::new("Pair", 8, 4);
        let value = Value::aggregate(record.clone(), vec![0; 8]);
        assert_eq!(value.ty(), CType::Record(record.clone()));
        assert_eq!(value.slot_type(), CType::pointer_to(CType::Record(record)));
    }

    #[test]
    fn bit_eq_distinguishes_signed_zero() {
        assert!(!Value::F64(0.0).bit_eq(&Value::F64(-0.0)));
        assert!(Value::F32(f32::NAN).bit_eq(&Value::F32(f32::NAN)));
        assert!(Value::I32(7).bit_eq(&Value::I32(7)));
    }

    #[test]
    fn display_formats() {
        assert_eq!(Value::I32(-3).to_string(), "-3");
        assert_eq!(Value::pointer(0x10).to_string(), "(ptr) 0x10");
        let agg = Value::aggregate(RecordType::new("P", 2, 1), vec![0xab, 0x01]);
        assert_eq!(agg.to_string(), "P {ab 01}");
    }
}
