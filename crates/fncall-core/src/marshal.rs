//! Conversion between debugger values and target bytes
//!
//! Everything here is pure: it turns values into byte images for a given
//! [`TargetInfo`] and back. Reading and writing target memory, including the
//! side allocations that carry aggregates by reference, is the caller's job.

use thiserror::Error;
use tracing::trace;

use crate::target::{ByteOrder, TargetInfo};
use crate::types::{CType, FloatType, IntType};
use crate::value::Value;

/// A value that does not fit the slot it was given
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MismatchError {
    #[error("argument {index}: expected `{expected}`, found `{found}`")]
    TypeMismatch {
        index: usize,
        expected: CType,
        found: CType,
    },

    #[error("expected {expected} arguments, found {found}")]
    WrongCount { expected: usize, found: usize },

    #[error("address {address:#x} does not fit in a {pointer_size}-byte pointer")]
    PointerTooWide { address: u64, pointer_size: u32 },

    #[error("`{ty}` takes {found} bytes but its slot holds {expected}")]
    SizeMismatch {
        ty: CType,
        expected: u32,
        found: usize,
    },

    #[error("aggregate `{record}` has {found} bytes, expected {expected}")]
    AggregateSize {
        record: String,
        expected: u32,
        found: usize,
    },

    #[error("cannot represent a value of type `{0}` in a slot")]
    Undecodable(CType),
}

/// Whether a value of type `value` may be stored in a slot of type `slot`
///
/// Types must match exactly, except that an untyped pointer converts to and
/// from any pointer. A function slot also takes a pointer to that function.
#[must_use]
pub fn slot_accepts(slot: &CType, value: &CType) -> bool {
    if slot == value {
        return true;
    }
    match (slot, value) {
        (CType::Pointer(slot), CType::Pointer(value)) => slot.is_void() || value.is_void(),
        (CType::Function(_), CType::Pointer(pointee)) => {
            pointee.is_void() || pointee.as_ref() == slot
        }
        (CType::Pointer(pointee), CType::Function(_)) => pointee.is_void(),
        _ => false,
    }
}

/// Check argument `index` against its slot type
pub fn check_argument(index: usize, slot: &CType, value: &Value) -> Result<(), MismatchError> {
    let found = value.slot_type();
    if !slot_accepts(slot, &found) {
        return Err(MismatchError::TypeMismatch {
            index,
            expected: slot.clone(),
            found,
        });
    }
    if let Value::Aggregate { record, bytes } = value {
        if bytes.len() != record.size as usize {
            return Err(MismatchError::AggregateSize {
                record: record.name.clone(),
                expected: record.size,
                found: bytes.len(),
            });
        }
    }
    Ok(())
}

macro_rules! to_bytes {
    ($value:expr, $order:expr) => {
        match $order {
            ByteOrder::Little => $value.to_le_bytes().to_vec(),
            ByteOrder::Big => $value.to_be_bytes().to_vec(),
        }
    };
}

macro_rules! from_bytes {
    ($ty:ty, $bytes:expr, $order:expr) => {
        match $order {
            ByteOrder::Little => <$ty>::from_le_bytes($bytes),
            ByteOrder::Big => <$ty>::from_be_bytes($bytes),
        }
    };
}

/// Encode a target address at the target's pointer width
pub fn encode_address(address: u64, target: &TargetInfo) -> Result<Vec<u8>, MismatchError> {
    let too_wide = MismatchError::PointerTooWide {
        address,
        pointer_size: target.pointer_size,
    };
    match target.pointer_size {
        8 => Ok(to_bytes!(address, target.byte_order)),
        4 => {
            let narrow = u32::try_from(address).map_err(|_| too_wide)?;
            Ok(to_bytes!(narrow, target.byte_order))
        }
        2 => {
            let narrow = u16::try_from(address).map_err(|_| too_wide)?;
            Ok(to_bytes!(narrow, target.byte_order))
        }
        _ => Err(too_wide),
    }
}

/// Encode a scalar or pointer value
///
/// Aggregates and `void` have no slot image of their own.
pub fn encode(value: &Value, target: &TargetInfo) -> Result<Vec<u8>, MismatchError> {
    let order = target.byte_order;
    let bytes = match value {
        Value::Bool(v) => vec![u8::from(*v)],
        Value::I8(v) => to_bytes!(v, order),
        Value::I16(v) => to_bytes!(v, order),
        Value::I32(v) => to_bytes!(v, order),
        Value::I64(v) => to_bytes!(v, order),
        Value::U8(v) => to_bytes!(v, order),
        Value::U16(v) => to_bytes!(v, order),
        Value::U32(v) => to_bytes!(v, order),
        Value::U64(v) => to_bytes!(v, order),
        Value::F32(v) => to_bytes!(v, order),
        Value::F64(v) => to_bytes!(v, order),
        Value::Pointer { address, .. } => encode_address(*address, target)?,
        Value::Void | Value::Aggregate { .. } => {
            return Err(MismatchError::Undecodable(value.ty()));
        }
    };
    trace!(value = %value, ?bytes, "encoded value");
    Ok(bytes)
}

fn array<const N: usize>(ty: &CType, bytes: &[u8]) -> Result<[u8; N], MismatchError> {
    bytes.try_into().map_err(|_| MismatchError::SizeMismatch {
        ty: ty.clone(),
        expected: N as u32,
        found: bytes.len(),
    })
}

/// Decode the bytes of a slot of type `ty`
pub fn decode(ty: &CType, bytes: &[u8], target: &TargetInfo) -> Result<Value, MismatchError> {
    let order = target.byte_order;
    let value = match ty {
        CType::Void => Value::Void,
        CType::Bool => Value::Bool(array::<1>(ty, bytes)?[0] != 0),
        CType::Int(IntType::I8) => Value::I8(from_bytes!(i8, array(ty, bytes)?, order)),
        CType::Int(IntType::I16) => Value::I16(from_bytes!(i16, array(ty, bytes)?, order)),
        CType::Int(IntType::I32) => Value::I32(from_bytes!(i32, array(ty, bytes)?, order)),
        CType::Int(IntType::I64) => Value::I64(from_bytes!(i64, array(ty, bytes)?, order)),
        CType::Int(IntType::U8) => Value::U8(from_bytes!(u8, array(ty, bytes)?, order)),
        CType::Int(IntType::U16) => Value::U16(from_bytes!(u16, array(ty, bytes)?, order)),
        CType::Int(IntType::U32) => Value::U32(from_bytes!(u32, array(ty, bytes)?, order)),
        CType::Int(IntType::U64) => Value::U64(from_bytes!(u64, array(ty, bytes)?, order)),
        CType::Float(FloatType::F32) => Value::F32(from_bytes!(f32, array(ty, bytes)?, order)),
        CType::Float(FloatType::F64) => Value::F64(from_bytes!(f64, array(ty, bytes)?, order)),
        CType::Pointer(_) | CType::Function(_) => {
            let address = decode_address(ty, bytes, target)?;
            let pointee = match ty {
                CType::Pointer(inner) => inner.as_ref().clone(),
                other => other.clone(),
            };
            Value::Pointer { pointee, address }
        }
        CType::Record(record) => {
            if bytes.len() != record.size as usize {
                return Err(MismatchError::AggregateSize {
                    record: record.name.clone(),
                    expected: record.size,
                    found: bytes.len(),
                });
            }
            Value::aggregate(record.clone(), bytes.to_vec())
        }
    };
    trace!(%ty, ?bytes, value = %value, "decoded value");
    Ok(value)
}

fn decode_address(ty: &CType, bytes: &[u8], target: &TargetInfo) -> Result<u64, MismatchError> {
    let order = target.byte_order;
    match target.pointer_size {
        8 => Ok(from_bytes!(u64, array(ty, bytes)?, order)),
        4 => Ok(u64::from(from_bytes!(u32, array(ty, bytes)?, order))),
        2 => Ok(u64::from(from_bytes!(u16, array(ty, bytes)?, order))),
        other => Err(MismatchError::SizeMismatch {
            ty: ty.clone(),
            expected: other,
            found: bytes.len(),
        }),
    }
}
