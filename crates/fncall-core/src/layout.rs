//! Recovering the argument struct's concrete layout from a compiled wrapper
//!
//! The facility never computes offsets itself. The compiler lays the struct
//! out while compiling the wrapper; [`StructLayoutExtractor`] reads that
//! layout back and checks it against the [`ArgumentStructModel`] before any
//! byte is written to the target.

use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::caller::{ArgumentStructModel, SlotKind};
use crate::compiler::CompiledWrapper;
use crate::types::CType;
use crate::wrapper::FN_PTR_FIELD;

/// Errors recovering the struct layout
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("compiled wrapper has no record named `{0}`")]
    MissingRecord(String),

    #[error("argument struct has no field `{0}`")]
    MissingField(String),

    #[error("field `{field}` has type `{found}`, expected `{expected}`")]
    FieldTypeMismatch {
        field: String,
        expected: CType,
        found: CType,
    },

    #[error("function pointer slot is {size} bytes, target pointers are {pointer_size}")]
    PointerSlotSize { size: u32, pointer_size: u32 },

    #[error("field `{field}` at offset {offset} (+{size}) lies outside the {struct_size}-byte struct")]
    OutOfBounds {
        field: String,
        offset: u32,
        size: u32,
        struct_size: u32,
    },

    #[error("fields `{first}` and `{second}` overlap")]
    Overlap { first: String, second: String },
}

/// Placement of one slot inside the argument struct
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    pub offset: u32,
    pub size: u32,
    pub align: u32,
}

impl SlotLayout {
    /// One past the last byte, widened so it cannot overflow
    #[must_use]
    pub fn end(&self) -> u64 {
        u64::from(self.offset) + u64::from(self.size)
    }
}

/// Concrete layout of the argument struct
///
/// Slot indices follow the struct: 0 is the function pointer, `1..=N` the
/// arguments and `N + 1` the return value when there is one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentStructLayout {
    pub size: u32,
    pub align: u32,
    pub function: SlotLayout,
    pub arguments: Vec<SlotLayout>,
    pub ret: Option<SlotLayout>,
}

impl ArgumentStructLayout {
    /// Look up a slot by struct index
    #[must_use]
    pub fn slot(&self, index: usize) -> Option<SlotLayout> {
        match index {
            0 => Some(self.function),
            i if i <= self.arguments.len() => Some(self.arguments[i - 1]),
            i if i == self.arguments.len() + 1 => self.ret,
            _ => None,
        }
    }

    /// Number of slots including the function pointer and return slots
    #[must_use]
    pub fn slot_count(&self) -> usize {
        1 + self.arguments.len() + usize::from(self.ret.is_some())
    }
}

impl fmt::Display for ArgumentStructLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "size {}, align {}", self.size, self.align)?;
        writeln!(f, "{:<14} {:>6} {:>5} {:>6}", "slot", "offset", "size", "align")?;
        let row = |f: &mut fmt::Formatter<'_>, name: &str, slot: &SlotLayout| {
            writeln!(
                f,
                "{name:<14} {:>6} {:>5} {:>6}",
                slot.offset, slot.size, slot.align
            )
        };
        row(f, "fn_ptr", &self.function)?;
        for (i, slot) in self.arguments.iter().enumerate() {
            row(f, &format!("arg_{i}"), slot)?;
        }
        if let Some(ret) = &self.ret {
            row(f, "return_value", ret)?;
        }
        Ok(())
    }
}

/// Reads the argument struct's layout out of a compiled wrapper
#[derive(Debug, Clone, Copy)]
pub struct StructLayoutExtractor {
    pointer_size: u32,
}

impl StructLayoutExtractor {
    #[must_use]
    pub fn new(pointer_size: u32) -> Self {
        Self { pointer_size }
    }

    /// Extract the layout of `struct_name` and validate it against `model`
    pub fn extract(
        &self,
        compiled: &CompiledWrapper,
        struct_name: &str,
        model: &ArgumentStructModel,
    ) -> Result<ArgumentStructLayout, LayoutError> {
        let record = compiled
            .record(struct_name)
            .ok_or_else(|| LayoutError::MissingRecord(struct_name.to_string()))?;

        let mut function = None;
        let mut arguments = Vec::with_capacity(model.argument_count());
        let mut ret = None;
        let mut placed: Vec<(&str, SlotLayout)> = Vec::with_capacity(model.slots().len());

        for slot in model.slots() {
            let field = record
                .field(&slot.field)
                .ok_or_else(|| LayoutError::MissingField(slot.field.clone()))?;
            if field.ty != slot.ty {
                return Err(LayoutError::FieldTypeMismatch {
                    field: slot.field.clone(),
                    expected: slot.ty.clone(),
                    found: field.ty.clone(),
                });
            }
            let layout = SlotLayout {
                offset: field.offset,
                size: field.size,
                align: field.align,
            };
            if layout.end() > u64::from(record.size) {
                return Err(LayoutError::OutOfBounds {
                    field: slot.field.clone(),
                    offset: layout.offset,
                    size: layout.size,
                    struct_size: record.size,
                });
            }
            match slot.kind {
                SlotKind::FunctionPointer => {
                    if layout.size != self.pointer_size {
                        return Err(LayoutError::PointerSlotSize {
                            size: layout.size,
                            pointer_size: self.pointer_size,
                        });
                    }
                    function = Some(layout);
                }
                SlotKind::Argument(_) => arguments.push(layout),
                SlotKind::Return => ret = Some(layout),
            }
            placed.push((slot.field.as_str(), layout));
        }

        placed.sort_by_key(|(_, layout)| layout.offset);
        for pair in placed.windows(2) {
            let ((first, a), (second, b)) = (pair[0], pair[1]);
            if a.end() > u64::from(b.offset) {
                return Err(LayoutError::Overlap {
                    first: first.to_string(),
                    second: second.to_string(),
                });
            }
        }

        let function =
            function.ok_or_else(|| LayoutError::MissingField(FN_PTR_FIELD.to_string()))?;
        let layout = ArgumentStructLayout {
            size: record.size,
            align: record.align,
            function,
            arguments,
            ret,
        };
        debug!(
            struct_name,
            size = layout.size,
            slots = layout.slot_count(),
            "extracted argument struct layout"
        );
        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{FieldLayout, RecordLayout};
    use crate::types::FunctionType;
    use crate::value::Value;

    fn add_type() -> FunctionType {
        FunctionType {
            ret: CType::I32,
            params: vec![CType::I32, CType::I32],
            variadic: false,
        }
    }

    fn field(name: &str, ty: CType, offset: u32, size: u32) -> FieldLayout {
        FieldLayout {
            name: name.to_string(),
            ty,
            offset,
            size,
            align: size,
        }
    }

    fn compiled(fields: Vec<FieldLayout>, size: u32) -> CompiledWrapper {
        CompiledWrapper::new(
            "w",
            0,
            vec![RecordLayout {
                name: "s".to_string(),
                size,
                align: 8,
                fields,
            }],
        )
    }

    fn model() -> ArgumentStructModel {
        ArgumentStructModel::new(&add_type(), &[Value::I32(1), Value::I32(2)])
    }

    fn fn_ty() -> CType {
        CType::Function(Box::new(add_type()))
    }

    #[test]
    fn extracts_indexed_slots() {
        let wrapper = compiled(
            vec![
                field("fn_ptr", fn_ty(), 0, 8),
                field("arg_0", CType::I32, 8, 4),
                field("arg_1", CType::I32, 12, 4),
                field("return_value", CType::I32, 16, 4),
            ],
            24,
        );
        let layout = StructLayoutExtractor::new(8)
            .extract(&wrapper, "s", &model())
            .expect("valid layout");
        assert_eq!(layout.slot_count(), 4);
        assert_eq!(layout.slot(0).map(|s| s.offset), Some(0));
        assert_eq!(layout.slot(2).map(|s| s.offset), Some(12));
        assert_eq!(layout.slot(3).map(|s| s.offset), Some(16));
        assert_eq!(layout.slot(4), None);
    }

    #[test]
    fn rejects_slot_past_the_end() {
        let wrapper = compiled(
            vec![
                field("fn_ptr", fn_ty(), 0, 8),
                field("arg_0", CType::I32, 8, 4),
                field("arg_1", CType::I32, 12, 4),
                field("return_value", CType::I32, u32::MAX - 1, 4),
            ],
            24,
        );
        assert_eq!(
            StructLayoutExtractor::new(8).extract(&wrapper, "s", &model()),
            Err(LayoutError::OutOfBounds {
                field: "return_value".to_string(),
                offset: u32::MAX - 1,
                size: 4,
                struct_size: 24
            })
        );
    }

    #[test]
    fn rejects_missing_and_mistyped_fields() {
        let extractor = StructLayoutExtractor::new(8);
        let missing = compiled(vec![field("fn_ptr", fn_ty(), 0, 8)], 8);
        assert_eq!(
            extractor.extract(&missing, "s", &model()),
            Err(LayoutError::MissingField("arg_0".to_string()))
        );

        let mistyped = compiled(
            vec![
                field("fn_ptr", fn_ty(), 0, 8),
                field("arg_0", CType::I64, 8, 8),
            ],
            16,
        );
        assert!(matches!(
            extractor.extract(&mistyped, "s", &model()),
            Err(LayoutError::FieldTypeMismatch { .. })
        ));
        assert_eq!(
            extractor.extract(&missing, "other", &model()),
            Err(LayoutError::MissingRecord("other".to_string()))
        );
    }

    #[test]
    fn rejects_overlap_and_bad_pointer_slot() {
        let overlapping = compiled(
            vec![
                field("fn_ptr", fn_ty(), 0, 8),
                field("arg_0", CType::I32, 8, 4),
                field("arg_1", CType::I32, 10, 4),
                field("return_value", CType::I32, 16, 4),
            ],
            24,
        );
        assert_eq!(
            StructLayoutExtractor::new(8).extract(&overlapping, "s", &model()),
            Err(LayoutError::Overlap {
                first: "arg_0".to_string(),
                second: "arg_1".to_string()
            })
        );

        let narrow = compiled(
            vec![
                field("fn_ptr", fn_ty(), 0, 4),
                field("arg_0", CType::I32, 4, 4),
                field("arg_1", CType::I32, 8, 4),
                field("return_value", CType::I32, 12, 4),
            ],
            16,
        );
        assert_eq!(
            StructLayoutExtractor::new(8).extract(&narrow, "s", &model()),
            Err(LayoutError::PointerSlotSize {
                size: 4,
                pointer_size: 8
            })
        );
    }
}
