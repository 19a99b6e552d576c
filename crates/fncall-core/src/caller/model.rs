//! Compiler-independent description of the argument struct

use crate::types::{CType, FunctionType};
use crate::value::Value;
use crate::wrapper::{argument_field, FN_PTR_FIELD, RETURN_FIELD};

/// What a slot of the argument struct holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    FunctionPointer,
    /// Zero-based argument position
    Argument(usize),
    Return,
}

/// One field of the argument struct
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub kind: SlotKind,
    pub ty: CType,
    /// Field name in the synthesized wrapper
    pub field: String,
}

/// The slots of the argument struct in declaration order
///
/// The function pointer slot always comes first, followed by one slot per
/// argument. A return slot is appended unless the function returns `void`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentStructModel {
    slots: Vec<Slot>,
}

impl ArgumentStructModel {
    /// Build the model for calling a function of type `func` with `args`
    ///
    /// Argument slots are typed after the values, not the declared
    /// parameters; the compiler checks one against the other.
    #[must_use]
    pub fn new(func: &FunctionType, args: &[Value]) -> Self {
        Self::from_slot_types(func, args.iter().map(Value::slot_type))
    }

    /// Build the model with explicit argument slot types
    #[must_use]
    pub fn from_slot_types(func: &FunctionType, slot_types: impl IntoIterator<Item = CType>) -> Self {
        let mut slots = vec![Slot {
            kind: SlotKind::FunctionPointer,
            ty: CType::Function(Box::new(func.clone())),
            field: FN_PTR_FIELD.to_string(),
        }];
        for (i, ty) in slot_types.into_iter().enumerate() {
            slots.push(Slot {
                kind: SlotKind::Argument(i),
                ty,
                field: argument_field(i),
            });
        }
        if !func.ret.is_void() {
            slots.push(Slot {
                kind: SlotKind::Return,
                ty: func.ret.clone(),
                field: RETURN_FIELD.to_string(),
            });
        }
        Self { slots }
    }

    #[must_use]
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    #[must_use]
    pub fn function_slot(&self) -> &Slot {
        &self.slots[0]
    }

    pub fn argument_slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.kind, SlotKind::Argument(_)))
    }

    #[must_use]
    pub fn argument_count(&self) -> usize {
        self.argument_slots().count()
    }

    #[must_use]
    pub fn return_slot(&self) -> Option<&Slot> {
        self.slots.last().filter(|slot| slot.kind == SlotKind::Return)
    }
}
