//! Synthesis of wrapper source text
//!
//! A wrapper is a tiny function with the fixed signature `fn(ptr)`. It
//! reinterprets its argument as the argument struct, calls through the
//! function pointer slot with every argument slot in order, and stores the
//! result into the return slot. All calling-convention work is left to the
//! compiler that lowers it.

use std::fmt::Write as _;

use crate::caller::ArgumentStructModel;
use crate::types::{CType, FunctionType, RecordType};

/// Field holding the callee's address
pub const FN_PTR_FIELD: &str = "fn_ptr";
/// Prefix of argument fields, followed by the zero-based position
pub const ARG_FIELD_PREFIX: &str = "arg_";
/// Field receiving the callee's return value
pub const RETURN_FIELD: &str = "return_value";

const WRAPPER_PREFIX: &str = "__fncall_wrapper_";
const STRUCT_PREFIX: &str = "__fncall_args_";

/// Name of the field for argument `index`
#[must_use]
pub fn argument_field(index: usize) -> String {
    format!("{ARG_FIELD_PREFIX}{index}")
}

/// Synthesized wrapper text and the names the rest of the facility needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperSource {
    pub text: String,
    /// Name of the wrapper function
    pub function_name: String,
    /// Name of the argument struct
    pub struct_name: String,
}

/// Builds wrapper units
#[derive(Debug, Clone, Copy, Default)]
pub struct WrapperSynthesizer;

impl WrapperSynthesizer {
    /// Synthesize a wrapper for calling `func` through the struct in `model`
    ///
    /// Every record mentioned anywhere is declared opaque up front, so the
    /// unit needs nothing from the debugger's type system.
    #[must_use]
    pub fn synthesize(name: &str, func: &FunctionType, model: &ArgumentStructModel) -> WrapperSource {
        let suffix = sanitize(name);
        let function_name = format!("{WRAPPER_PREFIX}{suffix}");
        let struct_name = format!("{STRUCT_PREFIX}{suffix}");

        let mut records: Vec<&RecordType> = Vec::new();
        for slot in model.slots() {
            slot.ty.collect_records(&mut records);
        }

        let mut text = String::new();
        let _ = writeln!(
            text,
            "// call wrapper for `{suffix}`: {}",
            CType::Function(Box::new(func.clone()))
        );
        for record in &records {
            let _ = writeln!(
                text,
                "opaque {}: size {}, align {};",
                record.name, record.size, record.align
            );
        }
        if !records.is_empty() {
            text.push('\n');
        }

        let _ = writeln!(text, "struct {struct_name} {{");
        for slot in model.slots() {
            let _ = writeln!(text, "    {}: {},", slot.field, slot.ty);
        }
        text.push_str("}\n\n");

        let arguments: Vec<String> = model
            .argument_slots()
            .map(|slot| format!("args.{}", slot.field))
            .collect();
        let call = format!("args.{FN_PTR_FIELD}({})", arguments.join(", "));

        let _ = writeln!(text, "fn {function_name}(input: ptr) {{");
        let _ = writeln!(text, "    let args = input as *{struct_name};");
        match model.return_slot() {
            Some(slot) => {
                let _ = writeln!(text, "    args.{} = {call};", slot.field);
            }
            None => {
                let _ = writeln!(text, "    {call};");
            }
        }
        text.push_str("}\n");

        WrapperSource {
            text,
            function_name,
            struct_name,
        }
    }
}

/// Reduce `name` to identifier characters
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "anon".to_string()
    } else {
        cleaned
    }
}
