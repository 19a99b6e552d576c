//! The wrapper compiler
//!
//! Wrapper text goes through four stages:
//!
//! ```text
//! source → lexer → parser → checker (types + record layout) → codegen → entry point
//! ```
//!
//! The invoker only ever sees the [`WrapperCompiler`] trait. [`JitCompiler`] is
//! the in-process implementation built on Cranelift; a debugger targeting a
//! remote process plugs in its own compiler behind the same seam.

pub mod ast;
mod check;
mod codegen;
pub mod lexer;
pub mod parser;
mod span;

use std::any::Any;
use std::fmt;

pub use check::{FieldLayout, RecordLayout};
pub(crate) use check::check_unit;
pub use codegen::{CodegenOptions, JitCompiler, JitError, OptLevel};
pub use span::{LineIndex, Location, Span};

use crate::diagnostics::DiagnosticManager;
use crate::target::TargetInfo;
use crate::wrapper::WrapperSource;

/// A declaration supplied by the debugger's type system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalDecl {
    /// An aggregate known only by size and alignment
    Opaque { size: u32, align: u32 },
}

/// Hooks that let a debugger's type system take part in compilation
///
/// Both hooks default to doing nothing, which suits wrappers that declare
/// every type they use.
pub trait TypeSystemHelper {
    /// Resolve a type name the wrapper uses but does not declare
    fn resolve_external(&self, _name: &str) -> Option<ExternalDecl> {
        None
    }

    /// Rewrite the parsed unit before it is checked
    fn transform(&self, _unit: &mut ast::Unit, _diagnostics: &mut DiagnosticManager) {}
}

/// Helper for self-contained wrappers
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfContained;

impl TypeSystemHelper for SelfContained {}

/// Turns wrapper source into executable code in the target
pub trait WrapperCompiler {
    /// Compile `source`, reporting every problem to `diagnostics`
    ///
    /// Returns `None` when at least one error was reported.
    fn compile(
        &self,
        source: &WrapperSource,
        target: &TargetInfo,
        helper: &dyn TypeSystemHelper,
        diagnostics: &mut DiagnosticManager,
    ) -> Option<CompiledWrapper>;
}

/// A compiled wrapper: its entry point plus the records it was laid out with
pub struct CompiledWrapper {
    pub function_name: String,
    /// Entry address of the wrapper in the target
    pub entry: u64,
    pub records: Vec<RecordLayout>,
    /// Printed IR, for inspection
    pub ir: String,
    /// Keeps generated code mapped for as long as the wrapper lives
    code: Option<Box<dyn Any>>,
}

impl CompiledWrapper {
    #[must_use]
    pub fn new(function_name: impl Into<String>, entry: u64, records: Vec<RecordLayout>) -> Self {
        Self {
            function_name: function_name.into(),
            entry,
            records,
            ir: String::new(),
            code: None,
        }
    }

    #[must_use]
    pub fn with_ir(mut self, ir: impl Into<String>) -> Self {
        self.ir = ir.into();
        self
    }

    /// Tie the lifetime of whatever owns the generated code to this wrapper
    #[must_use]
    pub fn with_code_owner(mut self, owner: Box<dyn Any>) -> Self {
        self.code = Some(owner);
        self
    }

    #[must_use]
    pub fn record(&self, name: &str) -> Option<&RecordLayout> {
        self.records.iter().find(|r| r.name == name)
    }

    #[must_use]
    pub fn owns_code(&self) -> bool {
        self.code.is_some()
    }
}

impl fmt::Debug for CompiledWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledWrapper")
            .field("function_name", &self.function_name)
            .field("entry", &format_args!("{:#x}", self.entry))
            .field("records", &self.records)
            .field("owns_code", &self.code.is_some())
            .finish_non_exhaustive()
    }
}
