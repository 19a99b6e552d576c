//! fncall core - dynamic function calls for debuggers
//!
//! Given a function's address, its signature and argument values, this crate
//! synthesizes a small wrapper, compiles it, lays out an argument struct in the
//! target's memory and runs the wrapper to call the function:
//! - Wrapper: synthesis of the wrapper source text
//! - Compiler: lexer, parser, checker and Cranelift code generation
//! - Layout: recovering the argument struct layout from the compiler
//! - Marshal: converting values to and from target bytes
//! - Caller: the compile-once, call-many orchestrator
//! - Target: the process, thread and execution context seams
//!
//! ```no_run
//! use fncall_core::{
//!     CType, CallOptions, DiagnosticManager, ExecutionContext, FunctionCaller,
//!     FunctionSignature, JitCompiler, Value,
//! };
//!
//! extern "C" fn add(a: i32, b: i32) -> i32 {
//!     a + b
//! }
//!
//! let ctx = ExecutionContext::host(JitCompiler::default());
//! let signature = FunctionSignature::new(
//!     CType::I32,
//!     vec![CType::I32, CType::I32],
//!     add as usize as u64,
//! );
//! let mut caller = FunctionCaller::new("add", signature, vec![Value::I32(3), Value::I32(4)]);
//! let mut diagnostics = DiagnosticManager::new();
//! let result = caller.execute_function(&ctx, &mut diagnostics, &CallOptions::default());
//! assert_eq!(result, Ok(Value::I32(7)));
//! ```

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Caller controller - compile once, call many times
pub mod caller;

/// Wrapper compiler - lexer, parser, checker and code generation
pub mod compiler;

/// User configuration
pub mod config;

/// Compile and call diagnostics
pub mod diagnostics;

/// Argument struct layout extraction
pub mod layout;

/// Value marshaling to and from target bytes
pub mod marshal;

/// Target process and thread abstractions
pub mod target;

/// Semantic type descriptors
pub mod types;

/// Debugger values
pub mod value;

/// Wrapper source synthesis
pub mod wrapper;

/// Test utilities - fake targets and compilers
pub mod testutil;

pub use caller::{
    ArgumentStructModel, CallError, CallOptions, CallPlan, CallRecord, CallResult, CallState,
    CallerState, FunctionCaller, StructLocation,
};
pub use compiler::{CompiledWrapper, JitCompiler, TypeSystemHelper, WrapperCompiler};
pub use config::FncallConfig;
pub use diagnostics::{Diagnostic, DiagnosticManager, Severity};
pub use layout::{ArgumentStructLayout, LayoutError, SlotLayout, StructLayoutExtractor};
pub use marshal::MismatchError;
pub use target::{
    ByteOrder, ExecutionContext, HostProcess, HostThread, MemoryError, Process, StopInfo,
    TargetInfo, ThreadRunner,
};
pub use types::{CType, FunctionSignature, FunctionType, RecordType};
pub use value::Value;
pub use wrapper::{WrapperSource, WrapperSynthesizer};
