//! The caller: compile once, call many times
//!
//! A [`FunctionCaller`] is bound to one function signature. Compiling it
//! synthesizes and compiles the wrapper and recovers the argument struct
//! layout; after that, every call runs on its own [`CallRecord`]:
//!
//! ```text
//! prepare_call_struct → write_arguments → call_plan → run → fetch_result → release
//! ```
//!
//! Compilation mutates the caller and is never retried after a failure.
//! Per-call operations only read it, so any number of records can be live at
//! once.

mod model;
mod plan;
mod record;

use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, warn};

pub use model::{ArgumentStructModel, Slot, SlotKind};
pub use plan::{CallOptions, CallPlan};
pub use record::{CallRecord, CallState};

use crate::compiler::{CompiledWrapper, SelfContained, TypeSystemHelper};
use crate::diagnostics::DiagnosticManager;
use crate::layout::{ArgumentStructLayout, LayoutError, StructLayoutExtractor};
use crate::marshal::{self, MismatchError};
use crate::target::{ExecutionContext, MemoryError, StopInfo, TargetInfo};
use crate::types::FunctionSignature;
use crate::value::Value;
use crate::wrapper::{WrapperSource, WrapperSynthesizer};

/// Where a call's argument struct lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructLocation {
    /// Caller-supplied memory, never freed by the facility
    UseExisting(u64),
    /// Allocate fresh memory owned by the call record
    AllocateNew,
}

/// Lifecycle of a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerState {
    Uninitialized,
    Compiling,
    Ready,
    CompileFailed,
}

/// Errors from preparing, running or decoding a call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The wrapper failed to compile; the caller is unusable
    #[error("wrapper failed to compile with {errors} error(s)")]
    Compilation { errors: usize },

    /// The struct layout could not be recovered; the caller is unusable
    #[error("argument struct layout: {0}")]
    Layout(#[from] LayoutError),

    #[error("argument mismatch: {0}")]
    ArgumentMismatch(#[from] MismatchError),

    #[error("target memory access failed: {0}")]
    MemoryAccess(#[from] MemoryError),

    #[error("execution interrupted: {0}")]
    ExecutionInterrupted(StopInfo),

    #[error("the caller has not been compiled")]
    NotReady,

    #[error("arguments have not been written to the call struct")]
    ArgumentsNotWritten,

    #[error("the call has not completed")]
    ResultUnavailable,
}

/// Result type for call operations
pub type CallResult<T> = Result<T, CallError>;

/// Calls one function in the target
pub struct FunctionCaller {
    name: String,
    signature: FunctionSignature,
    default_arguments: Vec<Value>,
    model: ArgumentStructModel,
    source: WrapperSource,
    helper: SelfContained,
    state: CallerState,
    error_count: usize,
    failure: Option<CallError>,
    compiled: Option<CompiledWrapper>,
    layout: Option<ArgumentStructLayout>,
    target: Option<TargetInfo>,
}

impl FunctionCaller {
    /// Create a caller for `signature` whose argument slots follow `arguments`
    ///
    /// The arguments double as defaults for [`execute_function`](Self::execute_function).
    #[must_use]
    pub fn new(name: impl Into<String>, signature: FunctionSignature, arguments: Vec<Value>) -> Self {
        let model = ArgumentStructModel::new(&signature.function_type(), &arguments);
        Self::with_model(name.into(), signature, arguments, model)
    }

    /// Create a caller whose argument slots are the declared parameter types
    ///
    /// Such a caller has no default arguments; pass them with each call.
    #[must_use]
    pub fn for_signature(name: impl Into<String>, signature: FunctionSignature) -> Self {
        let model = ArgumentStructModel::from_slot_types(
            &signature.function_type(),
            signature.params.iter().cloned(),
        );
        Self::with_model(name.into(), signature, Vec::new(), model)
    }

    fn with_model(
        name: String,
        signature: FunctionSignature,
        default_arguments: Vec<Value>,
        model: ArgumentStructModel,
    ) -> Self {
        let source = WrapperSynthesizer::synthesize(&name, &signature.function_type(), &model);
        Self {
            name,
            signature,
            default_arguments,
            model,
            source,
            helper: SelfContained,
            state: CallerState::Uninitialized,
            error_count: 0,
            failure: None,
            compiled: None,
            layout: None,
            target: None,
        }
    }

    // ==================== Accessors ====================

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }

    #[must_use]
    pub fn default_arguments(&self) -> &[Value] {
        &self.default_arguments
    }

    #[must_use]
    pub fn state(&self) -> CallerState {
        self.state
    }

    /// Errors reported by the last compile attempt
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.error_count
    }

    #[must_use]
    pub fn model(&self) -> &ArgumentStructModel {
        &self.model
    }

    #[must_use]
    pub fn wrapper_source(&self) -> &WrapperSource {
        &self.source
    }

    #[must_use]
    pub fn compiled(&self) -> Option<&CompiledWrapper> {
        self.compiled.as_ref()
    }

    /// The argument struct layout, once compiled
    #[must_use]
    pub fn layout(&self) -> Option<&ArgumentStructLayout> {
        self.layout.as_ref()
    }

    #[must_use]
    pub fn type_system_helper(&self) -> &dyn TypeSystemHelper {
        &self.helper
    }

    // ==================== Compilation ====================

    /// Compile the wrapper and recover the struct layout
    ///
    /// Returns the number of errors reported. A ready caller returns 0
    /// without recompiling; a failed one returns its stored count and does
    /// not try again.
    pub fn compile(&mut self, ctx: &ExecutionContext, diagnostics: &mut DiagnosticManager) -> usize {
        match self.state {
            CallerState::Ready => return 0,
            CallerState::CompileFailed => {
                diagnostics.put_error(format!(
                    "wrapper for `{}` already failed to compile; not retrying",
                    self.name
                ));
                return self.error_count;
            }
            CallerState::Uninitialized | CallerState::Compiling => {}
        }

        self.state = CallerState::Compiling;
        let target = ctx.process().target_info();
        debug!(function = %self.name, %target, "compiling wrapper:\n{}", self.source.text);

        let before = diagnostics.error_count();
        let compiled = ctx
            .compiler()
            .compile(&self.source, &target, &self.helper, diagnostics);
        let errors = diagnostics.error_count() - before;

        let compiled = match compiled {
            Some(compiled) if errors == 0 => compiled,
            _ => {
                if errors == 0 {
                    diagnostics.put_error(format!("wrapper for `{}` failed to compile", self.name));
                }
                let errors = errors.max(1);
                return self.fail(CallError::Compilation { errors }, errors);
            }
        };

        let extractor = StructLayoutExtractor::new(target.pointer_size);
        match extractor.extract(&compiled, &self.source.struct_name, &self.model) {
            Ok(layout) => {
                self.compiled = Some(compiled);
                self.layout = Some(layout);
                self.target = Some(target);
                self.state = CallerState::Ready;
                self.error_count = 0;
                0
            }
            Err(e) => {
                diagnostics.put_error(format!("cannot recover argument struct layout: {e}"));
                self.fail(CallError::Layout(e), 1)
            }
        }
    }

    fn fail(&mut self, error: CallError, errors: usize) -> usize {
        debug!(function = %self.name, %error, "wrapper compilation failed");
        self.state = CallerState::CompileFailed;
        self.error_count = errors;
        self.failure = Some(error);
        errors
    }

    fn ready(&self) -> CallResult<(&ArgumentStructLayout, TargetInfo)> {
        match (self.state, &self.layout, self.target) {
            (CallerState::Ready, Some(layout), Some(target)) => Ok((layout, target)),
            _ => Err(self.failure.clone().unwrap_or(CallError::NotReady)),
        }
    }

    // ==================== Per-call Operations ====================

    /// Allocate or adopt the argument struct for one call
    ///
    /// Adopted memory must hold the whole struct, return slot included.
    pub fn prepare_call_struct(
        &self,
        ctx: &ExecutionContext,
        location: StructLocation,
    ) -> CallResult<CallRecord> {
        let (layout, _) = self.ready()?;
        let process = Rc::clone(ctx.process());
        let record = match location {
            StructLocation::UseExisting(address) => {
                process.read(address, layout.size as usize)?;
                CallRecord::new(process, address, false)
            }
            StructLocation::AllocateNew => {
                let address =
                    process.allocate(u64::from(layout.size), u64::from(layout.align))?;
                CallRecord::new(process, address, true)
            }
        };
        debug!(
            function = %self.name,
            address = format_args!("{:#x}", record.struct_address()),
            owned = record.owns_struct(),
            "prepared argument struct"
        );
        Ok(record)
    }

    /// Prepare a struct and write the default arguments into it
    pub fn insert_function(
        &self,
        ctx: &ExecutionContext,
        location: StructLocation,
        diagnostics: &mut DiagnosticManager,
    ) -> CallResult<CallRecord> {
        let result = self.prepare_call_struct(ctx, location).and_then(|mut record| {
            self.write_arguments(&mut record, &self.default_arguments)?;
            Ok(record)
        });
        if let Err(e) = &result {
            diagnostics.put_error(format!("cannot set up call to `{}`: {e}", self.name));
        }
        result
    }

    /// Marshal `arguments` and the function address into the record's struct
    ///
    /// Every argument is checked before anything is written.
    pub fn write_arguments(&self, record: &mut CallRecord, arguments: &[Value]) -> CallResult<()> {
        let (layout, target) = self.ready()?;

        let expected = self.model.argument_count();
        if arguments.len() != expected {
            return Err(MismatchError::WrongCount {
                expected,
                found: arguments.len(),
            }
            .into());
        }

        // Validate and encode everything up front; aggregates are placed once
        // memory writes begin.
        let mut images = Vec::with_capacity(arguments.len());
        for (index, ((slot, slot_layout), value)) in self
            .model
            .argument_slots()
            .zip(&layout.arguments)
            .zip(arguments)
            .enumerate()
        {
            marshal::check_argument(index, &slot.ty, value)?;
            let image = match value {
                Value::Aggregate { .. } => None,
                scalar => {
                    let bytes = marshal::encode(scalar, &target)?;
                    if bytes.len() != slot_layout.size as usize {
                        return Err(MismatchError::SizeMismatch {
                            ty: slot.ty.clone(),
                            expected: slot_layout.size,
                            found: bytes.len(),
                        }
                        .into());
                    }
                    Some(bytes)
                }
            };
            images.push(image);
        }
        let function = marshal::encode_address(self.signature.address, &target)?;

        // The previous arguments stop being valid as soon as their buffers go
        record.set_state(CallState::StructPrepared);
        record.set_arguments(Vec::new());
        record.free_side_allocations()?;
        let base = record.struct_address();
        record.process().write(base + u64::from(layout.function.offset), &function)?;
        for ((image, slot_layout), value) in images.into_iter().zip(&layout.arguments).zip(arguments) {
            let bytes = match (image, value) {
                (Some(bytes), _) => bytes,
                (None, Value::Aggregate { record: ty, bytes }) => {
                    let address = record.allocate_side(bytes, ty.align)?;
                    marshal::encode_address(address, &target)?
                }
                (None, other) => return Err(MismatchError::Undecodable(other.ty()).into()),
            };
            record.process().write(base + u64::from(slot_layout.offset), &bytes)?;
        }

        record.set_arguments(arguments.to_vec());
        record.set_state(CallState::ArgumentsWritten);
        debug!(
            function = %self.name,
            address = format_args!("{base:#x}"),
            count = arguments.len(),
            "wrote call arguments"
        );
        Ok(())
    }

    /// Decode the argument slots of a written struct
    pub fn read_arguments(&self, record: &CallRecord) -> CallResult<Vec<Value>> {
        let (layout, target) = self.ready()?;
        if record.state() == CallState::StructPrepared {
            return Err(CallError::ArgumentsNotWritten);
        }
        let base = record.struct_address();
        let mut values = Vec::with_capacity(layout.arguments.len());
        for (index, (slot, slot_layout)) in self.model.argument_slots().zip(&layout.arguments).enumerate() {
            let bytes = record
                .process()
                .read(base + u64::from(slot_layout.offset), slot_layout.size as usize)?;
            let value = marshal::decode(&slot.ty, &bytes, &target)?;
            let value = match (record.arguments().get(index), value) {
                // Follow the slot to the aggregate it references
                (Some(Value::Aggregate { record: ty, .. }), Value::Pointer { address, .. }) => {
                    let contents = record.process().read(address, ty.size as usize)?;
                    Value::aggregate(ty.clone(), contents)
                }
                (_, value) => value,
            };
            values.push(value);
        }
        Ok(values)
    }

    /// Build the plan that runs the wrapper on the record's struct
    pub fn call_plan(&self, record: &CallRecord, options: &CallOptions) -> CallResult<CallPlan> {
        self.ready()?;
        if record.state() == CallState::StructPrepared {
            return Err(CallError::ArgumentsNotWritten);
        }
        let entry = self
            .compiled
            .as_ref()
            .map(|compiled| compiled.entry)
            .ok_or(CallError::NotReady)?;
        Ok(CallPlan {
            function_name: self.name.clone(),
            wrapper_entry: entry,
            struct_address: record.struct_address(),
            function_address: self.signature.address,
            options: options.clone(),
        })
    }

    /// Run a written record to completion and fetch its result
    pub fn run_call(
        &self,
        ctx: &ExecutionContext,
        record: &mut CallRecord,
        options: &CallOptions,
    ) -> CallResult<Value> {
        let plan = self.call_plan(record, options)?;
        debug!(?plan, "running call plan");
        record.set_state(CallState::Executing);
        let stop = ctx.thread().run(&plan);
        if !stop.is_completed() {
            record.set_state(CallState::ExecutionFailed);
            return Err(CallError::ExecutionInterrupted(stop));
        }
        record.set_state(CallState::Completed);
        self.fetch_result(record)
    }

    /// Decode the return slot of a completed call
    ///
    /// Functions returning `void` yield [`Value::Void`].
    pub fn fetch_result(&self, record: &mut CallRecord) -> CallResult<Value> {
        let (layout, target) = self.ready()?;
        if record.state() != CallState::Completed {
            return Err(CallError::ResultUnavailable);
        }
        let value = match (layout.ret, self.model.return_slot()) {
            (Some(slot_layout), Some(slot)) => {
                let bytes = record.process().read(
                    record.struct_address() + u64::from(slot_layout.offset),
                    slot_layout.size as usize,
                )?;
                marshal::decode(&slot.ty, &bytes, &target)?
            }
            _ => Value::Void,
        };
        debug!(function = %self.name, result = %value, "fetched call result");
        record.set_result(value.clone());
        Ok(value)
    }

    /// Release the memory a record owns now instead of on drop
    pub fn deallocate(&self, record: CallRecord) -> CallResult<()> {
        record.release()?;
        Ok(())
    }

    // ==================== One-shot Execution ====================

    /// Compile if needed, then call with the default arguments
    pub fn execute_function(
        &mut self,
        ctx: &ExecutionContext,
        diagnostics: &mut DiagnosticManager,
        options: &CallOptions,
    ) -> CallResult<Value> {
        let arguments = self.default_arguments.clone();
        self.execute_function_with(ctx, diagnostics, &arguments, StructLocation::AllocateNew, options)
    }

    /// Compile if needed, then call with explicit arguments and struct location
    ///
    /// A struct at [`StructLocation::UseExisting`] is left in place with the
    /// arguments and result still in it.
    pub fn execute_function_with(
        &mut self,
        ctx: &ExecutionContext,
        diagnostics: &mut DiagnosticManager,
        arguments: &[Value],
        location: StructLocation,
        options: &CallOptions,
    ) -> CallResult<Value> {
        let errors = self.compile(ctx, diagnostics);
        if errors > 0 {
            return Err(self.failure.clone().unwrap_or(CallError::Compilation { errors }));
        }

        let result = self.call_once(ctx, arguments, location, options);
        if let Err(e) = &result {
            diagnostics.put_error(format!("call to `{}` failed: {e}", self.name));
        }
        result
    }

    fn call_once(
        &self,
        ctx: &ExecutionContext,
        arguments: &[Value],
        location: StructLocation,
        options: &CallOptions,
    ) -> CallResult<Value> {
        let mut record = self.prepare_call_struct(ctx, location)?;
        self.write_arguments(&mut record, arguments)?;
        let value = self.run_call(ctx, &mut record, options)?;
        if let Err(e) = self.deallocate(record) {
            warn!(function = %self.name, error = %e, "failed to release call memory");
        }
        Ok(value)
    }
}

impl std::fmt::Debug for FunctionCaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionCaller")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("state", &self.state)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::testutil::{LayoutOnlyCompiler, ScriptedThread, SparseProcess};
    use crate::target::{ByteOrder, Process, ThreadRunner};
    use crate::types::{CType, RecordType};

    /// A sparse process that runs out of memory or refuses to free
    struct FaultyProcess {
        inner: SparseProcess,
        allocations_left: Cell<usize>,
        free_fails: bool,
    }

    impl FaultyProcess {
        fn new(allocations_left: usize, free_fails: bool) -> Self {
            Self {
                inner: SparseProcess::new(TargetInfo::new(8, ByteOrder::Little)),
                allocations_left: Cell::new(allocations_left),
                free_fails,
            }
        }
    }

    impl Process for FaultyProcess {
        fn target_info(&self) -> TargetInfo {
            self.inner.target_info()
        }

        fn allocate(&self, size: u64, align: u64) -> Result<u64, MemoryError> {
            match self.allocations_left.get() {
                0 => Err(MemoryError::AllocationFailed { size }),
                left => {
                    self.allocations_left.set(left - 1);
                    self.inner.allocate(size, align)
                }
            }
        }

        fn free(&self, address: u64) -> Result<(), MemoryError> {
            if self.free_fails {
                return Err(MemoryError::InvalidFree(address));
            }
            self.inner.free(address)
        }

        fn read(&self, address: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
            self.inner.read(address, len)
        }

        fn write(&self, address: u64, bytes: &[u8]) -> Result<(), MemoryError> {
            self.inner.write(address, bytes)
        }
    }

    fn context(target: TargetInfo, thread: Rc<dyn ThreadRunner>) -> (ExecutionContext, Rc<SparseProcess>) {
        let process = Rc::new(SparseProcess::new(target));
        let ctx = ExecutionContext::new(process.clone(), thread, Rc::new(LayoutOnlyCompiler));
        (ctx, process)
    }

    fn add_caller() -> FunctionCaller {
        FunctionCaller::new(
            "add",
            FunctionSignature::new(CType::I32, vec![CType::I32, CType::I32], 0x4000),
            vec![Value::I32(3), Value::I32(4)],
        )
    }

    #[test]
    fn per_call_operations_require_compile() {
        let (ctx, _) = context(TargetInfo::new(8, ByteOrder::Little), Rc::new(ScriptedThread::new()));
        let caller = add_caller();
        assert_eq!(caller.state(), CallerState::Uninitialized);
        assert_eq!(
            caller.prepare_call_struct(&ctx, StructLocation::AllocateNew).err(),
            Some(CallError::NotReady)
        );
    }

    #[test]
    fn writes_function_pointer_and_arguments_big_endian() {
        let target = TargetInfo::new(4, ByteOrder::Big);
        let (ctx, process) = context(target, Rc::new(ScriptedThread::new()));
        let mut caller = add_caller();
        let mut diags = DiagnosticManager::new();
        assert_eq!(caller.compile(&ctx, &mut diags), 0, "{}", diags.render(None));

        let layout = caller.layout().expect("layout").clone();
        assert_eq!(layout.size, 16);
        assert_eq!(layout.function.size, 4);

        let mut record = caller
            .prepare_call_struct(&ctx, StructLocation::AllocateNew)
            .expect("prepare");
        caller
            .write_arguments(&mut record, &[Value::I32(3), Value::I32(-1)])
            .expect("write");
        let image = process.read_raw(record.struct_address(), 12);
        assert_eq!(image, vec![0, 0, 0x40, 0, 0, 0, 0, 3, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(
            caller.read_arguments(&record).expect("read back"),
            vec![Value::I32(3), Value::I32(-1)]
        );
    }

    #[test]
    fn interrupted_call_reports_stop_and_frees_memory() {
        let thread = Rc::new(ScriptedThread::new());
        thread.push(StopInfo::Signal {
            signo: 11,
            name: "SIGSEGV".to_string(),
        });
        let (ctx, process) = context(TargetInfo::new(8, ByteOrder::Little), thread.clone());
        let mut caller = add_caller();
        let mut diags = DiagnosticManager::new();

        let err = caller
            .execute_function(&ctx, &mut diags, &CallOptions::default())
            .expect_err("signal interrupts the call");
        assert!(matches!(err, CallError::ExecutionInterrupted(StopInfo::Signal { signo: 11, .. })));
        assert_eq!(process.live_allocations(), 0);
        assert_eq!(diags.error_count(), 1);
        assert_eq!(caller.state(), CallerState::Ready);
        assert_eq!(thread.plans().len(), 1);
    }

    #[test]
    fn aggregates_travel_by_reference() {
        let point = RecordType::new("Point", 8, 4);
        let point_ptr = CType::pointer_to(CType::Record(point.clone()));
        let (ctx, process) = context(TargetInfo::new(8, ByteOrder::Little), Rc::new(ScriptedThread::new()));
        let mut caller = FunctionCaller::new(
            "norm",
            FunctionSignature::new(CType::F64, vec![point_ptr], 0x5000),
            vec![Value::aggregate(point.clone(), vec![1, 2, 3, 4, 5, 6, 7, 8])],
        );
        let mut diags = DiagnosticManager::new();
        assert_eq!(caller.compile(&ctx, &mut diags), 0, "{}", diags.render(None));

        let mut record = caller
            .insert_function(&ctx, StructLocation::AllocateNew, &mut diags)
            .expect("insert");
        assert_eq!(record.side_allocations().len(), 1);
        let side = record.side_allocations()[0];
        assert_eq!(process.read_raw(side, 8), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(caller.read_arguments(&record).expect("read"), record.arguments().to_vec());

        // Rewriting replaces the side buffer instead of leaking it
        caller
            .write_arguments(&mut record, &[Value::aggregate(point, vec![0; 8])])
            .expect("rewrite");
        assert_eq!(process.live_allocations(), 2);
        caller.deallocate(record).expect("release");
        assert_eq!(process.live_allocations(), 0);
    }

    #[test]
    fn mismatched_value_is_rejected_before_writing() {
        let (ctx, process) = context(TargetInfo::new(8, ByteOrder::Little), Rc::new(ScriptedThread::new()));
        let mut caller = add_caller();
        let mut diags = DiagnosticManager::new();
        caller.compile(&ctx, &mut diags);
        let mut record = caller
            .prepare_call_struct(&ctx, StructLocation::AllocateNew)
            .expect("prepare");
        let err = caller
            .write_arguments(&mut record, &[Value::I32(1), Value::F64(2.0)])
            .expect_err("f64 into i32 slot");
        assert!(matches!(
            err,
            CallError::ArgumentMismatch(MismatchError::TypeMismatch { index: 1, .. })
        ));
        assert_eq!(process.read_raw(record.struct_address(), 8), vec![0; 8]);
        assert_eq!(record.state(), CallState::StructPrepared);
        assert_eq!(
            caller.call_plan(&record, &CallOptions::default()).err(),
            Some(CallError::ArgumentsNotWritten)
        );
    }

    #[test]
    fn existing_struct_must_be_fully_mapped() {
        let (ctx, process) = context(TargetInfo::new(8, ByteOrder::Little), Rc::new(ScriptedThread::new()));
        let mut caller = add_caller();
        let mut diags = DiagnosticManager::new();
        caller.compile(&ctx, &mut diags);
        assert_eq!(caller.layout().map(|l| l.size), Some(24));

        // Room for the function pointer and arguments but not the return slot
        let short = process.allocate(16, 8).expect("allocate");
        assert_eq!(
            caller.prepare_call_struct(&ctx, StructLocation::UseExisting(short)).err(),
            Some(CallError::MemoryAccess(MemoryError::Unmapped {
                address: short,
                len: 24
            }))
        );

        let full = process.allocate(24, 8).expect("allocate");
        let record = caller
            .prepare_call_struct(&ctx, StructLocation::UseExisting(full))
            .expect("24 bytes hold the struct");
        assert!(!record.owns_struct());
    }

    #[test]
    fn failed_rewrite_invalidates_previous_arguments() {
        let point = RecordType::new("Point", 8, 4);
        let point_ptr = CType::pointer_to(CType::Record(point.clone()));
        // The struct and the first side buffer succeed; the second side buffer fails
        let process = Rc::new(FaultyProcess::new(2, false));
        let ctx = ExecutionContext::new(
            process.clone(),
            Rc::new(ScriptedThread::new()),
            Rc::new(LayoutOnlyCompiler),
        );
        let mut caller = FunctionCaller::new(
            "norm",
            FunctionSignature::new(CType::F64, vec![point_ptr], 0x5000),
            vec![Value::aggregate(point.clone(), vec![1; 8])],
        );
        let mut diags = DiagnosticManager::new();
        assert_eq!(caller.compile(&ctx, &mut diags), 0, "{}", diags.render(None));

        let mut record = caller
            .insert_function(&ctx, StructLocation::AllocateNew, &mut diags)
            .expect("first write");
        assert_eq!(record.state(), CallState::ArgumentsWritten);

        let err = caller
            .write_arguments(&mut record, &[Value::aggregate(point, vec![2; 8])])
            .expect_err("side allocation fails");
        assert_eq!(err, CallError::MemoryAccess(MemoryError::AllocationFailed { size: 8 }));
        assert_eq!(record.state(), CallState::StructPrepared);
        assert!(record.arguments().is_empty());
        assert!(record.side_allocations().is_empty());
        assert_eq!(
            caller.call_plan(&record, &CallOptions::default()).err(),
            Some(CallError::ArgumentsNotWritten)
        );
        assert_eq!(caller.read_arguments(&record).err(), Some(CallError::ArgumentsNotWritten));
    }

    #[test]
    fn release_failure_keeps_the_result() {
        let thread = Rc::new(ScriptedThread::new());
        thread.push(StopInfo::Completed);
        let process = Rc::new(FaultyProcess::new(usize::MAX, true));
        let ctx = ExecutionContext::new(process.clone(), thread, Rc::new(LayoutOnlyCompiler));
        let mut caller = add_caller();
        let mut diags = DiagnosticManager::new();

        // Nothing ran, so the return slot still holds the zeroed allocation
        let value = caller
            .execute_function(&ctx, &mut diags, &CallOptions::default())
            .expect("result survives the failed free");
        assert_eq!(value, Value::I32(0));
        assert_eq!(diags.error_count(), 0);
        assert_eq!(process.inner.live_allocations(), 1);
    }

    #[test]
    fn oversized_return_fails_compile_without_panicking() {
        let (ctx, _) = context(TargetInfo::new(8, ByteOrder::Little), Rc::new(ScriptedThread::new()));
        let big = RecordType::new("Big", u32::MAX - 2, 8);
        let mut caller = FunctionCaller::new(
            "make",
            FunctionSignature::new(CType::Record(big), vec![CType::I64], 0x7000),
            vec![Value::I64(1)],
        );
        let mut diags = DiagnosticManager::new();
        assert!(caller.compile(&ctx, &mut diags) > 0);
        assert_eq!(caller.state(), CallerState::CompileFailed);
        assert!(diags.render(None).contains("is too large"), "{}", diags.render(None));
    }

    #[test]
    fn record_result_decodes_as_aggregate() {
        let big = RecordType::new("Big", 24, 8);
        let thread = Rc::new(ScriptedThread::new());
        thread.push(StopInfo::Completed);
        let (ctx, process) = context(TargetInfo::new(8, ByteOrder::Little), thread);
        let mut caller = FunctionCaller::new(
            "make",
            FunctionSignature::new(CType::Record(big.clone()), vec![CType::I64], 0x7000),
            vec![Value::I64(1)],
        );
        let mut diags = DiagnosticManager::new();
        assert_eq!(caller.compile(&ctx, &mut diags), 0, "{}", diags.render(None));
        let ret = caller.layout().and_then(|l| l.ret).expect("return slot");
        assert_eq!((ret.offset, ret.size), (16, 24));

        let mut record = caller
            .insert_function(&ctx, StructLocation::AllocateNew, &mut diags)
            .expect("insert");
        let contents: Vec<u8> = (0..24).collect();
        process
            .write(record.struct_address() + 16, &contents)
            .expect("fill return slot");
        let value = caller
            .run_call(&ctx, &mut record, &CallOptions::default())
            .expect("completed");
        assert_eq!(value, Value::aggregate(big, contents));
    }

    #[test]
    fn for_signature_types_slots_from_parameters() {
        let caller = FunctionCaller::for_signature(
            "strlen",
            FunctionSignature::new(CType::U64, vec![CType::pointer_to(CType::I8)], 0x6000),
        );
        assert!(caller.default_arguments().is_empty());
        assert_eq!(caller.model().argument_count(), 1);
        assert!(caller.wrapper_source().text.contains("arg_0: *i8,"));
    }
}
