//! The process being debugged, as the call facility sees it
//!
//! Two narrow traits stand in for the debugger: [`Process`] for memory and
//! [`ThreadRunner`] for running a prepared call plan. Everything else in the
//! crate talks to the target only through them.

#[allow(unsafe_code)]
mod host;

use std::fmt;
use std::rc::Rc;

use thiserror::Error;

pub use host::{HostProcess, HostThread};

use crate::caller::CallPlan;
use crate::compiler::{JitCompiler, WrapperCompiler};

/// Byte order of the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    Little,
    Big,
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteOrder::Little => write!(f, "little-endian"),
            ByteOrder::Big => write!(f, "big-endian"),
        }
    }
}

/// What the facility needs to know about the target's data model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetInfo {
    /// Size of a pointer in bytes
    pub pointer_size: u32,
    pub byte_order: ByteOrder,
}

impl TargetInfo {
    #[must_use]
    pub const fn new(pointer_size: u32, byte_order: ByteOrder) -> Self {
        Self {
            pointer_size,
            byte_order,
        }
    }

    /// The machine this code is running on
    #[must_use]
    pub fn host() -> Self {
        let triple = target_lexicon::Triple::host();
        let pointer_size = triple
            .pointer_width()
            .map_or(std::mem::size_of::<usize>() as u32, |w| u32::from(w.bytes()));
        let byte_order = match triple.endianness() {
            Ok(target_lexicon::Endianness::Big) => ByteOrder::Big,
            _ => ByteOrder::Little,
        };
        Self::new(pointer_size, byte_order)
    }
}

impl fmt::Display for TargetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit {}", self.pointer_size * 8, self.byte_order)
    }
}

/// Errors from target memory operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("cannot access {len} bytes at {address:#x}: not mapped")]
    Unmapped { address: u64, len: usize },

    #[error("failed to allocate {size} bytes in the target")]
    AllocationFailed { size: u64 },

    #[error("{0:#x} is not the start of a live allocation")]
    InvalidFree(u64),
}

/// Memory services of a debugged process
pub trait Process {
    fn target_info(&self) -> TargetInfo;

    /// Allocate `size` bytes aligned to `align`, returning the address
    fn allocate(&self, size: u64, align: u64) -> Result<u64, MemoryError>;

    fn free(&self, address: u64) -> Result<(), MemoryError>;

    fn read(&self, address: u64, len: usize) -> Result<Vec<u8>, MemoryError>;

    fn write(&self, address: u64, bytes: &[u8]) -> Result<(), MemoryError>;
}

/// Why a thread stopped after running a call plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopInfo {
    /// The wrapper returned normally
    Completed,
    Breakpoint { address: u64 },
    Signal { signo: i32, name: String },
    TimedOut,
    Exited { status: i32 },
    /// The thread plan was abandoned
    Aborted(String),
}

impl StopInfo {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, StopInfo::Completed)
    }
}

impl fmt::Display for StopInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopInfo::Completed => write!(f, "completed"),
            StopInfo::Breakpoint { address } => write!(f, "hit breakpoint at {address:#x}"),
            StopInfo::Signal { signo, name } => write!(f, "received signal {name} ({signo})"),
            StopInfo::TimedOut => write!(f, "timed out"),
            StopInfo::Exited { status } => write!(f, "process exited with status {status}"),
            StopInfo::Aborted(reason) => write!(f, "aborted: {reason}"),
        }
    }
}

/// Runs call plans on a thread of the target
pub trait ThreadRunner {
    fn run(&self, plan: &CallPlan) -> StopInfo;
}

/// The process, thread and compiler a call runs against
#[derive(Clone)]
pub struct ExecutionContext {
    process: Rc<dyn Process>,
    thread: Rc<dyn ThreadRunner>,
    compiler: Rc<dyn WrapperCompiler>,
}

impl ExecutionContext {
    #[must_use]
    pub fn new(
        process: Rc<dyn Process>,
        thread: Rc<dyn ThreadRunner>,
        compiler: Rc<dyn WrapperCompiler>,
    ) -> Self {
        Self {
            process,
            thread,
            compiler,
        }
    }

    /// Calls into this process, compiling with Cranelift
    #[must_use]
    pub fn host(compiler: JitCompiler) -> Self {
        Self::new(
            Rc::new(HostProcess::new()),
            Rc::new(HostThread),
            Rc::new(compiler),
        )
    }

    #[must_use]
    pub fn process(&self) -> &Rc<dyn Process> {
        &self.process
    }

    #[must_use]
    pub fn thread(&self) -> &dyn ThreadRunner {
        self.thread.as_ref()
    }

    #[must_use]
    pub fn compiler(&self) -> &dyn WrapperCompiler {
        self.compiler.as_ref()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("target", &self.process.target_info())
            .finish_non_exhaustive()
    }
}
