//! Per-call state and the target memory it owns

use std::fmt;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::target::{MemoryError, Process};
use crate::value::Value;

/// Progress of a single call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    StructPrepared,
    ArgumentsWritten,
    Executing,
    Completed,
    ExecutionFailed,
}

/// One call against a [`FunctionCaller`](super::FunctionCaller)
///
/// The record owns the argument struct when the facility allocated it, and
/// always owns the side allocations that carry aggregates. Owned memory is
/// freed by [`release`](Self::release) or, failing that, on drop.
pub struct CallRecord {
    process: Rc<dyn Process>,
    struct_address: u64,
    owns_struct: bool,
    side_allocations: Vec<u64>,
    arguments: Vec<Value>,
    result: Option<Value>,
    state: CallState,
}

impl CallRecord {
    pub(crate) fn new(process: Rc<dyn Process>, struct_address: u64, owns_struct: bool) -> Self {
        Self {
            process,
            struct_address,
            owns_struct,
            side_allocations: Vec::new(),
            arguments: Vec::new(),
            result: None,
            state: CallState::StructPrepared,
        }
    }

    /// Address of the argument struct in the target
    #[must_use]
    pub fn struct_address(&self) -> u64 {
        self.struct_address
    }

    /// Whether the struct was allocated by the facility
    #[must_use]
    pub fn owns_struct(&self) -> bool {
        self.owns_struct
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        self.state
    }

    /// The values most recently written to the struct
    #[must_use]
    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    /// The decoded return value, once fetched
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Target allocations holding aggregate arguments
    #[must_use]
    pub fn side_allocations(&self) -> &[u64] {
        &self.side_allocations
    }

    pub(crate) fn process(&self) -> &dyn Process {
        self.process.as_ref()
    }

    pub(crate) fn set_state(&mut self, state: CallState) {
        self.state = state;
    }

    pub(crate) fn set_arguments(&mut self, arguments: Vec<Value>) {
        self.arguments = arguments;
    }

    pub(crate) fn set_result(&mut self, value: Value) {
        self.result = Some(value);
    }

    /// Allocate and fill a side buffer owned by this record
    pub(crate) fn allocate_side(&mut self, bytes: &[u8], align: u32) -> Result<u64, MemoryError> {
        let address = self.process.allocate(bytes.len() as u64, u64::from(align))?;
        self.side_allocations.push(address);
        self.process.write(address, bytes)?;
        Ok(address)
    }

    /// Free the side buffers of a previous argument write
    pub(crate) fn free_side_allocations(&mut self) -> Result<(), MemoryError> {
        let mut first_error = None;
        for address in self.side_allocations.drain(..) {
            if let Err(e) = self.process.free(address) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn free_all(&mut self) -> Result<(), MemoryError> {
        let side = self.free_side_allocations();
        if self.owns_struct {
            self.owns_struct = false;
            debug!(address = format_args!("{:#x}", self.struct_address), "releasing argument struct");
            self.process.free(self.struct_address)?;
        }
        side
    }

    /// Free all memory the record owns now, reporting the first failure
    pub fn release(mut self) -> Result<(), MemoryError> {
        self.free_all()
    }
}

impl Drop for CallRecord {
    fn drop(&mut self) {
        if let Err(e) = self.free_all() {
            warn!(
                address = format_args!("{:#x}", self.struct_address),
                error = %e,
                "failed to release call memory"
            );
        }
    }
}

impl fmt::Debug for CallRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRecord")
            .field("struct_address", &format_args!("{:#x}", self.struct_address))
            .field("owns_struct", &self.owns_struct)
            .field("side_allocations", &self.side_allocations)
            .field("arguments", &self.arguments)
            .field("result", &self.result)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
