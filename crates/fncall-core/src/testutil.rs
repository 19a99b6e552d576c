//! Test utilities for the call facility
//!
//! Fakes for the debugger-side collaborators, so callers can be exercised
//! against targets that are not this process: other pointer widths, other
//! byte orders, and threads that stop for reasons other than completion.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};

use crate::caller::CallPlan;
use crate::compiler::{check_unit, parser::Parser, CompiledWrapper, TypeSystemHelper, WrapperCompiler};
use crate::diagnostics::DiagnosticManager;
use crate::target::{HostThread, MemoryError, Process, StopInfo, TargetInfo, ThreadRunner};
use crate::wrapper::WrapperSource;

/// Default base address of [`SparseProcess`] allocations
pub const DEFAULT_BASE: u64 = 0x1000_0000;

struct SparseState {
    next: u64,
    regions: BTreeMap<u64, Vec<u8>>,
}

/// An in-memory fake target
///
/// Allocations are carved from an address range that only grows, so no two
/// ever overlap. Every access must fall inside one live allocation.
pub struct SparseProcess {
    target: TargetInfo,
    state: RefCell<SparseState>,
}

impl SparseProcess {
    #[must_use]
    pub fn new(target: TargetInfo) -> Self {
        Self::with_base(target, DEFAULT_BASE)
    }

    /// Start allocating at `base`
    #[must_use]
    pub fn with_base(target: TargetInfo, base: u64) -> Self {
        Self {
            target,
            state: RefCell::new(SparseState {
                next: base,
                regions: BTreeMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.state.borrow().regions.len()
    }

    /// Read memory, panicking if it is not mapped
    ///
    /// # Panics
    /// Panics when the range is outside every live allocation.
    #[must_use]
    pub fn read_raw(&self, address: u64, len: usize) -> Vec<u8> {
        match self.read(address, len) {
            Ok(bytes) => bytes,
            Err(e) => panic!("read_raw: {e}"),
        }
    }

    fn with_region<T>(
        &self,
        address: u64,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> T,
    ) -> Result<T, MemoryError> {
        let mut state = self.state.borrow_mut();
        let unmapped = MemoryError::Unmapped { address, len };
        let (start, bytes) = state
            .regions
            .range_mut(..=address)
            .next_back()
            .ok_or(unmapped.clone())?;
        let offset = usize::try_from(address - start).map_err(|_| unmapped.clone())?;
        let end = offset.checked_add(len).ok_or(unmapped.clone())?;
        let window = bytes.get_mut(offset..end).ok_or(unmapped)?;
        Ok(f(window))
    }
}

impl Process for SparseProcess {
    fn target_info(&self) -> TargetInfo {
        self.target
    }

    fn allocate(&self, size: u64, align: u64) -> Result<u64, MemoryError> {
        let failed = MemoryError::AllocationFailed { size };
        let align = align.max(1);
        if !align.is_power_of_two() {
            return Err(failed);
        }
        let len = usize::try_from(size).map_err(|_| failed.clone())?;
        let mut state = self.state.borrow_mut();
        let address = state.next.checked_next_multiple_of(align).ok_or(failed.clone())?;
        // Leave a one-byte gap so adjacent allocations never touch
        state.next = address.checked_add(size.max(1) + 1).ok_or(failed)?;
        state.regions.insert(address, vec![0; len]);
        Ok(address)
    }

    fn free(&self, address: u64) -> Result<(), MemoryError> {
        self.state
            .borrow_mut()
            .regions
            .remove(&address)
            .map(|_| ())
            .ok_or(MemoryError::InvalidFree(address))
    }

    fn read(&self, address: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        self.with_region(address, len, |window| window.to_vec())
    }

    fn write(&self, address: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        self.with_region(address, bytes.len(), |window| window.copy_from_slice(bytes))
    }
}

/// A thread that replays scripted stops
///
/// Each run pops the next stop. Breakpoint stops are skipped when the plan
/// ignores breakpoints. Once the script is exhausted, runs are delegated to
/// [`HostThread`].
#[derive(Default)]
pub struct ScriptedThread {
    script: RefCell<VecDeque<StopInfo>>,
    plans: RefCell<Vec<CallPlan>>,
}

impl ScriptedThread {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, stop: StopInfo) {
        self.script.borrow_mut().push_back(stop);
    }

    /// Every plan run so far
    #[must_use]
    pub fn plans(&self) -> Vec<CallPlan> {
        self.plans.borrow().clone()
    }
}

impl ThreadRunner for ScriptedThread {
    fn run(&self, plan: &CallPlan) -> StopInfo {
        self.plans.borrow_mut().push(plan.clone());
        loop {
            let next = self.script.borrow_mut().pop_front();
            match next {
                Some(StopInfo::Breakpoint { .. }) if plan.options.ignore_breakpoints => {}
                Some(stop) => return stop,
                None => return HostThread.run(plan),
            }
        }
    }
}

/// A compiler that checks wrappers and lays out records without generating code
///
/// Works for any pointer width. The compiled wrapper's entry is 0, so it
/// must never be run for real.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayoutOnlyCompiler;

impl WrapperCompiler for LayoutOnlyCompiler {
    fn compile(
        &self,
        source: &WrapperSource,
        target: &TargetInfo,
        helper: &dyn TypeSystemHelper,
        diagnostics: &mut DiagnosticManager,
    ) -> Option<CompiledWrapper> {
        let mut unit = Parser::parse_unit(&source.text, diagnostics)?;
        helper.transform(&mut unit, diagnostics);
        let checked = check_unit(&unit, target.pointer_size, helper, diagnostics)?;
        Some(CompiledWrapper::new(checked.wrapper.name, 0, checked.records))
    }
}
