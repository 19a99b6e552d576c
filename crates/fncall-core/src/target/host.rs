//! The current process as a call target
//!
//! Memory handed out by [`HostProcess`] is real heap memory, so JIT-compiled
//! wrappers can read and write it directly. Every access through the
//! [`Process`] trait is checked against the live allocations; nothing outside
//! them is ever touched.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::RefCell;
use std::collections::BTreeMap;

use tracing::trace;

use super::{MemoryError, Process, StopInfo, TargetInfo, ThreadRunner};
use crate::caller::CallPlan;

struct Region {
    ptr: *mut u8,
    layout: Layout,
}

/// Heap-backed memory of the running process
#[derive(Default)]
pub struct HostProcess {
    regions: RefCell<BTreeMap<u64, Region>>,
}

impl HostProcess {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live allocations
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.regions.borrow().len()
    }

    /// Locate `len` bytes at `address` inside a single live region
    fn locate(&self, address: u64, len: usize) -> Result<*mut u8, MemoryError> {
        let regions = self.regions.borrow();
        let unmapped = MemoryError::Unmapped { address, len };
        let (start, region) = regions.range(..=address).next_back().ok_or(unmapped.clone())?;
        let offset = address - start;
        let end = offset.checked_add(len as u64).ok_or(unmapped.clone())?;
        if end > region.layout.size() as u64 {
            return Err(unmapped);
        }
        // SAFETY: offset + len lies within the region's allocation
        Ok(unsafe { region.ptr.add(offset as usize) })
    }
}

impl Process for HostProcess {
    fn target_info(&self) -> TargetInfo {
        TargetInfo::host()
    }

    fn allocate(&self, size: u64, align: u64) -> Result<u64, MemoryError> {
        let failed = MemoryError::AllocationFailed { size };
        let size_bytes = usize::try_from(size.max(1)).map_err(|_| failed.clone())?;
        let align = usize::try_from(align.max(1)).map_err(|_| failed.clone())?;
        let layout = Layout::from_size_align(size_bytes, align).map_err(|_| failed.clone())?;

        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(failed);
        }
        let address = ptr as u64;
        self.regions.borrow_mut().insert(address, Region { ptr, layout });
        trace!(address = format_args!("{address:#x}"), size, "allocated host memory");
        Ok(address)
    }

    fn free(&self, address: u64) -> Result<(), MemoryError> {
        let region = self
            .regions
            .borrow_mut()
            .remove(&address)
            .ok_or(MemoryError::InvalidFree(address))?;
        // SAFETY: the region was allocated by `allocate` with this layout
        unsafe { dealloc(region.ptr, region.layout) };
        Ok(())
    }

    fn read(&self, address: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        let ptr = self.locate(address, len)?;
        // SAFETY: `locate` checked the range is inside a live allocation
        Ok(unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec())
    }

    fn write(&self, address: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        let ptr = self.locate(address, bytes.len())?;
        // SAFETY: `locate` checked the range is inside a live allocation
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        Ok(())
    }
}

impl Drop for HostProcess {
    fn drop(&mut self) {
        for (_, region) in std::mem::take(self.regions.get_mut()) {
            // SAFETY: each region was allocated by `allocate` with its layout
            unsafe { dealloc(region.ptr, region.layout) };
        }
    }
}

/// Runs wrappers on the calling thread
///
/// The plan's wrapper entry must be code compiled for this process, and its
/// struct address must point at memory the wrapper may write. Breakpoints and
/// timeouts cannot interrupt a direct call, so those options are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostThread;

impl ThreadRunner for HostThread {
    fn run(&self, plan: &CallPlan) -> StopInfo {
        if plan.wrapper_entry == 0 {
            return StopInfo::Aborted("wrapper has no entry point".to_string());
        }
        if plan.struct_address == 0 {
            return StopInfo::Aborted("argument struct address is null".to_string());
        }
        trace!(
            function = %plan.function_name,
            entry = format_args!("{:#x}", plan.wrapper_entry),
            "running wrapper on host thread"
        );
        // SAFETY: the entry was produced by a wrapper compiler for this
        // process and takes a single pointer to the argument struct
        let wrapper = unsafe {
            std::mem::transmute::<usize, extern "C" fn(*mut u8)>(plan.wrapper_entry as usize)
        };
        wrapper(plan.struct_address as usize as *mut u8);
        StopInfo::Completed
    }
}
