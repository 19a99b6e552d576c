//! Call options and the plan handed to the execution engine

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a call should be run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallOptions {
    /// Restore the thread's state if the call stops early
    pub unwind_on_error: bool,
    /// Keep running through breakpoints hit inside the callee
    pub ignore_breakpoints: bool,
    /// Give up after this many milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Let other threads run if the call blocks
    pub try_all_threads: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            unwind_on_error: true,
            ignore_breakpoints: false,
            timeout_ms: None,
            try_all_threads: true,
        }
    }
}

impl CallOptions {
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// A resumable unit of work: run the wrapper on the prepared struct
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallPlan {
    /// Name of the called function, for logs and stop reports
    pub function_name: String,
    pub wrapper_entry: u64,
    pub struct_address: u64,
    pub function_address: u64,
    pub options: CallOptions,
}
