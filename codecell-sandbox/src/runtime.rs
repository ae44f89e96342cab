//! Execution engines
//!
//! Every engine runs exactly one snippet. The registry hands out a fresh instance per
//! request, so no interpreter state leaks between executions.

mod languages;
mod probe;
mod process;
#[cfg(feature = "v8")]
mod v8;

use crate::limits::ResourceLimits;
use crate::monitor::ProbeSlot;
use crate::policy::CapabilityPolicy;
use crate::types::Language;
use crate::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use languages::{JavaScriptEngine, PythonEngine, ShellEngine, TypeScriptEngine};
pub use probe::ProcessGroupProbe;
pub use process::ProcessEngine;
#[cfg(feature = "v8")]
pub use v8::V8JavaScriptEngine;

/// Exit code reported when the wall-clock deadline kills an execution
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when an execution is killed on request
pub const KILLED_EXIT_CODE: i32 = 137;

/// Everything an engine needs besides the code itself
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Resource envelope; the engine enforces the deadline and output cap itself
    pub limits: ResourceLimits,
    /// Capabilities derived from the envelope
    pub capability: CapabilityPolicy,
    /// Cancelled by the manager on emergency stop or alert escalation
    pub cancel: CancellationToken,
    /// Slot the engine attaches its usage probe to
    pub probe: ProbeSlot,
}

impl ExecutionContext {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            capability: CapabilityPolicy::from_limits(&limits),
            limits,
            cancel: CancellationToken::new(),
            probe: ProbeSlot::default(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_probe(mut self, probe: ProbeSlot) -> Self {
        self.probe = probe;
        self
    }
}

/// Raw outcome of running a snippet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Killed by the engine's own deadline
    pub timed_out: bool,
    /// Killed because the context was cancelled
    pub cancelled: bool,
    /// stdout or stderr was cut at `maxOutputSize`
    pub truncated: bool,
    pub duration_ms: u64,
    /// Highest resident memory the probe observed
    pub peak_memory_bytes: u64,
    pub cpu_time_ms: u64,
    pub warnings: Vec<String>,
}

/// An isolated runtime for one language
#[async_trait]
pub trait ExecutionEngine: Send {
    fn language(&self) -> Language;

    /// Engine name for logs
    fn name(&self) -> &str;

    /// Run the snippet to completion, deadline or cancellation.
    ///
    /// Program failures are reported through [`EngineOutput`]; `Err` means the engine
    /// itself could not run (missing interpreter, I/O failure, reuse).
    async fn execute(
        &mut self,
        code: &str,
        inputs: &[String],
        ctx: &ExecutionContext,
    ) -> Result<EngineOutput>;

    /// Free the engine's resources (working directory, isolate)
    async fn release(&mut self);
}
