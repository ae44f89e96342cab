//! Codecell sandbox - validated, resource-bounded execution of untrusted snippets
//!
//! A request goes through the [`Validator`], then runs on a fresh [`ExecutionEngine`]
//! while a [`ResourceMonitor`] samples it, and ends as one [`ExecutionResult`] built by
//! the [`ResultReporter`]. The [`SandboxManager`] owns the environment lifecycle and the
//! emergency stop.
//!
//! ```no_run
//! use codecell_sandbox::{CodeExecutionRequest, Language, SandboxConfig, SandboxManager};
//!
//! # async fn demo() -> codecell_sandbox::Result<()> {
//! let manager = SandboxManager::from_config(SandboxConfig::default()).await;
//! let result = manager
//!     .execute(CodeExecutionRequest::new(Language::Shell, "echo hello"))
//!     .await?;
//! assert_eq!(result.output.as_deref(), Some("hello\n"));
//! # Ok(())
//! # }
//! ```

mod config;
mod environment;
mod error;
mod limits;
mod monitor;
mod policy;
mod registry;
mod reporter;
mod runtime;
mod service;
mod types;
mod validator;

pub use config::{
    ConfigError, InterpreterSettings, JavaScriptBackend, ManagerConfig, MonitorConfig,
    SandboxConfig, ValidatorConfig,
};
pub use environment::{
    EnvironmentId, EnvironmentStatus, ExecutionHandle, SandboxEnvironment, TerminationReason,
};
pub use error::SandboxError;
pub use limits::ResourceLimits;
pub use monitor::{
    AlertResource, AlertSeverity, AlertThresholds, ProbeSlot, RawCounters, ResourceAlert,
    ResourceMonitor, ResourceUsage, Subscription, UsageProbe, DEFAULT_SAMPLE_INTERVAL,
};
pub use policy::{Access, CapabilityPolicy};
pub use registry::{EngineFactory, EngineReadiness, EngineRegistry};
pub use reporter::{sanitize, ExecutionOutcome, ResultReporter};
#[cfg(feature = "v8")]
pub use runtime::V8JavaScriptEngine;
pub use runtime::{
    EngineOutput, ExecutionContext, ExecutionEngine, JavaScriptEngine, ProcessEngine,
    ProcessGroupProbe, PythonEngine, ShellEngine, TypeScriptEngine, KILLED_EXIT_CODE,
    TIMEOUT_EXIT_CODE,
};
pub use service::SandboxManager;
pub use types::{CodeExecutionRequest, ExecutionResult, Language};
pub use validator::{
    Finding, RiskLevel, ValidationResult, Validator, ValidatorSettings, DEFAULT_MAX_SOURCE_BYTES,
};

/// Result type for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;
