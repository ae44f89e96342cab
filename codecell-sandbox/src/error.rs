//! Error types for sandbox operations

use crate::environment::{EnvironmentId, EnvironmentStatus};
use crate::types::Language;
use thiserror::Error;

/// Errors returned by the sandbox control surface.
///
/// Validation rejections, program failures, resource violations and timeouts are not
/// errors: they are folded into [`crate::ExecutionResult`]. This enum covers misuse of the
/// API and infrastructure faults.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox environment '{0}' not found")]
    EnvironmentNotFound(EnvironmentId),

    #[error("Invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: EnvironmentStatus,
        to: EnvironmentStatus,
    },

    #[error("Sandbox environment '{0}' is {1:?}; reset it to idle before running again")]
    EnvironmentBusy(EnvironmentId, EnvironmentStatus),

    #[error("Invalid resource limits: {0}")]
    InvalidLimits(String),

    #[error("Language '{0}' has no registered execution engine")]
    UnsupportedLanguage(Language),

    #[error("Execution engine for '{0}' is still initializing")]
    EngineNotReady(Language),

    #[error("Execution engine for '{0}' is unavailable: {1}")]
    EngineUnavailable(Language, String),

    #[error("Engine registry has been shut down")]
    RegistryShutDown,

    #[error("Execution engine instances are single-use")]
    EngineReused,

    #[error("Failed to start interpreter '{program}': {source}")]
    EngineSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Resource monitor already started")]
    MonitorAlreadyStarted,

    #[error("Execution result channel closed before a result was delivered")]
    ResultChannelClosed,
}
