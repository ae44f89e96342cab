//! Sandbox environments and their lifecycle

use crate::error::SandboxError;
use crate::limits::ResourceLimits;
use crate::monitor::ResourceMonitor;
use crate::types::{ExecutionResult, Language};
use crate::validator::ValidationResult;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch, RwLock};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Unique environment identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentId(pub uuid::Uuid);

impl EnvironmentId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for EnvironmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EnvironmentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Environment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl EnvironmentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EnvironmentStatus::Completed | EnvironmentStatus::Failed | EnvironmentStatus::Terminated
        )
    }

    /// Whether the state machine allows `self -> to`
    pub fn can_transition_to(self, to: EnvironmentStatus) -> bool {
        use EnvironmentStatus::*;
        matches!(
            (self, to),
            (Idle, Running)
                | (Idle, Failed)
                | (Idle, Terminated)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Terminated)
                | (Completed, Idle)
                | (Failed, Idle)
                | (Terminated, Idle)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EnvironmentStatus::Idle => "idle",
            EnvironmentStatus::Running => "running",
            EnvironmentStatus::Completed => "completed",
            EnvironmentStatus::Failed => "failed",
            EnvironmentStatus::Terminated => "terminated",
        }
    }
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an execution was terminated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum TerminationReason {
    /// Emergency stop requested by the caller
    Requested,
    /// A critical resource alert was escalated
    ResourceViolation(String),
    /// Wall-clock deadline reached
    Timeout,
}

impl TerminationReason {
    /// Exit code reported for a terminated execution
    pub fn exit_code(&self) -> i32 {
        match self {
            TerminationReason::Timeout => 124,
            _ => 137,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Requested => f.write_str("terminated by request"),
            TerminationReason::ResourceViolation(detail) => {
                write!(f, "terminated for resource violation: {}", detail)
            }
            TerminationReason::Timeout => f.write_str("timeout exceeded"),
        }
    }
}

/// Snapshot of an environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxEnvironment {
    pub id: EnvironmentId,
    pub status: EnvironmentStatus,
    /// Resource envelope; never changes once the environment exists
    pub config: ResourceLimits,
    pub created_at: DateTime<Utc>,
    /// Language of the most recent execution
    pub language: Option<Language>,
    /// Number of executions started in this environment
    pub runs: u64,
}

impl SandboxEnvironment {
    pub fn new(config: ResourceLimits) -> Self {
        Self {
            id: EnvironmentId::new(),
            status: EnvironmentStatus::Idle,
            config,
            created_at: Utc::now(),
            language: None,
            runs: 0,
        }
    }

    /// Move to a new status, enforcing the lifecycle state machine
    pub fn transition(&mut self, to: EnvironmentStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(SandboxError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        tracing::debug!(
            environment_id = %self.id,
            from = %self.status,
            to = %to,
            "Environment status changed"
        );
        self.status = to;
        Ok(())
    }
}

/// Pending result of a submitted execution
#[derive(Debug)]
pub struct ExecutionHandle {
    environment_id: EnvironmentId,
    rx: oneshot::Receiver<ExecutionResult>,
}

impl ExecutionHandle {
    pub(crate) fn new(
        environment_id: EnvironmentId,
        rx: oneshot::Receiver<ExecutionResult>,
    ) -> Self {
        Self { environment_id, rx }
    }

    /// Environment the execution runs in; pass it to `terminate` for an emergency stop
    pub fn environment_id(&self) -> EnvironmentId {
        self.environment_id
    }

    /// Wait for the execution result
    pub async fn wait(self) -> Result<ExecutionResult> {
        self.rx.await.map_err(|_| SandboxError::ResultChannelClosed)
    }
}

/// Control block shared between a running pipeline and the manager's emergency stop
pub(crate) struct RunControl {
    pub cancel: CancellationToken,
    pub monitor: Arc<ResourceMonitor>,
    reason: OnceLock<TerminationReason>,
    validation: OnceLock<ValidationResult>,
    finalized: AtomicBool,
    result_tx: Mutex<Option<oneshot::Sender<ExecutionResult>>>,
    done_tx: watch::Sender<bool>,
    abort: Mutex<Option<AbortHandle>>,
}

impl RunControl {
    pub fn new(monitor: Arc<ResourceMonitor>, result_tx: oneshot::Sender<ExecutionResult>) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            monitor,
            reason: OnceLock::new(),
            validation: OnceLock::new(),
            finalized: AtomicBool::new(false),
            result_tx: Mutex::new(Some(result_tx)),
            done_tx,
            abort: Mutex::new(None),
        }
    }

    /// Record why the run is being terminated. Only the first reason sticks.
    pub fn record_reason(&self, reason: TerminationReason) -> bool {
        self.reason.set(reason).is_ok()
    }

    pub fn reason(&self) -> Option<&TerminationReason> {
        self.reason.get()
    }

    pub fn set_validation(&self, validation: ValidationResult) {
        let _ = self.validation.set(validation);
    }

    /// Verdict of the validator, once the pipeline has run it
    pub fn validation(&self) -> Option<&ValidationResult> {
        self.validation.get()
    }

    /// Claim the right to write the final status and result
    pub fn claim_finalization(&self) -> bool {
        !self.finalized.swap(true, Ordering::SeqCst)
    }

    pub fn deliver(&self, result: ExecutionResult) {
        let tx = self
            .result_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            // The caller may have dropped the handle
            let _ = tx.send(result);
        }
    }

    pub fn mark_done(&self) {
        self.done_tx.send_replace(true);
    }

    pub fn is_done(&self) -> bool {
        *self.done_tx.borrow()
    }

    /// Wait until the pipeline signals completion; `false` on timeout
    pub async fn wait_done(&self, timeout: Duration) -> bool {
        let mut rx = self.done_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|done| *done))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    pub fn set_abort_handle(&self, handle: AbortHandle) {
        *self.abort.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub fn abort(&self) {
        if let Some(handle) = self
            .abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Registry entry for one environment
pub(crate) struct EnvironmentSlot {
    pub env: RwLock<SandboxEnvironment>,
    pub run: Mutex<Option<Arc<RunControl>>>,
    pub last_result: RwLock<Option<ExecutionResult>>,
}

impl EnvironmentSlot {
    pub fn new(env: SandboxEnvironment) -> Self {
        Self {
            env: RwLock::new(env),
            run: Mutex::new(None),
            last_result: RwLock::new(None),
        }
    }

    pub fn current_run(&self) -> Option<Arc<RunControl>> {
        self.run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_run(&self, control: Option<Arc<RunControl>>) {
        *self.run.lock().unwrap_or_else(PoisonError::into_inner) = control;
    }
}
