//! Sandbox environment manager - main entry point

use crate::config::{ManagerConfig, MonitorConfig, SandboxConfig};
use crate::environment::{
    EnvironmentId, EnvironmentSlot, EnvironmentStatus, ExecutionHandle, RunControl,
    SandboxEnvironment, TerminationReason,
};
use crate::error::SandboxError;
use crate::limits::ResourceLimits;
use crate::monitor::{AlertResource, ResourceAlert, ResourceMonitor, ResourceUsage};
use crate::policy::CapabilityPolicy;
use crate::registry::EngineRegistry;
use crate::reporter::{ExecutionOutcome, ResultReporter};
use crate::runtime::ExecutionContext;
use crate::types::{CodeExecutionRequest, ExecutionResult};
use crate::validator::{Validator, ValidatorSettings};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{oneshot, RwLock};

type Environments = Arc<RwLock<HashMap<EnvironmentId, Arc<EnvironmentSlot>>>>;

struct ManagerInner {
    registry: Arc<EngineRegistry>,
    validator: Validator,
    reporter: ResultReporter,
    default_limits: ResourceLimits,
    monitor: MonitorConfig,
    manager: ManagerConfig,
    environments: Environments,
}

/// Owns sandbox environments and runs requests through validation, execution, monitoring
/// and reporting
#[derive(Clone)]
pub struct SandboxManager {
    inner: Arc<ManagerInner>,
}

impl SandboxManager {
    /// Create a manager around an already prepared registry
    pub fn new(registry: EngineRegistry, config: SandboxConfig) -> Self {
        Self::with_registry(Arc::new(registry), config)
    }

    pub fn with_registry(registry: Arc<EngineRegistry>, config: SandboxConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                validator: Validator::new(ValidatorSettings::from(&config.validator)),
                reporter: ResultReporter::new(),
                default_limits: config.limits,
                monitor: config.monitor,
                manager: config.manager,
                environments: Arc::new(RwLock::new(HashMap::new())),
            }),
        }
    }

    /// Build the default interpreter engines from configuration and run their readiness
    /// checks
    pub async fn from_config(config: SandboxConfig) -> Self {
        let registry = EngineRegistry::with_defaults(&config.interpreters);
        registry.initialize().await;
        Self::new(registry, config)
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.inner.registry
    }

    pub fn validator(&self) -> &Validator {
        &self.inner.validator
    }

    /// Envelope applied when a caller has no specific limits
    pub fn default_limits(&self) -> &ResourceLimits {
        &self.inner.default_limits
    }

    /// Create an idle environment with a fixed resource envelope
    pub async fn create_environment(&self, limits: ResourceLimits) -> Result<EnvironmentId> {
        limits.validate()?;
        let env = SandboxEnvironment::new(limits);
        let id = env.id;
        self.inner
            .environments
            .write()
            .await
            .insert(id, Arc::new(EnvironmentSlot::new(env)));
        tracing::debug!(environment_id = %id, "Created sandbox environment");
        Ok(id)
    }

    /// Create an environment for the request's envelope and start executing.
    ///
    /// Returns as soon as the execution is scheduled.
    pub async fn submit(&self, request: CodeExecutionRequest) -> Result<ExecutionHandle> {
        let id = self.create_environment(request.limits.clone()).await?;
        self.run(id, request).await
    }

    /// Submit and wait for the result
    pub async fn execute(&self, request: CodeExecutionRequest) -> Result<ExecutionResult> {
        self.submit(request).await?.wait().await
    }

    /// Start an execution in an existing idle environment.
    ///
    /// The environment's envelope applies; `request.limits` is only used by
    /// [`submit`](Self::submit) when it creates the environment.
    pub async fn run(
        &self,
        id: EnvironmentId,
        request: CodeExecutionRequest,
    ) -> Result<ExecutionHandle> {
        let slot = self.slot(id).await?;
        let (result_tx, result_rx) = oneshot::channel();

        let control = {
            let mut env = slot.env.write().await;
            let active = slot.current_run().is_some_and(|run| !run.is_done());
            if env.status != EnvironmentStatus::Idle || active {
                return Err(SandboxError::EnvironmentBusy(id, env.status));
            }
            env.runs += 1;
            env.language = Some(request.language);

            // A fresh monitor per run starts with zeroed usage and no alerts
            let monitor = Arc::new(ResourceMonitor::new(
                env.config.clone(),
                self.inner.monitor.thresholds(),
                self.inner.monitor.sample_interval,
            ));
            let control = Arc::new(RunControl::new(monitor, result_tx));
            slot.set_run(Some(control.clone()));
            control
        };

        tracing::info!(
            environment_id = %id,
            language = %request.language,
            code_len = request.code.len(),
            "Submitting execution"
        );

        let handle = tokio::spawn(run_pipeline(
            self.inner.clone(),
            slot,
            control.clone(),
            request,
        ));
        control.set_abort_handle(handle.abort_handle());
        Ok(ExecutionHandle::new(id, result_rx))
    }

    /// Emergency stop. Idempotent and bounded by the cleanup window.
    pub async fn terminate(&self, id: EnvironmentId) -> Result<()> {
        let slot = self.slot(id).await?;

        let control = {
            let mut env = slot.env.write().await;
            match slot.current_run().filter(|run| !run.is_done()) {
                Some(control) => control,
                None => {
                    if env.status == EnvironmentStatus::Idle {
                        env.transition(EnvironmentStatus::Terminated)?;
                        tracing::info!(environment_id = %id, "Terminated idle environment");
                    }
                    return Ok(());
                }
            }
        };

        control.record_reason(TerminationReason::Requested);
        control.cancel.cancel();
        tracing::warn!(environment_id = %id, "Emergency stop requested");

        if control.wait_done(self.inner.manager.cleanup_window).await {
            return Ok(());
        }

        tracing::error!(
            environment_id = %id,
            window_ms = self.inner.manager.cleanup_window.as_millis() as u64,
            "Execution did not stop within the cleanup window; forcing termination"
        );
        if control.claim_finalization() {
            control.abort();
            control.monitor.stop().await;
            let reason = control
                .reason()
                .cloned()
                .unwrap_or(TerminationReason::Requested);
            let outcome = ExecutionOutcome {
                status: EnvironmentStatus::Terminated,
                output: None,
                engine_error: None,
                reason: Some(reason.clone()),
                usage: control.monitor.usage(),
                alerts: control.monitor.get_alerts(),
                max_output_size: slot.env.read().await.config.max_output_size,
            };
            let result = match control.validation().cloned() {
                Some(validation) if validation.valid => {
                    self.inner.reporter.report(id, validation, Some(outcome))
                }
                validation => self.inner.reporter.cancelled_before_start(
                    id,
                    validation.unwrap_or_default(),
                    &reason,
                ),
            };
            {
                let mut env = slot.env.write().await;
                if let Err(err) = env.transition(EnvironmentStatus::Terminated) {
                    tracing::error!(
                        environment_id = %id,
                        %err,
                        "Failed to force terminated status"
                    );
                }
            }
            *slot.last_result.write().await = Some(result.clone());
            control.deliver(result);
        }
        control.mark_done();
        Ok(())
    }

    /// Return a finished environment to idle so it can run again
    pub async fn reset(&self, id: EnvironmentId) -> Result<()> {
        let slot = self.slot(id).await?;
        let mut env = slot.env.write().await;
        if slot.current_run().is_some_and(|run| !run.is_done()) {
            return Err(SandboxError::EnvironmentBusy(id, env.status));
        }
        if env.status.is_terminal() {
            env.transition(EnvironmentStatus::Idle)?;
        }
        slot.set_run(None);
        Ok(())
    }

    pub async fn status(&self, id: EnvironmentId) -> Result<EnvironmentStatus> {
        Ok(self.slot(id).await?.env.read().await.status)
    }

    pub async fn environment(&self, id: EnvironmentId) -> Result<SandboxEnvironment> {
        Ok(self.slot(id).await?.env.read().await.clone())
    }

    /// Alerts of the current or most recent execution
    pub async fn get_alerts(&self, id: EnvironmentId) -> Result<Vec<ResourceAlert>> {
        let slot = self.slot(id).await?;
        Ok(slot
            .current_run()
            .map(|run| run.monitor.get_alerts())
            .unwrap_or_default())
    }

    /// Usage of the current or most recent execution
    pub async fn usage(&self, id: EnvironmentId) -> Result<ResourceUsage> {
        let slot = self.slot(id).await?;
        Ok(slot
            .current_run()
            .map(|run| run.monitor.usage())
            .unwrap_or_default())
    }

    pub async fn last_result(&self, id: EnvironmentId) -> Result<Option<ExecutionResult>> {
        Ok(self.slot(id).await?.last_result.read().await.clone())
    }

    /// Snapshot of every environment, oldest first
    pub async fn list_environments(&self) -> Vec<SandboxEnvironment> {
        let slots: Vec<Arc<EnvironmentSlot>> =
            self.inner.environments.read().await.values().cloned().collect();
        let mut envs = Vec::with_capacity(slots.len());
        for slot in slots {
            envs.push(slot.env.read().await.clone());
        }
        envs.sort_by_key(|env| env.created_at);
        envs
    }

    /// Drop environments in a terminal state. Returns how many were removed.
    pub async fn cleanup_finished(&self) -> usize {
        let slots: Vec<(EnvironmentId, Arc<EnvironmentSlot>)> = self
            .inner
            .environments
            .read()
            .await
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();

        let mut finished = Vec::new();
        for (id, slot) in slots {
            let terminal = slot.env.read().await.status.is_terminal();
            let active = slot.current_run().is_some_and(|run| !run.is_done());
            if terminal && !active {
                finished.push(id);
            }
        }

        let mut environments = self.inner.environments.write().await;
        for id in &finished {
            environments.remove(id);
        }
        tracing::debug!(removed = finished.len(), "Cleaned up finished environments");
        finished.len()
    }

    /// Stop allocating engines and terminate every active execution
    pub async fn shutdown(&self) {
        self.inner.registry.shutdown();
        let ids: Vec<EnvironmentId> =
            self.inner.environments.read().await.keys().copied().collect();
        let stops = ids.into_iter().map(|id| async move {
            if let Err(err) = self.terminate(id).await {
                tracing::warn!(environment_id = %id, %err, "Failed to terminate during shutdown");
            }
        });
        futures::future::join_all(stops).await;
        tracing::info!("Sandbox manager shut down");
    }

    async fn slot(&self, id: EnvironmentId) -> Result<Arc<EnvironmentSlot>> {
        self.inner
            .environments
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SandboxError::EnvironmentNotFound(id))
    }
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("registry", &self.inner.registry)
            .field("manager", &self.inner.manager)
            .finish()
    }
}

async fn run_pipeline(
    inner: Arc<ManagerInner>,
    slot: Arc<EnvironmentSlot>,
    control: Arc<RunControl>,
    request: CodeExecutionRequest,
) {
    let (id, limits) = {
        let env = slot.env.read().await;
        (env.id, env.config.clone())
    };
    let policy = CapabilityPolicy::from_limits(&limits);

    let validation = inner
        .validator
        .validate_with(&request.code, request.language, &policy);
    control.set_validation(validation.clone());
    if !validation.valid {
        tracing::info!(
            environment_id = %id,
            risk_level = %validation.risk_level,
            errors = validation.errors.len(),
            "Request rejected by validator"
        );
        let result = inner.reporter.rejected(id, validation);
        finish(&slot, &control, EnvironmentStatus::Failed, result).await;
        return;
    }

    if control.cancel.is_cancelled() {
        let reason = control
            .reason()
            .cloned()
            .unwrap_or(TerminationReason::Requested);
        let result = inner.reporter.cancelled_before_start(id, validation, &reason);
        finish(&slot, &control, EnvironmentStatus::Terminated, result).await;
        return;
    }

    let mut engine = match inner.registry.create(request.language) {
        Ok(engine) => engine,
        Err(err) => {
            tracing::error!(
                environment_id = %id,
                language = %request.language,
                %err,
                "Engine allocation failed"
            );
            let result = inner.reporter.infrastructure_failure(id, validation, err.to_string());
            finish(&slot, &control, EnvironmentStatus::Failed, result).await;
            return;
        }
    };

    let started = slot.env.write().await.transition(EnvironmentStatus::Running);
    if let Err(err) = started {
        tracing::error!(environment_id = %id, %err, "Could not start execution");
        engine.release().await;
        let result = inner.reporter.infrastructure_failure(id, validation, err.to_string());
        finish(&slot, &control, EnvironmentStatus::Failed, result).await;
        return;
    }

    let alerts = control.monitor.subscribe_alerts();
    if let Err(err) = control.monitor.start() {
        tracing::error!(environment_id = %id, %err, "Resource monitor failed to start");
        engine.release().await;
        let result = inner.reporter.infrastructure_failure(id, validation, err.to_string());
        finish(&slot, &control, EnvironmentStatus::Failed, result).await;
        return;
    }
    let escalation = tokio::spawn(escalate_alerts(
        id,
        alerts,
        control.clone(),
        inner.manager.clone(),
    ));

    let ctx = ExecutionContext::new(limits.clone())
        .with_cancel(control.cancel.clone())
        .with_probe(control.monitor.probe_slot());
    tracing::debug!(
        environment_id = %id,
        engine = engine.name(),
        csp = %ctx.capability,
        "Executing"
    );

    let started = Instant::now();
    let executed = engine.execute(&request.code, &request.inputs, &ctx).await;
    let elapsed = started.elapsed();
    engine.release().await;
    escalation.abort();
    control.monitor.stop().await;

    let (status, output, engine_error) = match executed {
        Ok(output) => {
            if output.timed_out {
                control.record_reason(TerminationReason::Timeout);
            } else if elapsed > limits.deadline() + inner.manager.overshoot_tolerance {
                tracing::warn!(
                    environment_id = %id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Execution overshot its deadline"
                );
                control.record_reason(TerminationReason::Timeout);
            }
            let status = if control.reason().is_some() || output.cancelled {
                EnvironmentStatus::Terminated
            } else if output.exit_code == 0 {
                EnvironmentStatus::Completed
            } else {
                EnvironmentStatus::Failed
            };
            (status, Some(output), None)
        }
        Err(err) => {
            tracing::error!(environment_id = %id, %err, "Execution engine failed");
            let status = if control.reason().is_some() {
                EnvironmentStatus::Terminated
            } else {
                EnvironmentStatus::Failed
            };
            (status, None, Some(err.to_string()))
        }
    };

    let outcome = ExecutionOutcome {
        status,
        output,
        engine_error,
        reason: control.reason().cloned(),
        usage: control.monitor.usage(),
        alerts: control.monitor.get_alerts(),
        max_output_size: limits.max_output_size,
    };
    let result = inner.reporter.report(id, validation, Some(outcome));
    finish(&slot, &control, status, result).await;
}

/// Turn critical alerts into termination according to the escalation policy.
/// Ends once the run is cancelled, whoever cancelled it.
async fn escalate_alerts(
    id: EnvironmentId,
    mut alerts: tokio::sync::broadcast::Receiver<ResourceAlert>,
    control: Arc<RunControl>,
    policy: ManagerConfig,
) {
    loop {
        let received = tokio::select! {
            _ = control.cancel.cancelled() => return,
            received = alerts.recv() => received,
        };
        match received {
            Ok(alert) if alert.is_critical() => {
                let escalate = match alert.resource {
                    AlertResource::Memory => policy.terminate_on_memory_critical,
                    AlertResource::Cpu => policy.terminate_on_cpu_critical,
                    AlertResource::Sampling => false,
                };
                if escalate {
                    let reason = TerminationReason::ResourceViolation(alert.message.clone());
                    if control.record_reason(reason) {
                        tracing::warn!(
                            environment_id = %id,
                            alert = %alert.message,
                            "Escalating critical alert"
                        );
                    }
                    control.cancel.cancel();
                    return;
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(environment_id = %id, skipped, "Alert receiver lagged");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

async fn finish(
    slot: &EnvironmentSlot,
    control: &RunControl,
    status: EnvironmentStatus,
    result: ExecutionResult,
) {
    // An emergency stop that ran out of patience has already reported
    if !control.claim_finalization() {
        return;
    }
    {
        let mut env = slot.env.write().await;
        if let Err(err) = env.transition(status) {
            tracing::error!(environment_id = %env.id, %err, "Invalid final status");
        }
    }
    tracing::info!(
        environment_id = %result.environment_id,
        status = %result.status,
        exit_code = result.exit_code,
        execution_time_ms = result.execution_time_ms,
        "Execution finished"
    );
    *slot.last_result.write().await = Some(result.clone());
    control.deliver(result);
    control.mark_done();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{EngineOutput, ExecutionEngine};
    use crate::types::Language;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Prints its code back. "hang" sleeps until cancelled, "stubborn" ignores cancellation.
    struct EchoEngine;

    #[async_trait]
    impl ExecutionEngine for EchoEngine {
        fn language(&self) -> Language {
            Language::Python
        }

        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(
            &mut self,
            code: &str,
            _inputs: &[String],
            ctx: &ExecutionContext,
        ) -> Result<EngineOutput> {
            if code == "stubborn" {
                // Ignores cancellation entirely
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if code == "hang" {
                ctx.cancel.cancelled().await;
                return Ok(EngineOutput {
                    exit_code: 137,
                    cancelled: true,
                    ..Default::default()
                });
            }
            Ok(EngineOutput {
                stdout: format!("{}\n", code),
                ..Default::default()
            })
        }

        async fn release(&mut self) {}
    }

    fn manager() -> SandboxManager {
        let registry = EngineRegistry::new();
        registry.register(Language::Python, || Box::new(EchoEngine));
        SandboxManager::new(registry, SandboxConfig::default())
    }

    #[tokio::test]
    async fn test_execute_completes() {
        let manager = manager();
        let result = manager
            .execute(CodeExecutionRequest::new(Language::Python, "x = 1"))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.status, EnvironmentStatus::Completed);
        assert_eq!(result.output.as_deref(), Some("x = 1\n"));
        assert_eq!(
            manager.status(result.environment_id).await.unwrap(),
            EnvironmentStatus::Completed
        );
        assert_eq!(
            manager.last_result(result.environment_id).await.unwrap().map(|r| r.exit_code),
            Some(0)
        );
    }

    #[tokio::test]
    async fn test_rejected_request_fails_without_running() {
        let manager = manager();
        let result = manager
            .execute(CodeExecutionRequest::new(Language::Python, "import os\nos.system('ls')"))
            .await
            .unwrap();
        assert_eq!(result.status, EnvironmentStatus::Failed);
        assert!(!result.validation_result.valid);
        assert_eq!(result.output, None);
        assert_eq!(result.exit_code, 1);
    }

    #[tokio::test]
    async fn test_unsupported_language_is_infrastructure_failure() {
        let manager = manager();
        let result = manager
            .execute(CodeExecutionRequest::new(Language::Shell, "echo hi"))
            .await
            .unwrap();
        assert_eq!(result.status, EnvironmentStatus::Failed);
        assert_eq!(result.exit_code, 1);
        assert!(result.error.unwrap().contains("no registered execution engine"));
    }

    #[tokio::test]
    async fn test_forced_termination_releases_run_tasks() {
        let registry = EngineRegistry::new();
        registry.register(Language::Python, || Box::new(EchoEngine));
        let mut config = SandboxConfig::default();
        config.manager.cleanup_window = Duration::from_millis(200);
        let manager = SandboxManager::new(registry, config);

        let handle = manager
            .submit(CodeExecutionRequest::new(Language::Python, "stubborn"))
            .await
            .unwrap();
        let id = handle.environment_id();
        while manager.status(id).await.unwrap() != EnvironmentStatus::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let control = manager.slot(id).await.unwrap().current_run().unwrap();

        manager.terminate(id).await.unwrap();
        let result = handle.wait().await.unwrap();
        assert_eq!(result.status, EnvironmentStatus::Terminated);
        assert!(control.is_done());

        // Only the slot and this test still hold the run once the pipeline and the
        // escalation task are gone
        let deadline = Instant::now() + Duration::from_secs(1);
        while Arc::strong_count(&control) > 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(Arc::strong_count(&control), 2);
    }

    #[tokio::test]
    async fn test_busy_and_reset() {
        let manager = manager();
        let id = manager.create_environment(ResourceLimits::default()).await.unwrap();
        let handle = manager
            .run(id, CodeExecutionRequest::new(Language::Python, "hang"))
            .await
            .unwrap();
        assert_matches!(
            manager
                .run(id, CodeExecutionRequest::new(Language::Python, "x"))
                .await,
            Err(SandboxError::EnvironmentBusy(..))
        );
        assert_matches!(manager.reset(id).await, Err(SandboxError::EnvironmentBusy(..)));

        manager.terminate(id).await.unwrap();
        let result = handle.wait().await.unwrap();
        assert_eq!(result.status, EnvironmentStatus::Terminated);
        assert_eq!(result.exit_code, 137);

        manager.reset(id).await.unwrap();
        assert_eq!(manager.status(id).await.unwrap(), EnvironmentStatus::Idle);
        let result = manager
            .run(id, CodeExecutionRequest::new(Language::Python, "again"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(manager.environment(id).await.unwrap().runs, 2);
    }

    #[tokio::test]
    async fn test_terminate_idle_and_unknown() {
        let manager = manager();
        let id = manager.create_environment(ResourceLimits::default()).await.unwrap();
        manager.terminate(id).await.unwrap();
        manager.terminate(id).await.unwrap();
        assert_eq!(manager.status(id).await.unwrap(), EnvironmentStatus::Terminated);

        let unknown = EnvironmentId::new();
        assert_matches!(
            manager.terminate(unknown).await,
            Err(SandboxError::EnvironmentNotFound(missing)) if missing == unknown
        );
    }

    #[tokio::test]
    async fn test_invalid_limits_rejected() {
        let manager = manager();
        let limits = ResourceLimits {
            max_memory_mb: 0,
            ..Default::default()
        };
        assert_matches!(
            manager.create_environment(limits).await,
            Err(SandboxError::InvalidLimits(_))
        );
    }

    #[tokio::test]
    async fn test_cleanup_and_list() {
        let manager = manager();
        let done = manager
            .execute(CodeExecutionRequest::new(Language::Python, "x"))
            .await
            .unwrap()
            .environment_id;
        let idle = manager.create_environment(ResourceLimits::default()).await.unwrap();
        assert_eq!(manager.list_environments().await.len(), 2);

        assert_eq!(manager.cleanup_finished().await, 1);
        let remaining: Vec<EnvironmentId> =
            manager.list_environments().await.into_iter().map(|e| e.id).collect();
        assert_eq!(remaining, vec![idle]);
        assert_matches!(manager.status(done).await, Err(SandboxError::EnvironmentNotFound(_)));
    }

    #[tokio::test]
    async fn test_shutdown_terminates_running() {
        let manager = manager();
        let handle = manager
            .submit(CodeExecutionRequest::new(Language::Python, "hang"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.shutdown().await;
        let result = handle.wait().await.unwrap();
        assert_eq!(result.status, EnvironmentStatus::Terminated);
        assert_matches!(
            manager
                .submit(CodeExecutionRequest::new(Language::Python, "x"))
                .await
                .unwrap()
                .wait()
                .await
                .map(|r| r.status),
            Ok(EnvironmentStatus::Failed)
        );
    }
}
