//! End-to-end tests through the sandbox manager

use async_trait::async_trait;
use codecell_sandbox::{
    AlertResource, AlertSeverity, CodeExecutionRequest, EngineOutput, EngineRegistry,
    EnvironmentId, EnvironmentStatus, ExecutionContext, ExecutionEngine, Language, RawCounters,
    ResourceLimits, RiskLevel, SandboxConfig, SandboxManager, UsageProbe,
};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MIB: u64 = 1024 * 1024;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn fast_config() -> SandboxConfig {
    let mut config = SandboxConfig::default();
    config.monitor.sample_interval = Duration::from_millis(20);
    config
}

async fn shell_manager() -> SandboxManager {
    init_tracing();
    SandboxManager::from_config(fast_config()).await
}

async fn wait_for_status(manager: &SandboxManager, id: EnvironmentId, status: EnvironmentStatus) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while manager.status(id).await.unwrap() != status {
        assert!(Instant::now() < deadline, "environment never reached {}", status);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

#[tokio::test]
async fn test_shell_hello() {
    let manager = shell_manager().await;
    let result = manager
        .execute(CodeExecutionRequest::new(Language::Shell, "echo hello"))
        .await
        .unwrap();

    assert!(result.validation_result.valid);
    assert!(result.success);
    assert_eq!(result.status, EnvironmentStatus::Completed);
    assert_eq!(result.output.as_deref(), Some("hello\n"));
    assert_eq!(result.exit_code, 0);
    assert!(result.execution_time_ms <= ResourceLimits::default().max_execution_time_ms);
}

#[tokio::test]
async fn test_python_hello() {
    if !python_available() {
        return;
    }
    let manager = shell_manager().await;
    let result = manager
        .execute(CodeExecutionRequest::new(Language::Python, "print(\"hello\")"))
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.output.as_deref(), Some("hello\n"));
    assert_eq!(result.exit_code, 0);
}

#[tokio::test]
async fn test_python_reads_inputs() {
    if !python_available() {
        return;
    }
    let manager = shell_manager().await;
    let code = "a = input()\nb = input()\nprint(b + a)";
    let request = CodeExecutionRequest::new(Language::Python, code)
        .with_input("1")
        .with_input("2");
    let result = manager.execute(request).await.unwrap();
    assert_eq!(result.output.as_deref(), Some("21\n"));
}

#[tokio::test]
async fn test_destructive_shell_never_runs() {
    let manager = shell_manager().await;
    let result = manager
        .execute(CodeExecutionRequest::new(Language::Shell, "rm -rf /"))
        .await
        .unwrap();

    assert!(!result.validation_result.valid);
    assert_eq!(result.validation_result.risk_level, RiskLevel::Critical);
    assert!(!result.success);
    assert_eq!(result.status, EnvironmentStatus::Failed);
    assert_eq!(result.output, None);
    assert_ne!(result.exit_code, 0);

    let usage = manager.usage(result.environment_id).await.unwrap();
    assert_eq!(usage.execution_time_ms, 0);
    assert_eq!(usage.memory_mb, 0.0);
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let manager = shell_manager().await;
    let limits = ResourceLimits {
        max_execution_time_ms: 500,
        ..Default::default()
    };
    let started = Instant::now();
    let result = manager
        .execute(
            CodeExecutionRequest::new(Language::Shell, "while :; do :; done").with_limits(limits),
        )
        .await
        .unwrap();

    assert_eq!(result.status, EnvironmentStatus::Terminated);
    assert_eq!(result.exit_code, 124);
    assert!(result.error.as_deref().unwrap_or_default().contains("timeout exceeded"));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(
        manager.status(result.environment_id).await.unwrap(),
        EnvironmentStatus::Terminated
    );
}

/// Reports memory growing by 4 MB per sample, capped at 30 MB
struct GrowingProbe {
    samples: AtomicU64,
}

impl UsageProbe for GrowingProbe {
    fn sample(&self) -> io::Result<Option<RawCounters>> {
        let n = self.samples.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(RawCounters {
            memory_bytes: (n * 4 * MIB).min(30 * MIB),
            ..Default::default()
        }))
    }
}

/// Keeps "allocating" until the context is cancelled
struct AllocatingEngine;

#[async_trait]
impl ExecutionEngine for AllocatingEngine {
    fn language(&self) -> Language {
        Language::Python
    }

    fn name(&self) -> &str {
        "allocating"
    }

    async fn execute(
        &mut self,
        _code: &str,
        _inputs: &[String],
        ctx: &ExecutionContext,
    ) -> codecell_sandbox::Result<EngineOutput> {
        ctx.probe.attach(Arc::new(GrowingProbe {
            samples: AtomicU64::new(0),
        }));
        tokio::select! {
            _ = ctx.cancel.cancelled() => Ok(EngineOutput {
                exit_code: 137,
                cancelled: true,
                ..Default::default()
            }),
            _ = tokio::time::sleep(ctx.limits.deadline()) => Ok(EngineOutput {
                exit_code: 124,
                timed_out: true,
                ..Default::default()
            }),
        }
    }

    async fn release(&mut self) {}
}

#[tokio::test]
async fn test_memory_critical_alert_terminates() {
    init_tracing();
    let registry = EngineRegistry::new();
    registry.register(Language::Python, || Box::new(AllocatingEngine));
    let manager = SandboxManager::new(registry, fast_config());

    let result = manager
        .execute(CodeExecutionRequest::new(Language::Python, "data = []"))
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.status, EnvironmentStatus::Terminated);
    assert_eq!(result.exit_code, 137);
    assert!(result.error.as_deref().unwrap_or_default().contains("resource violation"));
    assert!((28.0..=32.0).contains(&result.memory_usage_mb));

    let memory_alerts: Vec<_> = result
        .alerts
        .iter()
        .filter(|a| a.resource == AlertResource::Memory)
        .map(|a| a.severity)
        .collect();
    assert_eq!(memory_alerts, vec![AlertSeverity::Warning, AlertSeverity::Critical]);
    assert_eq!(manager.get_alerts(result.environment_id).await.unwrap(), result.alerts);
}

/// Never looks at the cancellation token
struct StubbornEngine;

#[async_trait]
impl ExecutionEngine for StubbornEngine {
    fn language(&self) -> Language {
        Language::Python
    }

    fn name(&self) -> &str {
        "stubborn"
    }

    async fn execute(
        &mut self,
        _code: &str,
        _inputs: &[String],
        _ctx: &ExecutionContext,
    ) -> codecell_sandbox::Result<EngineOutput> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(EngineOutput::default())
    }

    async fn release(&mut self) {}
}

#[tokio::test]
async fn test_stubborn_engine_is_forced_down_after_cleanup_window() {
    init_tracing();
    let registry = EngineRegistry::new();
    registry.register(Language::Python, || Box::new(StubbornEngine));
    let mut config = fast_config();
    config.manager.cleanup_window = Duration::from_millis(300);
    let manager = SandboxManager::new(registry, config);

    let handle = manager
        .submit(CodeExecutionRequest::new(Language::Python, "print(1)"))
        .await
        .unwrap();
    let id = handle.environment_id();
    wait_for_status(&manager, id, EnvironmentStatus::Running).await;

    let started = Instant::now();
    manager.terminate(id).await.unwrap();
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(300), "returned after {:?}", waited);
    assert!(waited < Duration::from_secs(2), "returned after {:?}", waited);
    assert_eq!(manager.status(id).await.unwrap(), EnvironmentStatus::Terminated);

    let result = handle.wait().await.unwrap();
    assert!(!result.success);
    assert_eq!(result.status, EnvironmentStatus::Terminated);
    assert_eq!(result.exit_code, 137);
    assert_eq!(result.output, None);
    assert!(result.error.as_deref().unwrap_or_default().contains("terminated by request"));
    assert!(result.validation_result.valid);

    // The forced result is final; a second stop is a no-op
    manager.terminate(id).await.unwrap();
    assert_eq!(
        manager.last_result(id).await.unwrap().map(|r| r.exit_code),
        Some(137)
    );
}

#[tokio::test]
async fn test_terminate_running_execution() {
    let manager = shell_manager().await;
    let handle = manager
        .submit(CodeExecutionRequest::new(Language::Shell, "sleep 30"))
        .await
        .unwrap();
    let id = handle.environment_id();
    wait_for_status(&manager, id, EnvironmentStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    manager.terminate(id).await.unwrap();
    assert!(started.elapsed() <= Duration::from_secs(3));
    assert_eq!(manager.status(id).await.unwrap(), EnvironmentStatus::Terminated);

    let result = handle.wait().await.unwrap();
    assert_eq!(result.status, EnvironmentStatus::Terminated);
    assert_eq!(result.exit_code, 137);
    assert!(manager.get_alerts(id).await.is_ok());

    // Terminating again changes nothing
    manager.terminate(id).await.unwrap();
    assert_eq!(manager.status(id).await.unwrap(), EnvironmentStatus::Terminated);
    assert_eq!(
        manager.last_result(id).await.unwrap().map(|r| r.exit_code),
        Some(137)
    );
}

#[tokio::test]
async fn test_output_truncated_at_limit() {
    let manager = shell_manager().await;
    let limits = ResourceLimits {
        max_output_size: 1_000,
        ..Default::default()
    };
    let result = manager
        .execute(
            CodeExecutionRequest::new(Language::Shell, "yes | head -c 100000").with_limits(limits),
        )
        .await
        .unwrap();

    assert!(result.truncated);
    assert!(result.output.as_deref().unwrap_or_default().len() <= 1_000);
    assert!(result.warnings.iter().any(|w| w.contains("truncated")));
}

#[tokio::test]
async fn test_sanitized_output() {
    let manager = shell_manager().await;
    let result = manager
        .execute(CodeExecutionRequest::new(Language::Shell, "printf '<b>hi</b>\\n'"))
        .await
        .unwrap();
    assert_eq!(result.output.as_deref(), Some("<b>hi</b>\n"));
    assert_eq!(result.sanitized_output, "&lt;b&gt;hi&lt;/b&gt;\n");
}

#[tokio::test]
async fn test_result_json_shape() {
    let manager = shell_manager().await;
    let result = manager
        .execute(CodeExecutionRequest::new(Language::Shell, "echo hi"))
        .await
        .unwrap();
    let json = serde_json::to_value(&result).unwrap();
    for key in [
        "success",
        "output",
        "error",
        "sanitizedOutput",
        "exitCode",
        "executionTime",
        "memoryUsage",
        "warnings",
        "validationResult",
    ] {
        assert!(json.get(key).is_some(), "missing {}", key);
    }
    assert_eq!(json["validationResult"]["riskLevel"], "safe");
}
