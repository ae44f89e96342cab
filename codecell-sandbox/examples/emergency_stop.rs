//! Emergency stop example - terminate a running snippet and inspect what the monitor saw

use codecell_sandbox::{CodeExecutionRequest, Language, SandboxConfig, SandboxManager};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let manager = SandboxManager::from_config(SandboxConfig::default()).await;

    let handle = manager
        .submit(CodeExecutionRequest::new(
            Language::Shell,
            "i=0; while [ $i -lt 1000000 ]; do i=$((i+1)); done; echo $i",
        ))
        .await?;
    let id = handle.environment_id();
    println!("Submitted to environment {}", id);

    tokio::time::sleep(Duration::from_millis(300)).await;
    println!("Status before stop: {}", manager.status(id).await?);
    let usage = manager.usage(id).await?;
    println!(
        "Usage: {:.1} MB, {} ms CPU, {:.0}% CPU",
        usage.memory_mb, usage.cpu_time_ms, usage.cpu_percent
    );

    manager.terminate(id).await?;
    println!("Status after stop: {}", manager.status(id).await?);

    let result = handle.wait().await?;
    println!(
        "Result: status={} exit_code={} error={}",
        result.status,
        result.exit_code,
        result.error.as_deref().unwrap_or("-")
    );
    for alert in manager.get_alerts(id).await? {
        println!("  [{:?}] {}", alert.severity, alert.message);
    }

    // The environment can be reused after a reset
    manager.reset(id).await?;
    let handle = manager
        .run(id, CodeExecutionRequest::new(Language::Shell, "echo again"))
        .await?;
    let result = handle.wait().await?;
    println!("Second run: {:?}", result.output);

    manager.shutdown().await;
    Ok(())
}
