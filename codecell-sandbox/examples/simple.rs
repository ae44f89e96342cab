//! Simple sandbox example - validate and run a few snippets

use codecell_sandbox::{
    CodeExecutionRequest, ExecutionResult, Language, ResourceLimits, SandboxConfig, SandboxManager,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let manager = SandboxManager::from_config(SandboxConfig::default()).await;

    println!("=== Sandbox Example ===\n");
    for (language, readiness) in manager.registry().snapshot() {
        println!("  {:<12} {}", language, readiness);
    }

    // Example 1: Simple command
    println!("\nExample 1: Simple echo");
    let request = CodeExecutionRequest::new(Language::Shell, "echo 'Hello from sandbox!'");
    execute_and_print(&manager, request).await?;

    // Example 2: Reading inputs
    println!("\nExample 2: Python with inputs");
    let request = CodeExecutionRequest::new(
        Language::Python,
        "name = input()\nprint(f'Hello, {name}!')",
    )
    .with_input("codecell");
    execute_and_print(&manager, request).await?;

    // Example 3: Rejected before it runs
    println!("\nExample 3: Destructive command");
    let request = CodeExecutionRequest::new(Language::Shell, "rm -rf /");
    execute_and_print(&manager, request).await?;

    // Example 4: With timeout
    println!("\nExample 4: Long running task with timeout");
    let limits = ResourceLimits {
        max_execution_time_ms: 1_000,
        ..Default::default()
    };
    let request = CodeExecutionRequest::new(Language::Shell, "sleep 10 && echo 'Done!'")
        .with_limits(limits);
    execute_and_print(&manager, request).await?;

    // Example 5: Error output
    println!("\nExample 5: Error to stderr");
    let request = CodeExecutionRequest::new(Language::Shell, "echo 'Error message' >&2; exit 1");
    execute_and_print(&manager, request).await?;

    manager.shutdown().await;
    Ok(())
}

async fn execute_and_print(
    manager: &SandboxManager,
    request: CodeExecutionRequest,
) -> anyhow::Result<()> {
    let result = manager.execute(request).await?;
    print_result(&result);
    Ok(())
}

fn print_result(result: &ExecutionResult) {
    if let Some(output) = &result.output {
        for line in output.lines() {
            println!("  stdout: {}", line);
        }
    }
    println!(
        "  Result: status={} exit_code={} duration={}ms risk={:?}",
        result.status,
        result.exit_code,
        result.execution_time_ms,
        result.validation_result.risk_level
    );
    if let Some(error) = &result.error {
        println!("  Error: {}", error);
    }
    for warning in &result.warnings {
        println!("  Warning: {}", warning);
    }
}
