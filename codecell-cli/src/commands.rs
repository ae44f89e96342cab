//! CLI command implementations

use crate::{CapabilityArgs, LimitArgs};
use anyhow::{Context, Result};
use codecell_sandbox::{
    CapabilityPolicy, CodeExecutionRequest, EngineReadiness, ExecutionResult, Language,
    SandboxConfig, SandboxManager, Validator, ValidatorSettings,
};
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};

/// Exit code when validation rejects a snippet
const INVALID_EXIT_CODE: i32 = 1;

pub fn load_config(path: Option<&Path>) -> Result<SandboxConfig> {
    let config = SandboxConfig::load(path).with_context(|| match path {
        Some(path) => format!("Failed to load config from {}", path.display()),
        None => "Failed to load config".to_string(),
    })?;
    debug!(?config, "Effective configuration");
    Ok(config)
}

/// Read a snippet from a file, or from stdin when the path is `-`
pub fn read_source(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .context("Failed to read source from stdin")?;
        Ok(source)
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read source file {}", path.display()))
    }
}

/// Validate and execute a snippet; Ctrl-C triggers the emergency stop
pub async fn execute_run(
    config: SandboxConfig,
    file: &Path,
    language: Language,
    inputs: Vec<String>,
    limit_args: &LimitArgs,
    json: bool,
) -> Result<i32> {
    let code = read_source(file)?;
    let limits = limit_args.apply(&config.limits);
    limits.validate().context("Invalid resource limits")?;

    let manager = SandboxManager::from_config(config).await;
    let mut request = CodeExecutionRequest::new(language, code).with_limits(limits);
    request.inputs = inputs;

    let handle = manager.submit(request).await?;
    let id = handle.environment_id();
    info!(environment_id = %id, %language, "Submitted snippet");

    let wait = handle.wait();
    tokio::pin!(wait);
    let result = tokio::select! {
        result = &mut wait => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!(environment_id = %id, "Interrupted; terminating execution");
            manager.terminate(id).await?;
            wait.await?
        }
    };
    manager.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(result.exit_code)
}

fn print_result(result: &ExecutionResult) {
    if let Some(output) = &result.output {
        print!("{}", output);
        if !output.is_empty() && !output.ends_with('\n') {
            println!();
        }
    }

    eprintln!(
        "--- {} (exit {}, {} ms, {:.1} MB, risk {}) ---",
        result.status,
        result.exit_code,
        result.execution_time_ms,
        result.memory_usage_mb,
        result.validation_result.risk_level
    );
    if let Some(error) = &result.error {
        eprintln!("✗ {}", error);
    }
    for warning in &result.warnings {
        eprintln!("! {}", warning);
    }
    for suggestion in &result.validation_result.suggestions {
        eprintln!("  hint: {}", suggestion);
    }
}

/// Print the validation verdict as JSON
pub fn execute_validate(
    config: &SandboxConfig,
    file: &Path,
    language: Language,
    capabilities: CapabilityArgs,
) -> Result<i32> {
    let code = read_source(file)?;
    let limits = capabilities.apply(&config.limits);
    let validator = Validator::new(ValidatorSettings::from(&config.validator));
    let result = validator.validate_with(&code, language, &CapabilityPolicy::from_limits(&limits));

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(if result.valid { 0 } else { INVALID_EXIT_CODE })
}

/// Print the readiness of every registered engine
pub async fn execute_engines(config: SandboxConfig) -> Result<i32> {
    let manager = SandboxManager::from_config(config).await;
    let snapshot = manager.registry().snapshot();
    for (language, readiness) in &snapshot {
        let marker = if *readiness == EngineReadiness::Ready { "✓" } else { "✗" };
        println!("{} {:<12} {}", marker, language.as_str(), readiness);
    }
    manager.shutdown().await;
    Ok(0)
}

pub fn execute_csp(config: &SandboxConfig, capabilities: CapabilityArgs) -> Result<i32> {
    let limits = capabilities.apply(&config.limits);
    println!("{}", CapabilityPolicy::from_limits(&limits).to_csp());
    Ok(0)
}

pub fn execute_config(config: &SandboxConfig) -> Result<i32> {
    print!("{}", config.to_toml_string()?);
    Ok(0)
}
