//! Result assembly and output sanitization

use crate::environment::{EnvironmentId, EnvironmentStatus, TerminationReason};
use crate::monitor::{AlertSeverity, ResourceAlert, ResourceUsage};
use crate::runtime::{EngineOutput, KILLED_EXIT_CODE};
use crate::types::ExecutionResult;
use crate::validator::ValidationResult;
use regex::Regex;
use std::sync::LazyLock;

const MIB: f64 = 1024.0 * 1024.0;

/// CSI, OSC and two-byte escape sequences
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("valid ANSI escape regex")
});

/// Everything the pipeline learned about an execution that got past validation
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Final status decided by the manager
    pub status: EnvironmentStatus,
    /// Raw engine output; `None` when the engine failed to run
    pub output: Option<EngineOutput>,
    /// Infrastructure fault that stopped the engine
    pub engine_error: Option<String>,
    pub reason: Option<TerminationReason>,
    /// Final monitor sample
    pub usage: ResourceUsage,
    pub alerts: Vec<ResourceAlert>,
    /// Output cap the engine applied
    pub max_output_size: usize,
}

/// Merges validation and execution outcomes into one [`ExecutionResult`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultReporter;

impl ResultReporter {
    pub fn new() -> Self {
        Self
    }

    /// Build the terminal result. A rejected validation, or a missing outcome, always
    /// yields the rejection result; the engine never ran in that case.
    pub fn report(
        &self,
        environment_id: EnvironmentId,
        validation: ValidationResult,
        outcome: Option<ExecutionOutcome>,
    ) -> ExecutionResult {
        match outcome {
            Some(outcome) if validation.valid => self.merge(environment_id, validation, outcome),
            _ => self.rejected(environment_id, validation),
        }
    }

    /// Result for a request the validator refused
    pub fn rejected(
        &self,
        environment_id: EnvironmentId,
        validation: ValidationResult,
    ) -> ExecutionResult {
        let error = if validation.errors.is_empty() {
            "Validation failed".to_string()
        } else {
            validation.errors.join("; ")
        };
        ExecutionResult {
            environment_id,
            status: EnvironmentStatus::Failed,
            success: false,
            output: None,
            error: Some(error),
            sanitized_output: String::new(),
            exit_code: 1,
            execution_time_ms: 0,
            memory_usage_mb: 0.0,
            truncated: false,
            warnings: validation.warnings.clone(),
            alerts: Vec::new(),
            validation_result: validation,
        }
    }

    /// Result for an execution that could not start (no engine, registry shut down)
    pub fn infrastructure_failure(
        &self,
        environment_id: EnvironmentId,
        validation: ValidationResult,
        message: impl Into<String>,
    ) -> ExecutionResult {
        ExecutionResult {
            environment_id,
            status: EnvironmentStatus::Failed,
            success: false,
            output: None,
            error: Some(message.into()),
            sanitized_output: String::new(),
            exit_code: 1,
            execution_time_ms: 0,
            memory_usage_mb: 0.0,
            truncated: false,
            warnings: validation.warnings.clone(),
            alerts: Vec::new(),
            validation_result: validation,
        }
    }

    /// Result for a run that was cancelled before an engine was started
    pub fn cancelled_before_start(
        &self,
        environment_id: EnvironmentId,
        validation: ValidationResult,
        reason: &TerminationReason,
    ) -> ExecutionResult {
        ExecutionResult {
            environment_id,
            status: EnvironmentStatus::Terminated,
            success: false,
            output: None,
            error: Some(reason.to_string()),
            sanitized_output: String::new(),
            exit_code: reason.exit_code(),
            execution_time_ms: 0,
            memory_usage_mb: 0.0,
            truncated: false,
            warnings: validation.warnings.clone(),
            alerts: Vec::new(),
            validation_result: validation,
        }
    }

    fn merge(
        &self,
        environment_id: EnvironmentId,
        validation: ValidationResult,
        outcome: ExecutionOutcome,
    ) -> ExecutionResult {
        let ExecutionOutcome {
            status,
            output,
            engine_error,
            reason,
            usage,
            alerts,
            max_output_size,
        } = outcome;

        let mut warnings = validation.warnings.clone();
        let exit_code = match (&status, &reason, &output) {
            (EnvironmentStatus::Terminated, Some(reason), _) => reason.exit_code(),
            (EnvironmentStatus::Terminated, None, _) => KILLED_EXIT_CODE,
            (_, _, Some(output)) => output.exit_code,
            (_, _, None) => 1,
        };
        let success = status == EnvironmentStatus::Completed && exit_code == 0;

        if let Some(output) = &output {
            warnings.extend(output.warnings.iter().cloned());
            if output.truncated {
                warnings.push(format!("Output truncated to {} bytes", max_output_size));
            }
            if success && !output.stderr.trim().is_empty() {
                warnings.push(format!(
                    "Program wrote to stderr: {}",
                    first_line(&output.stderr)
                ));
            }
        }
        for alert in &alerts {
            warnings.push(format!("{} alert: {}", severity_label(alert.severity), alert.message));
        }
        if let Some(reason) = &reason {
            warnings.push(format!("Execution {}", reason));
        }

        let error = match status {
            EnvironmentStatus::Completed => None,
            EnvironmentStatus::Terminated => {
                Some(termination_error(reason.as_ref(), output.as_ref()))
            }
            _ => Some(match (&engine_error, &output) {
                (Some(message), _) => message.clone(),
                (None, Some(output)) if !output.stderr.trim().is_empty() => {
                    output.stderr.trim_end().to_string()
                }
                (None, _) => format!("Process exited with code {}", exit_code),
            }),
        };

        let peak_mb = output
            .as_ref()
            .map_or(0.0, |o| o.peak_memory_bytes as f64 / MIB);
        let memory_usage_mb = if usage.memory_mb > 0.0 {
            usage.memory_mb
        } else {
            peak_mb
        };
        // Like memory: the monitor's final sample, or the engine's clock when never sampled
        let execution_time_ms = if usage.execution_time_ms > 0 {
            usage.execution_time_ms
        } else {
            output.as_ref().map_or(0, |o| o.duration_ms)
        };

        let stdout = output.as_ref().map(|o| o.stdout.clone());
        ExecutionResult {
            environment_id,
            status,
            success,
            sanitized_output: stdout.as_deref().map(sanitize).unwrap_or_default(),
            output: stdout,
            error,
            exit_code,
            execution_time_ms,
            memory_usage_mb,
            truncated: output.as_ref().is_some_and(|o| o.truncated),
            warnings,
            alerts,
            validation_result: validation,
        }
    }
}

fn termination_error(reason: Option<&TerminationReason>, output: Option<&EngineOutput>) -> String {
    let base = match reason {
        Some(reason) => reason.to_string(),
        None if output.is_some_and(|o| o.timed_out) => TerminationReason::Timeout.to_string(),
        None => "terminated".to_string(),
    };
    match output.map(|o| o.stderr.trim()).filter(|s| !s.is_empty()) {
        Some(stderr) => format!("{}: {}", base, first_line(stderr)),
        None => base,
    }
}

fn severity_label(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Warning => "Warning",
        AlertSeverity::Error => "Error",
        AlertSeverity::Critical => "Critical",
    }
}

fn first_line(text: &str) -> &str {
    text.trim().lines().next().unwrap_or_default()
}

/// Make output safe to embed in a markup context.
///
/// Strips ANSI escape sequences and control characters (newlines and tabs are kept) and
/// entity-escapes `& < > " ' \``.
pub fn sanitize(text: &str) -> String {
    let stripped = ANSI_ESCAPE.replace_all(text, "");
    let mut out = String::with_capacity(stripped.len());
    for ch in stripped.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '`' => out.push_str("&#96;"),
            '\n' | '\t' => out.push(ch),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}
