//! Core types for sandbox execution

use crate::environment::{EnvironmentId, EnvironmentStatus};
use crate::limits::ResourceLimits;
use crate::monitor::ResourceAlert;
use crate::validator::ValidationResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported snippet languages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Shell,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::Python,
        Language::JavaScript,
        Language::TypeScript,
        Language::Shell,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Shell => "shell",
        }
    }

    /// Source file extension used when the snippet is written to disk
    pub fn extension(self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::JavaScript => "js",
            Language::TypeScript => "ts",
            Language::Shell => "sh",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            "typescript" | "ts" | "deno" => Ok(Language::TypeScript),
            "shell" | "sh" | "bash" => Ok(Language::Shell),
            other => Err(format!("unsupported language '{}'", other)),
        }
    }
}

/// Request to execute a snippet
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeExecutionRequest {
    /// Language of the snippet
    pub language: Language,

    /// The code to execute
    pub code: String,

    /// Lines fed to the program's stdin, in order
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Resource envelope for this execution
    #[serde(default)]
    pub limits: ResourceLimits,
}

impl CodeExecutionRequest {
    /// Create a request with default limits and no inputs
    pub fn new(language: Language, code: impl Into<String>) -> Self {
        Self {
            language,
            code: code.into(),
            inputs: Vec::new(),
            limits: ResourceLimits::default(),
        }
    }

    /// Append a stdin line
    pub fn with_input(mut self, line: impl Into<String>) -> Self {
        self.inputs.push(line.into());
        self
    }

    /// Replace the resource envelope
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Terminal record of one execution request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Environment the request ran in
    pub environment_id: EnvironmentId,

    /// Final status of the environment for this execution
    pub status: EnvironmentStatus,

    /// True only for a completed execution with exit code 0
    pub success: bool,

    /// Raw stdout; absent when the engine never ran
    pub output: Option<String>,

    /// Error description for failed, rejected or terminated executions
    pub error: Option<String>,

    /// Output escaped for display contexts
    pub sanitized_output: String,

    /// Process exit code (0 = success)
    pub exit_code: i32,

    /// Wall-clock execution time in milliseconds
    #[serde(rename = "executionTime")]
    pub execution_time_ms: u64,

    /// Memory in MB from the last usage sample
    #[serde(rename = "memoryUsage")]
    pub memory_usage_mb: f64,

    /// Whether output was cut at `maxOutputSize`
    pub truncated: bool,

    /// Aggregated validation, engine and monitor warnings
    pub warnings: Vec<String>,

    /// Alerts raised by the monitor during this execution
    #[serde(default)]
    pub alerts: Vec<ResourceAlert>,

    /// Verdict of the pre-execution validator
    pub validation_result: ValidationResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_aliases() {
        assert_eq!("py".parse::<Language>(), Ok(Language::Python));
        assert_eq!("Node".parse::<Language>(), Ok(Language::JavaScript));
        assert_eq!("ts".parse::<Language>(), Ok(Language::TypeScript));
        assert_eq!("bash".parse::<Language>(), Ok(Language::Shell));
        assert!("cobol".parse::<Language>().is_err());
    }

    #[test]
    fn test_request_from_json() {
        let json = r#"{
            "language": "python",
            "code": "print('hi')",
            "inputs": ["a", "b"],
            "limits": { "maxMemoryMB": 64, "maxExecutionTimeMs": 2000 }
        }"#;
        let request: CodeExecutionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.language, Language::Python);
        assert_eq!(request.inputs, vec!["a", "b"]);
        assert_eq!(request.limits.max_memory_mb, 64);
        assert_eq!(request.limits.max_execution_time_ms, 2000);
        // Unspecified limits keep their defaults
        assert_eq!(request.limits.max_cpu_time_ms, 5000);
        assert!(!request.limits.enable_network_access);
    }
}
