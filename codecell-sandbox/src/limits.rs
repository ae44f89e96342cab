//! Resource limits configuration for sandboxed execution

use crate::error::SandboxError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Resource envelope for one execution
///
/// Field names follow the request wire format (`maxMemoryMB`, ...) and also accept
/// snake_case so the same struct can be written in TOML configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum resident memory in megabytes
    #[serde(rename = "maxMemoryMB", alias = "max_memory_mb")]
    pub max_memory_mb: u64,

    /// Maximum wall-clock time before the engine kills the execution
    #[serde(rename = "maxExecutionTimeMs", alias = "max_execution_time_ms")]
    pub max_execution_time_ms: u64,

    /// CPU time budget used for monitor alerts
    #[serde(rename = "maxCpuTimeMs", alias = "max_cpu_time_ms")]
    pub max_cpu_time_ms: u64,

    /// Maximum captured output in bytes
    #[serde(rename = "maxOutputSize", alias = "max_output_size")]
    pub max_output_size: usize,

    /// Allow the snippet to open network connections
    #[serde(rename = "enableNetworkAccess", alias = "enable_network_access")]
    pub enable_network_access: bool,

    /// Allow the snippet to write to the filesystem
    #[serde(rename = "enableFileSystemAccess", alias = "enable_file_system_access")]
    pub enable_file_system_access: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 32,
            max_execution_time_ms: 10_000,
            max_cpu_time_ms: 5_000,
            max_output_size: 10 * 1024 * 1024,
            enable_network_access: false,
            enable_file_system_access: false,
        }
    }
}

impl ResourceLimits {
    /// Create strict limits for anonymous snippets
    pub fn strict() -> Self {
        Self {
            max_memory_mb: 16,
            max_execution_time_ms: 2_000,
            max_cpu_time_ms: 1_000,
            max_output_size: 64 * 1024,
            ..Self::default()
        }
    }

    /// Create permissive limits for trusted exercises
    pub fn permissive() -> Self {
        Self {
            max_memory_mb: 256,
            max_execution_time_ms: 60_000,
            max_cpu_time_ms: 30_000,
            max_output_size: 50 * 1024 * 1024,
            ..Self::default()
        }
    }

    /// Memory limit in bytes
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb.saturating_mul(MIB)
    }

    /// Wall-clock deadline
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.max_execution_time_ms)
    }

    /// Reject envelopes that could never run anything
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.max_memory_mb == 0 {
            return Err(SandboxError::InvalidLimits(
                "maxMemoryMB must be greater than zero".to_string(),
            ));
        }
        if self.max_execution_time_ms == 0 {
            return Err(SandboxError::InvalidLimits(
                "maxExecutionTimeMs must be greater than zero".to_string(),
            ));
        }
        if self.max_cpu_time_ms == 0 {
            return Err(SandboxError::InvalidLimits(
                "maxCpuTimeMs must be greater than zero".to_string(),
            ));
        }
        if self.max_output_size == 0 {
            return Err(SandboxError::InvalidLimits(
                "maxOutputSize must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.max_memory_mb, 32);
        assert_eq!(limits.max_execution_time_ms, 10_000);
        assert_eq!(limits.max_cpu_time_ms, 5_000);
        assert_eq!(limits.max_output_size, 10 * 1024 * 1024);
        assert!(!limits.enable_network_access);
        assert!(!limits.enable_file_system_access);
        assert_eq!(limits.max_memory_bytes(), 32 * 1024 * 1024);
    }

    #[test]
    fn test_strict_limits() {
        let limits = ResourceLimits::strict();
        assert_eq!(limits.deadline(), Duration::from_secs(2));
        assert!(limits.max_memory_mb < ResourceLimits::default().max_memory_mb);
    }

    #[test]
    fn test_validate_rejects_zero() {
        let limits = ResourceLimits {
            max_execution_time_ms: 0,
            ..Default::default()
        };
        assert!(limits.validate().is_err());
        assert!(ResourceLimits::default().validate().is_ok());
    }

    #[test]
    fn test_snake_case_alias() {
        let limits: ResourceLimits =
            toml::from_str("max_memory_mb = 8\nenable_network_access = true").unwrap();
        assert_eq!(limits.max_memory_mb, 8);
        assert!(limits.enable_network_access);
        assert_eq!(limits.max_execution_time_ms, 10_000);
    }
}
