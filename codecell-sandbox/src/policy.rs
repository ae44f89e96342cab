//! Capability policy composed from a resource envelope

use crate::limits::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Access granted for one capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Denied,
    Allowed,
}

impl Access {
    fn from_flag(enabled: bool) -> Self {
        if enabled {
            Access::Allowed
        } else {
            Access::Denied
        }
    }

    pub fn is_allowed(self) -> bool {
        self == Access::Allowed
    }
}

/// Capabilities an execution may use
///
/// Everything is denied unless the envelope explicitly enables it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilityPolicy {
    pub network: Access,
    pub filesystem: Access,
}

impl Default for CapabilityPolicy {
    fn default() -> Self {
        Self {
            network: Access::Denied,
            filesystem: Access::Denied,
        }
    }
}

impl CapabilityPolicy {
    /// Derive the policy from a resource envelope
    pub fn from_limits(limits: &ResourceLimits) -> Self {
        Self {
            network: Access::from_flag(limits.enable_network_access),
            filesystem: Access::from_flag(limits.enable_file_system_access),
        }
    }

    pub fn allows_network(&self) -> bool {
        self.network.is_allowed()
    }

    pub fn allows_filesystem(&self) -> bool {
        self.filesystem.is_allowed()
    }

    /// Ordered CSP directives
    pub fn directives(&self) -> Vec<(&'static str, &'static str)> {
        let connect = if self.allows_network() {
            "'self'"
        } else {
            "'none'"
        };
        let filesystem = if self.allows_filesystem() {
            "'self'"
        } else {
            "'none'"
        };
        vec![
            ("default-src", "'none'"),
            ("script-src", "'unsafe-inline'"),
            ("style-src", "'unsafe-inline'"),
            ("connect-src", connect),
            ("form-action", "'none'"),
            ("worker-src", "'none'"),
            ("filesystem-src", filesystem),
        ]
    }

    /// Semicolon-joined policy string handed to engines
    pub fn to_csp(&self) -> String {
        self.directives()
            .iter()
            .map(|(name, value)| format!("{} {}", name, value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Environment variables exported to interpreter processes
    pub fn env_vars(&self) -> [(&'static str, String); 3] {
        [
            ("CODECELL_CSP", self.to_csp()),
            ("CODECELL_ALLOW_NET", flag(self.allows_network())),
            ("CODECELL_ALLOW_FS", flag(self.allows_filesystem())),
        ]
    }
}

fn flag(enabled: bool) -> String {
    if enabled { "1" } else { "0" }.to_string()
}

impl fmt::Display for CapabilityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_csp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_denies_everything() {
        let policy = CapabilityPolicy::from_limits(&ResourceLimits::default());
        assert_eq!(policy, CapabilityPolicy::default());
        assert_eq!(
            policy.to_csp(),
            "default-src 'none'; script-src 'unsafe-inline'; style-src 'unsafe-inline'; \
             connect-src 'none'; form-action 'none'; worker-src 'none'; filesystem-src 'none'"
        );
    }

    #[test]
    fn test_network_enables_connect_src() {
        let limits = ResourceLimits {
            enable_network_access: true,
            ..Default::default()
        };
        let policy = CapabilityPolicy::from_limits(&limits);
        assert!(policy.allows_network());
        assert!(!policy.allows_filesystem());
        assert!(policy.to_csp().contains("connect-src 'self'"));
        assert!(policy.to_csp().contains("filesystem-src 'none'"));
    }

    #[test]
    fn test_env_vars() {
        let limits = ResourceLimits {
            enable_file_system_access: true,
            ..Default::default()
        };
        let vars = CapabilityPolicy::from_limits(&limits).env_vars();
        assert_eq!(vars[1], ("CODECELL_ALLOW_NET", "0".to_string()));
        assert_eq!(vars[2], ("CODECELL_ALLOW_FS", "1".to_string()));
    }
}
