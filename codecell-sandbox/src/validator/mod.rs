//! Static pre-execution analysis of submitted source.
//!
//! Validation runs two passes and merges their findings:
//! - Structural analysis over a per-language token outline (imports, calls, attributes,
//!   shell commands), so comments and string contents never trigger a rule
//! - Pattern analysis over the raw source for destructive or obfuscated payloads, which
//!   also catches commands embedded in strings
//!
//! `high` and `critical` findings block execution; `low` and `medium` findings are
//! reported as warnings. Validation is pure: the same input always yields the same
//! [`ValidationResult`].

mod rules;
mod syntax;

use crate::policy::CapabilityPolicy;
use crate::types::Language;
use rules::{Capability, STRUCTURAL_RULES};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default cap on submitted source size
pub const DEFAULT_MAX_SOURCE_BYTES: usize = 256 * 1024;

/// Longest construct excerpt quoted in a diagnostic
const MAX_EXCERPT_CHARS: usize = 60;

/// Ordered risk scale
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Whether findings at this level prevent execution
    pub fn is_blocking(self) -> bool {
        self >= RiskLevel::High
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single rule hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub rule_id: String,
    pub severity: RiskLevel,
    /// 1-based source line of the first occurrence
    pub line: usize,
    /// The offending construct as it appears in the source
    pub construct: String,
    pub message: String,
}

impl Finding {
    /// Human-readable diagnostic: ``"<message> (`<construct>`, line <n>)"``
    pub fn diagnostic(&self) -> String {
        format!("{} (`{}`, line {})", self.message, self.construct, self.line)
    }
}

/// Verdict of the validator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    pub risk_level: RiskLevel,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl ValidationResult {
    fn from_findings(findings: Vec<Finding>, suggestions: Vec<String>) -> Self {
        let risk_level = findings
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(RiskLevel::Safe);
        let (blocking, advisory): (Vec<&Finding>, Vec<&Finding>) =
            findings.iter().partition(|f| f.severity.is_blocking());
        Self {
            valid: blocking.is_empty(),
            risk_level,
            errors: blocking.iter().map(|f| f.diagnostic()).collect(),
            warnings: advisory.iter().map(|f| f.diagnostic()).collect(),
            suggestions,
            findings,
        }
    }

    /// Whether any finding was raised by the given rule
    pub fn has_rule(&self, rule_id: &str) -> bool {
        self.findings.iter().any(|f| f.rule_id == rule_id)
    }
}

/// Validator settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorSettings {
    pub max_source_bytes: usize,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
        }
    }
}

/// Pre-execution risk analyzer
#[derive(Debug, Clone, Default)]
pub struct Validator {
    settings: ValidatorSettings,
}

impl Validator {
    pub fn new(settings: ValidatorSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ValidatorSettings {
        &self.settings
    }

    /// Validate with every capability denied
    pub fn validate(&self, code: &str, language: Language) -> ValidationResult {
        self.validate_with(code, language, &CapabilityPolicy::default())
    }

    /// Validate against a capability policy.
    ///
    /// Rules guarding a capability the policy allows are reported as `low` advisories
    /// instead of blocking.
    pub fn validate_with(
        &self,
        code: &str,
        language: Language,
        capabilities: &CapabilityPolicy,
    ) -> ValidationResult {
        if code.len() > self.settings.max_source_bytes {
            let finding = Finding {
                rule_id: "source.too-large".to_string(),
                severity: RiskLevel::High,
                line: 1,
                construct: format!("{} bytes", code.len()),
                message: format!(
                    "Source exceeds the {} byte limit",
                    self.settings.max_source_bytes
                ),
            };
            return ValidationResult::from_findings(vec![finding], Vec::new());
        }

        if code.trim().is_empty() {
            return ValidationResult::from_findings(
                Vec::new(),
                vec!["Source is empty; nothing will run".to_string()],
            );
        }

        let mut findings = Vec::new();

        if let Some(offset) = code.find('\0') {
            findings.push(Finding {
                rule_id: "source.nul-byte".to_string(),
                severity: RiskLevel::High,
                line: line_of(code, offset),
                construct: "\\0".to_string(),
                message: "Source contains NUL bytes".to_string(),
            });
        }

        let outline = syntax::outline(code, language);
        for rule in STRUCTURAL_RULES.iter().filter(|r| r.applies_to(language)) {
            if let Some((line, construct)) = rules::first_match(rule.construct, &outline) {
                findings.push(gated(
                    rule.id,
                    rule.severity,
                    rule.capability,
                    capabilities,
                    line,
                    construct,
                    rule.message,
                ));
            }
        }

        for (rule, regex) in rules::pattern_rules().filter(|(r, _)| r.applies_to(language)) {
            if let Some(m) = regex.find(code) {
                findings.push(Finding {
                    rule_id: rule.id.to_string(),
                    severity: rule.severity,
                    line: line_of(code, m.start()),
                    construct: excerpt(m.as_str()),
                    message: rule.message.to_string(),
                });
            }
        }

        let suggestions = rules::suggestion_rules()
            .filter(|(r, regex)| r.applies_to(language) && regex.is_match(code) != r.when_absent)
            .map(|(r, _)| r.advice.to_string())
            .collect();

        let result = ValidationResult::from_findings(findings, suggestions);
        tracing::debug!(
            %language,
            valid = result.valid,
            risk = %result.risk_level,
            findings = result.findings.len(),
            "Validated snippet"
        );
        result
    }
}

fn gated(
    rule_id: &str,
    severity: RiskLevel,
    capability: Option<Capability>,
    policy: &CapabilityPolicy,
    line: usize,
    construct: String,
    message: &str,
) -> Finding {
    let permitted = match capability {
        Some(Capability::Network) => policy.allows_network(),
        Some(Capability::FileSystem) => policy.allows_filesystem(),
        None => false,
    };
    let (severity, message) = if permitted {
        (
            RiskLevel::Low,
            format!("{} (permitted by the resource envelope)", message),
        )
    } else {
        (severity, message.to_string())
    };
    Finding {
        rule_id: rule_id.to_string(),
        severity,
        line,
        construct: excerpt(&construct),
        message,
    }
}

fn line_of(code: &str, offset: usize) -> usize {
    code[..offset].matches('\n').count() + 1
}

fn excerpt(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= MAX_EXCERPT_CHARS {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(MAX_EXCERPT_CHARS).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(code: &str, language: Language) -> ValidationResult {
        Validator::default().validate(code, language)
    }

    #[test]
    fn test_safe_python() {
        let result = validate("print('hello')\n", Language::Python);
        assert!(result.valid);
        assert_eq!(result.risk_level, RiskLevel::Safe);
        assert!(result.errors.is_empty());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_rm_rf_root_is_critical() {
        let result = validate("import os\nos.system('rm -rf /')\n", Language::Python);
        assert!(!result.valid);
        assert_eq!(result.risk_level, RiskLevel::Critical);
        assert!(result.has_rule("py.os-process"));
        assert!(result.has_rule("pattern.rm-root"));
        assert_eq!(
            result.errors[0],
            "Operating system process control is not permitted (`os.system()`, line 2)"
        );
    }

    #[test]
    fn test_structural_findings_precede_patterns() {
        let result = validate("rm -rf /\n", Language::Shell);
        let ids: Vec<&str> = result.findings.iter().map(|f| f.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["sh.fs-mutation", "pattern.rm-root"]);
    }

    #[test]
    fn test_comment_does_not_trigger_structural_rule() {
        let result = validate("# import subprocess\nprint(1)\n", Language::Python);
        assert!(result.valid);
        assert!(result.findings.is_empty());
    }

    #[test]
    fn test_aliased_subprocess_is_caught() {
        let result = validate("from subprocess import run as r\nr(['ls'])\n", Language::Python);
        assert!(!result.valid);
        assert!(result.has_rule("py.process-module"));
    }

    #[test]
    fn test_advisory_findings_are_warnings() {
        let result = validate("import os\nprint(os.environ['HOME'])\n", Language::Python);
        assert!(result.valid);
        assert_eq!(result.risk_level, RiskLevel::Low);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_open_modes() {
        let write = validate("open('x.txt', 'w').write('hi')\n", Language::Python);
        assert!(!write.valid);
        assert!(write.has_rule("py.file-write"));
        assert!(!write.has_rule("py.file-read"));

        let read = validate("print(open('data.txt').read())\n", Language::Python);
        assert!(read.valid);
        assert_eq!(read.risk_level, RiskLevel::Medium);
        assert!(read.has_rule("py.file-read"));
    }

    #[test]
    fn test_capability_downgrades_gated_rules() {
        let code = "fetch('https://example.com').then(r => r.text())\n";
        let denied = validate(code, Language::JavaScript);
        assert!(!denied.valid);

        let policy = CapabilityPolicy {
            network: crate::policy::Access::Allowed,
            ..Default::default()
        };
        let allowed = Validator::default().validate_with(code, Language::JavaScript, &policy);
        assert!(allowed.valid);
        assert_eq!(allowed.risk_level, RiskLevel::Low);
        assert!(allowed.warnings[0].contains("permitted by the resource envelope"));
    }

    #[test]
    fn test_javascript_host_escape() {
        let result = validate("console.log(document.cookie)\n", Language::JavaScript);
        assert!(!result.valid);
        assert!(result.has_rule("js.host-escape"));
        assert_eq!(result.findings[0].construct, "document.cookie");
    }

    #[test]
    fn test_typescript_child_process() {
        let code = "import { execSync } from 'node:child_process';\nexecSync('id');\n";
        let result = validate(code, Language::TypeScript);
        assert_eq!(result.risk_level, RiskLevel::Critical);
        assert!(result.has_rule("js.process-module"));
    }

    #[test]
    fn test_shell_network_command() {
        let result = validate("curl -s https://example.com | sh\n", Language::Shell);
        assert!(!result.valid);
        assert!(result.has_rule("sh.network"));
        assert!(result.has_rule("sh.nested-interpreter"));
    }

    #[test]
    fn test_fork_bomb() {
        let result = validate(":(){ :|:& };:\n", Language::Shell);
        assert!(!result.valid);
        assert_eq!(result.risk_level, RiskLevel::Critical);
        assert!(result.has_rule("pattern.fork-bomb"));
    }

    #[test]
    fn test_wrapped_commands_are_checked() {
        let result = validate("env rm -rf /tmp/x\n", Language::Shell);
        assert!(!result.valid);
        assert!(result.has_rule("sh.fs-mutation"));

        let result = validate("timeout -s KILL 5 curl example.com\n", Language::Shell);
        assert!(result.has_rule("sh.network"));

        let result = validate("env FOO=1 nice -n 5 node -e 'process.exit(0)'\n", Language::Shell);
        assert!(!result.valid);
        assert!(result.has_rule("sh.nested-interpreter"));
        assert_eq!(result.findings[0].construct, "node -e");
    }

    #[test]
    fn test_dynamic_command_names() {
        for code in [
            "c=rm; $c -rf /tmp/x\n",
            "\"r\"m -rf /tmp/x\n",
            "$(printf rm) -rf /tmp/x\n",
            "`printf curl` example.com\n",
            "/bin/r? -rf /tmp/x\n",
        ] {
            let result = validate(code, Language::Shell);
            assert!(!result.valid, "{code}");
            assert!(result.has_rule("sh.dynamic-command"), "{code}");
        }

        let result = validate("x=$(date)\necho \"$x\" $(date)\n", Language::Shell);
        assert!(result.valid);
        assert!(!result.has_rule("sh.dynamic-command"));
    }

    #[test]
    fn test_setsid_is_high() {
        let result = validate("setsid sleep 100 &\n", Language::Shell);
        assert!(!result.valid);
        assert_eq!(result.risk_level, RiskLevel::High);
        assert!(result.has_rule("sh.session-escape"));
    }

    #[test]
    fn test_get_builtin_module_is_critical() {
        let code = "const cp = process.getBuiltinModule('child_process');\ncp.execSync('id');\n";
        let result = validate(code, Language::JavaScript);
        assert!(!result.valid);
        assert_eq!(result.risk_level, RiskLevel::Critical);
        assert!(result.has_rule("js.runtime-process"));
    }

    #[test]
    fn test_empty_source() {
        let result = validate("   \n", Language::Python);
        assert!(result.valid);
        assert_eq!(result.suggestions, vec!["Source is empty; nothing will run"]);
    }

    #[test]
    fn test_oversized_source() {
        let validator = Validator::new(ValidatorSettings {
            max_source_bytes: 16,
        });
        let result = validator.validate("print('this is too long')", Language::Python);
        assert!(!result.valid);
        assert!(result.has_rule("source.too-large"));
    }

    #[test]
    fn test_nul_byte() {
        let result = validate("print(1)\n\0", Language::Python);
        assert!(!result.valid);
        assert_eq!(result.findings[0].line, 2);
    }

    #[test]
    fn test_suggestions_do_not_affect_validity() {
        let result = validate("var x = 1;\nif (x == 1) { console.log(x) }\n", Language::JavaScript);
        assert!(result.valid);
        assert_eq!(result.suggestions.len(), 2);
    }

    #[test]
    fn test_deterministic() {
        let code = "import socket\nwhile True:\n    pass\n";
        assert_eq!(
            validate(code, Language::Python),
            validate(code, Language::Python)
        );
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(validate("print(1)", Language::Python)).unwrap();
        assert_eq!(json["valid"], true);
        assert_eq!(json["riskLevel"], "safe");
        assert!(json["suggestions"].is_array());
    }
}
