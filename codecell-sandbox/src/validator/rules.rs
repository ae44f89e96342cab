//! Rule tables for the validator
//!
//! Rules are declarative and evaluated in table order, so the findings for a given source
//! are always reported in the same order.

use super::syntax::{Call, Outline};
use super::RiskLevel;
use crate::types::Language;
use regex::Regex;
use std::sync::LazyLock;

const PY: &[Language] = &[Language::Python];
const SCRIPT: &[Language] = &[Language::JavaScript, Language::TypeScript];
const TS: &[Language] = &[Language::TypeScript];
const SH: &[Language] = &[Language::Shell];
const ANY: &[Language] = &[];

/// Capability that, when enabled by the envelope, downgrades a rule to an advisory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Capability {
    Network,
    FileSystem,
}

/// Construct a structural rule matches against the outline
#[derive(Debug, Clone, Copy)]
pub(crate) enum Construct {
    /// Imported module equal to, or nested under, one of these names
    Import(&'static [&'static str]),
    /// Call whose resolved callee matches; `*` suffix is a prefix match, `.` prefix a method
    Call(&'static [&'static str]),
    /// `open`-style call whose mode argument writes (`w`, `a`, `x`, `+` or non-literal)
    OpenForWrite(&'static [&'static str]),
    /// `open`-style call that only reads
    OpenForRead(&'static [&'static str]),
    /// Call whose first argument is a string literal
    CallWithSource(&'static [&'static str]),
    /// Dotted segments appearing anywhere in an attribute chain or callee path
    Attribute(&'static [&'static str]),
    /// Shell command name
    Command(&'static [&'static str]),
    /// Shell command whose name is computed by expansion
    DynamicCommand,
}

pub(crate) struct StructuralRule {
    pub id: &'static str,
    pub languages: &'static [Language],
    pub construct: Construct,
    pub severity: RiskLevel,
    pub capability: Option<Capability>,
    pub message: &'static str,
}

pub(crate) struct PatternRule {
    pub id: &'static str,
    pub languages: &'static [Language],
    pub pattern: &'static str,
    pub severity: RiskLevel,
    pub message: &'static str,
}

pub(crate) struct SuggestionRule {
    pub languages: &'static [Language],
    pub pattern: &'static str,
    /// Suggest when the pattern is absent instead of present
    pub when_absent: bool,
    pub advice: &'static str,
}

fn applies(languages: &[Language], language: Language) -> bool {
    languages.is_empty() || languages.contains(&language)
}

impl StructuralRule {
    pub fn applies_to(&self, language: Language) -> bool {
        applies(self.languages, language)
    }
}

impl PatternRule {
    pub fn applies_to(&self, language: Language) -> bool {
        applies(self.languages, language)
    }
}

impl SuggestionRule {
    pub fn applies_to(&self, language: Language) -> bool {
        applies(self.languages, language)
    }
}

pub(crate) static STRUCTURAL_RULES: &[StructuralRule] = &[
    // Python
    StructuralRule {
        id: "py.dynamic-eval",
        languages: PY,
        construct: Construct::Call(&[
            "eval",
            "exec",
            "compile",
            "__import__",
            "builtins.eval",
            "builtins.exec",
            "importlib.import_module",
        ]),
        severity: RiskLevel::High,
        capability: None,
        message: "Dynamic code evaluation is not permitted",
    },
    StructuralRule {
        id: "py.process-module",
        languages: PY,
        construct: Construct::Import(&["subprocess", "pty", "multiprocessing", "pexpect"]),
        severity: RiskLevel::Critical,
        capability: None,
        message: "Process spawning modules are not permitted",
    },
    StructuralRule {
        id: "py.os-process",
        languages: PY,
        construct: Construct::Call(&[
            "os.system",
            "os.popen",
            "os.exec*",
            "os.spawn*",
            "os.posix_spawn*",
            "os.fork",
            "os.forkpty",
            "os.kill",
            "os.killpg",
        ]),
        severity: RiskLevel::Critical,
        capability: None,
        message: "Operating system process control is not permitted",
    },
    StructuralRule {
        id: "py.native-ffi",
        languages: PY,
        construct: Construct::Import(&["ctypes", "_ctypes", "cffi"]),
        severity: RiskLevel::Critical,
        capability: None,
        message: "Loading native code is not permitted",
    },
    StructuralRule {
        id: "py.reflection-escape",
        languages: PY,
        construct: Construct::Attribute(&[
            "__subclasses__",
            "__globals__",
            "__builtins__",
            "__code__",
            "__mro__",
            "__bases__",
            "__loader__",
            "f_globals",
            "f_back",
            "gi_frame",
        ]),
        severity: RiskLevel::High,
        capability: None,
        message: "Interpreter internals that can escape the sandbox are not accessible",
    },
    StructuralRule {
        id: "py.frame-introspection",
        languages: PY,
        construct: Construct::Call(&[
            "sys._getframe",
            "inspect.currentframe",
            "inspect.stack",
            "gc.get_objects",
            "gc.get_referrers",
        ]),
        severity: RiskLevel::High,
        capability: None,
        message: "Frame and heap introspection is not permitted",
    },
    StructuralRule {
        id: "py.network",
        languages: PY,
        construct: Construct::Import(&[
            "socket",
            "ssl",
            "urllib.request",
            "urllib3",
            "http.client",
            "http.server",
            "requests",
            "httpx",
            "aiohttp",
            "ftplib",
            "smtplib",
            "telnetlib",
            "xmlrpc",
        ]),
        severity: RiskLevel::High,
        capability: Some(Capability::Network),
        message: "Network access is disabled",
    },
    StructuralRule {
        id: "py.file-write",
        languages: PY,
        construct: Construct::OpenForWrite(&["open", "io.open", "builtins.open"]),
        severity: RiskLevel::High,
        capability: Some(Capability::FileSystem),
        message: "Filesystem writes are disabled",
    },
    StructuralRule {
        id: "py.fs-mutation",
        languages: PY,
        construct: Construct::Call(&[
            "os.remove",
            "os.unlink",
            "os.rmdir",
            "os.removedirs",
            "os.mkdir",
            "os.makedirs",
            "os.rename",
            "os.replace",
            "os.chmod",
            "os.chown",
            "os.link",
            "os.symlink",
            "os.truncate",
            "os.open",
            "shutil.*",
            ".write_text",
            ".write_bytes",
            ".unlink",
            ".rmdir",
            ".mkdir",
            ".touch",
        ]),
        severity: RiskLevel::High,
        capability: Some(Capability::FileSystem),
        message: "Filesystem modification is disabled",
    },
    StructuralRule {
        id: "py.file-read",
        languages: PY,
        construct: Construct::OpenForRead(&["open", "io.open", "builtins.open"]),
        severity: RiskLevel::Medium,
        capability: Some(Capability::FileSystem),
        message: "Filesystem access is disabled; reads outside the working directory will fail",
    },
    StructuralRule {
        id: "py.env-access",
        languages: PY,
        construct: Construct::Attribute(&["os.environ", "os.getenv"]),
        severity: RiskLevel::Low,
        capability: None,
        message: "Environment variables are scrubbed inside the sandbox",
    },
    // JavaScript / TypeScript
    StructuralRule {
        id: "js.dynamic-eval",
        languages: SCRIPT,
        construct: Construct::Call(&[
            "eval",
            "Function",
            "globalThis.eval",
            "window.eval",
            "vm.*",
        ]),
        severity: RiskLevel::High,
        capability: None,
        message: "Dynamic code evaluation is not permitted",
    },
    StructuralRule {
        id: "js.string-timer",
        languages: SCRIPT,
        construct: Construct::CallWithSource(&["setTimeout", "setInterval"]),
        severity: RiskLevel::High,
        capability: None,
        message: "String-based timers evaluate code dynamically",
    },
    StructuralRule {
        id: "js.process-module",
        languages: SCRIPT,
        construct: Construct::Import(&[
            "child_process",
            "worker_threads",
            "cluster",
            "vm",
            "inspector",
            "v8",
            "module",
        ]),
        severity: RiskLevel::Critical,
        capability: None,
        message: "Process and runtime control modules are not permitted",
    },
    StructuralRule {
        id: "js.runtime-process",
        languages: SCRIPT,
        construct: Construct::Call(&[
            "process.binding",
            "process.getBuiltinModule",
            "process.dlopen",
            "process.kill",
            "Deno.run",
            "Deno.Command",
            "Deno.kill",
            "Bun.spawn",
            "Bun.spawnSync",
        ]),
        severity: RiskLevel::Critical,
        capability: None,
        message: "Spawning processes from the runtime is not permitted",
    },
    StructuralRule {
        id: "js.fs-module",
        languages: SCRIPT,
        construct: Construct::Import(&["fs", "fs/promises", "fs-extra", "graceful-fs"]),
        severity: RiskLevel::High,
        capability: Some(Capability::FileSystem),
        message: "Filesystem module access is disabled",
    },
    StructuralRule {
        id: "js.deno-fs",
        languages: SCRIPT,
        construct: Construct::Call(&[
            "Deno.writeFile",
            "Deno.writeTextFile",
            "Deno.remove",
            "Deno.mkdir",
            "Deno.rename",
            "Deno.create",
            "Deno.open",
            "Deno.truncate",
            "Deno.symlink",
            "Deno.chmod",
        ]),
        severity: RiskLevel::High,
        capability: Some(Capability::FileSystem),
        message: "Filesystem modification is disabled",
    },
    StructuralRule {
        id: "js.network-module",
        languages: SCRIPT,
        construct: Construct::Import(&[
            "http",
            "https",
            "http2",
            "net",
            "tls",
            "dgram",
            "dns",
            "undici",
            "axios",
            "node-fetch",
            "ws",
        ]),
        severity: RiskLevel::High,
        capability: Some(Capability::Network),
        message: "Network access is disabled",
    },
    StructuralRule {
        id: "js.network-api",
        languages: SCRIPT,
        construct: Construct::Call(&[
            "fetch",
            "globalThis.fetch",
            "window.fetch",
            "XMLHttpRequest",
            "WebSocket",
            "EventSource",
            "navigator.sendBeacon",
            "Deno.connect",
            "Deno.connectTls",
            "Deno.listen",
        ]),
        severity: RiskLevel::High,
        capability: Some(Capability::Network),
        message: "Network access is disabled",
    },
    StructuralRule {
        id: "js.host-escape",
        languages: SCRIPT,
        construct: Construct::Attribute(&[
            "window.parent",
            "window.top",
            "window.opener",
            "parent.document",
            "top.document",
            "document.cookie",
            "document.domain",
            "localStorage",
            "sessionStorage",
            "indexedDB",
            "constructor.constructor",
            "process.mainModule",
            "require.cache",
        ]),
        severity: RiskLevel::High,
        capability: None,
        message: "Access to the host page or runtime internals is not permitted",
    },
    StructuralRule {
        id: "js.dom-write",
        languages: SCRIPT,
        construct: Construct::Attribute(&[
            "document.write",
            "innerHTML",
            "outerHTML",
            "insertAdjacentHTML",
        ]),
        severity: RiskLevel::Medium,
        capability: None,
        message: "DOM mutation has no effect inside the sandbox",
    },
    StructuralRule {
        id: "js.prototype-pollution",
        languages: SCRIPT,
        construct: Construct::Attribute(&["__proto__", "setPrototypeOf"]),
        severity: RiskLevel::Medium,
        capability: None,
        message: "Prototype manipulation can leak between modules",
    },
    StructuralRule {
        id: "js.env-access",
        languages: SCRIPT,
        construct: Construct::Attribute(&["process.env", "Deno.env"]),
        severity: RiskLevel::Low,
        capability: None,
        message: "Environment variables are scrubbed inside the sandbox",
    },
    // Shell
    StructuralRule {
        id: "sh.privilege",
        languages: SH,
        construct: Construct::Command(&[
            "sudo", "su", "doas", "pkexec", "chroot", "unshare", "nsenter", "setcap",
        ]),
        severity: RiskLevel::Critical,
        capability: None,
        message: "Privilege changes are not permitted",
    },
    StructuralRule {
        id: "sh.system-destruction",
        languages: SH,
        construct: Construct::Command(&[
            "mkfs", "mkswap", "wipefs", "shred", "fdisk", "parted", "dd", "shutdown", "reboot",
            "halt", "poweroff", "insmod", "rmmod", "modprobe",
        ]),
        severity: RiskLevel::Critical,
        capability: None,
        message: "Disk and system administration commands are not permitted",
    },
    StructuralRule {
        id: "sh.dynamic-eval",
        languages: SH,
        construct: Construct::Command(&["eval", "source", ".", "exec"]),
        severity: RiskLevel::High,
        capability: None,
        message: "Dynamic command evaluation is not permitted",
    },
    StructuralRule {
        id: "sh.dynamic-command",
        languages: SH,
        construct: Construct::DynamicCommand,
        severity: RiskLevel::High,
        capability: None,
        message: "Command names built from variables, quotes or substitutions cannot be checked",
    },
    StructuralRule {
        id: "sh.nested-interpreter",
        languages: SH,
        construct: Construct::Command(&[
            "bash", "sh", "zsh", "dash", "ksh", "python", "python3", "perl", "ruby", "node",
            "deno", "php", "lua",
        ]),
        severity: RiskLevel::High,
        capability: None,
        message: "Starting another interpreter bypasses validation",
    },
    StructuralRule {
        id: "sh.network",
        languages: SH,
        construct: Construct::Command(&[
            "curl", "wget", "nc", "netcat", "ncat", "socat", "ssh", "scp", "sftp", "rsync",
            "ftp", "telnet", "ping", "dig", "nslookup",
        ]),
        severity: RiskLevel::High,
        capability: Some(Capability::Network),
        message: "Network access is disabled",
    },
    StructuralRule {
        id: "sh.fs-mutation",
        languages: SH,
        construct: Construct::Command(&[
            "rm", "rmdir", "mv", "cp", "mkdir", "touch", "tee", "ln", "chmod", "chown",
            "truncate", "install",
        ]),
        severity: RiskLevel::High,
        capability: Some(Capability::FileSystem),
        message: "Filesystem modification is disabled",
    },
    StructuralRule {
        id: "sh.process-control",
        languages: SH,
        construct: Construct::Command(&["kill", "pkill", "killall", "nohup", "disown", "crontab"]),
        severity: RiskLevel::Medium,
        capability: None,
        message: "Process control commands only affect the sandbox process group",
    },
    StructuralRule {
        id: "sh.session-escape",
        languages: SH,
        construct: Construct::Command(&["setsid", "start-stop-daemon", "daemonize"]),
        severity: RiskLevel::High,
        capability: None,
        message: "Leaving the sandbox session or process group is not permitted",
    },
];

pub(crate) static PATTERN_RULES: &[PatternRule] = &[
    PatternRule {
        id: "pattern.rm-root",
        languages: ANY,
        pattern: r#"(?m)\brm\s+(?:-\S+\s+)*-[A-Za-z]*[rR][A-Za-z]*\s+(?:-\S+\s+)*(?:/\*?|~/?|\$HOME/?|\$\{HOME\}/?)(?:\s|$|["';)&|])"#,
        severity: RiskLevel::Critical,
        message: "Recursive deletion of the root or home directory",
    },
    PatternRule {
        id: "pattern.rm-system",
        languages: ANY,
        pattern: r#"(?m)\brm\s+(?:-\S+\s+)*/(?:etc|usr|var|boot|bin|sbin|lib|lib64|dev|proc|sys|root)(?:/|\s|$|["';)])"#,
        severity: RiskLevel::Critical,
        message: "Deletion of system directories",
    },
    PatternRule {
        id: "pattern.rm-hidden",
        languages: ANY,
        pattern: r"\brm\s+(?:-\S+\s+)*(?:~/|\$HOME/)?\.\*",
        severity: RiskLevel::High,
        message: "Deletion of all hidden files",
    },
    PatternRule {
        id: "pattern.find-delete",
        languages: ANY,
        pattern: r"\bfind\s+[^\n|;]*(?:-exec\s+rm\b|-delete\b)|\|\s*xargs\s+(?:-\S+\s+)*rm\b",
        severity: RiskLevel::High,
        message: "Bulk deletion through find",
    },
    PatternRule {
        id: "pattern.fork-bomb",
        languages: ANY,
        pattern: r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        severity: RiskLevel::Critical,
        message: "Fork bomb",
    },
    PatternRule {
        id: "pattern.raw-device-write",
        languages: ANY,
        pattern: r">\s*/dev/(?:sd[a-z]|hd[a-z]|vd[a-z]|xvd[a-z]|nvme\d|mmcblk\d|mem\b|kmem\b|port\b)",
        severity: RiskLevel::Critical,
        message: "Raw write to a block or memory device",
    },
    PatternRule {
        id: "pattern.dd-device",
        languages: ANY,
        pattern: r"\bdd\s+[^\n]*\bof=/dev/",
        severity: RiskLevel::Critical,
        message: "dd writing to a device",
    },
    PatternRule {
        id: "pattern.mkfs",
        languages: ANY,
        pattern: r"\b(?:mkfs(?:\.[a-z0-9]+)?|wipefs|mkswap)\s",
        severity: RiskLevel::Critical,
        message: "Filesystem creation",
    },
    PatternRule {
        id: "pattern.privilege-escalation",
        languages: ANY,
        pattern: r#"(?m)(?:^|[\s;&|"'(`])(?:sudo|doas|pkexec|su)\s+(?:-\S*|root\b|[a-z/])"#,
        severity: RiskLevel::Critical,
        message: "Privilege escalation",
    },
    PatternRule {
        id: "pattern.setuid-chmod",
        languages: ANY,
        pattern: r"\bchmod\s+(?:[ugoa]*\+[rwx]*s|[0-7]?[2467][0-7]{3}\b)",
        severity: RiskLevel::High,
        message: "Setting setuid or setgid bits",
    },
    PatternRule {
        id: "pattern.sensitive-file",
        languages: ANY,
        pattern: r"/etc/(?:passwd|shadow|gshadow|sudoers)\b|\.ssh/(?:id_[a-z0-9]+|authorized_keys)\b",
        severity: RiskLevel::High,
        message: "Access to sensitive system files",
    },
    PatternRule {
        id: "pattern.proc-memory",
        languages: ANY,
        pattern: r"/proc/(?:self|\d+)/(?:mem|environ|maps)\b",
        severity: RiskLevel::High,
        message: "Access to process memory through /proc",
    },
    PatternRule {
        id: "pattern.base64-decode",
        languages: ANY,
        pattern: r#"\bbase64\s+(?:-d|--decode)\b|\bb64decode\s*\(|\batob\s*\(|Buffer\.from\([^)\n]*["']base64["']"#,
        severity: RiskLevel::Medium,
        message: "Base64 decoding can hide payloads",
    },
    PatternRule {
        id: "pattern.hex-obfuscation",
        languages: ANY,
        pattern: r"(?:\\x[0-9a-fA-F]{2}){8,}",
        severity: RiskLevel::Medium,
        message: "Long hex escape sequence looks obfuscated",
    },
    PatternRule {
        id: "pattern.unbounded-loop",
        languages: ANY,
        pattern: r"\bwhile\s*\(?\s*(?:True|true|1)\s*\)?\s*[:{]|\bfor\s*\(\s*;\s*;\s*\)|\bwhile\s+(?::|true)\s*;?\s*do\b",
        severity: RiskLevel::Low,
        message: "Unbounded loop will run until the time limit",
    },
    PatternRule {
        id: "pattern.long-sleep",
        languages: ANY,
        pattern: r"\bsleep\s*\(?\s*\d{3,}",
        severity: RiskLevel::Low,
        message: "Long sleep will run until the time limit",
    },
    PatternRule {
        id: "pattern.huge-allocation",
        languages: ANY,
        pattern: r"\*\s*(?:10\s*\*\*\s*(?:[89]|\d{2,})|\d{9,})|new\s+Array\(\s*\d{8,}\s*\)|\bbytearray\(\s*\d{8,}",
        severity: RiskLevel::Medium,
        message: "Very large allocation will exceed the memory limit",
    },
    PatternRule {
        id: "pattern.backtick-substitution",
        languages: SH,
        pattern: r"`[^`\n]+`",
        severity: RiskLevel::Low,
        message: "Backtick substitution; prefer $(...)",
    },
];

pub(crate) static SUGGESTION_RULES: &[SuggestionRule] = &[
    SuggestionRule {
        languages: PY,
        pattern: r"(?m)^\s*from\s+\S+\s+import\s+\*",
        when_absent: false,
        advice: "Import names explicitly instead of using `import *`",
    },
    SuggestionRule {
        languages: PY,
        pattern: r"(?m)^\s*except\s*:",
        when_absent: false,
        advice: "Catch specific exceptions instead of a bare `except:`",
    },
    SuggestionRule {
        languages: PY,
        pattern: r#"(?m)^\s*print\s+["'\w]"#,
        when_absent: false,
        advice: "`print` is a function in Python 3; use `print(...)`",
    },
    SuggestionRule {
        languages: SCRIPT,
        pattern: r"(?m)(?:^|[;{(\s])var\s+\w",
        when_absent: false,
        advice: "Prefer `let` or `const` over `var`",
    },
    SuggestionRule {
        languages: SCRIPT,
        pattern: r"[^=!<>]==[^=]|!=[^=]",
        when_absent: false,
        advice: "Use strict equality (`===` / `!==`)",
    },
    SuggestionRule {
        languages: TS,
        pattern: r":\s*any\b",
        when_absent: false,
        advice: "Avoid `any`; declare a concrete type",
    },
    SuggestionRule {
        languages: SH,
        pattern: r"(?m)^\s*set\s+-[a-z]*e",
        when_absent: true,
        advice: "Start scripts with `set -e` so failing commands stop execution",
    },
];

static COMPILED_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    PATTERN_RULES
        .iter()
        .map(|rule| Regex::new(rule.pattern).expect("pattern rule must compile"))
        .collect()
});

static COMPILED_SUGGESTIONS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    SUGGESTION_RULES
        .iter()
        .map(|rule| Regex::new(rule.pattern).expect("suggestion rule must compile"))
        .collect()
});

pub(crate) fn pattern_rules() -> impl Iterator<Item = (&'static PatternRule, &'static Regex)> {
    PATTERN_RULES.iter().zip(COMPILED_PATTERNS.iter())
}

pub(crate) fn suggestion_rules() -> impl Iterator<Item = (&'static SuggestionRule, &'static Regex)>
{
    SUGGESTION_RULES.iter().zip(COMPILED_SUGGESTIONS.iter())
}

/// First place in the outline where the construct occurs: `(line, construct text)`
pub(crate) fn first_match(construct: Construct, outline: &Outline) -> Option<(usize, String)> {
    match construct {
        Construct::Import(modules) => outline
            .imports
            .iter()
            .find(|import| modules.iter().any(|m| module_matches(&import.module, m)))
            .map(|import| (import.line, import.module.clone())),
        Construct::Call(paths) => find_call(outline, paths, |_| true),
        Construct::OpenForWrite(paths) => find_call(outline, paths, |call| {
            match call.args.mode() {
                None => false,
                Some(None) => true,
                Some(Some(mode)) => mode.contains(['w', 'a', 'x', '+']),
            }
        }),
        Construct::OpenForRead(paths) => find_call(outline, paths, |call| {
            match call.args.mode() {
                None => true,
                Some(None) => false,
                Some(Some(mode)) => !mode.contains(['w', 'a', 'x', '+']),
            }
        }),
        Construct::CallWithSource(paths) => find_call(outline, paths, |call| {
            matches!(call.args.positional.first(), Some(Some(_)))
        }),
        Construct::Attribute(names) => {
            let attribute = outline
                .attributes
                .iter()
                .map(|a| (a.line, a.path.as_str()))
                .chain(outline.calls.iter().map(|c| (c.line, c.path.as_str())))
                .filter(|(_, path)| names.iter().any(|name| contains_segments(path, name)))
                .min_by_key(|(line, _)| *line);
            attribute.map(|(line, path)| (line, path.trim_start_matches('.').to_string()))
        }
        Construct::Command(names) => outline
            .commands
            .iter()
            .find(|command| {
                names.iter().any(|name| {
                    command.name == *name
                        || command
                            .name
                            .strip_prefix(name)
                            .is_some_and(|rest| rest.starts_with('.'))
                })
            })
            .map(|command| {
                let mut text = command.name.clone();
                if let Some(first) = command.args.first() {
                    text.push(' ');
                    text.push_str(first);
                }
                (command.line, text)
            }),
        Construct::DynamicCommand => outline
            .commands
            .iter()
            .find(|command| command.dynamic)
            .map(|command| (command.line, command.name.clone())),
    }
}

fn find_call(
    outline: &Outline,
    paths: &[&str],
    filter: impl Fn(&Call) -> bool,
) -> Option<(usize, String)> {
    outline
        .calls
        .iter()
        .find(|call| paths.iter().any(|p| path_matches(&call.path, p)) && filter(call))
        .map(|call| (call.line, format!("{}()", call.path.trim_start_matches('.'))))
}

fn module_matches(module: &str, rule: &str) -> bool {
    module == rule
        || module
            .strip_prefix(rule)
            .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('/'))
}

fn path_matches(path: &str, rule: &str) -> bool {
    if let Some(method) = rule.strip_prefix('.') {
        return path
            .rsplit('.')
            .next()
            .is_some_and(|last| last == method && path.contains('.'));
    }
    match rule.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => path == rule,
    }
}

/// Whether the dotted segments of `name` appear contiguously in `path`
fn contains_segments(path: &str, name: &str) -> bool {
    let haystack: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let needle: Vec<&str> = name.split('.').collect();
    haystack.windows(needle.len()).any(|window| window == needle.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(COMPILED_PATTERNS.len(), PATTERN_RULES.len());
        assert_eq!(COMPILED_SUGGESTIONS.len(), SUGGESTION_RULES.len());
    }

    #[test]
    fn test_rule_ids_are_unique() {
        let mut seen = HashSet::new();
        for id in STRUCTURAL_RULES
            .iter()
            .map(|r| r.id)
            .chain(PATTERN_RULES.iter().map(|r| r.id))
        {
            assert!(seen.insert(id), "duplicate rule id {}", id);
        }
    }

    #[test]
    fn test_path_matching() {
        assert!(path_matches("os.execvp", "os.exec*"));
        assert!(path_matches("pathlib.Path.write_text", ".write_text"));
        assert!(path_matches(".write_text", ".write_text"));
        assert!(!path_matches("write_text", ".write_text"));
        assert!(!path_matches("os.systemd", "os.system"));
    }

    #[test]
    fn test_module_matching() {
        assert!(module_matches("http.client", "http.client"));
        assert!(module_matches("fs/promises", "fs"));
        assert!(module_matches("urllib.request.urlopen", "urllib.request"));
        assert!(!module_matches("fsevents", "fs"));
        assert!(!module_matches("urllib.parse", "urllib.request"));
    }

    #[test]
    fn test_segment_matching() {
        assert!(contains_segments("window.document.cookie", "document.cookie"));
        assert!(contains_segments(".__class__.__subclasses__", "__subclasses__"));
        assert!(!contains_segments("documents.cookie", "document.cookie"));
    }

    fn pattern_hits(source: &str) -> Vec<&'static str> {
        pattern_rules()
            .filter(|(_, regex)| regex.is_match(source))
            .map(|(rule, _)| rule.id)
            .collect()
    }

    #[test]
    fn test_destructive_patterns() {
        assert_eq!(pattern_hits("rm -rf /"), vec!["pattern.rm-root"]);
        assert_eq!(pattern_hits("rm -r -f ~"), vec!["pattern.rm-root"]);
        assert!(pattern_hits("rm -rf /tmp/build").is_empty());
        assert_eq!(pattern_hits("rm -rf /etc/nginx"), vec!["pattern.rm-system"]);
        assert_eq!(pattern_hits("rm -rf .*"), vec!["pattern.rm-hidden"]);
        assert_eq!(
            pattern_hits("find . -name '*.o' | xargs rm"),
            vec!["pattern.find-delete"]
        );
        assert_eq!(pattern_hits(":(){ :|:& };:"), vec!["pattern.fork-bomb"]);
        assert_eq!(
            pattern_hits("dd if=/dev/zero of=/dev/sda"),
            vec!["pattern.dd-device"]
        );
    }

    #[test]
    fn test_privilege_patterns() {
        assert_eq!(
            pattern_hits("sudo apt-get install x"),
            vec!["pattern.privilege-escalation"]
        );
        assert!(pattern_hits("pseudo = 1").is_empty());
        assert_eq!(pattern_hits("chmod u+s ./bin"), vec!["pattern.setuid-chmod"]);
        assert_eq!(pattern_hits("chmod 4755 ./bin"), vec!["pattern.setuid-chmod"]);
        assert!(pattern_hits("chmod 0755 ./bin").is_empty());
    }

    #[test]
    fn test_advisory_patterns() {
        assert_eq!(pattern_hits("while True:\n    pass"), vec!["pattern.unbounded-loop"]);
        assert_eq!(pattern_hits("time.sleep(3600)"), vec!["pattern.long-sleep"]);
        assert_eq!(
            pattern_hits("data = 'x' * 10**9"),
            vec!["pattern.huge-allocation"]
        );
    }
}
