//! Interpreter launch profiles and guard preludes

use super::process::ProcessEngine;
use super::{EngineOutput, ExecutionContext, ExecutionEngine};
use crate::types::Language;
use crate::Result;
use async_trait::async_trait;
use std::path::Path;

/// How to start an interpreter for one snippet
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Files written into the working directory before launch
    pub files: Vec<(&'static str, String)>,
    pub env: Vec<(&'static str, String)>,
    /// Whether the profile relies on `RLIMIT_FSIZE` when filesystem access is off
    pub guarded: bool,
    /// Commands linked into a private PATH. Empty keeps the host PATH.
    pub path_tools: Vec<&'static str>,
}

/// Utilities every shell snippet can reach
const SHELL_TOOLS: &[&str] = &[
    "echo", "printf", "cat", "head", "tail", "wc", "sort", "uniq", "cut", "tr", "grep", "egrep",
    "fgrep", "sed", "awk", "seq", "date", "sleep", "expr", "basename", "dirname", "true",
    "false", "test", "[", "tac", "rev", "fold", "paste", "join", "comm", "od", "md5sum",
    "sha1sum", "sha256sum", "yes", "ls", "pwd", "stat", "bc", "factor", "nl", "fmt", "numfmt",
    "shuf", "diff", "cmp", "base64", "printenv", "uname", "id",
];
/// Added when filesystem access is enabled
const SHELL_FS_TOOLS: &[&str] = &[
    "rm", "rmdir", "mv", "cp", "mkdir", "touch", "tee", "ln", "chmod", "truncate", "split",
    "find",
];
/// Added when network access is enabled
const SHELL_NET_TOOLS: &[&str] = &["curl", "wget", "nc", "ping"];

fn shell_tools(ctx: &ExecutionContext) -> Vec<&'static str> {
    let mut tools = SHELL_TOOLS.to_vec();
    if ctx.capability.allows_filesystem() {
        tools.extend_from_slice(SHELL_FS_TOOLS);
    }
    if ctx.capability.allows_network() {
        tools.extend_from_slice(SHELL_NET_TOOLS);
    }
    tools
}

const PYTHON_GUARD: &str = r#"import os
import sys


def _codecell_install_guard():
    allow_net = os.environ.get("CODECELL_ALLOW_NET") == "1"
    allow_fs = os.environ.get("CODECELL_ALLOW_FS") == "1"
    always_blocked = (
        "subprocess.Popen",
        "os.system",
        "os.exec",
        "os.posix_spawn",
        "os.spawn",
        "os.fork",
        "os.forkpty",
        "os.kill",
        "os.killpg",
        "pty.spawn",
        "ctypes.dlopen",
        "ctypes.dlsym",
    )
    fs_blocked = (
        "os.remove",
        "os.rmdir",
        "os.rename",
        "os.mkdir",
        "os.chmod",
        "os.chown",
        "os.link",
        "os.symlink",
        "os.truncate",
        "shutil.rmtree",
        "shutil.move",
        "shutil.copyfile",
    )
    write_flags = os.O_WRONLY | os.O_RDWR | os.O_CREAT | os.O_APPEND | os.O_TRUNC

    def hook(event, args):
        if event.startswith(always_blocked):
            raise PermissionError("sandbox: %s is not permitted" % event)
        if not allow_net and event.startswith("socket."):
            raise PermissionError("sandbox: network access is disabled")
        if not allow_fs:
            if event == "open" and len(args) > 2 and isinstance(args[2], int) and args[2] & write_flags:
                raise PermissionError("sandbox: filesystem writes are disabled")
            if event.startswith(fs_blocked):
                raise PermissionError("sandbox: filesystem modification is disabled")

    sys.addaudithook(hook)


_codecell_install_guard()
del _codecell_install_guard

with open("snippet.py", "rb") as _codecell_file:
    _codecell_code = compile(_codecell_file.read(), "snippet.py", "exec")

exec(_codecell_code, {"__name__": "__main__", "__builtins__": __builtins__})
"#;

const NODE_GUARD: &str = r#"'use strict';
const Module = require('module');
const fs = require('fs');

const allowNet = process.env.CODECELL_ALLOW_NET === '1';
const allowFs = process.env.CODECELL_ALLOW_FS === '1';
const blocked = new Set(['child_process', 'worker_threads', 'cluster', 'vm', 'inspector', 'v8', 'module']);
const network = new Set(['http', 'https', 'http2', 'net', 'tls', 'dgram', 'dns']);

let stdinText = '';
try {
  stdinText = fs.readFileSync(0, 'utf8');
} catch (_) {}
const inputLines = stdinText.length ? stdinText.replace(/\n$/, '').split('\n') : [];
globalThis.input = () => (inputLines.length ? inputLines.shift() : null);

const load = Module._load;
Module._load = function (request, parent, isMain) {
  const name = request.startsWith('node:') ? request.slice(5) : request;
  if (blocked.has(name)) {
    throw new Error(`sandbox: module '${request}' is not permitted`);
  }
  if (!allowNet && network.has(name)) {
    throw new Error('sandbox: network access is disabled');
  }
  if (!allowFs && (name === 'fs' || name.startsWith('fs/'))) {
    throw new Error('sandbox: filesystem access is disabled');
  }
  return load.apply(this, arguments);
};

const deny = (what) => () => {
  throw new Error(`sandbox: ${what} is not permitted`);
};
process.binding = deny('process.binding');
process._linkedBinding = deny('process._linkedBinding');
process.dlopen = deny('process.dlopen');
process.kill = deny('process.kill');
// Loads builtins without going through Module._load
process.getBuiltinModule = deny('process.getBuiltinModule');

if (!allowNet) {
  for (const name of ['fetch', 'WebSocket', 'EventSource', 'XMLHttpRequest']) {
    try {
      Object.defineProperty(globalThis, name, { value: undefined, writable: false, configurable: false });
    } catch (_) {}
  }
}

require('./snippet.js');
"#;

const DENO_MAIN: &str = r#"const chunks: Uint8Array[] = [];
for await (const chunk of Deno.stdin.readable) {
  chunks.push(chunk);
}
const text = new TextDecoder().decode(
  chunks.reduce((all, c) => {
    const merged = new Uint8Array(all.length + c.length);
    merged.set(all);
    merged.set(c, all.length);
    return merged;
  }, new Uint8Array()),
);
const lines = text.length ? text.replace(/\n$/, "").split("\n") : [];
(globalThis as Record<string, unknown>).input = () => lines.length ? lines.shift() : null;

await import("./snippet.ts");
"#;

/// Build the launch spec for a language
pub(crate) fn launch_spec(
    language: Language,
    interpreter: &str,
    code: &str,
    ctx: &ExecutionContext,
    workdir: &Path,
) -> LaunchSpec {
    match language {
        Language::Python => LaunchSpec {
            program: interpreter.to_string(),
            args: vec!["-I".into(), "-B".into(), "-u".into(), "main.py".into()],
            files: vec![("snippet.py", code.to_string()), ("main.py", PYTHON_GUARD.to_string())],
            env: vec![("PYTHONIOENCODING", "utf-8".to_string())],
            guarded: true,
            path_tools: Vec::new(),
        },
        Language::JavaScript => LaunchSpec {
            program: interpreter.to_string(),
            args: vec![
                format!("--max-old-space-size={}", ctx.limits.max_memory_mb),
                "--disallow-code-generation-from-strings".into(),
                "main.js".into(),
            ],
            files: vec![("snippet.js", code.to_string()), ("main.js", NODE_GUARD.to_string())],
            env: Vec::new(),
            guarded: true,
            path_tools: Vec::new(),
        },
        Language::TypeScript => {
            let mut args = vec![
                "run".to_string(),
                "--quiet".into(),
                "--no-prompt".into(),
                "--no-config".into(),
                "--no-remote".into(),
                format!("--v8-flags=--max-old-space-size={}", ctx.limits.max_memory_mb),
            ];
            if ctx.capability.allows_network() {
                args.push("--allow-net".into());
            }
            if ctx.capability.allows_filesystem() {
                args.push("--allow-read=.".into());
                args.push("--allow-write=.".into());
            }
            args.push("main.ts".into());
            LaunchSpec {
                program: interpreter.to_string(),
                args,
                files: vec![("snippet.ts", code.to_string()), ("main.ts", DENO_MAIN.to_string())],
                env: vec![
                    ("DENO_DIR", workdir.join(".deno").display().to_string()),
                    ("DENO_NO_UPDATE_CHECK", "1".to_string()),
                ],
                guarded: false,
                path_tools: Vec::new(),
            }
        }
        Language::Shell => LaunchSpec {
            program: interpreter.to_string(),
            args: vec!["snippet.sh".into()],
            files: vec![("snippet.sh", code.to_string())],
            env: Vec::new(),
            guarded: true,
            path_tools: shell_tools(ctx),
        },
    }
}

/// Flag enabling Node's permission model for a `node --version` string
pub(crate) fn node_permission_flag(version: &str) -> Option<&'static str> {
    let mut parts = version.trim().trim_start_matches('v').split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next().and_then(|m| m.parse().ok()).unwrap_or(0);
    match (major, minor) {
        (24.., _) | (23, 5..) | (22, 13..) => Some("--permission"),
        (20.., _) => Some("--experimental-permission"),
        _ => None,
    }
}

/// Confine a Node launch to its working directory: no child processes, no workers, and
/// filesystem writes only when the envelope allows them
pub(crate) fn restrict_node(
    spec: &mut LaunchSpec,
    flag: &str,
    ctx: &ExecutionContext,
    workdir: &Path,
) {
    let scope = format!("{}/*", workdir.display());
    let mut flags = vec![flag.to_string(), format!("--allow-fs-read={}", scope)];
    if ctx.capability.allows_filesystem() {
        flags.push(format!("--allow-fs-write={}", scope));
    }
    spec.args.splice(0..0, flags);
}

macro_rules! language_engine {
    ($(#[$doc:meta])* $name:ident, $language:expr, $default:expr) => {
        $(#[$doc])*
        pub struct $name(ProcessEngine);

        impl $name {
            pub fn new(interpreter: impl Into<String>) -> Self {
                Self(ProcessEngine::new($language, interpreter))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new($default)
            }
        }

        #[async_trait]
        impl ExecutionEngine for $name {
            fn language(&self) -> Language {
                self.0.language()
            }

            fn name(&self) -> &str {
                self.0.name()
            }

            async fn execute(
                &mut self,
                code: &str,
                inputs: &[String],
                ctx: &ExecutionContext,
            ) -> Result<EngineOutput> {
                self.0.execute(code, inputs, ctx).await
            }

            async fn release(&mut self) {
                self.0.release().await
            }
        }
    };
}

language_engine!(
    /// CPython with an audit-hook guard
    PythonEngine,
    Language::Python,
    "python3"
);
language_engine!(
    /// Node.js with a module-loader guard
    JavaScriptEngine,
    Language::JavaScript,
    "node"
);
language_engine!(
    /// Deno with permissions derived from the envelope
    TypeScriptEngine,
    Language::TypeScript,
    "deno"
);
language_engine!(
    /// POSIX shell
    ShellEngine,
    Language::Shell,
    "/bin/sh"
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::ResourceLimits;

    fn ctx(limits: ResourceLimits) -> ExecutionContext {
        ExecutionContext::new(limits)
    }

    #[test]
    fn test_python_profile() {
        let spec = launch_spec(
            Language::Python,
            "python3",
            "print(1)",
            &ctx(ResourceLimits::default()),
            Path::new("/tmp/x"),
        );
        assert_eq!(spec.args, vec!["-I", "-B", "-u", "main.py"]);
        assert_eq!(spec.files[0], ("snippet.py", "print(1)".to_string()));
        assert!(spec.guarded);
    }

    #[test]
    fn test_node_heap_limit() {
        let limits = ResourceLimits {
            max_memory_mb: 48,
            ..Default::default()
        };
        let spec = launch_spec(
            Language::JavaScript,
            "node",
            "",
            &ctx(limits),
            Path::new("/tmp/x"),
        );
        assert_eq!(spec.args[0], "--max-old-space-size=48");
        assert_eq!(spec.args.last().map(String::as_str), Some("main.js"));
    }

    #[test]
    fn test_deno_permissions_follow_envelope() {
        let denied = launch_spec(
            Language::TypeScript,
            "deno",
            "",
            &ctx(ResourceLimits::default()),
            Path::new("/tmp/x"),
        );
        assert!(!denied.args.iter().any(|a| a.starts_with("--allow")));
        assert!(!denied.guarded);
        assert_eq!(denied.env[0], ("DENO_DIR", "/tmp/x/.deno".to_string()));

        let limits = ResourceLimits {
            enable_network_access: true,
            enable_file_system_access: true,
            ..Default::default()
        };
        let allowed = launch_spec(
            Language::TypeScript,
            "deno",
            "",
            &ctx(limits),
            Path::new("/tmp/x"),
        );
        assert!(allowed.args.contains(&"--allow-net".to_string()));
        assert!(allowed.args.contains(&"--allow-write=.".to_string()));
    }

    #[test]
    fn test_shell_profile() {
        let spec = launch_spec(
            Language::Shell,
            "/bin/sh",
            "echo hi",
            &ctx(ResourceLimits::default()),
            Path::new("/tmp/x"),
        );
        assert_eq!(spec.program, "/bin/sh");
        assert_eq!(spec.args, vec!["snippet.sh"]);
        assert!(spec.path_tools.contains(&"grep"));
        assert!(!spec.path_tools.contains(&"rm"));
        assert!(!spec.path_tools.contains(&"curl"));
        assert!(!spec.path_tools.iter().any(|t| ["sh", "env", "python3", "node"].contains(t)));

        let limits = ResourceLimits {
            enable_file_system_access: true,
            ..Default::default()
        };
        let spec = launch_spec(Language::Shell, "/bin/sh", "", &ctx(limits), Path::new("/tmp/x"));
        assert!(spec.path_tools.contains(&"rm"));
        assert!(!spec.path_tools.contains(&"curl"));
    }

    #[test]
    fn test_node_permission_flag() {
        assert_eq!(node_permission_flag("v18.19.0\n"), None);
        assert_eq!(node_permission_flag("v20.11.1"), Some("--experimental-permission"));
        assert_eq!(node_permission_flag("v22.12.0"), Some("--experimental-permission"));
        assert_eq!(node_permission_flag("v22.13.0"), Some("--permission"));
        assert_eq!(node_permission_flag("v24.1.0"), Some("--permission"));
        assert_eq!(node_permission_flag("garbage"), None);
    }

    #[test]
    fn test_node_restricted_to_workdir() {
        let context = ctx(ResourceLimits::default());
        let mut spec = launch_spec(Language::JavaScript, "node", "", &context, Path::new("/tmp/x"));
        restrict_node(&mut spec, "--permission", &context, Path::new("/tmp/x"));
        assert_eq!(spec.args[0], "--permission");
        assert_eq!(spec.args[1], "--allow-fs-read=/tmp/x/*");
        assert!(!spec.args.iter().any(|a| a.starts_with("--allow-fs-write")));
        assert!(!spec.args.iter().any(|a| a.starts_with("--allow-child-process")));
        assert_eq!(spec.args.last().map(String::as_str), Some("main.js"));
    }

    #[test]
    fn test_node_guard_blocks_builtin_loader() {
        assert!(NODE_GUARD.contains("process.getBuiltinModule = deny("));
    }

    #[test]
    fn test_engine_defaults() {
        assert_eq!(PythonEngine::default().language(), Language::Python);
        assert_eq!(ShellEngine::default().name(), "shell");
    }
}
