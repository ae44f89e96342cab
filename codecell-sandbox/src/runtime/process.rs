//! Process-based engine: one interpreter process per snippet

use super::languages::{self, LaunchSpec};
use super::probe::{self, ProcessGroupProbe};
use super::{
    EngineOutput, ExecutionContext, ExecutionEngine, KILLED_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
use crate::error::SandboxError;
use crate::limits::ResourceLimits;
use crate::types::Language;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
/// Directory inside the workdir that holds a profile's private PATH
const TOOLS_DIR: &str = ".bin";
/// Inherited by every process a snippet starts, including ones that leave the tree
const RUN_MARKER_VAR: &str = "CODECELL_RUN_ID";
const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const KILL_GRACE: Duration = Duration::from_secs(2);
const DRAIN_GRACE: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 8 * 1024;

type CaptureTask = JoinHandle<io::Result<(Vec<u8>, bool)>>;

/// Node permission flag per interpreter path
static NODE_PERMISSION_FLAGS: LazyLock<Mutex<HashMap<String, Option<&'static str>>>> =
    LazyLock::new(Default::default);

/// Runs a snippet in a fresh interpreter process.
///
/// The process gets a private temporary working directory, a cleared environment, its own
/// process group and rlimits. The deadline and cancellation both kill the whole group.
pub struct ProcessEngine {
    language: Language,
    interpreter: String,
    workdir: Option<TempDir>,
    used: bool,
}

impl ProcessEngine {
    pub fn new(language: Language, interpreter: impl Into<String>) -> Self {
        Self {
            language,
            interpreter: interpreter.into(),
            workdir: None,
            used: false,
        }
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }
}

#[async_trait]
impl ExecutionEngine for ProcessEngine {
    fn language(&self) -> Language {
        self.language
    }

    fn name(&self) -> &str {
        self.language.as_str()
    }

    async fn execute(
        &mut self,
        code: &str,
        inputs: &[String],
        ctx: &ExecutionContext,
    ) -> Result<EngineOutput> {
        if self.used {
            return Err(SandboxError::EngineReused);
        }
        self.used = true;

        let workdir = tempfile::Builder::new().prefix("codecell-").tempdir()?;
        let mut spec =
            languages::launch_spec(self.language, &self.interpreter, code, ctx, workdir.path());
        if self.language == Language::JavaScript {
            match node_permission_flag(&self.interpreter).await {
                Some(flag) => languages::restrict_node(&mut spec, flag, ctx, workdir.path()),
                None => tracing::warn!(
                    interpreter = %self.interpreter,
                    "Node permission model unavailable; relying on the loader guard"
                ),
            }
        }
        for (name, contents) in &spec.files {
            tokio::fs::write(workdir.path().join(name), contents).await?;
        }
        let path = if spec.path_tools.is_empty() {
            OsString::from(host_path())
        } else {
            let dir = workdir.path().join(TOOLS_DIR);
            let linked = link_tools(&dir, &spec.path_tools).await?;
            tracing::debug!(linked, "Private PATH prepared");
            dir.into_os_string()
        };
        let marker = uuid::Uuid::new_v4().to_string();
        let mut cmd = build_command(&spec, workdir.path(), ctx, &path, &marker);
        apply_rlimits(
            &mut cmd,
            &ctx.limits,
            spec.guarded && !ctx.capability.allows_filesystem(),
        );
        self.workdir = Some(workdir);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| SandboxError::EngineSpawn {
            program: spec.program.clone(),
            source,
        })?;
        let pgid = child.id();
        let probe = pgid.map(|pid| Arc::new(ProcessGroupProbe::new(pid as i32)));
        if let Some(probe) = &probe {
            ctx.probe.attach(probe.clone());
        }
        tracing::debug!(language = %self.language, pid = ?pgid, "Interpreter started");

        let stdin_task = child.stdin.take().map(|mut stdin| {
            let payload = stdin_payload(inputs);
            tokio::spawn(async move {
                // The program may exit without reading its input
                let _ = stdin.write_all(payload.as_bytes()).await;
                let _ = stdin.shutdown().await;
            })
        });
        let cap = ctx.limits.max_output_size;
        let stdout_task = child.stdout.take().map(|out| tokio::spawn(read_capped(out, cap)));
        let stderr_task = child.stderr.take().map(|err| tokio::spawn(read_capped(err, cap)));

        let mut timed_out = false;
        let mut cancelled = false;
        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(ctx.limits.deadline()) => {
                timed_out = true;
                None
            }
            _ = ctx.cancel.cancelled() => {
                cancelled = true;
                None
            }
        };

        let status = match waited {
            Some(status) => Some(status?),
            None => {
                kill_run(pgid, &marker).await;
                let _ = child.start_kill();
                match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    Ok(Err(err)) => {
                        tracing::warn!(%err, "Failed to reap interpreter");
                        None
                    }
                    Err(_) => {
                        tracing::warn!(pid = ?pgid, "Interpreter did not exit after SIGKILL");
                        None
                    }
                }
            }
        };
        // Background processes left behind would keep the pipes open
        kill_run(pgid, &marker).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        ctx.probe.detach();

        if let Some(task) = stdin_task {
            task.abort();
        }
        let (stdout, stdout_truncated) = collect(stdout_task, cap).await;
        let (stderr, stderr_truncated) = collect(stderr_task, cap).await;

        let mut warnings = Vec::new();
        let exit_code = if timed_out {
            TIMEOUT_EXIT_CODE
        } else if cancelled {
            KILLED_EXIT_CODE
        } else {
            match status {
                Some(status) => exit_code_of(status, &mut warnings),
                None => KILLED_EXIT_CODE,
            }
        };

        tracing::debug!(
            language = %self.language,
            exit_code,
            timed_out,
            cancelled,
            duration_ms,
            "Interpreter finished"
        );

        Ok(EngineOutput {
            stdout,
            stderr,
            exit_code,
            timed_out,
            cancelled,
            truncated: stdout_truncated || stderr_truncated,
            duration_ms,
            peak_memory_bytes: probe.as_ref().map_or(0, |p| p.peak_memory_bytes()),
            cpu_time_ms: probe.as_ref().map_or(0, |p| p.cpu_time_ms()),
            warnings,
        })
    }

    async fn release(&mut self) {
        if let Some(workdir) = self.workdir.take() {
            let path = workdir.path().to_path_buf();
            if let Err(err) = workdir.close() {
                tracing::warn!(path = %path.display(), %err, "Failed to remove working directory");
            }
        }
    }
}

fn build_command(
    spec: &LaunchSpec,
    workdir: &Path,
    ctx: &ExecutionContext,
    path: &OsString,
    marker: &str,
) -> Command {
    let mut cmd = Command::new(resolve_program(&spec.program));
    cmd.args(&spec.args)
        .current_dir(workdir)
        .env_clear()
        .env("PATH", path)
        .env(RUN_MARKER_VAR, marker)
        .env("HOME", workdir)
        .env("TMPDIR", workdir)
        .env("LANG", "C.UTF-8")
        .env("NO_COLOR", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in ctx.capability.env_vars() {
        cmd.env(key, value);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

fn host_path() -> String {
    std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string())
}

/// Resolve a bare program name against the host PATH, since the child's PATH may be private
fn resolve_program(program: &str) -> PathBuf {
    if program.contains('/') {
        return PathBuf::from(program);
    }
    find_on_path(program).unwrap_or_else(|| PathBuf::from(program))
}

fn find_on_path(program: &str) -> Option<PathBuf> {
    std::env::split_paths(&host_path())
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Symlink each tool found on the host PATH into `dir`; tools the host lacks are skipped
#[cfg(unix)]
async fn link_tools(dir: &Path, tools: &[&str]) -> io::Result<usize> {
    tokio::fs::create_dir(dir).await?;
    let mut linked = 0;
    for tool in tools {
        if let Some(target) = find_on_path(tool) {
            tokio::fs::symlink(&target, dir.join(tool)).await?;
            linked += 1;
        }
    }
    Ok(linked)
}

#[cfg(not(unix))]
async fn link_tools(dir: &Path, _tools: &[&str]) -> io::Result<usize> {
    tokio::fs::create_dir(dir).await?;
    Ok(0)
}

/// Ask the interpreter for its version once and map it to a permission flag
async fn node_permission_flag(interpreter: &str) -> Option<&'static str> {
    let cached = NODE_PERMISSION_FLAGS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(interpreter)
        .copied();
    if let Some(flag) = cached {
        return flag;
    }
    let version = Command::new(resolve_program(interpreter))
        .arg("--version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    let flag = match tokio::time::timeout(VERSION_CHECK_TIMEOUT, version).await {
        Ok(Ok(output)) if output.status.success() => {
            languages::node_permission_flag(&String::from_utf8_lossy(&output.stdout))
        }
        _ => None,
    };
    NODE_PERMISSION_FLAGS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(interpreter.to_string(), flag);
    flag
}

/// Apply rlimits in the child between fork and exec
#[cfg(unix)]
fn apply_rlimits(cmd: &mut Command, limits: &ResourceLimits, deny_file_writes: bool) {
    // Backstop only; the wall-clock deadline normally fires first
    let cpu_seconds = (limits.max_execution_time_ms.div_ceil(1000) + 1) as libc::rlim_t;

    // SAFETY: pre_exec runs between fork() and exec() in the child. The closure only calls
    // setrlimit, which is async-signal-safe, and captures Copy values.
    unsafe {
        cmd.pre_exec(move || {
            let set = |resource, soft: libc::rlim_t, hard: libc::rlim_t| {
                let limit = libc::rlimit {
                    rlim_cur: soft,
                    rlim_max: hard,
                };
                if libc::setrlimit(resource, &limit) == 0 {
                    Ok(())
                } else {
                    Err(io::Error::last_os_error())
                }
            };
            set(libc::RLIMIT_CORE, 0, 0)?;
            // Raising the hard CPU limit can fail under a stricter parent limit
            let _ = set(libc::RLIMIT_CPU, cpu_seconds, cpu_seconds + 1);
            if deny_file_writes {
                set(libc::RLIMIT_FSIZE, 0, 0)?;
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_rlimits(_cmd: &mut Command, _limits: &ResourceLimits, _deny_file_writes: bool) {}

#[cfg(unix)]
fn kill_process_group(pgid: Option<u32>) {
    if let Some(pgid) = pgid.and_then(|p| i32::try_from(p).ok()) {
        // SAFETY: signals the process group created for this child
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: Option<u32>) {}

/// Kill the interpreter's group, then every descendant and marked process that left it
async fn kill_run(pgid: Option<u32>, marker: &str) {
    kill_process_group(pgid);
    let Some(root) = pgid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    let marker = format!("{}={}", RUN_MARKER_VAR, marker);
    match tokio::task::spawn_blocking(move || probe::run_members(root, &marker)).await {
        Ok(members) => {
            for pid in members {
                kill_pid(pid);
            }
        }
        Err(err) => tracing::warn!(%err, "Failed to scan for escaped processes"),
    }
}

#[cfg(unix)]
fn kill_pid(pid: i32) {
    // SAFETY: pid comes from a scan of this run's members
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_pid(_pid: i32) {}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus, warnings: &mut Vec<String>) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    if let Some(code) = status.code() {
        return code;
    }
    match status.signal() {
        Some(signal) => {
            warnings.push(match signal {
                libc::SIGXCPU => "CPU time limit exceeded".to_string(),
                libc::SIGXFSZ => "File write blocked: filesystem access is disabled".to_string(),
                other => format!("Process killed by signal {}", other),
            });
            128 + signal
        }
        None => 1,
    }
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus, _warnings: &mut Vec<String>) -> i32 {
    status.code().unwrap_or(1)
}

fn stdin_payload(inputs: &[String]) -> String {
    if inputs.is_empty() {
        return String::new();
    }
    let mut payload = inputs.join("\n");
    payload.push('\n');
    payload
}

/// Read everything, keeping at most `cap` bytes. The rest is drained and discarded so the
/// writer never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    cap: usize,
) -> io::Result<(Vec<u8>, bool)> {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(kept.len());
        kept.extend_from_slice(&buf[..n.min(room)]);
        if n > room {
            truncated = true;
        }
    }
    Ok((kept, truncated))
}

async fn collect(task: Option<CaptureTask>, cap: usize) -> (String, bool) {
    let Some(mut task) = task else {
        return (String::new(), false);
    };
    match tokio::time::timeout(DRAIN_GRACE, &mut task).await {
        Ok(Ok(Ok((bytes, truncated)))) => (decode_capped(bytes, cap), truncated),
        Ok(Ok(Err(err))) => {
            tracing::warn!(%err, "Failed to read interpreter output");
            (String::new(), false)
        }
        Ok(Err(err)) => {
            tracing::warn!(%err, "Output reader task failed");
            (String::new(), false)
        }
        Err(_) => {
            task.abort();
            tracing::warn!("Output pipe still open after the interpreter exited");
            (String::new(), false)
        }
    }
}

/// Decode captured bytes as UTF-8 and keep the result within `cap` bytes
pub(crate) fn decode_capped(bytes: Vec<u8>, cap: usize) -> String {
    let mut text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => {
            let utf8 = err.utf8_error();
            let bytes = err.into_bytes();
            if utf8.error_len().is_none() {
                // Cut in the middle of a character
                String::from_utf8_lossy(&bytes[..utf8.valid_up_to()]).into_owned()
            } else {
                String::from_utf8_lossy(&bytes).into_owned()
            }
        }
    };
    if text.len() > cap {
        let mut end = cap;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio_util::sync::CancellationToken;

    fn shell() -> ProcessEngine {
        ProcessEngine::new(Language::Shell, "/bin/sh")
    }

    fn ctx(limits: ResourceLimits) -> ExecutionContext {
        ExecutionContext::new(limits)
    }

    #[tokio::test]
    async fn test_echo() {
        let mut engine = shell();
        let output = engine
            .execute("echo hello", &[], &ctx(ResourceLimits::default()))
            .await
            .unwrap();
        engine.release().await;
        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.exit_code, 0);
        assert!(!output.timed_out && !output.truncated);
    }

    #[tokio::test]
    async fn test_inputs_on_stdin() {
        let mut engine = shell();
        let inputs = vec!["first".to_string(), "second".to_string()];
        let output = engine
            .execute(
                "read a\nread b\necho \"$b-$a\"",
                &inputs,
                &ctx(ResourceLimits::default()),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, "second-first\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_and_stderr() {
        let mut engine = shell();
        let output = engine
            .execute("echo oops >&2\nexit 3", &[], &ctx(ResourceLimits::default()))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stderr, "oops\n");
    }

    #[tokio::test]
    async fn test_deadline_kills_process() {
        let limits = ResourceLimits {
            max_execution_time_ms: 300,
            ..Default::default()
        };
        let mut engine = shell();
        let output = engine
            .execute("while :; do :; done", &[], &ctx(limits))
            .await
            .unwrap();
        assert!(output.timed_out);
        assert_eq!(output.exit_code, TIMEOUT_EXIT_CODE);
        assert!(output.duration_ms < 2_500);
    }

    #[tokio::test]
    async fn test_cancellation_kills_process_group() {
        let cancel = CancellationToken::new();
        let context = ctx(ResourceLimits::default()).with_cancel(cancel.clone());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let mut engine = shell();
        let output = engine
            .execute("sleep 30 &\nsleep 30", &[], &context)
            .await
            .unwrap();
        assert!(output.cancelled);
        assert_eq!(output.exit_code, KILLED_EXIT_CODE);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_output_truncated_on_cap() {
        let limits = ResourceLimits {
            max_output_size: 1_000,
            ..Default::default()
        };
        let mut engine = shell();
        let output = engine
            .execute("yes | head -c 100000", &[], &ctx(limits))
            .await
            .unwrap();
        assert!(output.truncated);
        assert_eq!(output.stdout.len(), 1_000);
        assert_eq!(output.exit_code, 0);
    }

    #[tokio::test]
    async fn test_file_writes_blocked_without_fs_access() {
        let mut engine = shell();
        let output = engine
            .execute("echo data > out.txt\necho done", &[], &ctx(ResourceLimits::default()))
            .await
            .unwrap();
        assert_ne!(output.exit_code, 0);
        assert!(!output.stdout.contains("done"));
    }

    #[tokio::test]
    async fn test_engine_is_single_use() {
        let mut engine = shell();
        let context = ctx(ResourceLimits::default());
        engine.execute("true", &[], &context).await.unwrap();
        assert_matches!(
            engine.execute("true", &[], &context).await,
            Err(SandboxError::EngineReused)
        );
    }

    #[tokio::test]
    async fn test_missing_interpreter() {
        let mut engine = ProcessEngine::new(Language::Python, "/nonexistent/python3");
        let result = engine
            .execute("print(1)", &[], &ctx(ResourceLimits::default()))
            .await;
        assert_matches!(result, Err(SandboxError::EngineSpawn { .. }));
        engine.release().await;
    }

    #[tokio::test]
    async fn test_shell_path_is_private() {
        let mut engine = shell();
        let output = engine
            .execute(
                "command -v rm || echo no-rm\ncommand -v curl || echo no-curl\necho a | grep a",
                &[],
                &ctx(ResourceLimits::default()),
            )
            .await
            .unwrap();
        engine.release().await;
        assert_eq!(output.stdout, "no-rm\nno-curl\na\n");
    }

    #[cfg(target_os = "linux")]
    fn is_running(pid: i32) -> bool {
        std::fs::read_to_string(format!("/proc/{}/stat", pid)).is_ok_and(|stat| {
            stat.rsplit(')')
                .next()
                .is_some_and(|rest| !rest.trim_start().starts_with('Z'))
        })
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_setsid_child_is_killed() {
        let Some(setsid) = find_on_path("setsid") else {
            return;
        };
        let code = format!(
            "{} /bin/sh -c 'echo $$; exec sleep 30' &\nsleep 0.3\n",
            setsid.display()
        );
        let started = Instant::now();
        let mut engine = shell();
        let output = engine
            .execute(&code, &[], &ctx(ResourceLimits::default()))
            .await
            .unwrap();
        engine.release().await;
        assert!(started.elapsed() < DRAIN_GRACE + Duration::from_secs(1));

        let pid: i32 = output.stdout.trim().parse().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while is_running(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!is_running(pid), "detached process {pid} survived the run");
    }

    #[test]
    fn test_decode_capped_respects_char_boundaries() {
        let bytes = "héllo".as_bytes()[..2].to_vec();
        assert_eq!(decode_capped(bytes, 10), "h");
        assert_eq!(decode_capped("héllo".as_bytes().to_vec(), 2), "h");
        assert_eq!(decode_capped(b"abc".to_vec(), 10), "abc");
    }

    #[test]
    fn test_stdin_payload() {
        assert_eq!(stdin_payload(&[]), "");
        assert_eq!(
            stdin_payload(&["a".to_string(), "b".to_string()]),
            "a\nb\n"
        );
    }
}
