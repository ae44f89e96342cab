//! In-process JavaScript engine on a V8 isolate (deno_core)

use super::process::decode_capped;
use super::{
    EngineOutput, ExecutionContext, ExecutionEngine, KILLED_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
use crate::error::SandboxError;
use crate::monitor::{RawCounters, UsageProbe};
use crate::types::Language;
use crate::Result;
use async_trait::async_trait;
use deno_core::v8;
use deno_core::{JsRuntime, RuntimeOptions};
use std::ffi::c_void;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Installs `console`, `input()` and output buffers. The isolate has no `Deno` namespace
/// beyond `Deno.core`, so there is no file, network or process access to remove.
const PRELUDE: &str = r#"
(() => {
  const state = { out: [], err: [], inputs: JSON.parse(globalThis.__codecellInputs || "[]") };
  delete globalThis.__codecellInputs;
  const show = (value) => {
    if (typeof value === "string") return value;
    try {
      const json = JSON.stringify(value);
      return json === undefined ? String(value) : json;
    } catch (_) {
      return String(value);
    }
  };
  const line = (args) => args.map(show).join(" ") + "\n";
  const toOut = (...args) => { state.out.push(line(args)); };
  const toErr = (...args) => { state.err.push(line(args)); };
  globalThis.console = { log: toOut, info: toOut, debug: toOut, warn: toErr, error: toErr };
  globalThis.input = () => (state.inputs.length ? state.inputs.shift() : null);
  Object.defineProperty(globalThis, "__codecellCollect", {
    value: () => JSON.stringify([state.out.join(""), state.err.join("")]),
  });
  delete globalThis.Deno;
})();
"#;

/// JavaScript on a fresh V8 isolate with a heap limit from `maxMemoryMB`
#[derive(Debug, Default)]
pub struct V8JavaScriptEngine {
    used: bool,
}

impl V8JavaScriptEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Heap and CPU figures written by the isolate thread
#[derive(Debug, Default)]
struct IsolateCounters {
    heap_used_bytes: AtomicU64,
    peak_heap_bytes: AtomicU64,
    cpu_start_ms: AtomicU64,
    cpu_time_ms: AtomicU64,
}

impl IsolateCounters {
    /// Must run on the isolate thread
    fn refresh(&self, isolate: &mut v8::Isolate) {
        let mut heap = v8::HeapStatistics::default();
        isolate.get_heap_statistics(&mut heap);
        let used = heap.used_heap_size() as u64;
        self.heap_used_bytes.store(used, Ordering::Relaxed);
        self.peak_heap_bytes.fetch_max(used, Ordering::Relaxed);
        let start = self.cpu_start_ms.load(Ordering::Relaxed);
        self.cpu_time_ms
            .store(thread_cpu_ms().saturating_sub(start), Ordering::Relaxed);
    }
}

extern "C" fn refresh_counters(isolate: &mut v8::Isolate, data: *mut c_void) {
    // SAFETY: data points into an `IsolateCounters` that the isolate thread keeps alive
    // until after the isolate is dropped, and interrupts only run on that thread
    let counters = unsafe { &*(data as *const IsolateCounters) };
    counters.refresh(isolate);
}

/// CPU time of the calling thread
fn thread_cpu_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer
    if unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) } != 0 {
        return 0;
    }
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

/// Samples a running isolate. Each sample asks the isolate to refresh its counters at the
/// next interrupt check and returns the figures from the previous refresh.
struct IsolateProbe {
    handle: v8::IsolateHandle,
    counters: Arc<IsolateCounters>,
}

impl UsageProbe for IsolateProbe {
    fn sample(&self) -> io::Result<Option<RawCounters>> {
        let data = Arc::as_ptr(&self.counters) as *mut c_void;
        if !self.handle.request_interrupt(refresh_counters, data) {
            // Isolate already disposed
            return Ok(None);
        }
        Ok(Some(RawCounters {
            memory_bytes: self.counters.heap_used_bytes.load(Ordering::Relaxed),
            cpu_time_ms: self.counters.cpu_time_ms.load(Ordering::Relaxed),
            ..Default::default()
        }))
    }
}

struct IsolateOutcome {
    stdout: String,
    stderr: String,
    exit_code: i32,
    heap_exhausted: bool,
    heap_used_bytes: u64,
}

#[async_trait]
impl ExecutionEngine for V8JavaScriptEngine {
    fn language(&self) -> Language {
        Language::JavaScript
    }

    fn name(&self) -> &str {
        "v8"
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

        let code = code.to_string();
        let inputs_json = serde_json::to_string(inputs)?;
        let max_bytes = ctx.limits.max_memory_bytes() as usize;
        let (handle_tx, handle_rx) = oneshot::channel();
        let counters = Arc::new(IsolateCounters::default());
        let start = Instant::now();

        let mut task = {
            let counters = counters.clone();
            tokio::task::spawn_blocking(move || {
                run_isolate(code, inputs_json, max_bytes, counters, handle_tx)
            })
        };
        let isolate = handle_rx.await.ok();
        if let Some(handle) = &isolate {
            ctx.probe.attach(Arc::new(IsolateProbe {
                handle: handle.clone(),
                counters: counters.clone(),
            }));
        }

        let mut timed_out = false;
        let mut cancelled = false;
        let joined = tokio::select! {
            joined = &mut task => Some(joined),
            _ = tokio::time::sleep(ctx.limits.deadline()) => {
                timed_out = true;
                None
            }
            _ = ctx.cancel.cancelled() => {
                cancelled = true;
                None
            }
        };
        let joined = match joined {
            Some(joined) => Some(joined),
            None => {
                if let Some(isolate) = &isolate {
                    isolate.terminate_execution();
                }
                tokio::time::timeout(TERMINATE_GRACE, &mut task).await.ok()
            }
        };

        let outcome = match joined {
            Some(Ok(outcome)) => outcome,
            Some(Err(err)) => {
                tracing::error!(%err, "V8 isolate task failed");
                IsolateOutcome {
                    stdout: String::new(),
                    stderr: format!("isolate failure: {}\n", err),
                    exit_code: 1,
                    heap_exhausted: false,
                    heap_used_bytes: 0,
                }
            }
            None => {
                tracing::warn!("V8 isolate did not stop after termination");
                IsolateOutcome {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: KILLED_EXIT_CODE,
                    heap_exhausted: false,
                    heap_used_bytes: 0,
                }
            }
        };

        ctx.probe.detach();

        let cap = ctx.limits.max_output_size;
        let truncated = outcome.stdout.len() > cap || outcome.stderr.len() > cap;
        let mut warnings = Vec::new();
        if outcome.heap_exhausted {
            warnings.push(format!(
                "JavaScript heap limit of {}MB reached",
                ctx.limits.max_memory_mb
            ));
        }
        let exit_code = if timed_out {
            TIMEOUT_EXIT_CODE
        } else if cancelled || outcome.heap_exhausted {
            KILLED_EXIT_CODE
        } else {
            outcome.exit_code
        };

        Ok(EngineOutput {
            stdout: decode_capped(outcome.stdout.into_bytes(), cap),
            stderr: decode_capped(outcome.stderr.into_bytes(), cap),
            exit_code,
            timed_out,
            cancelled,
            truncated,
            duration_ms: start.elapsed().as_millis() as u64,
            peak_memory_bytes: outcome
                .heap_used_bytes
                .max(counters.peak_heap_bytes.load(Ordering::Relaxed)),
            cpu_time_ms: counters.cpu_time_ms.load(Ordering::Relaxed),
            warnings,
        })
    }

    async fn release(&mut self) {}
}

fn run_isolate(
    code: String,
    inputs_json: String,
    max_bytes: usize,
    counters: Arc<IsolateCounters>,
    handle_tx: oneshot::Sender<v8::IsolateHandle>,
) -> IsolateOutcome {
    counters
        .cpu_start_ms
        .store(thread_cpu_ms(), Ordering::Relaxed);
    let initial_bytes = (max_bytes / 10).min(10 * 1024 * 1024);
    let mut runtime = JsRuntime::new(RuntimeOptions {
        create_params: Some(v8::CreateParams::default().heap_limits(initial_bytes, max_bytes)),
        ..Default::default()
    });

    let handle = runtime.v8_isolate().thread_safe_handle();
    let heap_exhausted = Arc::new(AtomicBool::new(false));
    {
        let handle = handle.clone();
        let heap_exhausted = heap_exhausted.clone();
        runtime.add_near_heap_limit_callback(move |current, _initial| {
            heap_exhausted.store(true, Ordering::SeqCst);
            handle.terminate_execution();
            // Headroom so termination can unwind
            current * 2
        });
    }
    // The caller only needs the handle to terminate a run in progress
    let _ = handle_tx.send(handle);

    let setup = format!(
        "globalThis.__codecellInputs = {};",
        serde_json::Value::String(inputs_json)
    );
    let mut stderr = String::new();
    let mut exit_code = 0;
    if let Err(err) = runtime
        .execute_script("<setup>", setup)
        .and_then(|_| runtime.execute_script("<prelude>", PRELUDE))
    {
        stderr.push_str(&format!("sandbox setup failed: {}\n", err));
        exit_code = 1;
    } else if let Err(err) = runtime.execute_script("<snippet>", code) {
        stderr.push_str(&format!("{}\n", err));
        exit_code = 1;
    }

    // Terminated isolates refuse to run anything until the flag is cleared
    runtime.v8_isolate().cancel_terminate_execution();
    let (stdout, captured_err) = collect_output(&mut runtime);
    counters.refresh(runtime.v8_isolate());
    let heap_used_bytes = counters.heap_used_bytes.load(Ordering::Relaxed);
    // Pending interrupts die with the isolate, before `counters` is released
    drop(runtime);

    IsolateOutcome {
        stdout,
        stderr: captured_err + &stderr,
        exit_code,
        heap_exhausted: heap_exhausted.load(Ordering::SeqCst),
        heap_used_bytes,
    }
}

fn collect_output(runtime: &mut JsRuntime) -> (String, String) {
    let Ok(global) = runtime.execute_script("<collect>", "globalThis.__codecellCollect()") else {
        return (String::new(), String::new());
    };
    let json = {
        let scope = &mut runtime.handle_scope();
        let local = v8::Local::new(scope, global);
        local.to_rust_string_lossy(scope)
    };
    serde_json::from_str(&json).unwrap_or_default()
}
