//! Engine registry with explicit readiness

use crate::config::{InterpreterSettings, JavaScriptBackend};
use crate::error::SandboxError;
use crate::runtime::{
    ExecutionEngine, JavaScriptEngine, PythonEngine, ShellEngine, TypeScriptEngine,
};
#[cfg(feature = "v8")]
use crate::runtime::V8JavaScriptEngine;
use crate::types::Language;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

const READINESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds a fresh engine for every execution
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn ExecutionEngine> + Send + Sync>;

/// Whether an engine can be allocated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "reason")]
pub enum EngineReadiness {
    /// Readiness check has not run yet
    Pending,
    Ready,
    Unavailable(String),
}

impl fmt::Display for EngineReadiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineReadiness::Pending => f.write_str("pending"),
            EngineReadiness::Ready => f.write_str("ready"),
            EngineReadiness::Unavailable(reason) => write!(f, "unavailable ({})", reason),
        }
    }
}

/// Command that proves an interpreter is installed
#[derive(Debug, Clone)]
struct ReadinessCheck {
    program: String,
    args: Vec<&'static str>,
}

struct Entry {
    factory: EngineFactory,
    check: Option<ReadinessCheck>,
    readiness: EngineReadiness,
}

/// Per-language engine factories
pub struct EngineRegistry {
    entries: RwLock<BTreeMap<Language, Entry>>,
    shut_down: AtomicBool,
}

impl EngineRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Registry with the built-in interpreter engines, all pending until
    /// [`initialize`](Self::initialize) runs
    pub fn with_defaults(settings: &InterpreterSettings) -> Self {
        let registry = Self::new();

        let python = settings.python.clone();
        registry.insert_checked(
            Language::Python,
            move || Box::new(PythonEngine::new(python.clone())),
            ReadinessCheck {
                program: settings.python.clone(),
                args: vec!["--version"],
            },
        );

        match settings.javascript_backend {
            JavaScriptBackend::Node => {
                let node = settings.node.clone();
                registry.insert_checked(
                    Language::JavaScript,
                    move || Box::new(JavaScriptEngine::new(node.clone())),
                    ReadinessCheck {
                        program: settings.node.clone(),
                        args: vec!["--version"],
                    },
                );
            }
            #[cfg(feature = "v8")]
            JavaScriptBackend::V8 => {
                registry.register(Language::JavaScript, || {
                    Box::new(V8JavaScriptEngine::new())
                });
            }
            #[cfg(not(feature = "v8"))]
            JavaScriptBackend::V8 => {
                tracing::warn!("V8 backend requested without the v8 feature; JavaScript disabled");
            }
        }

        let deno = settings.deno.clone();
        registry.insert_checked(
            Language::TypeScript,
            move || Box::new(TypeScriptEngine::new(deno.clone())),
            ReadinessCheck {
                program: settings.deno.clone(),
                args: vec!["--version"],
            },
        );

        let shell = settings.shell.clone();
        registry.insert_checked(
            Language::Shell,
            move || Box::new(ShellEngine::new(shell.clone())),
            ReadinessCheck {
                program: settings.shell.clone(),
                // POSIX shells do not agree on --version
                args: vec!["-c", "exit 0"],
            },
        );

        registry
    }

    /// Install a custom factory. It is ready immediately and replaces any existing entry.
    pub fn register<F>(&self, language: Language, factory: F)
    where
        F: Fn() -> Box<dyn ExecutionEngine> + Send + Sync + 'static,
    {
        tracing::debug!(%language, "Registered execution engine");
        self.write().insert(
            language,
            Entry {
                factory: Arc::new(factory),
                check: None,
                readiness: EngineReadiness::Ready,
            },
        );
    }

    fn insert_checked<F>(&self, language: Language, factory: F, check: ReadinessCheck)
    where
        F: Fn() -> Box<dyn ExecutionEngine> + Send + Sync + 'static,
    {
        self.write().insert(
            language,
            Entry {
                factory: Arc::new(factory),
                check: Some(check),
                readiness: EngineReadiness::Pending,
            },
        );
    }

    /// Run every pending readiness check concurrently
    pub async fn initialize(&self) -> BTreeMap<Language, EngineReadiness> {
        let pending: Vec<(Language, ReadinessCheck)> = self
            .read()
            .iter()
            .filter(|(_, entry)| entry.readiness == EngineReadiness::Pending)
            .filter_map(|(language, entry)| entry.check.clone().map(|check| (*language, check)))
            .collect();

        let checks = pending.into_iter().map(|(language, check)| async move {
            (language, run_check(&check).await)
        });
        let results = futures::future::join_all(checks).await;

        {
            let mut entries = self.write();
            for (language, readiness) in results {
                match &readiness {
                    EngineReadiness::Ready => tracing::info!(%language, "Execution engine ready"),
                    other => {
                        tracing::warn!(
                            %language,
                            readiness = %other,
                            "Execution engine unavailable"
                        )
                    }
                }
                if let Some(entry) = entries.get_mut(&language) {
                    entry.readiness = readiness;
                }
            }
        }
        self.snapshot()
    }

    /// Allocate a fresh engine
    pub fn create(&self, language: Language) -> Result<Box<dyn ExecutionEngine>> {
        if self.is_shut_down() {
            return Err(SandboxError::RegistryShutDown);
        }
        let entries = self.read();
        let entry = entries
            .get(&language)
            .ok_or(SandboxError::UnsupportedLanguage(language))?;
        match &entry.readiness {
            EngineReadiness::Ready => Ok((entry.factory)()),
            EngineReadiness::Pending => Err(SandboxError::EngineNotReady(language)),
            EngineReadiness::Unavailable(reason) => {
                Err(SandboxError::EngineUnavailable(language, reason.clone()))
            }
        }
    }

    pub fn readiness(&self, language: Language) -> Option<EngineReadiness> {
        self.read().get(&language).map(|e| e.readiness.clone())
    }

    /// Readiness of every registered language
    pub fn snapshot(&self) -> BTreeMap<Language, EngineReadiness> {
        self.read()
            .iter()
            .map(|(language, entry)| (*language, entry.readiness.clone()))
            .collect()
    }

    pub fn languages(&self) -> Vec<Language> {
        self.read().keys().copied().collect()
    }

    /// Stop handing out engines
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            tracing::info!("Engine registry shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<Language, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<Language, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.snapshot())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

async fn run_check(check: &ReadinessCheck) -> EngineReadiness {
    let mut cmd = tokio::process::Command::new(&check.program);
    cmd.args(&check.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(READINESS_TIMEOUT, cmd.status()).await {
        Ok(Ok(status)) if status.success() => EngineReadiness::Ready,
        Ok(Ok(status)) => EngineReadiness::Unavailable(format!(
            "`{} {}` exited with {}",
            check.program,
            check.args.join(" "),
            status
        )),
        Ok(Err(err)) => {
            EngineReadiness::Unavailable(format!("cannot run '{}': {}", check.program, err))
        }
        Err(_) => EngineReadiness::Unavailable(format!(
            "'{}' did not answer within {:?}",
            check.program, READINESS_TIMEOUT
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{EngineOutput, ExecutionContext};
    use assert_matches::assert_matches;
    use async_trait::async_trait;

    impl std::fmt::Debug for dyn ExecutionEngine {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ExecutionEngine")
                .field("language", &self.language())
                .field("name", &self.name())
                .finish()
        }
    }

    struct NoopEngine;

    #[async_trait]
    impl ExecutionEngine for NoopEngine {
        fn language(&self) -> Language {
            Language::Python
        }

        fn name(&self) -> &str {
            "noop"
        }

        async fn execute(
            &mut self,
            _code: &str,
            _inputs: &[String],
            _ctx: &ExecutionContext,
        ) -> Result<EngineOutput> {
            Ok(EngineOutput::default())
        }

        async fn release(&mut self) {}
    }

    #[test]
    fn test_registered_engine_ready_immediately() {
        let registry = EngineRegistry::new();
        registry.register(Language::Python, || Box::new(NoopEngine));
        assert_eq!(registry.readiness(Language::Python), Some(EngineReadiness::Ready));
        assert_eq!(registry.create(Language::Python).unwrap().name(), "noop");
        assert_matches!(
            registry.create(Language::Shell),
            Err(SandboxError::UnsupportedLanguage(Language::Shell))
        );
    }

    #[test]
    fn test_defaults_pending_until_initialized() {
        let registry = EngineRegistry::with_defaults(&InterpreterSettings::default());
        assert_eq!(registry.languages(), Language::ALL.to_vec());
        assert_matches!(
            registry.create(Language::Shell),
            Err(SandboxError::EngineNotReady(Language::Shell))
        );
    }

    #[tokio::test]
    async fn test_initialize_checks_interpreters() {
        let settings = InterpreterSettings {
            python: "/nonexistent/python3".to_string(),
            ..Default::default()
        };
        let registry = EngineRegistry::with_defaults(&settings);
        let readiness = registry.initialize().await;

        assert_eq!(readiness[&Language::Shell], EngineReadiness::Ready);
        assert_matches!(readiness[&Language::Python], EngineReadiness::Unavailable(_));
        assert_matches!(
            registry.create(Language::Python),
            Err(SandboxError::EngineUnavailable(Language::Python, _))
        );
        assert_eq!(registry.create(Language::Shell).unwrap().language(), Language::Shell);
    }

    #[test]
    fn test_shutdown_stops_allocation() {
        let registry = EngineRegistry::new();
        registry.register(Language::Python, || Box::new(NoopEngine));
        registry.shutdown();
        registry.shutdown();
        assert_matches!(
            registry.create(Language::Python),
            Err(SandboxError::RegistryShutDown)
        );
    }

    #[test]
    fn test_readiness_serialization() {
        let json = serde_json::to_string(&EngineReadiness::Unavailable("missing".into())).unwrap();
        assert_eq!(json, r#"{"state":"unavailable","reason":"missing"}"#);
    }
}
