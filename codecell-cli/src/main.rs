mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use codecell_sandbox::{Language, ResourceLimits};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "codecell")]
#[command(about = "Validate and run untrusted code snippets inside resource limits")]
#[command(version)]
pub struct Cli {
    /// Configuration file (defaults to the platform config dir)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate and execute a snippet
    Run {
        /// Source file, or `-` for stdin
        file: PathBuf,

        /// Snippet language (python, javascript, typescript, shell)
        #[arg(short, long)]
        language: Language,

        /// Line fed to the program's stdin (repeatable)
        #[arg(short, long = "input")]
        inputs: Vec<String>,

        #[command(flatten)]
        limits: LimitArgs,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate a snippet without running it
    Validate {
        /// Source file, or `-` for stdin
        file: PathBuf,

        /// Snippet language (python, javascript, typescript, shell)
        #[arg(short, long)]
        language: Language,

        #[command(flatten)]
        capabilities: CapabilityArgs,
    },
    /// Show which execution engines are available
    Engines,
    /// Print the capability policy string
    Csp {
        #[command(flatten)]
        capabilities: CapabilityArgs,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args, Debug, Default)]
pub struct LimitArgs {
    /// Memory limit in MB
    #[arg(long)]
    pub max_memory_mb: Option<u64>,

    /// Wall-clock limit in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// CPU time budget in milliseconds
    #[arg(long)]
    pub max_cpu_ms: Option<u64>,

    /// Output cap in bytes
    #[arg(long)]
    pub max_output: Option<usize>,

    #[command(flatten)]
    pub capabilities: CapabilityArgs,
}

impl LimitArgs {
    /// Overlay the flags that were given on top of `base`
    pub fn apply(&self, base: &ResourceLimits) -> ResourceLimits {
        let mut limits = self.capabilities.apply(base);
        if let Some(mb) = self.max_memory_mb {
            limits.max_memory_mb = mb;
        }
        if let Some(ms) = self.timeout_ms {
            limits.max_execution_time_ms = ms;
        }
        if let Some(ms) = self.max_cpu_ms {
            limits.max_cpu_time_ms = ms;
        }
        if let Some(bytes) = self.max_output {
            limits.max_output_size = bytes;
        }
        limits
    }
}

#[derive(Args, Debug, Default, Clone, Copy)]
pub struct CapabilityArgs {
    /// Allow network access
    #[arg(long)]
    pub allow_network: bool,

    /// Allow filesystem writes
    #[arg(long)]
    pub allow_fs: bool,
}

impl CapabilityArgs {
    pub fn apply(&self, base: &ResourceLimits) -> ResourceLimits {
        let mut limits = base.clone();
        limits.enable_network_access |= self.allow_network;
        limits.enable_file_system_access |= self.allow_fs;
        limits
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let guard = init_tracing(cli.verbose, cli.log_file.as_deref())?;

    let runtime = tokio::runtime::Runtime::new()?;
    let code = runtime.block_on(dispatch(cli))?;

    // Flush the file writer before exiting with the program's code
    drop(runtime);
    drop(guard);
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            file,
            language,
            inputs,
            limits,
            json,
        } => commands::execute_run(config, &file, language, inputs, &limits, json).await,
        Commands::Validate {
            file,
            language,
            capabilities,
        } => commands::execute_validate(&config, &file, language, capabilities),
        Commands::Engines => commands::execute_engines(config).await,
        Commands::Csp { capabilities } => commands::execute_csp(&config, capabilities),
        Commands::Config => commands::execute_config(&config),
    }
}

fn init_tracing(
    verbose: bool,
    log_file: Option<&std::path::Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let log_level = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "codecell={},codecell_sandbox={}",
            log_level, log_level
        ))
    });

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("Invalid log file path: {}", path.display()))?;
            let file_appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true),
        )
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from([
            "codecell",
            "run",
            "-",
            "--language",
            "py",
            "--input",
            "a",
            "--input",
            "b",
            "--timeout-ms",
            "500",
            "--allow-fs",
            "--verbose",
        ]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Run {
                language,
                inputs,
                limits,
                json,
                ..
            } => {
                assert_eq!(language, Language::Python);
                assert_eq!(inputs, vec!["a", "b"]);
                assert!(!json);
                let applied = limits.apply(&ResourceLimits::default());
                assert_eq!(applied.max_execution_time_ms, 500);
                assert!(applied.enable_file_system_access);
                assert!(!applied.enable_network_access);
                assert_eq!(applied.max_memory_mb, ResourceLimits::default().max_memory_mb);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_rejects_unknown_language() {
        let parsed = Cli::try_parse_from(["codecell", "validate", "x.rb", "--language", "ruby"]);
        assert!(parsed.is_err());
    }
}
