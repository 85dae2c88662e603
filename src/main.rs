use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

mod commands;
mod config;
mod context;
mod paths;
mod provisioner;
mod sandbox;
mod subagent;
mod templates;

use commands::ThreadArg;
use config::Config;
use context::AppContext;

#[derive(Parser)]
#[command(name = "burrow")]
#[command(
    author,
    version,
    about = "Per-thread sandboxes and bounded subagent tasks for AI agents"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Config file (default: ./burrow.toml if present)
    #[arg(short, long, global = true, env = "BURROW_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default burrow.toml in the current directory
    Init {
        /// Force overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Run a shell command in the thread's sandbox
    Exec {
        #[command(flatten)]
        target: ThreadArg,

        /// Command and arguments; a single argument is run as a shell line
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    #[command(flatten)]
    Files(commands::files::FileAction),

    /// Manage the thread's sandbox
    Sandbox {
        #[command(subcommand)]
        action: commands::sandbox::SandboxAction,
    },

    /// Delegate a prompt to a subagent and wait for its result
    Task {
        #[command(flatten)]
        target: ThreadArg,

        /// Subagent type
        #[arg(long = "type", default_value = "general-purpose")]
        subagent_type: String,

        /// Short description shown in progress output
        #[arg(short, long, default_value = "")]
        description: String,

        prompt: String,
    },

    /// List the available subagent types
    Agents,

    /// Run the sandbox provisioner service
    Provisioner(commands::provisioner::ProvisionerArgs),
}

/// Installs the global subscriber. The guard must outlive `main`'s work
/// or buffered file lines are lost.
fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let filter = if cli.verbose {
        EnvFilter::new("burrow=debug")
    } else {
        EnvFilter::new("burrow=info")
    };

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(match cli.log_format {
        LogFormat::Text => fmt::layer().with_writer(std::io::stderr).boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_timer(fmt::time::ChronoUtc::rfc_3339())
            .with_writer(std::io::stderr)
            .boxed(),
    });

    let guard = match &cli.log_file {
        Some(path) => {
            let (dir, name) = split_log_path(path)?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_timer(fmt::time::ChronoUtc::rfc_3339())
                .with_writer(writer);
            layers.push(match cli.log_format {
                LogFormat::Text => layer.boxed(),
                LogFormat::Json => layer.json().boxed(),
            });
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry().with(layers).with(filter).init();
    Ok(guard)
}

fn split_log_path(path: &Path) -> Result<(PathBuf, PathBuf)> {
    let Some(name) = path.file_name() else {
        bail!("--log-file must name a file: {}", path.display());
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    Ok((dir, PathBuf::from(name)))
}

fn load_config(explicit: Option<&Path>) -> Result<Config> {
    match explicit {
        Some(path) => {
            if !path.is_file() {
                bail!("Config file not found: {}", path.display());
            }
            Config::load_file(path)
        }
        None => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            Config::load(&cwd)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _guard = init_logging(&cli)?;

    let command = match cli.command {
        Commands::Init { force } => {
            commands::init::run(force)?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Provisioner(args) => {
            commands::provisioner::run(args).await?;
            return Ok(ExitCode::SUCCESS);
        }
        command => command,
    };

    let config = load_config(cli.config.as_deref())?;
    if let Commands::Agents = command {
        commands::task::list(&config)?;
        return Ok(ExitCode::SUCCESS);
    }
    let ctx = AppContext::new(config).await?;

    let code = match command {
        Commands::Exec { target, command } => {
            commands::exec::run(&ctx, &target.thread, &command).await?
        }
        Commands::Files(action) => {
            commands::files::run(&ctx, action).await?;
            ExitCode::SUCCESS
        }
        Commands::Sandbox { action } => {
            commands::sandbox::run(&ctx, action).await?;
            ExitCode::SUCCESS
        }
        Commands::Task {
            target,
            subagent_type,
            description,
            prompt,
        } => commands::task::run(ctx, &target.thread, &subagent_type, &description, &prompt).await?,
        Commands::Init { .. } | Commands::Provisioner(_) | Commands::Agents => ExitCode::SUCCESS,
    };

    Ok(code)
}
