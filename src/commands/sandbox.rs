//! `burrow sandbox`: lifecycle of a thread's sandbox.

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use tracing::warn;

use super::ThreadArg;
use crate::context::AppContext;
use crate::sandbox::{FileStateStore, SandboxStatus};

/// Sandbox lifecycle actions.
#[derive(Subcommand, Debug)]
pub enum SandboxAction {
    /// Create the thread's sandbox, or reuse the existing one
    Acquire {
        #[command(flatten)]
        target: ThreadArg,

        /// Block until the sandbox is running
        #[arg(long)]
        wait: bool,
    },

    /// Show the thread's sandbox and its backend status
    Status {
        #[command(flatten)]
        target: ThreadArg,
    },

    /// Tear the thread's sandbox down
    Release {
        #[command(flatten)]
        target: ThreadArg,
    },
}

pub(crate) async fn run(ctx: &AppContext, action: SandboxAction) -> Result<()> {
    match action {
        SandboxAction::Acquire { target, wait } => {
            let thread_id = target.thread.as_str();
            let info = if wait {
                ctx.ready_sandbox(thread_id).await?
            } else {
                ctx.provider().acquire(thread_id).await?
            };
            println!(
                "{} Sandbox {} for thread {} ({})",
                "✓".green().bold(),
                info.sandbox_id.cyan(),
                thread_id.cyan(),
                colored_status(info.status)
            );
            if let Some(endpoint) = &info.endpoint {
                println!("  Endpoint: {}", endpoint.cyan());
            }
        }
        SandboxAction::Status { target } => status(ctx, &target.thread).await?,
        SandboxAction::Release { target } => {
            let thread_id = target.thread.as_str();
            let provider = ctx.provider();
            let sandbox_id = provider.sandbox_id_for(thread_id);
            provider.release(&sandbox_id).await?;
            // The binding may belong to another process's registry.
            if let Err(e) = FileStateStore::new(ctx.config().paths()).remove(thread_id) {
                warn!(thread_id, error = %e, "Failed to remove sandbox state");
            }
            println!("{} Released sandbox {}", "✓".green().bold(), sandbox_id.cyan());
        }
    }
    Ok(())
}

async fn status(ctx: &AppContext, thread_id: &str) -> Result<()> {
    let provider = ctx.provider();
    let sandbox_id = provider.sandbox_id_for(thread_id);
    let status = provider.get(&sandbox_id).await?;
    let saved = FileStateStore::new(ctx.config().paths()).load(thread_id)?;

    println!("\n{}", "━".repeat(50).dimmed());
    println!("  Thread:   {}", thread_id.cyan());
    println!("  Sandbox:  {}", sandbox_id.cyan());
    println!("  Backend:  {}", provider.backend().to_string().cyan());
    println!("  Status:   {}", colored_status(status));
    if let Some(saved) = saved {
        if let Some(url) = &saved.sandbox_url {
            println!("  Endpoint: {}", url.cyan());
        }
        println!(
            "  Bound:    {}",
            saved
                .saved_at
                .format("%Y-%m-%d %H:%M:%S UTC")
                .to_string()
                .cyan()
        );
    }
    println!("{}", "━".repeat(50).dimmed());
    if status.is_terminal() && status != SandboxStatus::NotFound {
        println!(
            "  Run {} to replace it.",
            format!("burrow sandbox release --thread {thread_id}").green()
        );
    }
    Ok(())
}

fn colored_status(status: SandboxStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        SandboxStatus::Running => text.green().bold(),
        SandboxStatus::Pending | SandboxStatus::Unknown => text.yellow(),
        SandboxStatus::Succeeded => text.normal(),
        SandboxStatus::Failed | SandboxStatus::NotFound => text.red(),
    }
}
