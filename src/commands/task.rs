//! `burrow task`: delegates one prompt to a subagent and waits for it.

use anyhow::Result;
use colored::Colorize;
use std::process::ExitCode;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::context::AppContext;
use crate::sandbox::ToolName;
use crate::subagent::{SubagentRegistry, SubagentTask, TaskEvent, TaskRequest, TaskStatus};

pub(crate) async fn run(
    ctx: AppContext,
    thread_id: &str,
    subagent_type: &str,
    description: &str,
    prompt: &str,
) -> Result<ExitCode> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ctx = ctx.with_task_events(tx);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            eprintln!("{}", format_event(&event));
        }
    });

    let executor = ctx.executor();
    executor.begin_turn();
    let request = TaskRequest::new(subagent_type, prompt, description);
    let task = executor.run(thread_id, request).await?;

    // Dropping the context closes the event channel so the printer drains.
    drop(ctx);
    let _ = printer.await;

    if let Some(elapsed) = elapsed(&task) {
        eprintln!("{} {} in {elapsed:.1}s", "⏲".dimmed(), task.status);
    }
    println!("{}", task.render());
    Ok(if task.status == TaskStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// `burrow agents`: the subagent types this config provides.
pub(crate) fn list(config: &Config) -> Result<()> {
    let registry = SubagentRegistry::builtin(&config.subagents)?;
    println!("Max concurrent tasks per turn: {}\n", config.subagents.max_concurrent);
    for spec in registry.specs() {
        let tools: Vec<&str> = ToolName::ALL
            .into_iter()
            .filter(|tool| {
                !spec.denied_tools.contains(tool)
                    && spec.allowed_tools.as_ref().map_or(true, |allow| allow.contains(tool))
            })
            .map(ToolName::as_str)
            .collect();
        println!("{}", spec.name.green().bold());
        println!("  {}", spec.description);
        println!("  Timeout: {}s", spec.timeout.as_secs());
        println!("  Tools:   {}", tools.join(", ").cyan());
    }
    Ok(())
}

/// Wall time of a finished task.
fn elapsed(task: &SubagentTask) -> Option<f64> {
    if !task.status.is_terminal() {
        return None;
    }
    let (start, end) = (task.started_at?, task.completed_at?);
    #[allow(clippy::cast_precision_loss)]
    Some((end - start).num_milliseconds() as f64 / 1000.0)
}

fn format_event(event: &TaskEvent) -> String {
    match event {
        TaskEvent::Started {
            task_id,
            trace_id,
            subagent_type,
            description,
        } => format!(
            "{} [{}] {} {} (trace {})",
            "▶".blue(),
            task_id.cyan(),
            subagent_type,
            description.dimmed(),
            trace_id
        ),
        TaskEvent::Completed { task_id, .. } => {
            format!("{} [{}] completed", "✓".green().bold(), task_id.cyan())
        }
        TaskEvent::Failed { task_id, error } => {
            format!("{} [{}] failed: {}", "✗".red().bold(), task_id.cyan(), error)
        }
        TaskEvent::TimedOut { task_id, error } => {
            format!("{} [{}] {}", "⏱".yellow(), task_id.cyan(), error)
        }
    }
}
