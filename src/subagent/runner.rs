//! What a subagent actually does with its prompt.
//!
//! Runners only see the filtered tool set of their subagent, so a runner can
//! never reach a tool its subagent was not granted.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::sandbox::path::USER_DATA_ROOT;
use crate::sandbox::{SandboxTools, ToolName};

/// Runs one task prompt against a sandbox.
#[async_trait]
pub(crate) trait SubagentRunner: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, task_id: &str, prompt: &str, tools: &SandboxTools) -> Result<String>;
}

fn require(tools: &SandboxTools, tool: ToolName) -> Result<()> {
    if tools.allows(tool) {
        Ok(())
    } else {
        bail!("Tool '{tool}' is not available to this subagent")
    }
}

/// Runs the prompt itself as a shell command.
pub(crate) struct ShellRunner;

#[async_trait]
impl SubagentRunner for ShellRunner {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn run(&self, task_id: &str, prompt: &str, tools: &SandboxTools) -> Result<String> {
        require(tools, ToolName::Bash)?;
        debug!(task_id, command = prompt, "Running shell task");
        let output = tools.sandbox().execute_command(prompt).await?;
        Ok(output.render())
    }
}

/// Pipes the prompt into an agent CLI running inside the sandbox.
///
/// The prompt is written to `/mnt/user-data/workspace/.subagents/<task_id>.md`
/// first, so it survives in the thread's workspace for inspection.
pub(crate) struct CommandAgentRunner {
    argv: Vec<String>,
}

impl CommandAgentRunner {
    pub fn new(command: &str) -> Result<Self> {
        let argv = shell_words::split(command)
            .with_context(|| format!("Invalid agent command: {command}"))?;
        if argv.is_empty() {
            bail!("Agent command is empty");
        }
        Ok(Self { argv })
    }

    pub fn prompt_path(task_id: &str) -> String {
        format!("{USER_DATA_ROOT}/workspace/.subagents/{task_id}.md")
    }

    fn command_line(&self, prompt_path: &str) -> String {
        format!(
            "cd {USER_DATA_ROOT}/workspace && {} < {}",
            shell_words::join(&self.argv),
            shell_words::quote(prompt_path)
        )
    }
}

#[async_trait]
impl SubagentRunner for CommandAgentRunner {
    fn name(&self) -> &'static str {
        "agent-command"
    }

    async fn run(&self, task_id: &str, prompt: &str, tools: &SandboxTools) -> Result<String> {
        require(tools, ToolName::Bash)?;
        let sandbox = tools.sandbox();

        let prompt_path = Self::prompt_path(task_id);
        sandbox
            .write_file(&prompt_path, prompt, false)
            .await
            .context("Failed to write task prompt")?;

        let command = self.command_line(&prompt_path);
        info!(task_id, agent = %self.argv[0], "Running agent command");
        let output = sandbox.execute_command(&command).await?;

        if output.exit_code != 0 {
            warn!(task_id, exit_code = output.exit_code, stderr = %output.stderr, "Agent command failed");
            if output.exit_code == 127 {
                bail!(
                    "Agent command '{}' not found in the sandbox. \
                     Set [subagents] agent_command in burrow.toml.",
                    self.argv[0]
                );
            }
            bail!(
                "Agent exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            );
        }

        let response = output.stdout.trim();
        if response.is_empty() {
            Ok("No response generated".to_string())
        } else {
            Ok(response.to_string())
        }
    }
}
