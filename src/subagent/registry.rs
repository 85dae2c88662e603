//! Built-in subagent types and their tool grants.

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::runner::{CommandAgentRunner, ShellRunner, SubagentRunner};
use super::SubagentError;
use crate::config::SubagentsConfig;
use crate::sandbox::ToolName;

/// A subagent type: what it may touch, how long it may run, and how it runs.
#[derive(Clone)]
pub(crate) struct SubagentSpec {
    pub name: String,
    pub description: String,
    /// `None` grants every tool not denied.
    pub allowed_tools: Option<Vec<ToolName>>,
    pub denied_tools: Vec<ToolName>,
    pub timeout: Duration,
    pub runner: Arc<dyn SubagentRunner>,
}

impl std::fmt::Debug for SubagentSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubagentSpec")
            .field("name", &self.name)
            .field("allowed_tools", &self.allowed_tools)
            .field("denied_tools", &self.denied_tools)
            .field("timeout", &self.timeout)
            .field("runner", &self.runner.name())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SubagentRegistry {
    specs: BTreeMap<String, SubagentSpec>,
}

impl SubagentRegistry {
    /// `general-purpose` and `bash`, with timeouts from config.
    pub fn builtin(config: &SubagentsConfig) -> Result<Self> {
        let mut registry = Self::default();

        registry.register(SubagentSpec {
            name: "general-purpose".to_string(),
            description: "Capable agent for multi-step work that needs to read, \
                          write and run code in the thread's sandbox"
                .to_string(),
            allowed_tools: None,
            denied_tools: vec![ToolName::Task],
            timeout: config.timeout_for("general-purpose"),
            runner: Arc::new(CommandAgentRunner::new(&config.agent_command)?),
        });

        registry.register(SubagentSpec {
            name: "bash".to_string(),
            description: "Runs the prompt as a shell command in the thread's sandbox".to_string(),
            allowed_tools: Some(vec![
                ToolName::Bash,
                ToolName::Ls,
                ToolName::ReadFile,
                ToolName::WriteFile,
                ToolName::StrReplace,
            ]),
            denied_tools: vec![ToolName::Task],
            timeout: config.timeout_for("bash"),
            runner: Arc::new(ShellRunner),
        });

        Ok(registry)
    }

    /// Adds or replaces a subagent type.
    ///
    /// Nested delegation is never allowed, so `task` is always denied.
    pub fn register(&mut self, mut spec: SubagentSpec) {
        if !spec.denied_tools.contains(&ToolName::Task) {
            spec.denied_tools.push(ToolName::Task);
        }
        debug!(name = %spec.name, timeout_secs = spec.timeout.as_secs(), "Registered subagent");
        self.specs.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Result<&SubagentSpec, SubagentError> {
        self.specs
            .get(name)
            .ok_or_else(|| SubagentError::unknown_subagent(name, &self.names()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.specs.keys().map(String::as_str).collect()
    }

    pub fn specs(&self) -> impl Iterator<Item = &SubagentSpec> {
        self.specs.values()
    }
}
