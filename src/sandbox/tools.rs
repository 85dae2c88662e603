//! Agent-facing tool surface over a [`Sandbox`].
//!
//! Every tool returns a plain string. Failures are rendered as
//! `Error: ...` so an agent never sees a raw transport error.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use super::{LineRange, Sandbox, MAX_LIST_DEPTH};

/// Named tools an agent can be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum ToolName {
    Bash,
    Ls,
    ReadFile,
    WriteFile,
    StrReplace,
    Task,
}

impl ToolName {
    pub const ALL: [Self; 6] = [
        Self::Bash,
        Self::Ls,
        Self::ReadFile,
        Self::WriteFile,
        Self::StrReplace,
        Self::Task,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bash => "bash",
            Self::Ls => "ls",
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::StrReplace => "str_replace",
            Self::Task => "task",
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown tool: {s}"))
    }
}

/// Sandbox tools bound to one thread's sandbox, filtered by an allowlist.
#[derive(Clone)]
pub(crate) struct SandboxTools {
    sandbox: Arc<dyn Sandbox>,
    allowed: BTreeSet<ToolName>,
}

impl SandboxTools {
    /// Grants every tool.
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            sandbox,
            allowed: ToolName::ALL.into_iter().collect(),
        }
    }

    /// Narrows the grant. `None` keeps the current allowlist.
    pub fn restrict(mut self, allow: Option<&[ToolName]>, deny: &[ToolName]) -> Self {
        if let Some(allow) = allow {
            self.allowed.retain(|t| allow.contains(t));
        }
        self.allowed.retain(|t| !deny.contains(t));
        self
    }

    pub fn allows(&self, tool: ToolName) -> bool {
        self.allowed.contains(&tool)
    }

    pub fn allowed(&self) -> impl Iterator<Item = ToolName> + '_ {
        self.allowed.iter().copied()
    }

    pub fn sandbox(&self) -> &Arc<dyn Sandbox> {
        &self.sandbox
    }

    fn check(&self, tool: ToolName) -> Result<(), String> {
        if self.allows(tool) {
            Ok(())
        } else {
            Err(format!("Error: Tool '{tool}' is not available to this agent"))
        }
    }

    pub async fn bash(&self, command: &str) -> String {
        if let Err(denied) = self.check(ToolName::Bash) {
            return denied;
        }
        debug!(sandbox_id = %self.sandbox.id(), command, "bash");
        match self.sandbox.execute_command(command).await {
            Ok(output) => output.render(),
            Err(e) => format!("Error: {e}"),
        }
    }

    pub async fn ls(&self, path: &str) -> String {
        if let Err(denied) = self.check(ToolName::Ls) {
            return denied;
        }
        match self.sandbox.list_dir(path, MAX_LIST_DEPTH).await {
            Ok(entries) if entries.is_empty() => "(empty)".to_string(),
            Ok(entries) => entries.join("\n"),
            Err(e) => format!("Error: {e}"),
        }
    }

    pub async fn read_file(&self, path: &str, start_line: Option<usize>, end_line: Option<usize>) -> String {
        if let Err(denied) = self.check(ToolName::ReadFile) {
            return denied;
        }
        let range = match (start_line, end_line) {
            (None, None) => None,
            (start, end) => Some(LineRange::new(start.unwrap_or(1), end.unwrap_or(usize::MAX))),
        };
        match self.sandbox.read_file(path, range).await {
            Ok(content) if content.is_empty() => "(empty)".to_string(),
            Ok(content) => content,
            Err(e) => format!("Error: {e}"),
        }
    }

    pub async fn write_file(&self, path: &str, content: &str, append: bool) -> String {
        if let Err(denied) = self.check(ToolName::WriteFile) {
            return denied;
        }
        match self.sandbox.write_file(path, content, append).await {
            Ok(()) => "OK".to_string(),
            Err(e) => format!("Error: {e}"),
        }
    }

    pub async fn str_replace(&self, path: &str, old: &str, new: &str, all: bool) -> String {
        if let Err(denied) = self.check(ToolName::StrReplace) {
            return denied;
        }
        match self.sandbox.str_replace(path, old, new, all).await {
            Ok(_) => "OK".to_string(),
            Err(e) => format!("Error: {e}"),
        }
    }
}
