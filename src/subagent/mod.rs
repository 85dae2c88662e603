//! Delegated subagent tasks.
//!
//! A `task()` call runs one prompt inside the calling thread's sandbox under
//! a per-task deadline. Orchestration and execution run on separate bounded
//! pools, and a per-turn limiter rejects submissions beyond the cap.

mod executor;
mod limiter;
mod pool;
mod registry;
mod runner;

#[cfg(test)]
mod mock;

pub(crate) use executor::{SubagentExecutor, TaskEvent, TaskRequest};
pub(crate) use limiter::{LimiterPermit, SubagentLimiter};
pub(crate) use pool::WorkerPool;
pub(crate) use registry::{SubagentRegistry, SubagentSpec};
pub(crate) use runner::SubagentRunner;

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::sandbox::SandboxError;

/// Errors returned by `task()` before a task reaches a terminal status.
///
/// Timeouts are not errors: a timed-out task is a normal, reported result.
#[derive(Debug, thiserror::Error)]
pub(crate) enum SubagentError {
    #[error(
        "Subagent limit exceeded: {limit} tasks already running. \
         Wait for earlier tasks to finish before starting more."
    )]
    ConcurrencyLimit { limit: usize },

    #[error("Unknown subagent type '{name}'. Available: {available}")]
    UnknownSubagent { name: String, available: String },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("Task orchestration failed: {message}")]
    Orchestration { message: String },
}

impl SubagentError {
    pub fn concurrency_limit(limit: usize) -> Self {
        Self::ConcurrencyLimit { limit }
    }

    pub fn unknown_subagent(name: impl Into<String>, available: &[&str]) -> Self {
        Self::UnknownSubagent {
            name: name.into(),
            available: available.join(", "),
        }
    }

    pub fn is_concurrency_limit(&self) -> bool {
        matches!(self, Self::ConcurrencyLimit { .. })
    }

    pub fn is_unknown_subagent(&self) -> bool {
        matches!(self, Self::UnknownSubagent { .. })
    }
}

/// Lifecycle of a task. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        })
    }
}

/// One delegated unit of work, owned by its orchestration routine.
#[derive(Debug, Clone)]
pub(crate) struct SubagentTask {
    pub task_id: String,
    pub trace_id: String,
    pub subagent_type: String,
    pub prompt: String,
    pub description: String,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SubagentTask {
    pub fn new(
        task_id: impl Into<String>,
        trace_id: impl Into<String>,
        subagent_type: impl Into<String>,
        prompt: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            trace_id: trace_id.into(),
            subagent_type: subagent_type.into(),
            prompt: prompt.into(),
            description: description.into(),
            status: TaskStatus::Queued,
            result: None,
            error: None,
            started_at: None,
            deadline: None,
            completed_at: None,
        }
    }

    /// `queued -> running`; stamps the start time and deadline.
    pub fn start(&mut self, timeout: Duration) -> bool {
        if self.status != TaskStatus::Queued {
            return false;
        }
        let now = Utc::now();
        self.status = TaskStatus::Running;
        self.started_at = Some(now);
        self.deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| now.checked_add_signed(t));
        true
    }

    pub fn complete(&mut self, result: String) -> bool {
        self.finish(TaskStatus::Completed, Some(result), None)
    }

    pub fn fail(&mut self, error: String) -> bool {
        self.finish(TaskStatus::Failed, None, Some(error))
    }

    pub fn time_out(&mut self, timeout: Duration) -> bool {
        let error = format!("Execution timed out after {} seconds", timeout.as_secs());
        self.finish(TaskStatus::TimedOut, None, Some(error))
    }

    /// `running -> terminal`. A task holds exactly one of result or error.
    fn finish(&mut self, status: TaskStatus, result: Option<String>, error: Option<String>) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.status = status;
        self.result = result;
        self.error = error;
        self.completed_at = Some(Utc::now());
        true
    }

    /// The string handed back to the calling agent.
    pub fn render(&self) -> String {
        let prefix = format!("[Subagent: {}]", self.subagent_type);
        let error = self.error.as_deref().unwrap_or_default();
        match self.status {
            TaskStatus::Completed => format!(
                "{prefix} Task Succeeded. Result: {}",
                self.result.as_deref().unwrap_or_default()
            ),
            TaskStatus::Failed => format!("{prefix} Task failed. Error: {error}"),
            TaskStatus::TimedOut => format!("{prefix} Task timed out. Error: {error}"),
            status => format!("{prefix} Task is {status}"),
        }
    }
}
