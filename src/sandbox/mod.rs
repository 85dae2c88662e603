//! Per-thread sandboxes for agent tool execution.
//!
//! A [`Sandbox`] runs shell commands and file operations against one
//! thread's data, always addressed through virtual paths. A
//! [`SandboxProvider`] owns the lifecycle of sandboxes for a single backend:
//! the host itself, a Docker/Podman container, or a Kubernetes Pod created
//! through the provisioner service.

mod container;
mod error;
mod local;
mod managed;
pub(crate) mod path;
mod provisioned;
mod registry;
mod remote;
mod state;
mod tools;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{BackendKind, Config};

pub(crate) use container::ContainerBackend;
pub(crate) use error::{SandboxError, SandboxResult};
pub(crate) use local::LocalSandboxProvider;
pub(crate) use managed::ManagedSandboxProvider;
pub(crate) use provisioned::ProvisionedBackend;
pub(crate) use state::FileStateStore;
pub(crate) use tools::{SandboxTools, ToolName};

/// First delay between readiness polls.
const READY_POLL_INITIAL: Duration = Duration::from_millis(250);

/// Upper bound on the delay between readiness polls.
const READY_POLL_MAX: Duration = Duration::from_secs(5);

/// Maximum depth accepted by `list_dir`.
pub(crate) const MAX_LIST_DEPTH: usize = 2;

/// Lifecycle state of a sandbox as reported by its backend.
///
/// `Unknown` and `NotFound` are query-time states: the backend could not
/// confirm a status, or the sandbox no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SandboxStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
    NotFound,
}

impl SandboxStatus {
    /// Maps a Kubernetes Pod phase onto the status enum.
    pub fn from_phase(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// True once the sandbox can no longer become `Running`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::NotFound)
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
            Self::NotFound => "NotFound",
        };
        f.write_str(s)
    }
}

/// Descriptor of a sandbox bound to a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SandboxInfo {
    pub sandbox_id: String,
    pub thread_id: String,
    pub backend: BackendKind,
    /// Base URL of the sandbox API; absent for the local backend.
    pub endpoint: Option<String>,
    pub status: SandboxStatus,
}

/// Result of a shell command. A non-zero exit code is a normal result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CommandOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i64,
}

impl CommandOutput {
    /// Renders the output the way agents see it.
    pub fn render(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("Std Error:\n");
            out.push_str(&self.stderr);
        }
        if self.exit_code != 0 {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&format!("Exit Code: {}", self.exit_code));
        }
        if out.is_empty() {
            "(no output)".to_string()
        } else {
            out
        }
    }
}

/// Inclusive, 1-indexed line range for `read_file`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl LineRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Returns the selected lines joined with `\n`.
    pub fn slice(self, content: &str) -> String {
        let start = self.start.max(1);
        content
            .lines()
            .skip(start - 1)
            .take(self.end.saturating_add(1).saturating_sub(start))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One isolated execution environment, addressed through virtual paths.
#[async_trait]
pub(crate) trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    /// Runs a shell command after translating virtual paths in it.
    async fn execute_command(&self, command: &str) -> SandboxResult<CommandOutput>;

    async fn read_file(&self, path: &str, range: Option<LineRange>) -> SandboxResult<String>;

    /// Writes a file, creating parent directories. Readers never observe a
    /// partially written file.
    async fn write_file(&self, path: &str, content: &str, append: bool) -> SandboxResult<()>;

    /// Lists entries under `path` up to `depth` levels (capped at
    /// [`MAX_LIST_DEPTH`]). Directories end with `/`.
    async fn list_dir(&self, path: &str, depth: usize) -> SandboxResult<Vec<String>>;

    /// Replaces `old` with `new` and returns the number of replacements.
    async fn str_replace(&self, path: &str, old: &str, new: &str, all: bool) -> SandboxResult<usize> {
        let content = self.read_file(path, None).await?;
        let count = if old.is_empty() {
            0
        } else {
            content.matches(old).count()
        };
        if count == 0 {
            return Err(SandboxError::no_match(path));
        }
        if count > 1 && !all {
            return Err(SandboxError::ambiguous_match(path, count));
        }
        let updated = if all {
            content.replace(old, new)
        } else {
            content.replacen(old, new, 1)
        };
        self.write_file(path, &updated, false).await?;
        Ok(count)
    }
}

/// Acquires, looks up and releases sandboxes for one backend.
#[async_trait]
pub(crate) trait SandboxProvider: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Id that `acquire(thread_id)` binds to, derivable without creating anything.
    fn sandbox_id_for(&self, thread_id: &str) -> String {
        sandbox_id_for_thread(thread_id)
    }

    /// Returns the thread's sandbox, creating it on first use.
    async fn acquire(&self, thread_id: &str) -> SandboxResult<SandboxInfo>;

    /// Current status as reported by the backend.
    async fn get(&self, sandbox_id: &str) -> SandboxResult<SandboxStatus>;

    /// Handle for running operations against a tracked sandbox.
    async fn sandbox(&self, sandbox_id: &str) -> Option<Arc<dyn Sandbox>>;

    /// Tears a sandbox down. Releasing an absent sandbox succeeds.
    async fn release(&self, sandbox_id: &str) -> SandboxResult<()>;

    /// Releases every tracked sandbox. Safe to call more than once.
    async fn shutdown(&self);

    /// Polls `get` with exponential backoff until the sandbox is `Running`.
    async fn wait_until_ready(&self, sandbox_id: &str, max_wait: Duration) -> SandboxResult<()> {
        let deadline = Instant::now() + max_wait;
        let mut delay = READY_POLL_INITIAL;
        loop {
            let status = self.get(sandbox_id).await?;
            match status {
                SandboxStatus::Running => {
                    debug!(sandbox_id, "Sandbox is ready");
                    return Ok(());
                }
                SandboxStatus::Pending | SandboxStatus::Unknown => {}
                terminal => {
                    return Err(SandboxError::provisioning_with_status(
                        format!("sandbox {sandbox_id} is {terminal}"),
                        terminal,
                    ));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SandboxError::provisioning(format!(
                    "sandbox {sandbox_id} not ready after {}s (last status: {status})",
                    max_wait.as_secs()
                )));
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(READY_POLL_MAX);
        }
    }
}

/// Deterministic sandbox id for a thread: the first 8 hex chars of SHA-256.
///
/// Every process derives the same id, so a restarted process can find a
/// sandbox another process created.
pub(crate) fn sandbox_id_for_thread(thread_id: &str) -> String {
    Sha256::digest(thread_id.as_bytes())
        .iter()
        .take(4)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Builds the provider selected by `sandbox.backend`.
pub(crate) async fn build_provider(config: &Config) -> SandboxResult<Arc<dyn SandboxProvider>> {
    let paths = config.paths();
    let skills_dir = config.skills_dir(&paths);
    let sandbox = &config.sandbox;

    info!(backend = %sandbox.backend, base_dir = %paths.base_dir().display(), "Building sandbox provider");

    let provider: Arc<dyn SandboxProvider> = match sandbox.backend {
        BackendKind::Local => Arc::new(LocalSandboxProvider::new(
            paths,
            skills_dir,
            sandbox.command_timeout(),
        )),
        BackendKind::Container => {
            let backend = ContainerBackend::connect(sandbox, paths.clone(), skills_dir).await?;
            ManagedSandboxProvider::new(backend, paths, sandbox)
        }
        BackendKind::Provisioned => {
            let backend = ProvisionedBackend::new(&sandbox.provisioner_url)?;
            ManagedSandboxProvider::new(backend, paths, sandbox)
        }
    };
    Ok(provider)
}
