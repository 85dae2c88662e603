use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths::Paths;

pub(crate) const CONFIG_FILE: &str = "burrow.toml";

/// Image serving the sandbox HTTP API on port 8080.
pub(crate) const DEFAULT_SANDBOX_IMAGE: &str = "ghcr.io/agent-infra/sandbox:latest";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub subagents: SubagentsConfig,
}

/// Where thread data and skills live on the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Base directory for thread data (default: `$BURROW_HOME` or `~/.burrow`)
    #[serde(default)]
    pub base_dir: Option<String>,

    /// Shared skills directory mounted read-only at `/mnt/skills`
    /// (default: `{base_dir}/skills`)
    #[serde(default)]
    pub skills_dir: Option<String>,
}

/// Which sandbox backend serves `acquire`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Local,
    Container,
    Provisioned,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Container => write!(f, "container"),
            Self::Provisioned => write!(f, "provisioned"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Backend: "local", "container" or "provisioned"
    #[serde(default)]
    pub backend: BackendKind,

    /// Sandbox image for the container backend
    #[serde(default = "default_image")]
    pub image: String,

    /// HTTP port the sandbox image listens on inside the container
    #[serde(default = "default_port")]
    pub port: u16,

    /// Container name prefix
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,

    /// Release sandboxes idle for longer than this (0 disables the reaper)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How long `wait_until_ready` polls before giving up
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// Wall-clock limit for a single local command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Provisioner Service base URL for the provisioned backend
    #[serde(default = "default_provisioner_url")]
    pub provisioner_url: String,

    /// Additional volume mounts for the container backend
    #[serde(default)]
    pub mounts: Vec<Mount>,

    /// Extra environment variables for the container backend
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Resource limits for the container backend
    #[serde(default)]
    pub resources: ResourceConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            image: default_image(),
            port: default_port(),
            container_prefix: default_container_prefix(),
            idle_timeout_secs: default_idle_timeout(),
            ready_timeout_secs: default_ready_timeout(),
            command_timeout_secs: default_command_timeout(),
            provisioner_url: default_provisioner_url(),
            mounts: Vec::new(),
            environment: BTreeMap::new(),
            resources: ResourceConfig::default(),
        }
    }
}

impl SandboxConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub host: String,
    pub container: String,
    #[serde(default = "default_true")]
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Memory limit (e.g., "8g")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit (e.g., "4")
    #[serde(default = "default_cpus")]
    pub cpus: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpus: default_cpus(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentsConfig {
    /// Default per-task deadline in seconds
    #[serde(default = "default_task_timeout")]
    pub timeout_seconds: u64,

    /// Maximum in-flight tasks per turn
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Orchestration pool size
    #[serde(default = "default_scheduler_workers")]
    pub scheduler_workers: usize,

    /// Execution pool size
    #[serde(default = "default_execution_workers")]
    pub execution_workers: usize,

    /// Command run inside the sandbox by the general-purpose subagent.
    /// The prompt file is piped to its stdin.
    #[serde(default = "default_agent_command")]
    pub agent_command: String,

    /// Per-agent overrides, keyed by subagent type
    #[serde(default)]
    pub agents: BTreeMap<String, AgentOverride>,
}

impl Default for SubagentsConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_task_timeout(),
            max_concurrent: default_max_concurrent(),
            scheduler_workers: default_scheduler_workers(),
            execution_workers: default_execution_workers(),
            agent_command: default_agent_command(),
            agents: BTreeMap::new(),
        }
    }
}

impl SubagentsConfig {
    /// Effective timeout for an agent: its override, else the global default.
    pub fn timeout_for(&self, agent: &str) -> Duration {
        let secs = self
            .agents
            .get(agent)
            .and_then(|o| o.timeout_seconds)
            .unwrap_or(self.timeout_seconds);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOverride {
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_image() -> String {
    DEFAULT_SANDBOX_IMAGE.to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_container_prefix() -> String {
    "burrow-sandbox".to_string()
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_ready_timeout() -> u64 {
    60
}

fn default_command_timeout() -> u64 {
    600
}

fn default_provisioner_url() -> String {
    "http://provisioner:8002".to_string()
}

fn default_memory() -> String {
    "1g".to_string()
}

fn default_cpus() -> String {
    "1".to_string()
}

fn default_task_timeout() -> u64 {
    300
}

fn default_max_concurrent() -> usize {
    3
}

fn default_scheduler_workers() -> usize {
    3
}

fn default_execution_workers() -> usize {
    8
}

fn default_agent_command() -> String {
    "claude -p --dangerously-skip-permissions".to_string()
}

impl Config {
    /// Load configuration from file, using defaults if not found
    pub fn load(project_dir: &Path) -> Result<Self> {
        Self::load_file(&project_dir.join(CONFIG_FILE))
    }

    /// Load a specific config file, using defaults if it does not exist
    pub fn load_file(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }

    /// Host path layout, honouring `paths.base_dir` before the environment.
    pub fn paths(&self) -> Paths {
        match &self.paths.base_dir {
            Some(dir) => Paths::new(dir),
            None => Paths::from_env(),
        }
    }

    /// Host directory mounted read-only at `/mnt/skills`.
    pub fn skills_dir(&self, paths: &Paths) -> PathBuf {
        match &self.paths.skills_dir {
            Some(dir) => PathBuf::from(dir),
            None => paths.base_dir().join("skills"),
        }
    }
}
