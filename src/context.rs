//! Process-wide wiring: the sandbox provider and the subagent executor.
//!
//! Built once at startup and passed to whatever needs it.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::config::Config;
use crate::sandbox::{build_provider, SandboxInfo, SandboxProvider, SandboxStatus, SandboxTools};
use crate::subagent::{SubagentExecutor, SubagentRegistry, TaskEvent};

pub(crate) struct AppContext {
    config: Config,
    provider: Arc<dyn SandboxProvider>,
    executor: SubagentExecutor,
}

impl AppContext {
    pub async fn new(config: Config) -> Result<Self> {
        let provider = build_provider(&config)
            .await
            .context("Failed to set up the sandbox backend")?;
        let registry = SubagentRegistry::builtin(&config.subagents)?;
        let executor = SubagentExecutor::new(
            Arc::clone(&provider),
            registry,
            &config.subagents,
            config.sandbox.ready_timeout(),
        );
        Ok(Self {
            config,
            provider,
            executor,
        })
    }

    /// Streams subagent lifecycle events to `events`.
    pub fn with_task_events(mut self, events: UnboundedSender<TaskEvent>) -> Self {
        self.executor = self.executor.with_events(events);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn SandboxProvider> {
        &self.provider
    }

    pub fn executor(&self) -> &SubagentExecutor {
        &self.executor
    }

    /// Acquires the thread's sandbox and waits for it to be usable.
    pub async fn ready_sandbox(&self, thread_id: &str) -> Result<SandboxInfo> {
        let mut info = self
            .provider
            .acquire(thread_id)
            .await
            .with_context(|| format!("Failed to acquire a sandbox for thread '{thread_id}'"))?;
        if info.status != SandboxStatus::Running {
            debug!(sandbox_id = %info.sandbox_id, status = %info.status, "Waiting for sandbox");
            self.provider
                .wait_until_ready(&info.sandbox_id, self.config.sandbox.ready_timeout())
                .await?;
            info.status = SandboxStatus::Running;
        }
        Ok(info)
    }

    /// The full tool set on the thread's sandbox.
    pub async fn tools(&self, thread_id: &str) -> Result<SandboxTools> {
        let info = self.ready_sandbox(thread_id).await?;
        let sandbox = self
            .provider
            .sandbox(&info.sandbox_id)
            .await
            .with_context(|| format!("Sandbox {} is not tracked", info.sandbox_id))?;
        Ok(SandboxTools::new(sandbox))
    }
}
