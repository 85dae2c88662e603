//! Provider for sandboxes that live outside this process.
//!
//! The container and provisioned backends differ only in how a sandbox is
//! created, inspected and destroyed. Everything else lives here:
//!
//! 1. In-process cache, keyed by thread.
//! 2. Persisted `sandbox.json` plus backend discovery, so a restarted
//!    process re-adopts a live sandbox instead of creating a second one.
//! 3. Creation under the thread's lock.
//!
//! An idle reaper releases sandboxes nobody has used for a while.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::registry::SandboxRegistry;
use super::remote::HttpSandbox;
use super::state::{FileStateStore, PersistedSandbox};
use super::{
    sandbox_id_for_thread, Sandbox, SandboxInfo, SandboxProvider, SandboxResult, SandboxStatus,
};
use crate::config::{BackendKind, SandboxConfig};
use crate::paths::{validate_thread_id, Paths};

/// How often the reaper looks for idle sandboxes.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Where a backend sandbox can be reached and what state it is in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BackendSandbox {
    pub endpoint: String,
    pub status: SandboxStatus,
}

/// Lifecycle operations a managed backend must provide.
#[async_trait]
pub(crate) trait SandboxBackend: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    /// Starts a sandbox without waiting for it to become ready.
    /// Creating an id that already exists returns the existing sandbox.
    async fn create(&self, sandbox_id: &str, thread_id: &str) -> SandboxResult<BackendSandbox>;

    /// Finds a live sandbox created earlier, possibly by another process.
    async fn discover(&self, sandbox_id: &str) -> SandboxResult<Option<BackendSandbox>>;

    /// Current status. Errors collapse to `Unknown`.
    async fn status(&self, sandbox_id: &str) -> SandboxStatus;

    /// Tears a sandbox down. An absent sandbox is not an error.
    async fn destroy(&self, sandbox_id: &str) -> SandboxResult<()>;
}

pub(crate) struct ManagedSandboxProvider<B: SandboxBackend> {
    backend: B,
    registry: SandboxRegistry,
    store: FileStateStore,
    client: reqwest::Client,
    command_timeout: Duration,
    shut_down: AtomicBool,
    reaper: OnceLock<JoinHandle<()>>,
}

impl<B: SandboxBackend> ManagedSandboxProvider<B> {
    /// Creates the provider and starts the idle reaper when enabled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(backend: B, paths: Paths, config: &SandboxConfig) -> Arc<Self> {
        let provider = Arc::new(Self {
            backend,
            registry: SandboxRegistry::new(),
            store: FileStateStore::new(paths),
            client: reqwest::Client::new(),
            command_timeout: config.command_timeout(),
            shut_down: AtomicBool::new(false),
            reaper: OnceLock::new(),
        });

        if let Some(idle_timeout) = config.idle_timeout() {
            let handle = tokio::spawn(reap_idle(Arc::downgrade(&provider), idle_timeout));
            let _ = provider.reaper.set(handle);
            info!(
                idle_timeout_secs = idle_timeout.as_secs(),
                "Started idle sandbox reaper"
            );
        }
        provider
    }

    /// Releases sandboxes idle for longer than `idle_timeout`.
    pub async fn release_idle(&self, idle_timeout: Duration) -> usize {
        let mut released = 0;
        for sandbox_id in self.registry.idle(idle_timeout).await {
            info!(sandbox_id = %sandbox_id, "Releasing idle sandbox");
            match self.release(&sandbox_id).await {
                Ok(()) => released += 1,
                Err(e) => warn!(sandbox_id = %sandbox_id, error = %e, "Failed to release idle sandbox"),
            }
        }
        released
    }

    async fn adopt(&self, sandbox_id: &str, thread_id: &str, found: BackendSandbox) -> SandboxInfo {
        let info = SandboxInfo {
            sandbox_id: sandbox_id.to_string(),
            thread_id: thread_id.to_string(),
            backend: self.backend.kind(),
            endpoint: Some(found.endpoint.clone()),
            status: found.status,
        };
        let sandbox: Arc<dyn Sandbox> = Arc::new(HttpSandbox::new(
            sandbox_id,
            thread_id,
            &found.endpoint,
            self.client.clone(),
            self.command_timeout,
        ));
        self.registry.insert(info.clone(), sandbox).await;
        info
    }

    fn persist(&self, info: &SandboxInfo) {
        let state = PersistedSandbox::new(&info.sandbox_id, info.endpoint.as_deref(), info.backend);
        if let Err(e) = self.store.save(&info.thread_id, &state) {
            warn!(thread_id = %info.thread_id, error = %e, "Failed to save sandbox state");
        }
    }

    fn forget(&self, thread_id: &str) {
        if let Err(e) = self.store.remove(thread_id) {
            warn!(thread_id, error = %e, "Failed to remove sandbox state");
        }
    }

    /// Cache, then persisted state, then a fresh sandbox. Caller holds the
    /// thread lock.
    async fn acquire_locked(&self, thread_id: &str) -> SandboxResult<SandboxInfo> {
        if let Some(info) = self.registry.for_thread(thread_id).await {
            debug!(sandbox_id = %info.sandbox_id, thread_id, "Reusing sandbox");
            return Ok(info);
        }

        if let Some(info) = self.recover(thread_id).await {
            return Ok(info);
        }

        let sandbox_id = sandbox_id_for_thread(thread_id);
        let created = self.backend.create(&sandbox_id, thread_id).await?;
        let info = self.adopt(&sandbox_id, thread_id, created).await;
        self.persist(&info);
        info!(
            sandbox_id = %sandbox_id,
            thread_id,
            backend = %info.backend,
            status = %info.status,
            "Created sandbox"
        );
        Ok(info)
    }

    async fn release_locked(&self, sandbox_id: &str) -> SandboxResult<()> {
        self.backend.destroy(sandbox_id).await?;
        if let Some(info) = self.registry.remove(sandbox_id).await {
            self.forget(&info.thread_id);
        }
        info!(sandbox_id, "Released sandbox");
        Ok(())
    }

    /// Re-adopts a sandbox recorded by an earlier process, if it is still alive.
    async fn recover(&self, thread_id: &str) -> Option<SandboxInfo> {
        let persisted = match self.store.load(thread_id) {
            Ok(persisted) => persisted?,
            Err(e) => {
                warn!(thread_id, error = %e, "Ignoring unreadable sandbox state");
                self.forget(thread_id);
                return None;
            }
        };

        if persisted.backend != self.backend.kind() {
            debug!(thread_id, backend = %persisted.backend, "Persisted sandbox belongs to another backend");
            self.forget(thread_id);
            return None;
        }

        match self.backend.discover(&persisted.sandbox_id).await {
            Ok(Some(found)) => {
                let info = self.adopt(&persisted.sandbox_id, thread_id, found).await;
                if info.endpoint != persisted.sandbox_url {
                    self.persist(&info);
                }
                info!(sandbox_id = %info.sandbox_id, thread_id, "Recovered sandbox");
                Some(info)
            }
            Ok(None) => {
                info!(sandbox_id = %persisted.sandbox_id, thread_id, "Persisted sandbox is gone");
                self.forget(thread_id);
                None
            }
            Err(e) => {
                warn!(sandbox_id = %persisted.sandbox_id, error = %e, "Sandbox discovery failed");
                None
            }
        }
    }
}

#[async_trait]
impl<B: SandboxBackend> SandboxProvider for ManagedSandboxProvider<B> {
    fn backend(&self) -> BackendKind {
        self.backend.kind()
    }

    async fn acquire(&self, thread_id: &str) -> SandboxResult<SandboxInfo> {
        validate_thread_id(thread_id)?;

        let key = sandbox_id_for_thread(thread_id);
        let lock = self.registry.thread_lock(&key).await;
        let result = {
            let _guard = lock.lock().await;
            self.acquire_locked(thread_id).await
        };
        self.registry.prune_lock(&key, lock).await;
        result
    }

    async fn get(&self, sandbox_id: &str) -> SandboxResult<SandboxStatus> {
        let status = self.backend.status(sandbox_id).await;
        if status != SandboxStatus::NotFound {
            self.registry.touch(sandbox_id).await;
        }
        Ok(status)
    }

    async fn sandbox(&self, sandbox_id: &str) -> Option<Arc<dyn Sandbox>> {
        self.registry.sandbox(sandbox_id).await
    }

    async fn release(&self, sandbox_id: &str) -> SandboxResult<()> {
        let key = match self.registry.thread_of(sandbox_id).await {
            Some(thread_id) => sandbox_id_for_thread(&thread_id),
            None => sandbox_id.to_string(),
        };
        let lock = self.registry.thread_lock(&key).await;
        let result = {
            let _guard = lock.lock().await;
            self.release_locked(sandbox_id).await
        };
        self.registry.prune_lock(&key, lock).await;
        result
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reaper) = self.reaper.get() {
            reaper.abort();
        }

        let ids = self.registry.ids().await;
        info!(count = ids.len(), "Shutting down sandbox provider");
        for sandbox_id in ids {
            if let Err(e) = self.release(&sandbox_id).await {
                warn!(sandbox_id = %sandbox_id, error = %e, "Failed to release sandbox during shutdown");
            }
        }
    }
}

async fn reap_idle<B: SandboxBackend>(
    provider: Weak<ManagedSandboxProvider<B>>,
    idle_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(IDLE_CHECK_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(provider) = provider.upgrade() else {
            break;
        };
        let released = provider.release_idle(idle_timeout).await;
        if released > 0 {
            debug!(released, "Idle reaper pass finished");
        }
    }
}
