//! In-process bookkeeping for managed sandboxes.
//!
//! Tracks which sandbox belongs to which thread, when each was last used,
//! and hands out one async lock per thread so `acquire` and `release` for
//! the same thread serialise. Locks live only while someone holds them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{Sandbox, SandboxInfo};

struct Entry {
    info: SandboxInfo,
    sandbox: Arc<dyn Sandbox>,
    last_activity: Instant,
}

#[derive(Default)]
struct Inner {
    by_thread: HashMap<String, String>,
    entries: HashMap<String, Entry>,
}

#[derive(Default)]
pub(crate) struct SandboxRegistry {
    inner: Mutex<Inner>,
    thread_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock serialising lifecycle changes for one thread. `key` is the
    /// thread's sandbox id, so `release` can find it from the id alone.
    /// Hand the lock back through [`Self::prune_lock`] once done.
    pub async fn thread_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.thread_locks.lock().await;
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Drops the map's entry for `key` unless another caller still holds or
    /// waits on `lock`.
    pub async fn prune_lock(&self, key: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.thread_locks.lock().await;
        let ours = locks.get(key).is_some_and(|held| Arc::ptr_eq(held, &lock));
        // One handle in the map, one here.
        if ours && Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }

    /// Thread a tracked sandbox belongs to.
    pub async fn thread_of(&self, sandbox_id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.entries.get(sandbox_id).map(|e| e.info.thread_id.clone())
    }

    /// Sandbox bound to a thread, refreshing its activity.
    pub async fn for_thread(&self, thread_id: &str) -> Option<SandboxInfo> {
        let mut inner = self.inner.lock().await;
        let sandbox_id = inner.by_thread.get(thread_id)?.clone();
        let entry = inner.entries.get_mut(&sandbox_id)?;
        entry.last_activity = Instant::now();
        Some(entry.info.clone())
    }

    pub async fn insert(&self, info: SandboxInfo, sandbox: Arc<dyn Sandbox>) {
        let mut inner = self.inner.lock().await;
        inner
            .by_thread
            .insert(info.thread_id.clone(), info.sandbox_id.clone());
        inner.entries.insert(
            info.sandbox_id.clone(),
            Entry {
                info,
                sandbox,
                last_activity: Instant::now(),
            },
        );
    }

    /// Sandbox handle by id, refreshing its activity.
    pub async fn sandbox(&self, sandbox_id: &str) -> Option<Arc<dyn Sandbox>> {
        let mut inner = self.inner.lock().await;
        let entry = inner.entries.get_mut(sandbox_id)?;
        entry.last_activity = Instant::now();
        Some(Arc::clone(&entry.sandbox))
    }

    pub async fn touch(&self, sandbox_id: &str) {
        if let Some(entry) = self.inner.lock().await.entries.get_mut(sandbox_id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Stops tracking a sandbox and returns what was tracked.
    pub async fn remove(&self, sandbox_id: &str) -> Option<SandboxInfo> {
        let mut inner = self.inner.lock().await;
        let entry = inner.entries.remove(sandbox_id)?;
        if inner.by_thread.get(&entry.info.thread_id).map(String::as_str) == Some(sandbox_id) {
            inner.by_thread.remove(&entry.info.thread_id);
        }
        Some(entry.info)
    }

    /// Ids of sandboxes unused for longer than `idle_timeout`.
    pub async fn idle(&self, idle_timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_activity) > idle_timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.inner.lock().await.entries.keys().cloned().collect()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    #[cfg(test)]
    pub async fn lock_count(&self) -> usize {
        self.thread_locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::sandbox::{CommandOutput, LineRange, SandboxResult, SandboxStatus};
    use async_trait::async_trait;

    struct NullSandbox(String);

    #[async_trait]
    impl Sandbox for NullSandbox {
        fn id(&self) -> &str {
            &self.0
        }
        async fn execute_command(&self, _command: &str) -> SandboxResult<CommandOutput> {
            Ok(CommandOutput::default())
        }
        async fn read_file(&self, _path: &str, _range: Option<LineRange>) -> SandboxResult<String> {
            Ok(String::new())
        }
        async fn write_file(&self, _path: &str, _content: &str, _append: bool) -> SandboxResult<()> {
            Ok(())
        }
        async fn list_dir(&self, _path: &str, _depth: usize) -> SandboxResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn info(id: &str, thread: &str) -> SandboxInfo {
        SandboxInfo {
            sandbox_id: id.to_string(),
            thread_id: thread.to_string(),
            backend: BackendKind::Container,
            endpoint: Some("http://localhost:1".to_string()),
            status: SandboxStatus::Pending,
        }
    }

    #[tokio::test]
    async fn test_insert_lookup_remove() {
        let registry = SandboxRegistry::new();
        registry
            .insert(info("s1", "t1"), Arc::new(NullSandbox("s1".into())))
            .await;

        assert_eq!(registry.for_thread("t1").await.unwrap().sandbox_id, "s1");
        assert!(registry.sandbox("s1").await.is_some());
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.thread_of("s1").await.as_deref(), Some("t1"));

        assert!(registry.remove("s1").await.is_some());
        assert!(registry.remove("s1").await.is_none());
        assert!(registry.for_thread("t1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_detection_respects_activity() {
        let registry = SandboxRegistry::new();
        registry
            .insert(info("s1", "t1"), Arc::new(NullSandbox("s1".into())))
            .await;
        registry
            .insert(info("s2", "t2"), Arc::new(NullSandbox("s2".into())))
            .await;

        tokio::time::advance(Duration::from_secs(50)).await;
        registry.touch("s2").await;
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(registry.idle(Duration::from_secs(60)).await, vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_thread_lock_is_shared_per_thread() {
        let registry = SandboxRegistry::new();
        let a = registry.thread_lock("t1").await;
        let b = registry.thread_lock("t1").await;
        let c = registry.thread_lock("t2").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_prune_keeps_locks_still_in_use() {
        let registry = SandboxRegistry::new();
        let first = registry.thread_lock("s1").await;
        let second = registry.thread_lock("s1").await;

        registry.prune_lock("s1", first).await;
        assert_eq!(registry.lock_count().await, 1);

        registry.prune_lock("s1", second).await;
        assert_eq!(registry.lock_count().await, 0);
    }
}
