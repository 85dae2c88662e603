use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::config::BackendKind;
use crate::paths::Paths;

const STATE_FILE: &str = "sandbox.json";

/// Thread-to-sandbox binding persisted next to the thread's data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PersistedSandbox {
    pub sandbox_id: String,
    pub sandbox_url: Option<String>,
    pub backend: BackendKind,
    pub saved_at: DateTime<Utc>,
}

impl PersistedSandbox {
    pub fn new(sandbox_id: &str, sandbox_url: Option<&str>, backend: BackendKind) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            sandbox_url: sandbox_url.map(str::to_string),
            backend,
            saved_at: Utc::now(),
        }
    }
}

/// Stores one `sandbox.json` per thread under `{base}/threads/{thread_id}/`.
#[derive(Debug, Clone)]
pub(crate) struct FileStateStore {
    paths: Paths,
}

impl FileStateStore {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    fn state_path(&self, thread_id: &str) -> Result<PathBuf> {
        Ok(self.paths.thread_dir(thread_id)?.join(STATE_FILE))
    }

    /// Load the binding for a thread if one was saved
    pub fn load(&self, thread_id: &str) -> Result<Option<PersistedSandbox>> {
        let state_path = self.state_path(thread_id)?;

        if !state_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&state_path)
            .with_context(|| format!("Failed to read state file: {}", state_path.display()))?;

        let state: PersistedSandbox = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", state_path.display()))?;

        Ok(Some(state))
    }

    /// Save the binding for a thread
    pub fn save(&self, thread_id: &str, state: &PersistedSandbox) -> Result<()> {
        let state_path = self.state_path(thread_id)?;

        if let Some(parent) = state_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(state).context("Failed to serialize state")?;

        fs::write(&state_path, content)
            .with_context(|| format!("Failed to write state file: {}", state_path.display()))?;

        Ok(())
    }

    /// Delete the binding; returns whether a file was removed
    pub fn remove(&self, thread_id: &str) -> Result<bool> {
        let state_path = self.state_path(thread_id)?;

        if state_path.exists() {
            fs::remove_file(&state_path).with_context(|| {
                format!("Failed to delete state file: {}", state_path.display())
            })?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_state_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(Paths::new(dir.path()));
        let state = PersistedSandbox::new("ab12cd34", Some("http://localhost:32001"), BackendKind::Provisioned);

        store.save("t1", &state).unwrap();
        assert!(dir.path().join("threads/t1/sandbox.json").is_file());

        let loaded = store.load("t1").unwrap().unwrap();
        assert_eq!(loaded, state);

        assert!(store.remove("t1").unwrap());
        assert!(!store.remove("t1").unwrap());
        assert!(store.load("t1").unwrap().is_none());
    }

    #[test]
    fn test_load_nonexistent() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(Paths::new(dir.path()));
        assert!(store.load("t1").unwrap().is_none());
    }

    #[test]
    fn test_load_corrupt_file_errors() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(Paths::new(dir.path()));
        fs::create_dir_all(dir.path().join("threads/t1")).unwrap();
        fs::write(dir.path().join("threads/t1/sandbox.json"), "{not json").unwrap();
        assert!(store.load("t1").is_err());
    }
}
