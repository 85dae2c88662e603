//! Host-side directory layout for per-thread sandbox data.
//!
//! ```text
//! {base_dir}/
//! └── threads/
//!     └── {thread_id}/
//!         ├── sandbox.json       persisted sandbox mapping
//!         └── user-data/         mounted as /mnt/user-data
//!             ├── workspace/
//!             ├── uploads/
//!             └── outputs/
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use crate::sandbox::{SandboxError, SandboxResult};

/// Environment variable overriding the base directory.
pub(crate) const HOME_ENV: &str = "BURROW_HOME";

/// Subdirectories of `user-data` exposed to agents.
pub(crate) const USER_DATA_DIRS: [&str; 3] = ["workspace", "uploads", "outputs"];

/// Resolves host paths for thread data under a single base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Paths {
    base_dir: PathBuf,
}

impl Paths {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Resolves the base directory: `BURROW_HOME`, then `~/.burrow`, then `./.burrow`.
    pub fn from_env() -> Self {
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Self::new(home);
        }
        match dirs::home_dir() {
            Some(home) => Self::new(home.join(".burrow")),
            None => Self::new(".burrow"),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Host directory for a thread: `{base}/threads/{thread_id}`.
    pub fn thread_dir(&self, thread_id: &str) -> SandboxResult<PathBuf> {
        validate_thread_id(thread_id)?;
        Ok(self.base_dir.join("threads").join(thread_id))
    }

    /// Host directory mounted as `/mnt/user-data`.
    pub fn user_data_dir(&self, thread_id: &str) -> SandboxResult<PathBuf> {
        Ok(self.thread_dir(thread_id)?.join("user-data"))
    }

    /// Creates `workspace`, `uploads` and `outputs` for a thread.
    pub fn ensure_thread_dirs(&self, thread_id: &str) -> SandboxResult<PathBuf> {
        let user_data = self.user_data_dir(thread_id)?;
        for dir in USER_DATA_DIRS {
            let path = user_data.join(dir);
            fs::create_dir_all(&path)
                .map_err(|e| SandboxError::from_io(&e, &path.display().to_string()))?;
        }
        Ok(user_data)
    }
}

/// Rejects thread ids that could escape the threads directory.
pub(crate) fn validate_thread_id(thread_id: &str) -> SandboxResult<()> {
    let safe = !thread_id.is_empty()
        && thread_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if safe {
        Ok(())
    } else {
        Err(SandboxError::invalid_thread_id(thread_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_thread_dir_layout() {
        let paths = Paths::new("/data");
        assert_eq!(
            paths.user_data_dir("t1").unwrap(),
            PathBuf::from("/data/threads/t1/user-data")
        );
    }

    #[test]
    fn test_rejects_unsafe_thread_ids() {
        let paths = Paths::new("/data");
        for bad in ["", "../etc", "a/b", "a b", "t1;rm"] {
            assert!(paths.thread_dir(bad).is_err(), "accepted {bad:?}");
        }
        assert!(paths.thread_dir("thread_01-abc").is_ok());
    }

    #[test]
    fn test_ensure_thread_dirs_creates_all() {
        let dir = tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let user_data = paths.ensure_thread_dirs("t1").unwrap();

        for sub in USER_DATA_DIRS {
            assert!(user_data.join(sub).is_dir());
        }
    }
}
