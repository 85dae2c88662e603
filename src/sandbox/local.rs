//! Direct execution on the host.
//!
//! Virtual paths map straight onto `{base}/threads/{thread_id}/user-data`
//! and the shared skills directory. There is no isolation beyond path
//! translation, so this backend is meant for development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::path::{PathLayout, VirtualPathTranslator};
use super::{
    sandbox_id_for_thread, CommandOutput, LineRange, Sandbox, SandboxError, SandboxInfo,
    SandboxProvider, SandboxResult, SandboxStatus, MAX_LIST_DEPTH,
};
use crate::config::BackendKind;
use crate::paths::Paths;

/// A thread's view of the host filesystem.
pub(crate) struct LocalSandbox {
    id: String,
    thread_id: String,
    translator: VirtualPathTranslator,
    workspace: PathBuf,
    command_timeout: Duration,
}

impl LocalSandbox {
    fn physical(&self, path: &str) -> SandboxResult<String> {
        self.translator.to_physical(path, &self.thread_id)
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute_command(&self, command: &str) -> SandboxResult<CommandOutput> {
        let translated = self.translator.translate_command(command, &self.thread_id)?;
        debug!(sandbox_id = %self.id, command = %translated, "Executing local command");

        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(&translated)
            .current_dir(&self.workspace)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.command_timeout, child)
            .await
            .map_err(|_| {
                SandboxError::execution(format!(
                    "Command timed out after {} seconds",
                    self.command_timeout.as_secs()
                ))
            })?
            .map_err(|e| SandboxError::execution(format!("failed to spawn shell: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(CommandOutput {
            stdout: self.translator.virtualize_output(&stdout, &self.thread_id),
            stderr: self.translator.virtualize_output(&stderr, &self.thread_id),
            exit_code: output.status.code().map_or(-1, i64::from),
        })
    }

    async fn read_file(&self, path: &str, range: Option<LineRange>) -> SandboxResult<String> {
        let physical = self.physical(path)?;
        let metadata = tokio::fs::metadata(&physical)
            .await
            .map_err(|e| SandboxError::from_io(&e, path))?;
        if metadata.is_dir() {
            return Err(SandboxError::is_a_directory(path));
        }

        let content = tokio::fs::read_to_string(&physical)
            .await
            .map_err(|e| SandboxError::from_io(&e, path))?;
        Ok(match range {
            Some(range) => range.slice(&content),
            None => content,
        })
    }

    async fn write_file(&self, path: &str, content: &str, append: bool) -> SandboxResult<()> {
        let physical = PathBuf::from(
            self.translator
                .to_physical_writable(path, &self.thread_id)?,
        );
        let virtual_path = path.to_string();
        let content = content.to_string();

        tokio::task::spawn_blocking(move || {
            atomic_write(&physical, &content, append)
                .map_err(|e| SandboxError::from_io(&e, &virtual_path))
        })
        .await
        .map_err(|e| SandboxError::execution(format!("write task failed: {e}")))?
    }

    async fn list_dir(&self, path: &str, depth: usize) -> SandboxResult<Vec<String>> {
        let physical = PathBuf::from(self.physical(path)?);
        let depth = depth.clamp(1, MAX_LIST_DEPTH);
        let virtual_path = path.to_string();

        let entries = tokio::task::spawn_blocking(move || {
            let metadata =
                std::fs::metadata(&physical).map_err(|e| SandboxError::from_io(&e, &virtual_path))?;
            if !metadata.is_dir() {
                return Err(SandboxError::execution(format!(
                    "{virtual_path} is not a directory"
                )));
            }
            let mut entries = Vec::new();
            walk(&physical, depth, &mut entries)
                .map_err(|e| SandboxError::from_io(&e, &virtual_path))?;
            Ok(entries)
        })
        .await
        .map_err(|e| SandboxError::execution(format!("list task failed: {e}")))??;

        let mut listed: Vec<String> = entries
            .into_iter()
            .map(|(entry, is_dir)| {
                let mut v = self.translator.to_virtual(&entry, &self.thread_id);
                if is_dir {
                    v.push('/');
                }
                v
            })
            .collect();
        listed.sort();
        Ok(listed)
    }
}

/// Writes through a temp file in the target directory and renames it in place.
fn atomic_write(target: &Path, content: &str, append: bool) -> std::io::Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no parent directory"))?;
    std::fs::create_dir_all(parent)?;

    if target.is_dir() {
        return Err(std::io::Error::from(std::io::ErrorKind::IsADirectory));
    }

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    if append {
        match std::fs::read(target) {
            Ok(existing) => tmp.write_all(&existing)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// Collects `(path, is_dir)` pairs up to `depth` levels below `dir`.
fn walk(dir: &Path, depth: usize, out: &mut Vec<(String, bool)>) -> std::io::Result<()> {
    if depth == 0 {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_dir = entry.file_type()?.is_dir();
        out.push((path.display().to_string(), is_dir));
        if is_dir {
            walk(&path, depth - 1, out)?;
        }
    }
    Ok(())
}

/// Serves every thread from the host, one sandbox handle per thread.
pub(crate) struct LocalSandboxProvider {
    paths: Paths,
    translator: VirtualPathTranslator,
    command_timeout: Duration,
    sandboxes: Mutex<HashMap<String, (SandboxInfo, Arc<LocalSandbox>)>>,
}

impl LocalSandboxProvider {
    pub fn new(paths: Paths, skills_dir: PathBuf, command_timeout: Duration) -> Self {
        let translator = VirtualPathTranslator::new(PathLayout::Host {
            paths: paths.clone(),
            skills_dir,
        });
        Self {
            paths,
            translator,
            command_timeout,
            sandboxes: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    fn backend(&self) -> BackendKind {
        BackendKind::Local
    }

    fn sandbox_id_for(&self, thread_id: &str) -> String {
        format!("local-{}", sandbox_id_for_thread(thread_id))
    }

    async fn acquire(&self, thread_id: &str) -> SandboxResult<SandboxInfo> {
        let user_data = self.paths.ensure_thread_dirs(thread_id)?;
        let sandbox_id = self.sandbox_id_for(thread_id);

        let mut sandboxes = self.sandboxes.lock().await;
        if let Some((info, _)) = sandboxes.get(&sandbox_id) {
            return Ok(info.clone());
        }

        let info = SandboxInfo {
            sandbox_id: sandbox_id.clone(),
            thread_id: thread_id.to_string(),
            backend: BackendKind::Local,
            endpoint: None,
            status: SandboxStatus::Running,
        };
        let sandbox = Arc::new(LocalSandbox {
            id: sandbox_id.clone(),
            thread_id: thread_id.to_string(),
            translator: self.translator.clone(),
            workspace: user_data.join("workspace"),
            command_timeout: self.command_timeout,
        });
        sandboxes.insert(sandbox_id.clone(), (info.clone(), sandbox));
        info!(sandbox_id = %sandbox_id, thread_id, "Acquired local sandbox");
        Ok(info)
    }

    async fn get(&self, sandbox_id: &str) -> SandboxResult<SandboxStatus> {
        let sandboxes = self.sandboxes.lock().await;
        Ok(if sandboxes.contains_key(sandbox_id) {
            SandboxStatus::Running
        } else {
            SandboxStatus::NotFound
        })
    }

    async fn sandbox(&self, sandbox_id: &str) -> Option<Arc<dyn Sandbox>> {
        let sandboxes = self.sandboxes.lock().await;
        sandboxes
            .get(sandbox_id)
            .map(|(_, sandbox)| Arc::clone(sandbox) as Arc<dyn Sandbox>)
    }

    async fn release(&self, sandbox_id: &str) -> SandboxResult<()> {
        if self.sandboxes.lock().await.remove(sandbox_id).is_some() {
            info!(sandbox_id, "Released local sandbox");
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let released = {
            let mut sandboxes = self.sandboxes.lock().await;
            let n = sandboxes.len();
            sandboxes.clear();
            n
        };
        if released > 0 {
            info!(released, "Local sandbox provider shut down");
        }
    }
}
