//! Client for the HTTP API served by the sandbox image.
//!
//! Container and provisioned sandboxes run the same image, which mounts
//! thread data at `/mnt/user-data` and skills at `/mnt/skills`, so paths are
//! only validated here, never rewritten.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::path::VirtualPathTranslator;
use super::{CommandOutput, LineRange, Sandbox, SandboxError, SandboxResult, MAX_LIST_DEPTH};

/// Timeout for file operations.
const FILE_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Marker the sandbox API uses for reads that hit a directory.
const IS_A_DIRECTORY: &str = "is_a_directory";

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct FileContent {
    content: String,
}

#[derive(Debug, Deserialize)]
struct DirEntries {
    entries: Vec<String>,
}

/// A sandbox reached over HTTP at `base_url`.
pub(crate) struct HttpSandbox {
    id: String,
    thread_id: String,
    base_url: String,
    client: reqwest::Client,
    translator: VirtualPathTranslator,
    command_timeout: Duration,
}

impl HttpSandbox {
    pub fn new(
        id: &str,
        thread_id: &str,
        base_url: &str,
        client: reqwest::Client,
        command_timeout: Duration,
    ) -> Self {
        Self {
            id: id.to_string(),
            thread_id: thread_id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            translator: VirtualPathTranslator::mounted(),
            command_timeout,
        }
    }

    /// POSTs `body` to `route` and unwraps the API envelope.
    async fn call<T: DeserializeOwned>(
        &self,
        route: &str,
        body: serde_json::Value,
        subject: &str,
        timeout: Duration,
    ) -> SandboxResult<Option<T>> {
        let url = format!("{}{route}", self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                SandboxError::execution(format!("sandbox {} unreachable: {e}", self.id))
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SandboxError::not_found(subject));
        }

        let text = response.text().await.map_err(|e| {
            SandboxError::execution(format!("sandbox {} response failed: {e}", self.id))
        })?;
        let parsed: Result<ApiResponse<T>, _> = serde_json::from_str(&text);

        match parsed {
            Ok(envelope) if envelope.error.as_deref() == Some(IS_A_DIRECTORY) => {
                Err(SandboxError::is_a_directory(subject))
            }
            Ok(envelope) if status.is_success() && envelope.success => Ok(envelope.data),
            Ok(envelope) => Err(SandboxError::execution(format!(
                "sandbox {} returned {status}: {}",
                self.id,
                envelope
                    .message
                    .or(envelope.error)
                    .unwrap_or_else(|| "request failed".to_string())
            ))),
            Err(e) => Err(SandboxError::execution(format!(
                "sandbox {} returned {status} with an unreadable body: {e}",
                self.id
            ))),
        }
    }
}

#[async_trait]
impl Sandbox for HttpSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute_command(&self, command: &str) -> SandboxResult<CommandOutput> {
        let command = self.translator.translate_command(command, &self.thread_id)?;
        debug!(sandbox_id = %self.id, %command, "Executing remote command");
        let output: Option<CommandOutput> = self
            .call(
                "/v1/shell/exec",
                json!({ "command": command }),
                "command",
                self.command_timeout,
            )
            .await?;
        Ok(output.unwrap_or_default())
    }

    async fn read_file(&self, path: &str, range: Option<LineRange>) -> SandboxResult<String> {
        let file = self.translator.to_physical(path, &self.thread_id)?;
        let mut body = json!({ "file": file });
        if let Some(range) = range {
            body["start_line"] = json!(range.start);
            body["end_line"] = json!(range.end);
        }
        let data: Option<FileContent> = self.call("/v1/file/read", body, path, FILE_OP_TIMEOUT).await?;
        Ok(data.map(|d| d.content).unwrap_or_default())
    }

    async fn write_file(&self, path: &str, content: &str, append: bool) -> SandboxResult<()> {
        let file = self.translator.to_physical_writable(path, &self.thread_id)?;
        let _: Option<serde_json::Value> = self
            .call(
                "/v1/file/write",
                json!({ "file": file, "content": content, "append": append }),
                path,
                FILE_OP_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn list_dir(&self, path: &str, depth: usize) -> SandboxResult<Vec<String>> {
        let dir = self.translator.to_physical(path, &self.thread_id)?;
        let depth = depth.clamp(1, MAX_LIST_DEPTH);
        let data: Option<DirEntries> = self
            .call(
                "/v1/file/list",
                json!({ "path": dir, "depth": depth }),
                path,
                FILE_OP_TIMEOUT,
            )
            .await?;
        let mut entries = data.map(|d| d.entries).unwrap_or_default();
        entries.sort();
        Ok(entries)
    }
}
