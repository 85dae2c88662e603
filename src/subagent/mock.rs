//! Scripted runner for executor tests.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::SubagentRunner;
use crate::sandbox::SandboxTools;

/// What one invocation of [`MockRunner`] does.
#[derive(Debug, Clone)]
pub(crate) enum MockResponse {
    Success(String),
    Error(String),
    /// Succeeds with the output after a delay.
    Delayed(Duration, String),
    /// Never finishes until `release` is called.
    Hang,
}

/// Returns scripted responses in order, cycling when it runs out.
#[derive(Debug, Clone)]
pub(crate) struct MockRunner {
    responses: Arc<Vec<MockResponse>>,
    invocations: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
    release: Arc<tokio::sync::Notify>,
}

impl MockRunner {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Arc::new(responses),
            invocations: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
            release: Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn always(response: MockResponse) -> Self {
        Self::new(vec![response])
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Invocations that have returned, including hung ones later released.
    pub fn finished_count(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    /// Lets every hung invocation finish.
    pub fn release(&self) {
        self.release.notify_waiters();
    }
}

#[async_trait]
impl SubagentRunner for MockRunner {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn run(&self, _task_id: &str, _prompt: &str, _tools: &SandboxTools) -> Result<String> {
        let count = self.invocations.fetch_add(1, Ordering::SeqCst);
        let response = self.responses[count % self.responses.len()].clone();
        let result = match response {
            MockResponse::Success(output) => Ok(output),
            MockResponse::Error(message) => Err(anyhow::anyhow!(message)),
            MockResponse::Delayed(delay, output) => {
                tokio::time::sleep(delay).await;
                Ok(output)
            }
            MockResponse::Hang => {
                self.release.notified().await;
                Ok("released".to_string())
            }
        };
        self.finished.fetch_add(1, Ordering::SeqCst);
        result
    }
}
