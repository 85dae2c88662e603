//! Orchestration of subagent tasks.
//!
//! Each `task()` call gets one orchestration routine on the scheduling pool.
//! The routine hands the real work to the execution pool and waits for it
//! with the task's deadline. Keeping the pools separate means orchestration
//! never waits for a slot in the pool it is running on.
//!
//! A task that misses its deadline is reported as timed out right away. Its
//! execution is abandoned, not cancelled: the work keeps its execution slot
//! until it ends on its own, and the abandoned count says how many are still
//! out there.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

use super::{
    LimiterPermit, SubagentError, SubagentLimiter, SubagentRegistry, SubagentSpec, SubagentTask,
    TaskStatus, WorkerPool,
};
use crate::config::SubagentsConfig;
use crate::sandbox::{SandboxError, SandboxProvider, SandboxStatus, SandboxTools};

/// Lifecycle notifications for callers that want progress without polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TaskEvent {
    Started {
        task_id: String,
        trace_id: String,
        subagent_type: String,
        description: String,
    },
    Completed {
        task_id: String,
        result: String,
    },
    Failed {
        task_id: String,
        error: String,
    },
    TimedOut {
        task_id: String,
        error: String,
    },
}

/// Inputs of one `task()` call.
#[derive(Debug, Clone)]
pub(crate) struct TaskRequest {
    pub subagent_type: String,
    pub prompt: String,
    pub description: String,
    /// Generated when absent.
    pub task_id: Option<String>,
    /// Inherited from the parent agent when it has one.
    pub trace_id: Option<String>,
}

impl TaskRequest {
    pub fn new(subagent_type: &str, prompt: &str, description: &str) -> Self {
        Self {
            subagent_type: subagent_type.to_string(),
            prompt: prompt.to_string(),
            description: description.to_string(),
            task_id: None,
            trace_id: None,
        }
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// State an orchestration routine needs once it leaves the caller.
struct Orchestration {
    spec: SubagentSpec,
    tools: SandboxTools,
    execution: WorkerPool,
    abandoned: Arc<AtomicUsize>,
    events: Option<UnboundedSender<TaskEvent>>,
    _permit: LimiterPermit,
}

impl Orchestration {
    fn emit(&self, event: TaskEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    async fn run(self, mut task: SubagentTask) -> SubagentTask {
        let timeout = self.spec.timeout;
        let deadline = Instant::now() + timeout;
        task.start(timeout);
        info!(timeout_secs = timeout.as_secs(), "Task started");
        self.emit(TaskEvent::Started {
            task_id: task.task_id.clone(),
            trace_id: task.trace_id.clone(),
            subagent_type: task.subagent_type.clone(),
            description: task.description.clone(),
        });

        let runner = Arc::clone(&self.spec.runner);
        let tools = self.tools.clone();
        let (task_id, prompt) = (task.task_id.clone(), task.prompt.clone());
        let mut handle = self.execution.submit(
            async move { runner.run(&task_id, &prompt, &tools).await }.in_current_span(),
        );

        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(Ok(result))) => {
                info!("Task completed");
                task.complete(result);
            }
            Ok(Ok(Err(e))) => {
                let message = format!("{e:#}");
                error!(error = %message, "Task failed");
                task.fail(message);
            }
            Ok(Err(e)) => {
                error!(error = %e, "Task execution aborted");
                task.fail(format!("Execution aborted: {e}"));
            }
            Err(_) => {
                task.time_out(timeout);
                let abandoned = self.abandoned.fetch_add(1, Ordering::SeqCst) + 1;
                error!(
                    timeout_secs = timeout.as_secs(),
                    abandoned,
                    pool = self.execution.name(),
                    "Task timed out; abandoning its execution"
                );
                let counter = Arc::clone(&self.abandoned);
                tokio::spawn(
                    async move {
                        let _ = handle.await;
                        let left = counter.fetch_sub(1, Ordering::SeqCst) - 1;
                        warn!(abandoned = left, "Abandoned execution finished");
                    }
                    .in_current_span(),
                );
            }
        }

        let task_id = task.task_id.clone();
        let error = task.error.clone().unwrap_or_default();
        match task.status {
            TaskStatus::Completed => self.emit(TaskEvent::Completed {
                task_id,
                result: task.result.clone().unwrap_or_default(),
            }),
            TaskStatus::TimedOut => self.emit(TaskEvent::TimedOut { task_id, error }),
            _ => self.emit(TaskEvent::Failed { task_id, error }),
        }
        task
    }
}

/// Runs subagent tasks against per-thread sandboxes.
pub(crate) struct SubagentExecutor {
    provider: Arc<dyn SandboxProvider>,
    registry: SubagentRegistry,
    limiter: SubagentLimiter,
    scheduler: WorkerPool,
    execution: WorkerPool,
    ready_timeout: Duration,
    abandoned: Arc<AtomicUsize>,
    events: Option<UnboundedSender<TaskEvent>>,
}

impl SubagentExecutor {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        registry: SubagentRegistry,
        config: &SubagentsConfig,
        ready_timeout: Duration,
    ) -> Self {
        info!(
            max_concurrent = config.max_concurrent,
            scheduler_workers = config.scheduler_workers,
            execution_workers = config.execution_workers,
            subagents = ?registry.names(),
            "Subagent executor ready"
        );
        Self {
            provider,
            registry,
            limiter: SubagentLimiter::new(config.max_concurrent),
            scheduler: WorkerPool::new("subagent-scheduler", config.scheduler_workers),
            execution: WorkerPool::new("subagent-exec", config.execution_workers),
            ready_timeout,
            abandoned: Arc::new(AtomicUsize::new(0)),
            events: None,
        }
    }

    /// Sends task lifecycle events to `events`.
    pub fn with_events(mut self, events: UnboundedSender<TaskEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn limiter(&self) -> &SubagentLimiter {
        &self.limiter
    }

    /// Starts a new top-level turn; the in-flight ledger starts from zero.
    pub fn begin_turn(&self) {
        self.limiter.reset();
    }

    /// Timed-out executions that are still running.
    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Runs one task and returns the string the calling agent sees.
    pub async fn task(
        &self,
        thread_id: &str,
        subagent_type: &str,
        prompt: &str,
        description: &str,
    ) -> Result<String, SubagentError> {
        let task = self
            .run(thread_id, TaskRequest::new(subagent_type, prompt, description))
            .await?;
        Ok(task.render())
    }

    /// Runs one task to a terminal status.
    ///
    /// Rejections (unknown type, limit reached, no sandbox) are errors;
    /// failures and timeouts are reported on the returned task.
    pub async fn run(&self, thread_id: &str, request: TaskRequest) -> Result<SubagentTask, SubagentError> {
        let spec = self.registry.get(&request.subagent_type)?.clone();
        let permit = self.limiter.try_acquire()?;
        let tools = self.tools_for(thread_id, &spec).await?;

        let task = SubagentTask::new(
            request.task_id.unwrap_or_else(short_id),
            request.trace_id.unwrap_or_else(short_id),
            &spec.name,
            request.prompt,
            request.description,
        );
        let span = info_span!(
            "subagent",
            trace_id = %task.trace_id,
            task_id = %task.task_id,
            subagent = %spec.name,
            thread_id,
        );
        info!(parent: &span, description = %task.description, "Task queued");

        let orchestration = Orchestration {
            spec,
            tools,
            execution: self.execution.clone(),
            abandoned: Arc::clone(&self.abandoned),
            events: self.events.clone(),
            _permit: permit,
        };
        self.scheduler
            .submit(orchestration.run(task).instrument(span))
            .await
            .map_err(|e| SubagentError::Orchestration {
                message: e.to_string(),
            })
    }

    /// The thread's sandbox, ready, behind the subagent's tool grant.
    async fn tools_for(&self, thread_id: &str, spec: &SubagentSpec) -> Result<SandboxTools, SubagentError> {
        let info = self.provider.acquire(thread_id).await?;
        if info.status != SandboxStatus::Running {
            self.provider
                .wait_until_ready(&info.sandbox_id, self.ready_timeout)
                .await?;
        }
        let sandbox = self
            .provider
            .sandbox(&info.sandbox_id)
            .await
            .ok_or_else(|| SandboxError::not_found(format!("sandbox {}", info.sandbox_id)))?;
        Ok(SandboxTools::new(sandbox).restrict(spec.allowed_tools.as_deref(), &spec.denied_tools))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::Paths;
    use crate::sandbox::{LocalSandboxProvider, ToolName};
    use crate::subagent::mock::{MockResponse, MockRunner};
    use crate::subagent::SubagentRunner;
    use async_trait::async_trait;
    use futures_util::future::join_all;
    use std::path::Path;
    use tempfile::tempdir;

    /// Reports which tools it was handed.
    struct ToolProbe;

    #[async_trait]
    impl SubagentRunner for ToolProbe {
        fn name(&self) -> &'static str {
            "probe"
        }

        async fn run(&self, _task_id: &str, _prompt: &str, tools: &SandboxTools) -> anyhow::Result<String> {
            Ok(tools
                .allowed()
                .map(ToolName::as_str)
                .collect::<Vec<_>>()
                .join(","))
        }
    }

    fn provider(dir: &Path) -> Arc<dyn SandboxProvider> {
        Arc::new(LocalSandboxProvider::new(
            Paths::new(dir),
            dir.join("skills"),
            Duration::from_secs(30),
        ))
    }

    fn spec(name: &str, timeout: Duration, runner: Arc<dyn SubagentRunner>) -> SubagentSpec {
        SubagentSpec {
            name: name.to_string(),
            description: String::new(),
            allowed_tools: None,
            denied_tools: Vec::new(),
            timeout,
            runner,
        }
    }

    fn executor(dir: &Path, specs: Vec<SubagentSpec>, max_concurrent: usize) -> SubagentExecutor {
        let mut registry = SubagentRegistry::default();
        for spec in specs {
            registry.register(spec);
        }
        let config = SubagentsConfig {
            max_concurrent,
            ..SubagentsConfig::default()
        };
        SubagentExecutor::new(provider(dir), registry, &config, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_bash_task_blocks_until_done() {
        let dir = tempdir().unwrap();
        let registry = SubagentRegistry::builtin(&SubagentsConfig::default()).unwrap();
        let executor = SubagentExecutor::new(
            provider(dir.path()),
            registry,
            &SubagentsConfig::default(),
            Duration::from_secs(5),
        );

        let started = std::time::Instant::now();
        let out = executor
            .task("t1", "bash", "sleep 1 && echo done", "wait a second")
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(10), "{elapsed:?}");
        assert_eq!(out, "[Subagent: bash] Task Succeeded. Result: done\n");
        assert_eq!(executor.limiter().in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_cap_rejects_extra_tasks() {
        let dir = tempdir().unwrap();
        let runner = MockRunner::always(MockResponse::Delayed(
            Duration::from_millis(200),
            "ok".to_string(),
        ));
        let executor = executor(
            dir.path(),
            vec![spec("slow", Duration::from_secs(5), Arc::new(runner.clone()))],
            3,
        );

        let results = join_all((0..5).map(|_| executor.run("t1", TaskRequest::new("slow", "go", "d")))).await;

        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.is_concurrency_limit()))
            .count();
        let completed = results
            .iter()
            .filter(|r| matches!(r, Ok(t) if t.status == TaskStatus::Completed))
            .count();
        assert_eq!(rejected, 2);
        assert_eq!(completed, 3);
        assert_eq!(runner.invocation_count(), 3);
        assert_eq!(executor.limiter().in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_timeout_is_isolated_and_abandoned() {
        let dir = tempdir().unwrap();
        let hung = MockRunner::always(MockResponse::Hang);
        let quick = MockRunner::always(MockResponse::Delayed(
            Duration::from_millis(200),
            "fine".to_string(),
        ));
        let executor = executor(
            dir.path(),
            vec![
                spec("hung", Duration::from_secs(1), Arc::new(hung.clone())),
                spec("quick", Duration::from_secs(5), Arc::new(quick)),
            ],
            3,
        );

        let started = std::time::Instant::now();
        let (slow, fast) = tokio::join!(
            executor.run("t1", TaskRequest::new("hung", "wait", "d")),
            executor.run("t1", TaskRequest::new("quick", "go", "d")),
        );
        let elapsed = started.elapsed();

        let slow = slow.unwrap();
        assert_eq!(slow.status, TaskStatus::TimedOut);
        assert_eq!(
            slow.render(),
            "[Subagent: hung] Task timed out. Error: Execution timed out after 1 seconds"
        );
        assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");

        let fast = fast.unwrap();
        assert_eq!(fast.status, TaskStatus::Completed);
        assert_eq!(fast.result.as_deref(), Some("fine"));

        assert_eq!(executor.limiter().in_flight(), 0);
        assert_eq!(executor.abandoned(), 1);
        assert_eq!(hung.finished_count(), 0);

        hung.release();
        for _ in 0..100 {
            if executor.abandoned() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(executor.abandoned(), 0);
        assert_eq!(hung.finished_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_reported_not_raised() {
        let dir = tempdir().unwrap();
        let runner = MockRunner::always(MockResponse::Error("boom".to_string()));
        let executor = executor(
            dir.path(),
            vec![spec("broken", Duration::from_secs(5), Arc::new(runner))],
            3,
        );

        let out = executor.task("t1", "broken", "x", "d").await.unwrap();
        assert_eq!(out, "[Subagent: broken] Task failed. Error: boom");
    }

    #[tokio::test]
    async fn test_unknown_type_takes_no_slot() {
        let dir = tempdir().unwrap();
        let executor = executor(dir.path(), Vec::new(), 3);
        let err = executor.task("t1", "nope", "x", "d").await.unwrap_err();
        assert!(err.is_unknown_subagent());
        assert_eq!(executor.limiter().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_invalid_thread_releases_slot() {
        let dir = tempdir().unwrap();
        let runner = MockRunner::always(MockResponse::Success("ok".to_string()));
        let executor = executor(
            dir.path(),
            vec![spec("ok", Duration::from_secs(5), Arc::new(runner))],
            1,
        );

        let err = executor.task("../t1", "ok", "x", "d").await.unwrap_err();
        assert!(matches!(err, SubagentError::Sandbox(_)));
        assert_eq!(executor.limiter().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_subagents_never_get_the_task_tool() {
        let dir = tempdir().unwrap();
        let executor = executor(
            dir.path(),
            vec![spec("probe", Duration::from_secs(5), Arc::new(ToolProbe))],
            3,
        );
        let task = executor
            .run("t1", TaskRequest::new("probe", "", "d"))
            .await
            .unwrap();
        let tools = task.result.unwrap();
        assert!(tools.contains("bash"), "{tools}");
        assert!(!tools.contains("task"), "{tools}");
    }

    #[tokio::test]
    async fn test_events_and_ids() {
        let dir = tempdir().unwrap();
        let runner = MockRunner::always(MockResponse::Success("ok".to_string()));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let executor = executor(
            dir.path(),
            vec![spec("ok", Duration::from_secs(5), Arc::new(runner))],
            3,
        )
        .with_events(tx);

        let request = TaskRequest {
            task_id: Some("task0001".to_string()),
            trace_id: Some("trace001".to_string()),
            ..TaskRequest::new("ok", "x", "describe")
        };
        let task = executor.run("t1", request).await.unwrap();
        assert_eq!(task.task_id, "task0001");
        assert_eq!(task.trace_id, "trace001");

        assert_eq!(
            rx.recv().await.unwrap(),
            TaskEvent::Started {
                task_id: "task0001".to_string(),
                trace_id: "trace001".to_string(),
                subagent_type: "ok".to_string(),
                description: "describe".to_string(),
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            TaskEvent::Completed {
                task_id: "task0001".to_string(),
                result: "ok".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_begin_turn_resets_ledger() {
        let dir = tempdir().unwrap();
        let executor = executor(dir.path(), Vec::new(), 1);
        let permit = executor.limiter().try_acquire().unwrap();
        assert!(executor.limiter().try_acquire().is_err());

        executor.begin_turn();
        let _fresh = executor.limiter().try_acquire().unwrap();
        drop(permit);
        assert_eq!(executor.limiter().in_flight(), 1);
    }
}
