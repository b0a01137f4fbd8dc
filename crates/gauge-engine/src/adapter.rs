use std::sync::Arc;

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::blocking::{run_with_heartbeat, BlockingMonitor};

/// One task call: the item input plus the optional hooks a task may use.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub input: Value,
    pub model_name: Option<String>,
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub output: Value,
    pub trace_id: Option<String>,
    pub trace_url: Option<String>,
}

impl TaskOutput {
    pub fn value(output: Value) -> Self {
        Self {
            output,
            trace_id: None,
            trace_url: None,
        }
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>, trace_url: Option<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self.trace_url = trace_url;
        self
    }
}

type SyncTaskFn = dyn Fn(&TaskInvocation) -> anyhow::Result<TaskOutput> + Send + Sync;
type AsyncTaskFn =
    dyn Fn(TaskInvocation) -> BoxFuture<'static, anyhow::Result<TaskOutput>> + Send + Sync;

enum TaskKind {
    /// Runs on the blocking worker pool; free to do blocking I/O.
    Sync(Arc<SyncTaskFn>),
    /// Runs on the scheduler runtime, under blocking detection.
    Async(Arc<AsyncTaskFn>),
}

/// Uniform front over the supported task shapes. A task that ignores the
/// model/trace hooks simply doesn't read them from the invocation.
pub struct TaskAdapter {
    name: String,
    kind: TaskKind,
    monitor: BlockingMonitor,
}

impl TaskAdapter {
    pub fn from_sync_fn<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&TaskInvocation) -> anyhow::Result<TaskOutput> + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            monitor: BlockingMonitor::new("task", name.clone()),
            kind: TaskKind::Sync(Arc::new(func)),
            name,
        }
    }

    pub fn from_async_fn<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(TaskInvocation) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<TaskOutput>> + Send + 'static,
    {
        let name = name.into();
        Self {
            monitor: BlockingMonitor::new("task", name.clone()),
            kind: TaskKind::Async(Arc::new(move |invocation| func(invocation).boxed())),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn monitor(&self) -> &BlockingMonitor {
        &self.monitor
    }

    /// Invoke the task. Errors and panics surface as `Err`; the blocking
    /// probe runs for async tasks until the function graduates clean.
    pub async fn invoke(&self, invocation: TaskInvocation) -> anyhow::Result<TaskOutput> {
        match &self.kind {
            TaskKind::Sync(func) => {
                let func = func.clone();
                let name = self.name.clone();
                tokio::task::spawn_blocking(move || func(&invocation))
                    .await
                    .map_err(|err| {
                        if err.is_panic() {
                            anyhow!("task `{name}` panicked")
                        } else {
                            anyhow!("task `{name}` was cancelled")
                        }
                    })?
            }
            TaskKind::Async(func) => {
                let name = self.name.clone();
                let inner = func(invocation);
                let fut = async move {
                    let caught = std::panic::AssertUnwindSafe(inner).catch_unwind().await;
                    match caught {
                        Ok(result) => result,
                        Err(_) => Err(anyhow!("task `{name}` panicked")),
                    }
                };
                if self.monitor.should_probe() {
                    let (result, report) = run_with_heartbeat(fut).await;
                    self.monitor.observe(report);
                    result
                } else {
                    fut.await
                }
            }
        }
    }
}
