use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

pub const DEFAULT_MAX_CONCURRENCY: usize = 10;
pub const DEFAULT_MAX_METRIC_CONCURRENCY: usize = 5;

/// Per-run engine configuration.
#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub run_name: String,
    pub task_name: String,
    pub model_name: Option<String>,
    /// Cap on items evaluated in parallel.
    pub max_concurrency: usize,
    /// Cap on metric computations in flight across all items.
    pub max_metric_concurrency: usize,
    /// Hard per-item wall-clock limit; in-flight work is abandoned on expiry.
    pub item_timeout: Option<Duration>,
    /// Enables checkpointing and resume when set.
    pub checkpoint_path: Option<PathBuf>,
    /// Final results JSON, written when set.
    pub results_path: Option<PathBuf>,
    /// Free-form, forwarded to the platform on `run_started`.
    pub run_metadata: Value,
    pub run_config: Value,
}

impl EvalConfig {
    pub fn new(run_name: impl Into<String>, task_name: impl Into<String>) -> Self {
        Self {
            run_name: run_name.into(),
            task_name: task_name.into(),
            model_name: None,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_metric_concurrency: DEFAULT_MAX_METRIC_CONCURRENCY,
            item_timeout: None,
            checkpoint_path: None,
            results_path: None,
            run_metadata: Value::Object(Default::default()),
            run_config: Value::Object(Default::default()),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_name = Some(model.into());
        self
    }

    pub fn with_max_concurrency(mut self, cap: usize) -> Self {
        self.max_concurrency = cap.max(1);
        self
    }

    pub fn with_max_metric_concurrency(mut self, cap: usize) -> Self {
        self.max_metric_concurrency = cap.max(1);
        self
    }

    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = Some(timeout);
        self
    }

    pub fn with_checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    pub fn with_results_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.results_path = Some(path.into());
        self
    }
}
