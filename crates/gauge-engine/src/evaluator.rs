use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use gauge_observability::{emit_event, ObservabilityEvent, ProcessKind};
use gauge_wire::{
    EventBody, FinalStatus, ItemCompletedPayload, ItemFailedPayload, ItemStartedPayload,
    MetricScoredPayload, RunCompletedPayload, RunStartedPayload,
};
use tracing::Level;

use crate::adapter::{TaskAdapter, TaskInvocation};
use crate::checkpoint::{load_checkpoint_state, CheckpointRow, CheckpointWriter, ERROR_PREFIX};
use crate::config::EvalConfig;
use crate::dataset::{Dataset, DatasetItem};
use crate::metric::{Metric, MetricScore};
use crate::progress::ProgressObserver;
use crate::results::write_results_file;
use crate::stream::RunEventSink;

/// Grace period for in-flight items after cancellation.
const CANCEL_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ItemResult {
    pub item_id: String,
    pub index: usize,
    pub input: Value,
    pub item_metadata: Value,
    pub output: Value,
    pub expected: Option<Value>,
    pub time_seconds: f64,
    pub trace_id: Option<String>,
    pub trace_url: Option<String>,
    pub scores: BTreeMap<String, MetricScore>,
}

#[derive(Debug, Clone)]
pub struct ItemFailure {
    pub item_id: String,
    pub index: usize,
    pub input: Value,
    pub item_metadata: Value,
    pub error: String,
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalSummary {
    pub total_items: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub metric_averages: BTreeMap<String, f64>,
}

#[derive(Debug)]
pub struct EvalOutcome {
    pub results: BTreeMap<String, ItemResult>,
    pub errors: BTreeMap<String, ItemFailure>,
    pub summary: EvalSummary,
    pub final_status: FinalStatus,
}

enum ItemOutcome {
    Completed(ItemResult),
    Failed(ItemFailure),
    /// Checkpoint writes are the durability boundary; failure kills the run.
    CheckpointFatal(String),
}

struct RunContext {
    adapter: Arc<TaskAdapter>,
    metrics: Vec<Arc<Metric>>,
    observer: Arc<dyn ProgressObserver>,
    sink: Option<Arc<dyn RunEventSink>>,
    metric_semaphore: Arc<Semaphore>,
    writer: StdMutex<Option<CheckpointWriter>>,
    model_name: Option<String>,
    item_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl RunContext {
    fn emit(&self, body: EventBody) {
        if let Some(sink) = &self.sink {
            sink.emit(body);
        }
    }

    fn writer_guard(&self) -> MutexGuard<'_, Option<CheckpointWriter>> {
        match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn append_checkpoint(&self, row: &CheckpointRow) -> Result<(), String> {
        let mut guard = self.writer_guard();
        let Some(writer) = guard.as_mut() else {
            return Ok(());
        };
        writer.append(row).map_err(|err| err.to_string())
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn checkpoint_row_for_result(result: &ItemResult) -> CheckpointRow {
    CheckpointRow {
        item_id: result.item_id.clone(),
        input: value_text(&result.input),
        expected_output: result
            .expected
            .as_ref()
            .map(value_text)
            .unwrap_or_default(),
        output: value_text(&result.output),
        time_seconds: result.time_seconds,
        trace_id: result.trace_id.clone().unwrap_or_default(),
        scores: result
            .scores
            .iter()
            .map(|(name, score)| (name.clone(), score.score))
            .collect(),
        metric_meta: result
            .scores
            .iter()
            .filter(|(_, score)| !score.metadata.is_empty())
            .map(|(name, score)| {
                (
                    name.clone(),
                    score
                        .metadata
                        .iter()
                        .map(|(k, v)| (k.clone(), value_text(v)))
                        .collect(),
                )
            })
            .collect(),
    }
}

fn checkpoint_row_for_failure(failure: &ItemFailure, item: &DatasetItem) -> CheckpointRow {
    CheckpointRow {
        item_id: failure.item_id.clone(),
        input: value_text(&failure.input),
        expected_output: item
            .expected_output
            .as_ref()
            .map(value_text)
            .unwrap_or_default(),
        output: format!("{ERROR_PREFIX} {}", failure.error),
        time_seconds: 0.0,
        trace_id: failure.trace_id.clone().unwrap_or_default(),
        scores: BTreeMap::new(),
        metric_meta: BTreeMap::new(),
    }
}

async fn evaluate_item(
    ctx: Arc<RunContext>,
    index: usize,
    item: DatasetItem,
    permit: OwnedSemaphorePermit,
) -> ItemOutcome {
    // Held for the lifetime of the item; dropped on any exit path.
    let _permit = permit;

    let invocation = TaskInvocation {
        input: item.input.clone(),
        model_name: ctx.model_name.clone(),
        trace_id: None,
    };

    // Latency runs from the task invoke, not the semaphore acquire.
    let started = Instant::now();
    let invoke = ctx.adapter.invoke(invocation);
    let invoked = match ctx.item_timeout {
        Some(limit) => match tokio::time::timeout(limit, invoke).await {
            Ok(result) => result,
            Err(_) => {
                ctx.observer.fail_item_timeout(index, limit);
                let error = format!("task timed out after {:.1}s", limit.as_secs_f64());
                ctx.emit(EventBody::ItemFailed(ItemFailedPayload {
                    item_id: item.id.clone(),
                    error: error.clone(),
                    trace_id: None,
                    trace_url: None,
                }));
                return finish_failure(&ctx, index, &item, error, None);
            }
        },
        None => invoke.await,
    };
    let elapsed = started.elapsed();

    let task_output = match invoked {
        Ok(output) => output,
        Err(err) => {
            let error = format!("{err:#}");
            ctx.observer.fail_item(index, &error);
            ctx.emit(EventBody::ItemFailed(ItemFailedPayload {
                item_id: item.id.clone(),
                error: error.clone(),
                trace_id: None,
                trace_url: None,
            }));
            return finish_failure(&ctx, index, &item, error, None);
        }
    };

    ctx.observer.update_trace_info(
        index,
        task_output.trace_id.as_deref(),
        task_output.trace_url.as_deref(),
    );
    ctx.observer.update_output(index, &task_output.output);

    // Metric fan-out: every metric concurrently, each gated by the global
    // metric semaphore; results are published the moment they land.
    let mut metric_set: JoinSet<(String, MetricScore)> = JoinSet::new();
    for metric in &ctx.metrics {
        let metric = metric.clone();
        let ctx = ctx.clone();
        let output = task_output.output.clone();
        let expected = item.expected_output.clone();
        let input = item.input.clone();
        let item_id = item.id.clone();
        metric_set.spawn(Box::pin(async move {
            let _permit = match ctx.metric_semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    // Semaphore closed only on teardown; score as error.
                    return (
                        metric.name().to_string(),
                        MetricScore {
                            score: Some(0.0),
                            raw: Value::Null,
                            metadata: Map::from_iter([(
                                "error".to_string(),
                                json!("scheduler shut down"),
                            )]),
                            errored: true,
                        },
                    );
                }
            };
            ctx.observer.set_metric_computing(index, metric.name());
            let score = metric.score(&output, expected.as_ref(), &input).await;
            if score.errored {
                ctx.observer.set_metric_error(index, metric.name());
            } else {
                let display = score.score.map(|s| json!(s)).unwrap_or(Value::Null);
                let meta = (!score.metadata.is_empty()).then_some(&score.metadata);
                ctx.observer.update_metric(index, metric.name(), &display, meta);
            }
            ctx.emit(EventBody::MetricScored(MetricScoredPayload {
                item_id,
                metric_name: metric.name().to_string(),
                score_numeric: score.score,
                score_raw: (!score.raw.is_null()).then(|| score.raw.clone()),
                meta: Value::Object(score.metadata.clone()),
            }));
            (metric.name().to_string(), score)
        }));
    }

    let mut scores = BTreeMap::new();
    while let Some(joined) = metric_set.join_next().await {
        match joined {
            Ok((name, score)) => {
                scores.insert(name, score);
            }
            Err(err) => tracing::error!(error = %err, "metric task aborted"),
        }
    }

    let latency_ms = elapsed.as_secs_f64() * 1000.0;
    ctx.emit(EventBody::ItemCompleted(ItemCompletedPayload {
        item_id: item.id.clone(),
        output: task_output.output.clone(),
        latency_ms,
        trace_id: task_output.trace_id.clone(),
        trace_url: task_output.trace_url.clone(),
    }));
    ctx.observer.complete_item(index);

    let result = ItemResult {
        item_id: item.id.clone(),
        index,
        input: item.input.clone(),
        item_metadata: item.metadata.clone(),
        output: task_output.output,
        expected: item.expected_output.clone(),
        time_seconds: elapsed.as_secs_f64(),
        trace_id: task_output.trace_id,
        trace_url: task_output.trace_url,
        scores,
    };
    if let Err(message) = ctx.append_checkpoint(&checkpoint_row_for_result(&result)) {
        ctx.cancel.cancel();
        return ItemOutcome::CheckpointFatal(message);
    }
    ItemOutcome::Completed(result)
}

fn finish_failure(
    ctx: &RunContext,
    index: usize,
    item: &DatasetItem,
    error: String,
    trace_id: Option<String>,
) -> ItemOutcome {
    let failure = ItemFailure {
        item_id: item.id.clone(),
        index,
        input: item.input.clone(),
        item_metadata: item.metadata.clone(),
        error,
        trace_id,
    };
    if let Err(message) = ctx.append_checkpoint(&checkpoint_row_for_failure(&failure, item)) {
        ctx.cancel.cancel();
        return ItemOutcome::CheckpointFatal(message);
    }
    ItemOutcome::Failed(failure)
}

pub struct Evaluator {
    adapter: Arc<TaskAdapter>,
    metrics: Vec<Arc<Metric>>,
    observer: Arc<dyn ProgressObserver>,
    sink: Option<Arc<dyn RunEventSink>>,
    config: EvalConfig,
    cancel: CancellationToken,
}

impl Evaluator {
    pub fn new(
        adapter: TaskAdapter,
        metrics: Vec<Metric>,
        observer: Arc<dyn ProgressObserver>,
        config: EvalConfig,
    ) -> Self {
        Self {
            adapter: Arc::new(adapter),
            metrics: metrics.into_iter().map(Arc::new).collect(),
            observer,
            sink: None,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn RunEventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Token for external shutdown; cancelling stops issue and leaves a
    /// bounded grace for in-flight items.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, dataset: &Dataset) -> anyhow::Result<EvalOutcome> {
        let metric_names: Vec<String> =
            self.metrics.iter().map(|m| m.name().to_string()).collect();

        // ---- Resume --------------------------------------------------
        let mut results: BTreeMap<String, ItemResult> = BTreeMap::new();
        let mut errors: BTreeMap<String, ItemFailure> = BTreeMap::new();
        let mut processed: HashSet<String> = HashSet::new();
        if let Some(path) = &self.config.checkpoint_path {
            if let Some(state) = load_checkpoint_state(path, &metric_names)? {
                let index_of: HashMap<&str, usize> = dataset
                    .items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| (item.id.as_str(), i))
                    .collect();
                for row in &state.rows {
                    let Some(&index) = index_of.get(row.item_id.as_str()) else {
                        continue;
                    };
                    self.restore_row(index, row, &mut results, &mut errors);
                }
                processed = state.processed();
                tracing::info!(
                    restored = state.rows.len(),
                    run = %self.config.run_name,
                    "resuming from checkpoint; previously processed items will be skipped"
                );
            }
        }

        // ---- Run start ----------------------------------------------
        let mut run_metadata = self
            .config
            .run_metadata
            .as_object()
            .cloned()
            .unwrap_or_default();
        run_metadata.insert("total_items".to_string(), json!(dataset.len()));
        let mut run_config = self
            .config
            .run_config
            .as_object()
            .cloned()
            .unwrap_or_default();
        run_config.insert("run_name".to_string(), json!(self.config.run_name));

        let writer = match &self.config.checkpoint_path {
            Some(path) => Some(CheckpointWriter::open(path, metric_names.clone())?),
            None => None,
        };

        let ctx = Arc::new(RunContext {
            adapter: self.adapter.clone(),
            metrics: self.metrics.clone(),
            observer: self.observer.clone(),
            sink: self.sink.clone(),
            metric_semaphore: Arc::new(Semaphore::new(self.config.max_metric_concurrency)),
            writer: StdMutex::new(writer),
            model_name: self.config.model_name.clone(),
            item_timeout: self.config.item_timeout,
            cancel: self.cancel.clone(),
        });

        ctx.emit(EventBody::RunStarted(RunStartedPayload {
            external_run_id: Some(self.config.run_name.clone()),
            task: self.config.task_name.clone(),
            dataset: dataset.name.clone(),
            model: self.config.model_name.clone(),
            metrics: metric_names.clone(),
            run_metadata: Value::Object(run_metadata),
            run_config: Value::Object(run_config),
            started_at: Utc::now(),
        }));
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run.start",
                component: "engine.evaluator",
                run_id: Some(&self.config.run_name),
                item_id: None,
                metric: None,
                status: Some("start"),
                error_code: None,
                detail: Some(&dataset.name),
            },
        );

        // ---- Issue in dataset order ---------------------------------
        let item_semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut join_set: JoinSet<ItemOutcome> = JoinSet::new();

        for (index, item) in dataset.items.iter().enumerate() {
            if processed.contains(&item.id) {
                continue;
            }
            if self.cancel.is_cancelled() {
                break;
            }

            self.observer.start_item(index);
            let mut item_metadata = item.metadata.as_object().cloned().unwrap_or_default();
            item_metadata.insert(
                "task_started_at_ms".to_string(),
                json!(Utc::now().timestamp_millis()),
            );
            ctx.emit(EventBody::ItemStarted(ItemStartedPayload {
                item_id: item.id.clone(),
                index: index as u64,
                input: item.input.clone(),
                expected: item.expected_output.clone(),
                item_metadata: Value::Object(item_metadata),
            }));

            let permit = tokio::select! {
                acquired = item_semaphore.clone().acquire_owned() => match acquired {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.cancel.cancelled() => break,
            };
            join_set.spawn(evaluate_item(ctx.clone(), index, item.clone(), permit));
        }

        // ---- Drain (bounded grace on cancellation) ------------------
        let mut fatal: Option<String> = None;
        let record = |outcome: ItemOutcome,
                          results: &mut BTreeMap<String, ItemResult>,
                          errors: &mut BTreeMap<String, ItemFailure>,
                          fatal: &mut Option<String>| {
            match outcome {
                ItemOutcome::Completed(result) => {
                    results.insert(result.item_id.clone(), result);
                }
                ItemOutcome::Failed(failure) => {
                    errors.insert(failure.item_id.clone(), failure);
                }
                ItemOutcome::CheckpointFatal(message) => {
                    if fatal.is_none() {
                        *fatal = Some(message);
                    }
                }
            }
        };

        loop {
            if self.cancel.is_cancelled() {
                let deadline = tokio::time::sleep(CANCEL_GRACE);
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        joined = join_set.join_next() => match joined {
                            Some(Ok(outcome)) => record(outcome, &mut results, &mut errors, &mut fatal),
                            Some(Err(err)) => tracing::error!(error = %err, "item task panicked"),
                            None => break,
                        },
                        _ = &mut deadline => {
                            tracing::warn!("cancellation grace expired; aborting in-flight items");
                            join_set.abort_all();
                            while let Some(joined) = join_set.join_next().await {
                                if let Ok(outcome) = joined {
                                    record(outcome, &mut results, &mut errors, &mut fatal);
                                }
                            }
                            break;
                        }
                    }
                }
                break;
            }

            tokio::select! {
                joined = join_set.join_next() => match joined {
                    Some(Ok(outcome)) => record(outcome, &mut results, &mut errors, &mut fatal),
                    Some(Err(err)) => tracing::error!(error = %err, "item task panicked"),
                    None => break,
                },
                _ = self.cancel.cancelled() => {}
            }
        }

        // ---- Summary + terminal event -------------------------------
        let summary = build_summary(&metric_names, &results, &errors);
        let unprocessed = dataset.len() - results.len() - errors.len();
        let final_status = if fatal.is_some() || unprocessed > 0 {
            FinalStatus::Failed
        } else {
            FinalStatus::Completed
        };
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run.finish",
                component: "engine.evaluator",
                run_id: Some(&self.config.run_name),
                item_id: None,
                metric: None,
                status: Some(final_status.as_str()),
                error_code: None,
                detail: fatal.as_deref(),
            },
        );

        if let Some(sink) = &self.sink {
            let completed = EventBody::RunCompleted(RunCompletedPayload {
                ended_at: Utc::now(),
                summary: serde_json::to_value(&summary).unwrap_or(Value::Null),
                final_status,
            });
            if let Err(err) = sink.emit_sync(completed).await {
                tracing::warn!(error = %err, "terminal run event was not delivered");
            }
            sink.close().await;
        }

        let outcome = EvalOutcome {
            results,
            errors,
            summary,
            final_status,
        };

        if let Some(path) = &self.config.results_path {
            write_results_file(
                path,
                &dataset.name,
                &self.config.run_name,
                &metric_names,
                &outcome,
            )?;
        }

        if let Some(message) = fatal {
            anyhow::bail!("checkpoint write failed: {message}");
        }
        Ok(outcome)
    }

    /// Feed one checkpoint row back through the observer protocol and into
    /// the result maps, so resumed runs show full history.
    fn restore_row(
        &self,
        index: usize,
        row: &CheckpointRow,
        results: &mut BTreeMap<String, ItemResult>,
        errors: &mut BTreeMap<String, ItemFailure>,
    ) {
        self.observer.start_item(index);
        if row.is_error() {
            let message = row.error_message().unwrap_or("unknown error").to_string();
            self.observer.fail_item(index, &message);
            errors.insert(
                row.item_id.clone(),
                ItemFailure {
                    item_id: row.item_id.clone(),
                    index,
                    input: json!(row.input),
                    item_metadata: json!({}),
                    error: message,
                    trace_id: (!row.trace_id.is_empty()).then(|| row.trace_id.clone()),
                },
            );
            return;
        }

        self.observer.update_output(index, &json!(row.output));
        let mut scores = BTreeMap::new();
        for (metric, score) in &row.scores {
            let metadata: Map<String, Value> = row
                .metric_meta
                .get(metric)
                .map(|meta| meta.iter().map(|(k, v)| (k.clone(), json!(v))).collect())
                .unwrap_or_default();
            let errored = metadata.contains_key("error");
            if let Some(value) = score {
                self.observer.update_metric(
                    index,
                    metric,
                    &json!(value),
                    (!metadata.is_empty()).then_some(&metadata),
                );
            }
            scores.insert(
                metric.clone(),
                MetricScore {
                    score: *score,
                    raw: score.map(|s| json!(s)).unwrap_or(Value::Null),
                    metadata,
                    errored,
                },
            );
        }
        self.observer.complete_item(index);
        results.insert(
            row.item_id.clone(),
            ItemResult {
                item_id: row.item_id.clone(),
                index,
                input: json!(row.input),
                item_metadata: json!({}),
                output: json!(row.output),
                expected: (!row.expected_output.is_empty())
                    .then(|| json!(row.expected_output)),
                time_seconds: row.time_seconds,
                trace_id: (!row.trace_id.is_empty()).then(|| row.trace_id.clone()),
                trace_url: None,
                scores,
            },
        );
    }
}

/// Items that errored contribute 0 to every metric average, so failures are
/// visible in the aggregate rather than silently excluded.
fn build_summary(
    metric_names: &[String],
    results: &BTreeMap<String, ItemResult>,
    errors: &BTreeMap<String, ItemFailure>,
) -> EvalSummary {
    let succeeded = results.len();
    let failed = errors.len();
    let total = succeeded + failed;

    let avg_latency_ms = if succeeded > 0 {
        results
            .values()
            .map(|r| r.time_seconds * 1000.0)
            .sum::<f64>()
            / succeeded as f64
    } else {
        0.0
    };

    let mut metric_averages = BTreeMap::new();
    for metric in metric_names {
        let mut sum = 0.0;
        let mut count = 0usize;
        for result in results.values() {
            if let Some(score) = result.scores.get(metric).and_then(|s| s.score) {
                sum += score;
                count += 1;
            }
        }
        count += failed;
        let average = if count > 0 { sum / count as f64 } else { 0.0 };
        metric_averages.insert(metric.clone(), average);
    }

    EvalSummary {
        total_items: total,
        succeeded,
        failed,
        success_rate: if total > 0 {
            succeeded as f64 / total as f64
        } else {
            0.0
        },
        avg_latency_ms,
        metric_averages,
    }
}
