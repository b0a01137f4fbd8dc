use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::dataset::DatasetItem;

/// The scheduler's view of live progress. The evaluator only ever talks to
/// this trait, which is what keeps it decoupled from UI concerns.
pub trait ProgressObserver: Send + Sync {
    fn start_item(&self, index: usize);
    fn update_trace_info(&self, index: usize, trace_id: Option<&str>, trace_url: Option<&str>);
    fn update_output(&self, index: usize, output: &Value);
    fn set_metric_computing(&self, index: usize, metric: &str);
    fn update_metric(
        &self,
        index: usize,
        metric: &str,
        value: &Value,
        metadata: Option<&Map<String, Value>>,
    );
    fn set_metric_error(&self, index: usize, metric: &str);
    fn complete_item(&self, index: usize);
    fn fail_item(&self, index: usize, error: &str);
    fn fail_item_timeout(&self, index: usize, timeout: Duration);
    fn snapshot(&self) -> ProgressSnapshot;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InProgress,
    Completed,
    Error,
}

impl ItemStatus {
    fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Completed => "completed",
            ItemStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
enum MetricCell {
    Pending,
    Computing,
    Value(String),
    Error,
}

impl MetricCell {
    fn display(&self) -> String {
        match self {
            MetricCell::Pending => "pending".to_string(),
            MetricCell::Computing => "computing...".to_string(),
            MetricCell::Value(v) => v.clone(),
            MetricCell::Error => "error".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct ItemState {
    input: String,
    expected: String,
    output: String,
    status: ItemStatus,
    started: Option<Instant>,
    elapsed: Option<Duration>,
    trace_id: Option<String>,
    trace_url: Option<String>,
    metrics: BTreeMap<String, MetricCell>,
    metric_meta: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotRow {
    pub index: usize,
    pub status: String,
    pub input: String,
    pub output: String,
    pub expected: String,
    pub metric_values: Vec<String>,
    pub metric_meta: BTreeMap<String, BTreeMap<String, String>>,
    pub time: String,
    pub latency_ms: Option<u64>,
    pub trace_id: Option<String>,
    pub trace_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SnapshotStats {
    pub total: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub failed: usize,
    pub pending: usize,
    pub success_rate: f64,
}

/// Fully self-contained; safe to hand to any thread or serialize for a UI.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub rows: Vec<SnapshotRow>,
    pub stats: SnapshotStats,
    pub metric_names: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

pub struct ProgressTracker {
    metrics: Vec<String>,
    states: Mutex<Vec<ItemState>>,
}

fn display_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn format_metric_value(value: &Value) -> String {
    let text = match value {
        Value::Bool(true) => "\u{2713}".to_string(),
        Value::Bool(false) => "\u{2717}".to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 => format!("{}", f as i64),
            Some(f) => format!("{f:.3}"),
            None => n.to_string(),
        },
        Value::Null => "None".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() > 50 {
        let head: String = text.chars().take(50).collect();
        format!("{head}...")
    } else {
        text
    }
}

impl ProgressTracker {
    pub fn new(items: &[DatasetItem], metrics: Vec<String>) -> Self {
        let states = items
            .iter()
            .map(|item| ItemState {
                input: display_text(&item.input),
                expected: item
                    .expected_output
                    .as_ref()
                    .map(display_text)
                    .unwrap_or_else(|| "N/A".to_string()),
                output: "pending".to_string(),
                status: ItemStatus::Pending,
                started: None,
                elapsed: None,
                trace_id: None,
                trace_url: None,
                metrics: metrics
                    .iter()
                    .map(|m| (m.clone(), MetricCell::Pending))
                    .collect(),
                metric_meta: BTreeMap::new(),
            })
            .collect();
        Self {
            metrics,
            states: Mutex::new(states),
        }
    }

    fn lock_states(&self) -> std::sync::MutexGuard<'_, Vec<ItemState>> {
        match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn with_state<R>(&self, index: usize, f: impl FnOnce(&mut ItemState) -> R) -> Option<R> {
        let mut states = self.lock_states();
        states.get_mut(index).map(f)
    }
}

impl ProgressObserver for ProgressTracker {
    fn start_item(&self, index: usize) {
        self.with_state(index, |state| {
            state.status = ItemStatus::InProgress;
            state.started = Some(Instant::now());
        });
    }

    fn update_trace_info(&self, index: usize, trace_id: Option<&str>, trace_url: Option<&str>) {
        self.with_state(index, |state| {
            if let Some(id) = trace_id {
                state.trace_id = Some(id.to_string());
            }
            if let Some(url) = trace_url {
                state.trace_url = Some(url.to_string());
            }
        });
    }

    fn update_output(&self, index: usize, output: &Value) {
        self.with_state(index, |state| {
            state.output = display_text(output);
        });
    }

    fn set_metric_computing(&self, index: usize, metric: &str) {
        self.with_state(index, |state| {
            state
                .metrics
                .insert(metric.to_string(), MetricCell::Computing);
        });
    }

    fn update_metric(
        &self,
        index: usize,
        metric: &str,
        value: &Value,
        metadata: Option<&Map<String, Value>>,
    ) {
        self.with_state(index, |state| {
            state
                .metrics
                .insert(metric.to_string(), MetricCell::Value(format_metric_value(value)));
            if let Some(meta) = metadata {
                let slot = state.metric_meta.entry(metric.to_string()).or_default();
                for (key, val) in meta {
                    slot.insert(key.clone(), display_text(val));
                }
            }
        });
    }

    fn set_metric_error(&self, index: usize, metric: &str) {
        self.with_state(index, |state| {
            state.metrics.insert(metric.to_string(), MetricCell::Error);
        });
    }

    fn complete_item(&self, index: usize) {
        self.with_state(index, |state| {
            state.elapsed = state.started.map(|s| s.elapsed());
            state.status = ItemStatus::Completed;
        });
    }

    fn fail_item(&self, index: usize, error: &str) {
        self.with_state(index, |state| {
            state.elapsed = state.started.map(|s| s.elapsed());
            state.status = ItemStatus::Error;
            state.output = format!("error: {error}");
            for cell in state.metrics.values_mut() {
                *cell = MetricCell::Error;
            }
        });
    }

    fn fail_item_timeout(&self, index: usize, timeout: Duration) {
        self.with_state(index, |state| {
            state.elapsed = Some(timeout);
            state.status = ItemStatus::Error;
            state.output = "timeout".to_string();
            for cell in state.metrics.values_mut() {
                *cell = MetricCell::Error;
            }
        });
    }

    fn snapshot(&self) -> ProgressSnapshot {
        let states = self.lock_states();
        let total = states.len();
        let mut completed = 0;
        let mut in_progress = 0;
        let mut failed = 0;
        for state in states.iter() {
            match state.status {
                ItemStatus::Completed => completed += 1,
                ItemStatus::InProgress => in_progress += 1,
                ItemStatus::Error => failed += 1,
                ItemStatus::Pending => {}
            }
        }
        let pending = total - completed - in_progress - failed;

        let rows = states
            .iter()
            .enumerate()
            .map(|(index, state)| SnapshotRow {
                index,
                status: state.status.as_str().to_string(),
                input: state.input.clone(),
                output: state.output.clone(),
                expected: state.expected.clone(),
                metric_values: self
                    .metrics
                    .iter()
                    .map(|m| {
                        state
                            .metrics
                            .get(m)
                            .map(MetricCell::display)
                            .unwrap_or_default()
                    })
                    .collect(),
                metric_meta: state.metric_meta.clone(),
                time: match (state.status, state.elapsed) {
                    (ItemStatus::InProgress, _) => "running...".to_string(),
                    (_, Some(elapsed)) => format!("{}s", elapsed.as_secs()),
                    _ => "pending".to_string(),
                },
                latency_ms: state.elapsed.map(|e| e.as_millis() as u64),
                trace_id: state.trace_id.clone(),
                trace_url: state.trace_url.clone(),
            })
            .collect();

        ProgressSnapshot {
            rows,
            stats: SnapshotStats {
                total,
                completed,
                in_progress,
                failed,
                pending,
                success_rate: if total > 0 {
                    completed as f64 / total as f64 * 100.0
                } else {
                    0.0
                },
            },
            metric_names: self.metrics.clone(),
            last_updated: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn items(n: usize) -> Vec<DatasetItem> {
        (0..n)
            .map(|i| {
                DatasetItem::new(format!("item_{i}"), json!(format!("input {i}")))
                    .with_expected(json!(format!("expected {i}")))
            })
            .collect()
    }

    #[test]
    fn lifecycle_updates_counts() {
        let tracker = ProgressTracker::new(&items(3), vec!["m1".to_string()]);

        tracker.start_item(0);
        let snap = tracker.snapshot();
        assert_eq!(snap.stats.in_progress, 1);
        assert_eq!(snap.stats.pending, 2);

        tracker.update_output(0, &json!("out"));
        tracker.update_metric(0, "m1", &json!(1.0), None);
        tracker.complete_item(0);

        tracker.start_item(1);
        tracker.fail_item(1, "exploded");

        let snap = tracker.snapshot();
        assert_eq!(snap.stats.completed, 1);
        assert_eq!(snap.stats.failed, 1);
        assert_eq!(snap.stats.pending, 1);
        assert!((snap.stats.success_rate - 100.0 / 3.0).abs() < 1e-9);

        assert_eq!(snap.rows[0].status, "completed");
        assert_eq!(snap.rows[0].metric_values, vec!["1".to_string()]);
        assert_eq!(snap.rows[1].status, "error");
        assert!(snap.rows[1].output.contains("exploded"));
        assert_eq!(snap.rows[1].metric_values, vec!["error".to_string()]);
        assert_eq!(snap.rows[2].status, "pending");
    }

    #[test]
    fn timeout_marks_error_with_timeout_output() {
        let tracker = ProgressTracker::new(&items(1), vec![]);
        tracker.start_item(0);
        tracker.fail_item_timeout(0, Duration::from_secs(30));
        let snap = tracker.snapshot();
        assert_eq!(snap.rows[0].status, "error");
        assert_eq!(snap.rows[0].output, "timeout");
        assert_eq!(snap.rows[0].latency_ms, Some(30_000));
    }

    #[test]
    fn metric_metadata_is_flattened_to_strings() {
        let tracker = ProgressTracker::new(&items(1), vec!["m1".to_string()]);
        tracker.start_item(0);
        let mut meta = Map::new();
        meta.insert("note".to_string(), json!("fine"));
        meta.insert("count".to_string(), json!(3));
        tracker.update_metric(0, "m1", &json!(0.5), Some(&meta));
        let snap = tracker.snapshot();
        assert_eq!(snap.rows[0].metric_meta["m1"]["note"], "fine");
        assert_eq!(snap.rows[0].metric_meta["m1"]["count"], "3");
        assert_eq!(snap.rows[0].metric_values, vec!["0.500".to_string()]);
    }

    #[test]
    fn metric_display_formats() {
        assert_eq!(format_metric_value(&json!(true)), "\u{2713}");
        assert_eq!(format_metric_value(&json!(false)), "\u{2717}");
        assert_eq!(format_metric_value(&json!(2.0)), "2");
        assert_eq!(format_metric_value(&json!(0.1234)), "0.123");
        assert_eq!(format_metric_value(&Value::Null), "None");
        let long = "x".repeat(60);
        assert!(format_metric_value(&json!(long)).ends_with("..."));
    }

    #[test]
    fn snapshot_is_safe_under_concurrent_reads() {
        let tracker = std::sync::Arc::new(ProgressTracker::new(&items(8), vec!["m".to_string()]));
        let mut handles = Vec::new();
        for i in 0..8 {
            let tracker = tracker.clone();
            handles.push(std::thread::spawn(move || {
                tracker.start_item(i);
                tracker.update_output(i, &json!("o"));
                tracker.complete_item(i);
                tracker.snapshot()
            }));
        }
        for handle in handles {
            let snap = handle.join().unwrap();
            assert_eq!(snap.stats.total, 8);
        }
        assert_eq!(tracker.snapshot().stats.completed, 8);
    }
}
