use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Map, Value};

use crate::blocking::{run_with_heartbeat, BlockingMonitor};

/// What a metric function may return.
#[derive(Debug, Clone)]
pub enum MetricValue {
    Number(f64),
    Bool(bool),
    /// Deliberately unscored; recorded with a null numeric.
    Unscored,
    Detailed {
        score: Option<f64>,
        metadata: Map<String, Value>,
    },
}

/// Normalized score record; this is what lands in events, the tracker, and
/// the checkpoint. A numeric of 0 is a valid failure contribution.
#[derive(Debug, Clone)]
pub struct MetricScore {
    pub score: Option<f64>,
    pub raw: Value,
    pub metadata: Map<String, Value>,
    pub errored: bool,
}

impl MetricScore {
    fn from_value(value: MetricValue) -> Self {
        match value {
            MetricValue::Number(n) => Self {
                score: Some(n),
                raw: json!(n),
                metadata: Map::new(),
                errored: false,
            },
            MetricValue::Bool(b) => Self {
                score: Some(if b { 1.0 } else { 0.0 }),
                raw: json!(b),
                metadata: Map::new(),
                errored: false,
            },
            MetricValue::Unscored => Self {
                score: None,
                raw: Value::Null,
                metadata: Map::new(),
                errored: false,
            },
            MetricValue::Detailed { score, metadata } => {
                let raw = json!({ "score": score, "metadata": metadata.clone() });
                Self {
                    score,
                    raw,
                    metadata,
                    errored: false,
                }
            }
        }
    }

    fn from_error(message: String) -> Self {
        let mut metadata = Map::new();
        metadata.insert("error".to_string(), json!(message));
        Self {
            score: Some(0.0),
            raw: Value::Null,
            metadata,
            errored: true,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.metadata.get("error").and_then(Value::as_str)
    }
}

type SyncUnary = dyn Fn(&Value) -> anyhow::Result<MetricValue> + Send + Sync;
type SyncBinary = dyn Fn(&Value, Option<&Value>) -> anyhow::Result<MetricValue> + Send + Sync;
type SyncTernary =
    dyn Fn(&Value, Option<&Value>, &Value) -> anyhow::Result<MetricValue> + Send + Sync;
type AsyncUnary =
    dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<MetricValue>> + Send + Sync;
type AsyncBinary =
    dyn Fn(Value, Option<Value>) -> BoxFuture<'static, anyhow::Result<MetricValue>> + Send + Sync;
type AsyncTernary = dyn Fn(Value, Option<Value>, Value) -> BoxFuture<'static, anyhow::Result<MetricValue>>
    + Send
    + Sync;

/// Metric arity is declared at registration; the runner binds exactly what
/// the function takes: output, output+expected, or output+expected+input.
enum MetricFn {
    SyncUnary(Arc<SyncUnary>),
    SyncBinary(Arc<SyncBinary>),
    SyncTernary(Arc<SyncTernary>),
    AsyncUnary(Arc<AsyncUnary>),
    AsyncBinary(Arc<AsyncBinary>),
    AsyncTernary(Arc<AsyncTernary>),
}

pub struct Metric {
    name: String,
    func: MetricFn,
    monitor: BlockingMonitor,
}

impl Metric {
    fn new(name: String, func: MetricFn) -> Self {
        Self {
            monitor: BlockingMonitor::new("metric", name.clone()),
            name,
            func,
        }
    }

    pub fn unary<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<MetricValue> + Send + Sync + 'static,
    {
        Self::new(name.into(), MetricFn::SyncUnary(Arc::new(func)))
    }

    pub fn binary<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Value, Option<&Value>) -> anyhow::Result<MetricValue> + Send + Sync + 'static,
    {
        Self::new(name.into(), MetricFn::SyncBinary(Arc::new(func)))
    }

    pub fn ternary<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Value, Option<&Value>, &Value) -> anyhow::Result<MetricValue>
            + Send
            + Sync
            + 'static,
    {
        Self::new(name.into(), MetricFn::SyncTernary(Arc::new(func)))
    }

    pub fn async_unary<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<MetricValue>> + Send + 'static,
    {
        Self::new(
            name.into(),
            MetricFn::AsyncUnary(Arc::new(move |output| func(output).boxed())),
        )
    }

    pub fn async_binary<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<MetricValue>> + Send + 'static,
    {
        Self::new(
            name.into(),
            MetricFn::AsyncBinary(Arc::new(move |output, expected| {
                func(output, expected).boxed()
            })),
        )
    }

    pub fn async_ternary<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value, Option<Value>, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<MetricValue>> + Send + 'static,
    {
        Self::new(
            name.into(),
            MetricFn::AsyncTernary(Arc::new(move |output, expected, input| {
                func(output, expected, input).boxed()
            })),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn monitor(&self) -> &BlockingMonitor {
        &self.monitor
    }

    /// Run the metric and normalize. Never errors: failures and panics come
    /// back as a zero score with the message in metadata.
    pub async fn score(
        &self,
        output: &Value,
        expected: Option<&Value>,
        input: &Value,
    ) -> MetricScore {
        let result = match &self.func {
            MetricFn::SyncUnary(func) => {
                let func = func.clone();
                let output = output.clone();
                run_sync(self.name.clone(), move || func(&output)).await
            }
            MetricFn::SyncBinary(func) => {
                let func = func.clone();
                let output = output.clone();
                let expected = expected.cloned();
                run_sync(self.name.clone(), move || func(&output, expected.as_ref())).await
            }
            MetricFn::SyncTernary(func) => {
                let func = func.clone();
                let output = output.clone();
                let expected = expected.cloned();
                let input = input.clone();
                run_sync(self.name.clone(), move || {
                    func(&output, expected.as_ref(), &input)
                })
                .await
            }
            MetricFn::AsyncUnary(func) => {
                self.run_async(func(output.clone())).await
            }
            MetricFn::AsyncBinary(func) => {
                self.run_async(func(output.clone(), expected.cloned())).await
            }
            MetricFn::AsyncTernary(func) => {
                self.run_async(func(output.clone(), expected.cloned(), input.clone()))
                    .await
            }
        };

        match result {
            Ok(value) => MetricScore::from_value(value),
            Err(err) => MetricScore::from_error(err.to_string()),
        }
    }

    async fn run_async(
        &self,
        fut: BoxFuture<'static, anyhow::Result<MetricValue>>,
    ) -> anyhow::Result<MetricValue> {
        let name = self.name.clone();
        let fut = async move {
            let caught = std::panic::AssertUnwindSafe(fut).catch_unwind().await;
            match caught {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("metric `{name}` panicked")),
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

async fn run_sync<F>(name: String, func: F) -> anyhow::Result<MetricValue>
where
    F: FnOnce() -> anyhow::Result<MetricValue> + Send + 'static,
{
    tokio::task::spawn_blocking(func).await.map_err(|err| {
        if err.is_panic() {
            anyhow::anyhow!("metric `{name}` panicked")
        } else {
            anyhow::anyhow!("metric `{name}` was cancelled")
        }
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn number_bool_and_none_normalize() {
        let number = Metric::unary("n", |_| Ok(MetricValue::Number(0.75)));
        let score = number.score(&json!("out"), None, &json!("in")).await;
        assert_eq!(score.score, Some(0.75));
        assert_eq!(score.raw, json!(0.75));
        assert!(!score.errored);

        let truthy = Metric::unary("b", |_| Ok(MetricValue::Bool(true)));
        let score = truthy.score(&json!("out"), None, &json!("in")).await;
        assert_eq!(score.score, Some(1.0));
        assert_eq!(score.raw, json!(true));

        let unscored = Metric::unary("u", |_| Ok(MetricValue::Unscored));
        let score = unscored.score(&json!("out"), None, &json!("in")).await;
        assert_eq!(score.score, None);
        assert!(!score.errored);
    }

    #[tokio::test]
    async fn detailed_returns_pass_through() {
        let metric = Metric::binary("d", |_, _| {
            let mut meta = Map::new();
            meta.insert("reason".to_string(), json!("matched"));
            Ok(MetricValue::Detailed {
                score: Some(0.5),
                metadata: meta,
            })
        });
        let score = metric.score(&json!("out"), Some(&json!("exp")), &json!("in")).await;
        assert_eq!(score.score, Some(0.5));
        assert_eq!(score.metadata["reason"], json!("matched"));
        assert_eq!(score.raw["score"], json!(0.5));
    }

    #[tokio::test]
    async fn errors_become_zero_scores_with_message() {
        let metric = Metric::ternary("bad", |_, _, _| Err(anyhow::anyhow!("boom")));
        let score = metric.score(&json!("out"), None, &json!("in")).await;
        assert_eq!(score.score, Some(0.0));
        assert!(score.errored);
        assert_eq!(score.error_message(), Some("boom"));
    }

    #[tokio::test]
    async fn sync_panic_becomes_error_score() {
        let metric = Metric::unary("panics", |_| panic!("metric exploded"));
        let score = metric.score(&json!("out"), None, &json!("in")).await;
        assert!(score.errored);
        assert!(score.error_message().unwrap().contains("panicked"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn async_panic_becomes_error_score() {
        let metric = Metric::async_unary("panics", |_| async move {
            panic!("metric exploded");
            #[allow(unreachable_code)]
            Ok(MetricValue::Unscored)
        });
        let score = metric.score(&json!("out"), None, &json!("in")).await;
        assert!(score.errored);
        assert!(score.error_message().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn ternary_sees_the_raw_input() {
        let metric = Metric::ternary("echoes", |out, expected, input| {
            let ok = out == input && expected.is_none();
            Ok(MetricValue::Bool(ok))
        });
        let score = metric.score(&json!("same"), None, &json!("same")).await;
        assert_eq!(score.score, Some(1.0));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn blocking_async_metric_warns_once_across_items() {
        let metric = Metric::async_binary("blocker", |_, _| async move {
            std::thread::sleep(Duration::from_millis(1200));
            Ok(MetricValue::Number(1.0))
        });
        for _ in 0..2 {
            let score = metric.score(&json!("out"), None, &json!("in")).await;
            assert_eq!(score.score, Some(1.0));
        }
        assert_eq!(metric.monitor().warn_count(), 1);
    }

    #[tokio::test]
    async fn sync_metric_is_not_probed() {
        let metric = Metric::binary("sync", |_, _| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(MetricValue::Number(0.8))
        });
        let score = metric.score(&json!("out"), None, &json!("in")).await;
        assert_eq!(score.score, Some(0.8));
        assert_eq!(metric.monitor().call_count(), 0);
    }
}
