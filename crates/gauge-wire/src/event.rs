use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const SCHEMA_VERSION: u32 = 1;

/// Envelope shared by every run event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEventV1 {
    pub schema_version: u32,
    pub event_id: Uuid,
    /// Per-run monotonic, assigned at emit time, starts at 1.
    pub sequence: u64,
    pub sent_at: DateTime<Utc>,
    pub run_id: String,
    #[serde(flatten)]
    pub body: EventBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventBody {
    RunStarted(RunStartedPayload),
    ItemStarted(ItemStartedPayload),
    MetricScored(MetricScoredPayload),
    ItemCompleted(ItemCompletedPayload),
    ItemFailed(ItemFailedPayload),
    RunCompleted(RunCompletedPayload),
}

impl EventBody {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventBody::RunStarted(_) => "run_started",
            EventBody::ItemStarted(_) => "item_started",
            EventBody::MetricScored(_) => "metric_scored",
            EventBody::ItemCompleted(_) => "item_completed",
            EventBody::ItemFailed(_) => "item_failed",
            EventBody::RunCompleted(_) => "run_completed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunStartedPayload {
    #[serde(default)]
    pub external_run_id: Option<String>,
    pub task: String,
    pub dataset: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default = "empty_object")]
    pub run_metadata: Value,
    #[serde(default = "empty_object")]
    pub run_config: Value,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemStartedPayload {
    pub item_id: String,
    pub index: u64,
    pub input: Value,
    #[serde(default)]
    pub expected: Option<Value>,
    #[serde(default = "empty_object")]
    pub item_metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricScoredPayload {
    pub item_id: String,
    pub metric_name: String,
    #[serde(default)]
    pub score_numeric: Option<f64>,
    #[serde(default)]
    pub score_raw: Option<Value>,
    #[serde(default = "empty_object")]
    pub meta: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemCompletedPayload {
    pub item_id: String,
    pub output: Value,
    pub latency_ms: f64,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub trace_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemFailedPayload {
    pub item_id: String,
    pub error: String,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub trace_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalStatus {
    Completed,
    Failed,
}

impl FinalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FinalStatus::Completed => "COMPLETED",
            FinalStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunCompletedPayload {
    pub ended_at: DateTime<Utc>,
    #[serde(default = "empty_object")]
    pub summary: Value,
    pub final_status: FinalStatus,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl RunEventV1 {
    /// Structural checks beyond what serde enforces.
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(format!(
                "unsupported schema_version {} (expected {})",
                self.schema_version, SCHEMA_VERSION
            ));
        }
        if self.sequence == 0 {
            return Err("sequence must be >= 1".to_string());
        }
        if self.run_id.trim().is_empty() {
            return Err("run_id must be non-empty".to_string());
        }
        match &self.body {
            EventBody::ItemCompleted(p) if p.latency_ms < 0.0 => {
                Err("latency_ms must be >= 0".to_string())
            }
            EventBody::ItemFailed(p) if p.error.is_empty() => {
                Err("item_failed requires a non-empty error".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(body: EventBody) -> RunEventV1 {
        RunEventV1 {
            schema_version: SCHEMA_VERSION,
            event_id: Uuid::new_v4(),
            sequence: 1,
            sent_at: Utc::now(),
            run_id: "run-1".to_string(),
            body,
        }
    }

    #[test]
    fn event_serializes_with_flat_type_and_payload() {
        let evt = envelope(EventBody::ItemStarted(ItemStartedPayload {
            item_id: "item_0".to_string(),
            index: 0,
            input: json!("hello"),
            expected: Some(json!("world")),
            item_metadata: json!({}),
        }));
        let value = serde_json::to_value(&evt).unwrap();
        assert_eq!(value["type"], "item_started");
        assert_eq!(value["payload"]["item_id"], "item_0");
        assert_eq!(value["schema_version"], 1);

        let back: RunEventV1 = serde_json::from_value(value).unwrap();
        assert_eq!(back, evt);
    }

    #[test]
    fn every_body_round_trips() {
        let bodies = vec![
            EventBody::RunStarted(RunStartedPayload {
                external_run_id: Some("ext".to_string()),
                task: "qa".to_string(),
                dataset: "ds".to_string(),
                model: Some("gpt-x".to_string()),
                metrics: vec!["m1".to_string()],
                run_metadata: json!({"total_items": 3}),
                run_config: json!({}),
                started_at: Utc::now(),
            }),
            EventBody::MetricScored(MetricScoredPayload {
                item_id: "i".to_string(),
                metric_name: "m1".to_string(),
                score_numeric: Some(0.5),
                score_raw: Some(json!(0.5)),
                meta: json!({}),
            }),
            EventBody::ItemCompleted(ItemCompletedPayload {
                item_id: "i".to_string(),
                output: json!("ok"),
                latency_ms: 12.0,
                trace_id: None,
                trace_url: None,
            }),
            EventBody::ItemFailed(ItemFailedPayload {
                item_id: "i".to_string(),
                error: "boom".to_string(),
                trace_id: None,
                trace_url: None,
            }),
            EventBody::RunCompleted(RunCompletedPayload {
                ended_at: Utc::now(),
                summary: json!({"success_rate": 1.0}),
                final_status: FinalStatus::Completed,
            }),
        ];
        for body in bodies {
            let evt = envelope(body);
            let text = serde_json::to_string(&evt).unwrap();
            let back: RunEventV1 = serde_json::from_str(&text).unwrap();
            assert_eq!(back, evt);
        }
    }

    #[test]
    fn validation_rejects_bad_envelopes() {
        let mut evt = envelope(EventBody::ItemFailed(ItemFailedPayload {
            item_id: "i".to_string(),
            error: "x".to_string(),
            trace_id: None,
            trace_url: None,
        }));
        assert!(evt.validate().is_ok());

        evt.schema_version = 2;
        assert!(evt.validate().is_err());
        evt.schema_version = SCHEMA_VERSION;

        evt.sequence = 0;
        assert!(evt.validate().is_err());
        evt.sequence = 1;

        evt.run_id = " ".to_string();
        assert!(evt.validate().is_err());
    }

    #[test]
    fn negative_latency_rejected() {
        let evt = envelope(EventBody::ItemCompleted(ItemCompletedPayload {
            item_id: "i".to_string(),
            output: json!(null),
            latency_ms: -1.0,
            trace_id: None,
            trace_url: None,
        }));
        assert!(evt.validate().is_err());
    }
}
