use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `POST /v1/runs`, sent by the engine to open a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunRequest {
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
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunResponse {
    pub run_id: String,
    pub live_url: String,
}

/// Result of applying an NDJSON event batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestResponse {
    pub applied: u64,
    pub skipped: u64,
}
