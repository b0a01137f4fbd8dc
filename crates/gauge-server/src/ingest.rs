use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use gauge_types::{
    CreateRunRequest, CreateRunResponse, IngestResponse, RunItemRecord, RunItemScoreRecord,
    RunRecord, RunWorkflowStatus,
};
use gauge_wire::{decode_ndjson, parse_csv_records};

use crate::auth::require_api_key;
use crate::{ApiError, ApiResult, AppState};

pub async fn create_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateRunRequest>,
) -> ApiResult<Json<CreateRunResponse>> {
    let principal = require_api_key(&state, &headers).await?;
    let owner = principal.user()?;

    let now = Utc::now();
    let run = RunRecord {
        id: Uuid::new_v4().to_string(),
        external_run_id: req.external_run_id,
        created_by_user_id: owner.id.clone(),
        owner_user_id: owner.id.clone(),
        task: req.task,
        dataset: req.dataset,
        model: req.model,
        metrics: req.metrics,
        run_metadata: req.run_metadata,
        run_config: req.run_config,
        status: RunWorkflowStatus::Running,
        started_at: Some(now),
        ended_at: None,
        created_at: now,
        updated_at: now,
    };
    state.store.insert_run(&run).await?;
    tracing::info!(run_id = %run.id, task = %run.task, "run created");

    Ok(Json(CreateRunResponse {
        live_url: state.live_url(&run.id),
        run_id: run.id,
    }))
}

/// NDJSON event batch intake. The whole batch is rejected when any line is
/// malformed or addressed to a different run; valid batches apply per-event
/// with `(run_id, event_id)` dedup.
pub async fn ingest_events(
    State(state): State<AppState>,
    axum::extract::Path(run_id): axum::extract::Path<String>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<IngestResponse>> {
    let principal = require_api_key(&state, &headers).await?;
    let caller = principal.user()?;

    let run = state
        .store
        .get_run(&run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("run not found".to_string()))?;
    if run.owner_user_id != caller.id {
        return Err(ApiError::Forbidden("not the run owner".to_string()));
    }

    let events = decode_ndjson(&body).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    for event in &events {
        if event.run_id != run_id {
            return Err(ApiError::BadRequest(format!(
                "event {} addresses run {}, not {}",
                event.event_id, event.run_id, run_id
            )));
        }
    }

    let mut applied = 0u64;
    let mut skipped = 0u64;
    for event in &events {
        if state.store.apply_event(event).await? {
            applied += 1;
        } else {
            skipped += 1;
        }
    }
    tracing::debug!(run_id = %run_id, applied, skipped, "event batch applied");

    Ok(Json(IngestResponse { applied, skipped }))
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub task: String,
    pub dataset: String,
    #[serde(default)]
    pub model: Option<String>,
    /// `csv` or `json`; inferred from the leading byte when omitted.
    #[serde(default)]
    pub format: Option<String>,
}

/// Post-hoc ingestion of a saved results file. The run is created already
/// terminal (COMPLETED) and populated from the file contents.
pub async fn upload_run(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<CreateRunResponse>> {
    let principal = require_api_key(&state, &headers).await?;
    let owner = principal.user()?;

    if body.trim().is_empty() {
        return Err(ApiError::BadRequest("empty upload".to_string()));
    }

    let format = match query.format.as_deref() {
        Some("csv") => UploadFormat::Csv,
        Some("json") => UploadFormat::Json,
        Some(other) => {
            return Err(ApiError::BadRequest(format!(
                "unsupported format {other:?} (use csv or json)"
            )))
        }
        None => {
            if body.trim_start().starts_with('{') {
                UploadFormat::Json
            } else {
                UploadFormat::Csv
            }
        }
    };

    let now = Utc::now();
    let run = RunRecord {
        id: Uuid::new_v4().to_string(),
        external_run_id: None,
        created_by_user_id: owner.id.clone(),
        owner_user_id: owner.id.clone(),
        task: query.task.clone(),
        dataset: query.dataset.clone(),
        model: query.model.clone(),
        metrics: Vec::new(),
        run_metadata: json!({}),
        run_config: json!({}),
        status: RunWorkflowStatus::Completed,
        started_at: Some(now),
        ended_at: Some(now),
        created_at: now,
        updated_at: now,
    };
    state.store.insert_run(&run).await?;

    match format {
        UploadFormat::Json => ingest_json_results(&state, &run.id, &query.dataset, &body).await?,
        UploadFormat::Csv => ingest_csv_results(&state, &run.id, &body).await?,
    }

    Ok(Json(CreateRunResponse {
        live_url: state.live_url(&run.id),
        run_id: run.id,
    }))
}

enum UploadFormat {
    Csv,
    Json,
}

async fn ingest_json_results(
    state: &AppState,
    run_id: &str,
    dataset_fallback: &str,
    body: &str,
) -> ApiResult<()> {
    let data: Value = serde_json::from_str(body)
        .map_err(|err| ApiError::BadRequest(format!("invalid results JSON: {err}")))?;

    let metrics: Vec<String> = data["metrics"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    state.store.set_run_metrics(run_id, &metrics).await?;

    let dataset = data["dataset_name"]
        .as_str()
        .filter(|s| !s.is_empty())
        .unwrap_or(dataset_fallback);
    state.store.set_run_dataset(run_id, dataset).await?;

    let empty = serde_json::Map::new();
    let inputs = data["inputs"].as_object().unwrap_or(&empty);
    let metadatas = data["metadatas"].as_object().unwrap_or(&empty);
    let results = data["results"].as_object().unwrap_or(&empty);
    let errors = data["errors"].as_object().unwrap_or(&empty);

    for (idx, (item_id, input)) in inputs.iter().enumerate() {
        let item_metadata = metadatas.get(item_id).cloned().unwrap_or(json!({}));
        if let Some(result) = results.get(item_id) {
            let latency_ms = result["time"].as_f64().unwrap_or(0.0) * 1000.0;
            state
                .store
                .insert_item(&RunItemRecord {
                    run_id: run_id.to_string(),
                    item_id: item_id.clone(),
                    index: idx as i64,
                    input: input.clone(),
                    expected: result.get("expected").cloned(),
                    output: result.get("output").cloned(),
                    error: None,
                    item_metadata,
                    latency_ms: Some(latency_ms),
                    trace_id: result["trace_id"].as_str().map(str::to_string),
                    trace_url: result["trace_url"].as_str().map(str::to_string),
                })
                .await?;

            let scores = result["scores"].as_object().cloned().unwrap_or_default();
            for metric in &metrics {
                let raw = scores.get(metric).cloned();
                let (score_numeric, meta) = normalize_uploaded_score(raw.as_ref());
                state
                    .store
                    .upsert_score(&RunItemScoreRecord {
                        run_id: run_id.to_string(),
                        item_id: item_id.clone(),
                        metric_name: metric.clone(),
                        score_numeric,
                        score_raw: raw,
                        meta,
                    })
                    .await?;
            }
        } else if let Some(err) = errors.get(item_id) {
            let message = err["error"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            state
                .store
                .insert_item(&RunItemRecord {
                    run_id: run_id.to_string(),
                    item_id: item_id.clone(),
                    index: idx as i64,
                    input: input.clone(),
                    expected: None,
                    output: None,
                    error: Some(message),
                    item_metadata,
                    latency_ms: None,
                    trace_id: err["trace_id"].as_str().map(str::to_string),
                    trace_url: None,
                })
                .await?;
        }
    }
    Ok(())
}

fn normalize_uploaded_score(raw: Option<&Value>) -> (Option<f64>, Value) {
    match raw {
        Some(Value::Number(n)) => (n.as_f64(), json!({})),
        Some(Value::Bool(b)) => (Some(if *b { 1.0 } else { 0.0 }), json!({})),
        Some(Value::Object(obj)) => {
            let numeric = match obj.get("score") {
                Some(Value::Number(n)) => n.as_f64(),
                Some(Value::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
                _ => None,
            };
            let meta = obj.get("metadata").cloned().unwrap_or(json!({}));
            (numeric, meta)
        }
        _ => (None, json!({})),
    }
}

async fn ingest_csv_results(state: &AppState, run_id: &str, body: &str) -> ApiResult<()> {
    let rows = parse_csv_records(body);
    let Some((header, records)) = rows.split_first() else {
        return Err(ApiError::BadRequest("empty CSV".to_string()));
    };

    let metrics: Vec<String> = header
        .iter()
        .filter(|col| col.ends_with("_score") && !col.contains("__meta__"))
        .map(|col| col.trim_end_matches("_score").to_string())
        .collect();
    state.store.set_run_metrics(run_id, &metrics).await?;

    let col = |name: &str| header.iter().position(|c| c == name);
    let item_id_col = col("item_id");
    let input_col = col("input");
    let expected_col = col("expected_output");
    let output_col = col("output");
    let time_col = col("time");
    let trace_col = col("trace_id");

    for (idx, record) in records.iter().enumerate() {
        let cell = |pos: Option<usize>| {
            pos.and_then(|p| record.get(p))
                .map(String::as_str)
                .unwrap_or("")
        };
        let item_id = {
            let raw = cell(item_id_col);
            if raw.is_empty() {
                format!("row_{idx:06}")
            } else {
                raw.to_string()
            }
        };
        let output = cell(output_col);
        let is_error = output.starts_with("ERROR:");
        let latency_ms = cell(time_col).parse::<f64>().ok().map(|s| s * 1000.0);

        state
            .store
            .insert_item(&RunItemRecord {
                run_id: run_id.to_string(),
                item_id: item_id.clone(),
                index: idx as i64,
                input: json!(cell(input_col)),
                expected: Some(json!(cell(expected_col))),
                output: (!is_error).then(|| json!(output)),
                error: is_error.then(|| output["ERROR:".len()..].trim().to_string()),
                item_metadata: json!({}),
                latency_ms,
                trace_id: {
                    let t = cell(trace_col);
                    (!t.is_empty()).then(|| t.to_string())
                },
                trace_url: None,
            })
            .await?;

        for metric in &metrics {
            let score_col = col(&format!("{metric}_score"));
            let raw = cell(score_col);
            let score_numeric = if is_error {
                Some(0.0)
            } else if raw.is_empty() || raw == "N/A" {
                None
            } else {
                raw.parse::<f64>().ok()
            };

            let meta_prefix = format!("{metric}__meta__");
            let mut meta = serde_json::Map::new();
            for (pos, name) in header.iter().enumerate() {
                if let Some(key) = name.strip_prefix(&meta_prefix) {
                    if let Some(value) = record.get(pos) {
                        meta.insert(key.to_string(), json!(value));
                    }
                }
            }

            state
                .store
                .upsert_score(&RunItemScoreRecord {
                    run_id: run_id.to_string(),
                    item_id: item_id.clone(),
                    metric_name: metric.clone(),
                    score_numeric,
                    score_raw: (!raw.is_empty()).then(|| json!(raw)),
                    meta: Value::Object(meta),
                })
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uploaded_score_normalization() {
        assert_eq!(normalize_uploaded_score(Some(&json!(0.7))).0, Some(0.7));
        assert_eq!(normalize_uploaded_score(Some(&json!(true))).0, Some(1.0));
        let (num, meta) =
            normalize_uploaded_score(Some(&json!({"score": 0.4, "metadata": {"k": 1}})));
        assert_eq!(num, Some(0.4));
        assert_eq!(meta, json!({"k": 1}));
        assert_eq!(normalize_uploaded_score(None).0, None);
    }
}
