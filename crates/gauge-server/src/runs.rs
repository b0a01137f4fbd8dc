use std::collections::{BTreeMap, HashMap, HashSet};

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Map, Value};

use gauge_types::{
    setting_truthy, ApprovalDecision, RunItemRecord, RunItemScoreRecord, RunRecord,
    RunWorkflowStatus, UserRecord, UserRole, SETTING_GM_VP_APPROVED_ONLY,
};

use crate::auth::{require_ui, Principal};
use crate::{ApiError, ApiResult, AppState};

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Object(_) | Value::Array(_) => {
            serde_json::to_string_pretty(value).unwrap_or_default()
        }
        other => other.to_string(),
    }
}

/// Normalize `provider/model` to `model` for consistent grouping.
fn strip_model_provider(model: &str) -> &str {
    match model.find('/') {
        Some(idx) if idx > 0 => &model[idx + 1..],
        _ => model,
    }
}

async fn gm_vp_approved_only(state: &AppState) -> ApiResult<bool> {
    let setting = state.store.get_setting(SETTING_GM_VP_APPROVED_ONLY).await?;
    Ok(setting.as_deref().map(setting_truthy).unwrap_or(true))
}

async fn can_view_run(
    state: &AppState,
    principal: &Principal,
    run: &RunRecord,
) -> ApiResult<bool> {
    if principal.is_local_dev() {
        return Ok(true);
    }
    let Some(user) = principal.user.as_ref() else {
        return Ok(false);
    };
    if user.role == UserRole::Admin {
        return Ok(true);
    }
    if run.owner_user_id == user.id {
        return Ok(true);
    }
    match user.role {
        UserRole::Manager => {
            let Some(owner) = state.store.get_user(&run.owner_user_id).await? else {
                return Ok(false);
            };
            let Some(owner_team) = owner.team_unit_id else {
                return Ok(false);
            };
            let managed = state.store.teams_managed_by(&user.id).await?;
            Ok(managed.contains(&owner_team))
        }
        UserRole::Gm | UserRole::Vp => {
            if gm_vp_approved_only(state).await? {
                Ok(run.status == RunWorkflowStatus::Approved)
            } else {
                Ok(matches!(
                    run.status,
                    RunWorkflowStatus::Submitted | RunWorkflowStatus::Approved
                ))
            }
        }
        _ => Ok(false),
    }
}

/// Only the manager of the owner's team (or ADMIN) may decide a run.
async fn can_approve_run(
    state: &AppState,
    principal: &Principal,
    run: &RunRecord,
) -> ApiResult<bool> {
    if principal.is_local_dev() {
        return Ok(true);
    }
    let Some(user) = principal.user.as_ref() else {
        return Ok(false);
    };
    if user.role == UserRole::Admin {
        return Ok(true);
    }
    if user.role != UserRole::Manager {
        return Ok(false);
    }
    let Some(owner) = state.store.get_user(&run.owner_user_id).await? else {
        return Ok(false);
    };
    let Some(owner_team) = owner.team_unit_id else {
        return Ok(false);
    };
    let managed = state.store.teams_managed_by(&user.id).await?;
    Ok(managed.contains(&owner_team))
}

async fn visible_runs(state: &AppState, principal: &Principal) -> ApiResult<Vec<RunRecord>> {
    if principal.is_local_dev() {
        return Ok(state.store.list_runs().await?);
    }
    let user = principal.user()?;
    match user.role {
        UserRole::Admin => Ok(state.store.list_runs().await?),
        UserRole::Employee => Ok(state.store.list_runs_by_owner(&user.id).await?),
        UserRole::Manager => {
            let managed = state.store.teams_managed_by(&user.id).await?;
            if managed.is_empty() {
                return Ok(state.store.list_runs_by_owner(&user.id).await?);
            }
            let mut owner_ids = state.store.user_ids_in_teams(&managed).await?;
            if !owner_ids.contains(&user.id) {
                owner_ids.push(user.id.clone());
            }
            Ok(state.store.list_runs_by_owners(&owner_ids).await?)
        }
        UserRole::Gm | UserRole::Vp => {
            let statuses = if gm_vp_approved_only(state).await? {
                vec![RunWorkflowStatus::Approved]
            } else {
                vec![RunWorkflowStatus::Submitted, RunWorkflowStatus::Approved]
            };
            Ok(state.store.list_runs_by_statuses(&statuses).await?)
        }
    }
}

#[derive(Debug, Serialize)]
struct OwnerInfo {
    id: String,
    email: String,
    display_name: String,
}

fn owner_info(user: &UserRecord) -> OwnerInfo {
    let display = if user.display_name.is_empty() {
        user.email.split('@').next().unwrap_or_default().to_string()
    } else {
        user.display_name.clone()
    };
    OwnerInfo {
        id: user.id.clone(),
        email: user.email.clone(),
        display_name: display,
    }
}

#[derive(Debug, Serialize)]
struct ApprovalInfo {
    decision: Option<String>,
    decision_at: Option<String>,
    decision_by: Option<OwnerInfo>,
    comment: String,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    run_id: String,
    run_name: String,
    external_run_id: String,
    task_name: String,
    model_name: String,
    dataset_name: String,
    timestamp: String,
    metrics: Vec<String>,
    metric_averages: BTreeMap<String, f64>,
    total_items: usize,
    progress_completed: usize,
    progress_total: Option<i64>,
    progress_pct: Option<f64>,
    success_count: usize,
    error_count: usize,
    success_rate: f64,
    avg_latency_ms: f64,
    langfuse_url: Option<Value>,
    status: RunWorkflowStatus,
    run_config: Value,
    owner: Option<OwnerInfo>,
    approval: Option<ApprovalInfo>,
}

/// Aggregate one run for the list view. Errored items contribute score 0 to
/// every metric average so failures visibly drag the aggregate down.
async fn compute_run_summary(state: &AppState, run: &RunRecord) -> ApiResult<RunSummary> {
    let items = state.store.list_items(&run.id).await?;
    let total_items = items.len();
    let error_items: HashSet<&str> = items
        .iter()
        .filter(|it| it.error.is_some())
        .map(|it| it.item_id.as_str())
        .collect();
    let error_count = error_items.len();
    let success_count = total_items - error_count;
    let completed_count = items.iter().filter(|it| it.is_terminal()).count();

    let expected_total = run
        .run_metadata
        .get("total_items")
        .and_then(Value::as_i64)
        .filter(|n| *n >= 0);

    let latencies: Vec<f64> = items.iter().filter_map(|it| it.latency_ms).collect();
    let avg_latency_ms = if latencies.is_empty() {
        0.0
    } else {
        latencies.iter().sum::<f64>() / latencies.len() as f64
    };

    let mut metric_averages: BTreeMap<String, f64> =
        run.metrics.iter().map(|m| (m.clone(), 0.0)).collect();
    if !run.metrics.is_empty() && total_items > 0 {
        let scores = state.store.list_scores(&run.id).await?;
        let by_item_metric: HashMap<(&str, &str), &RunItemScoreRecord> = scores
            .iter()
            .map(|s| ((s.item_id.as_str(), s.metric_name.as_str()), s))
            .collect();
        for metric in &run.metrics {
            let mut sum = 0.0;
            let mut count = 0usize;
            for item in &items {
                if error_items.contains(item.item_id.as_str()) {
                    count += 1;
                    continue;
                }
                if let Some(score) = by_item_metric.get(&(item.item_id.as_str(), metric.as_str()))
                {
                    if let Some(numeric) = score.score_numeric {
                        sum += numeric;
                        count += 1;
                    }
                }
            }
            let avg = if count > 0 { sum / count as f64 } else { 0.0 };
            metric_averages.insert(metric.clone(), avg);
        }
    }

    let owner = state.store.get_user(&run.owner_user_id).await?;

    let approval = match state.store.get_approval(&run.id).await? {
        Some(approval) => {
            let decision_by = match &approval.decision_by_user_id {
                Some(id) => state.store.get_user(id).await?.map(|u| owner_info(&u)),
                None => None,
            };
            Some(ApprovalInfo {
                decision: approval.decision.map(|d| d.as_str().to_string()),
                decision_at: approval.decision_at.map(|t| t.to_rfc3339()),
                decision_by,
                comment: approval.comment.clone(),
            })
        }
        None => None,
    };

    let run_name = run
        .run_config
        .get("run_name")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| run.external_run_id.clone())
        .unwrap_or_default();

    Ok(RunSummary {
        run_id: run.id.clone(),
        run_name,
        external_run_id: run.external_run_id.clone().unwrap_or_default(),
        task_name: run.task.clone(),
        model_name: strip_model_provider(run.model.as_deref().unwrap_or_default()).to_string(),
        dataset_name: run.dataset.clone(),
        timestamp: run
            .started_at
            .unwrap_or(run.created_at)
            .to_rfc3339(),
        metrics: run.metrics.clone(),
        metric_averages,
        total_items,
        progress_completed: completed_count,
        progress_total: expected_total,
        progress_pct: expected_total
            .filter(|total| *total > 0)
            .map(|total| completed_count as f64 / total as f64),
        success_count,
        error_count,
        success_rate: if total_items > 0 {
            success_count as f64 / total_items as f64
        } else {
            0.0
        },
        avg_latency_ms,
        langfuse_url: run.run_metadata.get("langfuse_url").cloned(),
        status: run.status,
        run_config: run.run_config.clone(),
        owner: owner.as_ref().map(owner_info),
        approval,
    })
}

/// `GET /api/runs`: visible runs grouped by task, then model.
pub async fn list_runs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let principal = require_ui(&state, &headers).await?;
    let runs = visible_runs(&state, &principal).await?;

    let mut tasks: BTreeMap<String, BTreeMap<String, Vec<Value>>> = BTreeMap::new();
    for run in &runs {
        let summary = compute_run_summary(&state, run).await?;
        let model_key = if summary.model_name.is_empty() {
            "nomodel".to_string()
        } else {
            summary.model_name.clone()
        };
        let value =
            serde_json::to_value(&summary).map_err(|e| ApiError::Internal(e.to_string()))?;
        tasks
            .entry(summary.task_name.clone())
            .or_default()
            .entry(model_key)
            .or_default()
            .push(value);
    }

    Ok(Json(json!({
        "tasks": tasks,
        "last_updated": chrono::Utc::now().to_rfc3339(),
    })))
}

#[derive(Debug, Serialize)]
struct DetailStats {
    total: usize,
    completed: usize,
    in_progress: usize,
    pending: usize,
    failed: usize,
    success_rate: f64,
}

async fn build_detail_row(
    state: &AppState,
    run: &RunRecord,
    item: &RunItemRecord,
    scores_by_metric: &HashMap<String, RunItemScoreRecord>,
) -> ApiResult<Value> {
    let is_error = item.error.is_some();
    let status = if is_error { "error" } else { "completed" };

    let mut metric_values: Vec<Value> = Vec::new();
    let mut metric_meta = Map::new();
    for metric in &run.metrics {
        match scores_by_metric.get(metric) {
            Some(score) => {
                let value = score
                    .score_numeric
                    .map(|n| json!(n))
                    .or_else(|| score.score_raw.clone())
                    .unwrap_or(Value::Null);
                metric_values.push(value);
                if score.meta.as_object().map(|m| !m.is_empty()).unwrap_or(false) {
                    metric_meta.insert(metric.clone(), score.meta.clone());
                }
            }
            None => metric_values.push(json!("")),
        }
    }

    let output_text = match &item.error {
        Some(err) => format!("ERROR: {err}"),
        None => stringify(item.output.as_ref().unwrap_or(&Value::Null)),
    };

    // Prefer the engine-reported start; fall back to the item_started event
    // arrival time for older runs.
    let mut task_started_at_ms = item
        .item_metadata
        .get("task_started_at_ms")
        .and_then(Value::as_i64);
    if task_started_at_ms.is_none() {
        task_started_at_ms = state
            .store
            .item_started_sent_at(&run.id, &item.item_id)
            .await?
            .map(|ts| ts.timestamp_millis());
    }

    Ok(json!({
        "index": item.index,
        "item_id": item.item_id,
        "status": status,
        "input": stringify(&item.input),
        "input_full": stringify(&item.input),
        "output": output_text,
        "output_full": output_text,
        "expected": stringify(item.expected.as_ref().unwrap_or(&Value::Null)),
        "expected_full": stringify(item.expected.as_ref().unwrap_or(&Value::Null)),
        "time": item
            .latency_ms
            .map(|ms| format!("{:.3}", ms / 1000.0))
            .unwrap_or_default(),
        "latency_ms": item.latency_ms.unwrap_or(0.0),
        "trace_id": item.trace_id.clone().unwrap_or_default(),
        "trace_url": item.trace_url.clone().unwrap_or_default(),
        "task_started_at_ms": task_started_at_ms,
        "metric_values": metric_values,
        "metric_meta": metric_meta,
        "item_metadata": item.item_metadata,
    }))
}

/// `GET /api/runs/{id}`: full item list with scores for one run.
pub async fn run_detail(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let principal = require_ui(&state, &headers).await?;
    let run = state
        .store
        .get_run(&run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("run not found".to_string()))?;
    if !can_view_run(&state, &principal, &run).await? {
        return Err(ApiError::Forbidden("access denied".to_string()));
    }

    let items = state.store.list_items(&run.id).await?;
    let scores = state.store.list_scores(&run.id).await?;
    let mut by_item: HashMap<String, HashMap<String, RunItemScoreRecord>> = HashMap::new();
    for score in scores {
        by_item
            .entry(score.item_id.clone())
            .or_default()
            .insert(score.metric_name.clone(), score);
    }

    let empty = HashMap::new();
    let mut rows = Vec::with_capacity(items.len());
    let mut failed = 0usize;
    for item in &items {
        if item.error.is_some() {
            failed += 1;
        }
        let item_scores = by_item.get(&item.item_id).unwrap_or(&empty);
        rows.push(build_detail_row(&state, &run, item, item_scores).await?);
    }

    let total = items.len();
    let completed = total - failed;
    let stats = DetailStats {
        total,
        completed,
        in_progress: 0,
        pending: 0,
        failed,
        success_rate: if total > 0 {
            completed as f64 / total as f64 * 100.0
        } else {
            0.0
        },
    };

    Ok(Json(json!({
        "run": {
            "file_path": run.id,
            "dataset_name": run.dataset,
            "run_name": run.external_run_id.clone().unwrap_or_else(|| run.id.clone()),
            "metric_names": run.metrics,
            "config": run.run_config,
            "metadata": run.run_metadata,
            "status": run.status,
        },
        "snapshot": {
            "rows": rows,
            "stats": stats,
            "metric_names": run.metrics,
        },
    })))
}

fn body_run_id(body: &Value) -> ApiResult<String> {
    body.get("run_id")
        .or_else(|| body.get("file_path"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest("run_id required".to_string()))
}

/// `POST /api/runs/update_metric`: manual score override; the original
/// value is preserved in the score meta.
pub async fn update_metric(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let _principal = require_ui(&state, &headers).await?;
    let run_id = body_run_id(&body)?;
    let row_index = body
        .get("row_index")
        .and_then(Value::as_i64)
        .ok_or_else(|| ApiError::BadRequest("row_index required".to_string()))?;
    let metric_name = body
        .get("metric_name")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::BadRequest("metric_name required".to_string()))?;
    let new_score = body.get("new_score").cloned().unwrap_or(Value::Null);

    let run = state
        .store
        .get_run(&run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("run not found".to_string()))?;
    let item = state
        .store
        .get_item_by_index(&run_id, row_index)
        .await?
        .ok_or_else(|| ApiError::NotFound("item not found".to_string()))?;

    let existing = state.store.get_score(&run_id, &item.item_id, metric_name).await?;

    let mut meta = existing
        .as_ref()
        .and_then(|s| s.meta.as_object().cloned())
        .unwrap_or_default();
    if !meta.contains_key("original_score") {
        let original = existing
            .as_ref()
            .and_then(|s| s.score_raw.clone().or(s.score_numeric.map(|n| json!(n))))
            .unwrap_or(Value::Null);
        meta.insert("original_score".to_string(), original);
    }
    meta.insert("modified".to_string(), json!("true"));

    let numeric = match &new_score {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    let raw = numeric.map(|n| json!(n)).unwrap_or(new_score);

    state
        .store
        .upsert_score(&RunItemScoreRecord {
            run_id: run_id.clone(),
            item_id: item.item_id.clone(),
            metric_name: metric_name.to_string(),
            score_numeric: numeric,
            score_raw: Some(raw),
            meta: Value::Object(meta),
        })
        .await?;

    let item_scores: HashMap<String, RunItemScoreRecord> = state
        .store
        .list_scores_for_item(&run_id, &item.item_id)
        .await?
        .into_iter()
        .map(|s| (s.metric_name.clone(), s))
        .collect();
    let row = build_detail_row(&state, &run, &item, &item_scores).await?;

    Ok(Json(json!({ "ok": true, "row": row })))
}

/// `POST /api/runs/update_root_cause`: annotate one item's metadata.
pub async fn update_root_cause(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let _principal = require_ui(&state, &headers).await?;
    let run_id = body_run_id(&body)?;
    let item_id = body
        .get("item_id")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::BadRequest("item_id required".to_string()))?;
    let root_cause = body
        .get("root_cause")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();

    let item = state
        .store
        .get_item(&run_id, item_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("item not found".to_string()))?;

    let mut meta = item.item_metadata.as_object().cloned().unwrap_or_default();
    if root_cause.is_empty() {
        meta.remove("root_cause");
    } else {
        meta.insert("root_cause".to_string(), json!(root_cause));
    }
    state
        .store
        .set_item_metadata(&run_id, item_id, &Value::Object(meta))
        .await?;

    Ok(Json(json!({ "ok": true })))
}

/// `POST /api/runs/delete`: cascade delete; owner, managing manager, or
/// admin.
pub async fn delete_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let principal = require_ui(&state, &headers).await?;
    let run_id = body_run_id(&body)?;
    let run = state
        .store
        .get_run(&run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("run not found".to_string()))?;

    let allowed = if principal.is_local_dev() || principal.is_admin() {
        true
    } else {
        let user = principal.user()?;
        if run.owner_user_id == user.id {
            true
        } else {
            can_approve_run(&state, &principal, &run).await?
        }
    };
    if !allowed {
        return Err(ApiError::Forbidden("permission denied".to_string()));
    }

    state.store.delete_run_cascade(&run_id).await?;
    state
        .store
        .append_audit(
            principal.user.as_ref().map(|u| u.id.as_str()),
            "run.delete",
            "run",
            &run_id,
            &json!({"status": run.status}),
            &json!({}),
        )
        .await?;
    Ok(Json(json!({ "ok": true })))
}

/// `POST /v1/runs/{id}/submit`: owner sends the run into review.
pub async fn submit_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let principal = require_ui(&state, &headers).await?;
    let run = state
        .store
        .get_run(&run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("run not found".to_string()))?;

    if !principal.is_local_dev() && run.owner_user_id != principal.user()?.id {
        return Err(ApiError::Forbidden("only the owner can submit".to_string()));
    }
    if run.status.is_decided() {
        return Err(ApiError::BadRequest(format!(
            "run not submittable from status {}",
            run.status.as_str()
        )));
    }

    let submitter = principal
        .user
        .as_ref()
        .map(|u| u.id.clone())
        .unwrap_or_else(|| run.owner_user_id.clone());
    state.store.ensure_approval(&run_id, &submitter).await?;
    state
        .store
        .set_run_status(&run_id, RunWorkflowStatus::Submitted)
        .await?;
    state
        .store
        .append_audit(
            Some(submitter.as_str()),
            "run.submit",
            "run",
            &run_id,
            &json!({"status": run.status}),
            &json!({"status": RunWorkflowStatus::Submitted}),
        )
        .await?;

    Ok(Json(json!({ "ok": true, "status": RunWorkflowStatus::Submitted })))
}

async fn decide_run(
    state: AppState,
    run_id: String,
    headers: HeaderMap,
    body: Option<Json<Value>>,
    decision: ApprovalDecision,
) -> ApiResult<Json<Value>> {
    let principal = require_ui(&state, &headers).await?;
    let run = state
        .store
        .get_run(&run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("run not found".to_string()))?;
    if run.status != RunWorkflowStatus::Submitted {
        return Err(ApiError::BadRequest("run not submitted".to_string()));
    }
    if !can_approve_run(&state, &principal, &run).await? {
        return Err(ApiError::Forbidden(
            "only the team manager can decide".to_string(),
        ));
    }
    if state.store.get_approval(&run_id).await?.is_none() {
        return Err(ApiError::BadRequest("missing approval record".to_string()));
    }

    let comment = body
        .as_ref()
        .and_then(|b| b.0.get("comment").and_then(Value::as_str))
        .unwrap_or("")
        .to_string();
    let decider = principal
        .user
        .as_ref()
        .map(|u| u.id.clone())
        .unwrap_or_else(|| "local-dev".to_string());

    state
        .store
        .decide_approval(&run_id, decision, &decider, &comment)
        .await?;
    let next = match decision {
        ApprovalDecision::Approved => RunWorkflowStatus::Approved,
        ApprovalDecision::Rejected => RunWorkflowStatus::Rejected,
    };
    state.store.set_run_status(&run_id, next).await?;
    state
        .store
        .append_audit(
            Some(decider.as_str()),
            match decision {
                ApprovalDecision::Approved => "run.approve",
                ApprovalDecision::Rejected => "run.reject",
            },
            "run",
            &run_id,
            &json!({"status": RunWorkflowStatus::Submitted}),
            &json!({"status": next, "comment": comment}),
        )
        .await?;

    Ok(Json(json!({ "ok": true, "status": next })))
}

pub async fn approve_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> ApiResult<Json<Value>> {
    decide_run(state, run_id, headers, body, ApprovalDecision::Approved).await
}

pub async fn reject_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> ApiResult<Json<Value>> {
    decide_run(state, run_id, headers, body, ApprovalDecision::Rejected).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_prefix_is_stripped() {
        assert_eq!(strip_model_provider("openai/gpt-4o"), "gpt-4o");
        assert_eq!(strip_model_provider("gpt-4o"), "gpt-4o");
        assert_eq!(strip_model_provider("/weird"), "/weird");
        assert_eq!(strip_model_provider(""), "");
    }

    #[test]
    fn stringify_pretty_prints_containers() {
        assert_eq!(stringify(&json!("plain")), "plain");
        assert_eq!(stringify(&Value::Null), "");
        assert!(stringify(&json!({"a": 1})).contains("\"a\": 1"));
    }
}
