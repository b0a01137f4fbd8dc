//! End-to-end API tests against the full router with an in-memory store.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use gauge_server::{build_router, hash_api_key, new_api_key_token, token_prefix};
use gauge_server::{AppState, AuthMode, ServerConfig};
use gauge_store::Store;
use gauge_types::{OrgUnitType, UserRecord, UserRole};
use gauge_wire::{
    encode_ndjson, EventBody, ItemCompletedPayload, ItemFailedPayload, ItemStartedPayload,
    MetricScoredPayload, RunEventV1, RunStartedPayload, SCHEMA_VERSION,
};

async fn test_state() -> AppState {
    let store = Store::open_in_memory().await.unwrap();
    AppState::new(
        store,
        ServerConfig {
            base_url: "http://localhost:8000".to_string(),
            auth_mode: AuthMode::ProxyHeaders,
            admin_bootstrap_token: "boot-secret".to_string(),
        },
    )
}

async fn issue_key(state: &AppState, user_id: &str) -> String {
    let token = new_api_key_token();
    state
        .store
        .create_api_key(user_id, "test", &token_prefix(&token), &hash_api_key(&token))
        .await
        .unwrap();
    token
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn api_post(path: &str, token: &str, body: String, content_type: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap()
}

fn ui_get(path: &str, email: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header("X-User-Email", email)
        .body(Body::empty())
        .unwrap()
}

fn ui_post(path: &str, email: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("X-User-Email", email)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn event(run_id: &str, seq: u64, body: EventBody) -> RunEventV1 {
    RunEventV1 {
        schema_version: SCHEMA_VERSION,
        event_id: Uuid::new_v4(),
        sequence: seq,
        sent_at: Utc::now(),
        run_id: run_id.to_string(),
        body,
    }
}

async fn seed_user(state: &AppState, email: &str, role: UserRole, team: Option<&str>) -> UserRecord {
    state
        .store
        .create_user(email, email.split('@').next().unwrap(), role, team)
        .await
        .unwrap()
}

/// Sector, Department, and two Teams, with a manager on the first team.
struct OrgFixture {
    team_a: String,
    team_b: String,
    manager: UserRecord,
    employee: UserRecord,
    outsider: UserRecord,
    admin: UserRecord,
}

async fn seed_org(state: &AppState) -> OrgFixture {
    let sector = state
        .store
        .create_org_unit("Platform", OrgUnitType::Sector, None)
        .await
        .unwrap();
    let dept = state
        .store
        .create_org_unit("Core", OrgUnitType::Department, Some(&sector.id))
        .await
        .unwrap();
    let team_a = state
        .store
        .create_org_unit("Eval", OrgUnitType::Team, Some(&dept.id))
        .await
        .unwrap();
    let team_b = state
        .store
        .create_org_unit("Infra", OrgUnitType::Team, Some(&dept.id))
        .await
        .unwrap();

    let manager = seed_user(state, "mgr@example.com", UserRole::Manager, Some(&team_a.id)).await;
    state
        .store
        .set_team_manager(&team_a.id, Some(&manager.id))
        .await
        .unwrap();
    let employee = seed_user(state, "emp@example.com", UserRole::Employee, Some(&team_a.id)).await;
    let outsider = seed_user(state, "out@example.com", UserRole::Employee, Some(&team_b.id)).await;
    let admin = seed_user(state, "admin@example.com", UserRole::Admin, None).await;

    OrgFixture {
        team_a: team_a.id,
        team_b: team_b.id,
        manager,
        employee,
        outsider,
        admin,
    }
}

async fn create_run_via_api(router: &Router, token: &str) -> String {
    let (status, body) = send(
        router,
        api_post(
            "/v1/runs",
            token,
            json!({
                "task": "qa",
                "dataset": "ds",
                "model": "openai/gpt-4o",
                "metrics": ["exactness"],
                "run_metadata": {"total_items": 2},
                "run_config": {"run_name": "nightly"},
            })
            .to_string(),
            "application/json",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "create run failed: {body}");
    body["run_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn healthz_is_open() {
    let state = test_state().await;
    let router = build_router(state);
    let (status, body) = send(
        &router,
        Request::builder().uri("/healthz").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn run_creation_requires_api_key() {
    let state = test_state().await;
    let router = build_router(state.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/runs")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"task": "t", "dataset": "d"}).to_string()))
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let fixture = seed_org(&state).await;
    let token = issue_key(&state, &fixture.employee.id).await;
    let run_id = create_run_via_api(&router, &token).await;
    let run = state.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.owner_user_id, fixture.employee.id);
    assert_eq!(run.status, gauge_types::RunWorkflowStatus::Running);
}

#[tokio::test]
async fn revoked_key_is_rejected() {
    let state = test_state().await;
    let router = build_router(state.clone());
    let fixture = seed_org(&state).await;

    let token = new_api_key_token();
    let key = state
        .store
        .create_api_key(
            &fixture.employee.id,
            "t",
            &token_prefix(&token),
            &hash_api_key(&token),
        )
        .await
        .unwrap();
    state.store.revoke_api_key(&key.id).await.unwrap();

    let (status, _) = send(
        &router,
        api_post(
            "/v1/runs",
            &token,
            json!({"task": "t", "dataset": "d"}).to_string(),
            "application/json",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

fn sample_batch(run_id: &str) -> Vec<RunEventV1> {
    vec![
        event(
            run_id,
            1,
            EventBody::RunStarted(RunStartedPayload {
                external_run_id: None,
                task: "qa".to_string(),
                dataset: "ds".to_string(),
                model: Some("openai/gpt-4o".to_string()),
                metrics: vec!["exactness".to_string()],
                run_metadata: json!({"total_items": 2}),
                run_config: json!({}),
                started_at: Utc::now(),
            }),
        ),
        event(
            run_id,
            2,
            EventBody::ItemStarted(ItemStartedPayload {
                item_id: "item_0".to_string(),
                index: 0,
                input: json!("one"),
                expected: Some(json!("one")),
                item_metadata: json!({}),
            }),
        ),
        event(
            run_id,
            3,
            EventBody::MetricScored(MetricScoredPayload {
                item_id: "item_0".to_string(),
                metric_name: "exactness".to_string(),
                score_numeric: Some(1.0),
                score_raw: Some(json!(1.0)),
                meta: json!({}),
            }),
        ),
        event(
            run_id,
            4,
            EventBody::ItemCompleted(ItemCompletedPayload {
                item_id: "item_0".to_string(),
                output: json!("one"),
                latency_ms: 120.0,
                trace_id: None,
                trace_url: None,
            }),
        ),
        event(
            run_id,
            5,
            EventBody::ItemStarted(ItemStartedPayload {
                item_id: "item_1".to_string(),
                index: 1,
                input: json!("two"),
                expected: Some(json!("two")),
                item_metadata: json!({}),
            }),
        ),
        event(
            run_id,
            6,
            EventBody::ItemFailed(ItemFailedPayload {
                item_id: "item_1".to_string(),
                error: "task exploded".to_string(),
                trace_id: None,
                trace_url: None,
            }),
        ),
        event(
            run_id,
            7,
            EventBody::RunCompleted(gauge_wire::RunCompletedPayload {
                ended_at: Utc::now(),
                summary: json!({"success_rate": 0.5}),
                final_status: gauge_wire::FinalStatus::Completed,
            }),
        ),
    ]
}

#[tokio::test]
async fn event_batches_apply_idempotently() {
    let state = test_state().await;
    let router = build_router(state.clone());
    let fixture = seed_org(&state).await;
    let token = issue_key(&state, &fixture.employee.id).await;
    let run_id = create_run_via_api(&router, &token).await;

    let ndjson = encode_ndjson(&sample_batch(&run_id));
    let path = format!("/v1/runs/{run_id}/events");

    let (status, body) = send(
        &router,
        api_post(&path, &token, ndjson.clone(), "application/x-ndjson"),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body, json!({"applied": 7, "skipped": 0}));

    for _ in 0..2 {
        let (status, body) = send(
            &router,
            api_post(&path, &token, ndjson.clone(), "application/x-ndjson"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"applied": 0, "skipped": 7}));
    }

    assert_eq!(state.store.count_events(&run_id).await.unwrap(), 7);
    assert_eq!(state.store.list_items(&run_id).await.unwrap().len(), 2);
    let run = state.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, gauge_types::RunWorkflowStatus::Completed);
}

#[tokio::test]
async fn malformed_batches_are_rejected_whole() {
    let state = test_state().await;
    let router = build_router(state.clone());
    let fixture = seed_org(&state).await;
    let token = issue_key(&state, &fixture.employee.id).await;
    let run_id = create_run_via_api(&router, &token).await;
    let path = format!("/v1/runs/{run_id}/events");

    // Bad JSON line.
    let mut ndjson = encode_ndjson(&sample_batch(&run_id)[..1]);
    ndjson.push_str("not json\n");
    let (status, _) = send(&router, api_post(&path, &token, ndjson, "application/x-ndjson")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(state.store.count_events(&run_id).await.unwrap(), 0);

    // Event addressed to a different run.
    let foreign = encode_ndjson(&[event("other-run", 1, sample_batch(&run_id)[0].body.clone())]);
    let (status, _) = send(&router, api_post(&path, &token, foreign, "application/x-ndjson")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Not the owner.
    let other_token = issue_key(&state, &fixture.outsider.id).await;
    let ndjson = encode_ndjson(&sample_batch(&run_id)[..1]);
    let (status, _) = send(
        &router,
        api_post(&path, &other_token, ndjson, "application/x-ndjson"),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Unknown run is a 404.
    let (status, _) = send(
        &router,
        api_post(
            "/v1/runs/missing/events",
            &token,
            encode_ndjson(&sample_batch("missing")[..1]),
            "application/x-ndjson",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn summaries_zero_errored_items_into_averages() {
    let state = test_state().await;
    let router = build_router(state.clone());
    let fixture = seed_org(&state).await;
    let token = issue_key(&state, &fixture.employee.id).await;
    let run_id = create_run_via_api(&router, &token).await;

    let ndjson = encode_ndjson(&sample_batch(&run_id));
    send(
        &router,
        api_post(
            &format!("/v1/runs/{run_id}/events"),
            &token,
            ndjson,
            "application/x-ndjson",
        ),
    )
    .await;

    let (status, body) = send(&router, ui_get("/api/runs", "emp@example.com")).await;
    assert_eq!(status, StatusCode::OK);
    let runs = &body["tasks"]["qa"]["gpt-4o"];
    assert_eq!(runs.as_array().unwrap().len(), 1);
    let summary = &runs[0];
    assert_eq!(summary["total_items"], json!(2));
    assert_eq!(summary["error_count"], json!(1));
    assert_eq!(summary["success_rate"], json!(0.5));
    // item_0 scored 1.0, item_1 errored and contributes 0.
    assert_eq!(summary["metric_averages"]["exactness"], json!(0.5));
    assert_eq!(summary["progress_total"], json!(2));
    assert_eq!(summary["progress_completed"], json!(2));
}

#[tokio::test]
async fn run_detail_lists_rows_in_index_order() {
    let state = test_state().await;
    let router = build_router(state.clone());
    let fixture = seed_org(&state).await;
    let token = issue_key(&state, &fixture.employee.id).await;
    let run_id = create_run_via_api(&router, &token).await;
    send(
        &router,
        api_post(
            &format!("/v1/runs/{run_id}/events"),
            &token,
            encode_ndjson(&sample_batch(&run_id)),
            "application/x-ndjson",
        ),
    )
    .await;

    let (status, body) = send(
        &router,
        ui_get(&format!("/api/runs/{run_id}"), "emp@example.com"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rows = body["snapshot"]["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["index"], json!(0));
    assert_eq!(rows[0]["status"], "completed");
    assert_eq!(rows[1]["status"], "error");
    assert!(rows[1]["output"].as_str().unwrap().starts_with("ERROR:"));
    assert_eq!(body["snapshot"]["stats"]["failed"], json!(1));

    // Outsider employee cannot read it.
    let (status, _) = send(
        &router,
        ui_get(&format!("/api/runs/{run_id}"), "out@example.com"),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn visibility_matrix_for_submitted_run() {
    let state = test_state().await;
    let router = build_router(state.clone());
    let fixture = seed_org(&state).await;
    let token = issue_key(&state, &fixture.employee.id).await;
    let run_id = create_run_via_api(&router, &token).await;

    let (status, _) = send(
        &router,
        ui_post(&format!("/v1/runs/{run_id}/submit"), "emp@example.com", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let listed = |body: &Value| -> bool {
        body["tasks"]
            .as_object()
            .map(|tasks| {
                tasks.values().any(|models| {
                    models.as_object().unwrap().values().any(|runs| {
                        runs.as_array()
                            .unwrap()
                            .iter()
                            .any(|r| r["run_id"] == json!(run_id))
                    })
                })
            })
            .unwrap_or(false)
    };

    // Owner and managing manager see it; the outsider employee does not.
    let (_, body) = send(&router, ui_get("/api/runs", "emp@example.com")).await;
    assert!(listed(&body));
    let (_, body) = send(&router, ui_get("/api/runs", "mgr@example.com")).await;
    assert!(listed(&body));
    let (_, body) = send(&router, ui_get("/api/runs", "out@example.com")).await;
    assert!(!listed(&body));
    // Admin always sees it.
    let (_, body) = send(&router, ui_get("/api/runs", &fixture.admin.email)).await;
    assert!(listed(&body));

    // GM sees nothing while only SUBMITTED under the default policy.
    let dept = state
        .store
        .get_org_unit(&fixture.team_a)
        .await
        .unwrap()
        .unwrap()
        .parent_id
        .unwrap();
    seed_user(&state, "gm@example.com", UserRole::Gm, Some(&dept)).await;
    let (_, body) = send(&router, ui_get("/api/runs", "gm@example.com")).await;
    assert!(!listed(&body));

    // Relaxed policy surfaces SUBMITTED to GM/VP.
    state
        .store
        .set_setting("gm_vp_approved_only", "false")
        .await
        .unwrap();
    let (_, body) = send(&router, ui_get("/api/runs", "gm@example.com")).await;
    assert!(listed(&body));

    // Back to default; approval makes it visible again.
    state
        .store
        .set_setting("gm_vp_approved_only", "true")
        .await
        .unwrap();
    let (status, _) = send(
        &router,
        ui_post(
            &format!("/v1/runs/{run_id}/approve"),
            "mgr@example.com",
            json!({"comment": "ship it"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(&router, ui_get("/api/runs", "gm@example.com")).await;
    assert!(listed(&body));
}

#[tokio::test]
async fn workflow_state_machine_is_enforced() {
    let state = test_state().await;
    let router = build_router(state.clone());
    let fixture = seed_org(&state).await;
    let token = issue_key(&state, &fixture.employee.id).await;
    let run_id = create_run_via_api(&router, &token).await;
    let submit = format!("/v1/runs/{run_id}/submit");
    let approve = format!("/v1/runs/{run_id}/approve");
    let reject = format!("/v1/runs/{run_id}/reject");

    // Approve before submission is a state error.
    let (status, _) = send(&router, ui_post(&approve, "mgr@example.com", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Only the owner may submit.
    let (status, _) = send(&router, ui_post(&submit, "out@example.com", json!({}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send(&router, ui_post(&submit, "emp@example.com", json!({}))).await;
    assert_eq!(status, StatusCode::OK);

    // Re-submission from SUBMITTED is rejected.
    let (status, _) = send(&router, ui_post(&submit, "emp@example.com", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Neither the owner nor an unrelated employee can decide.
    let (status, _) = send(&router, ui_post(&approve, "emp@example.com", json!({}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send(&router, ui_post(&approve, "out@example.com", json!({}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // The managing manager rejects with a comment.
    let (status, body) = send(
        &router,
        ui_post(&reject, "mgr@example.com", json!({"comment": "needs rerun"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "REJECTED");

    let approval = state.store.get_approval(&run_id).await.unwrap().unwrap();
    assert_eq!(approval.comment, "needs rerun");
    assert_eq!(
        approval.decision,
        Some(gauge_types::ApprovalDecision::Rejected)
    );
    assert_eq!(approval.decision_by_user_id, Some(fixture.manager.id.clone()));

    // Terminal: cannot resubmit a rejected run.
    let (status, _) = send(&router, ui_post(&submit, "emp@example.com", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Audit trail recorded the transitions.
    assert_eq!(state.store.count_audit_rows("run.submit").await.unwrap(), 1);
    assert_eq!(state.store.count_audit_rows("run.reject").await.unwrap(), 1);
}

#[tokio::test]
async fn admin_org_endpoints_validate_hierarchy_and_roles() {
    let state = test_state().await;
    let router = build_router(state.clone());
    let fixture = seed_org(&state).await;

    // Non-admin gets 403.
    let (status, _) = send(&router, ui_get("/v1/admin/org/tree", "emp@example.com")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&router, ui_get("/v1/admin/org/tree", "admin@example.com")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tree"].as_array().unwrap().len(), 1);
    let teams = body["tree"][0]["children"][0]["children"].as_array().unwrap();
    assert_eq!(teams.len(), 2);

    // A department must hang off a sector.
    let (status, _) = send(
        &router,
        ui_post(
            "/v1/admin/org/units",
            "admin@example.com",
            json!({"name": "Orphan", "type": "DEPARTMENT"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(
        &router,
        ui_post(
            "/v1/admin/org/units",
            "admin@example.com",
            json!({"name": "Orphan", "type": "DEPARTMENT", "parent_id": fixture.team_a}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Role/org matrix: a GM cannot live on a TEAM.
    let gm = seed_user(&state, "gm2@example.com", UserRole::Employee, Some(&fixture.team_b)).await;
    let patch = Request::builder()
        .method("PATCH")
        .uri(format!("/v1/admin/users/{}", gm.id))
        .header("X-User-Email", "admin@example.com")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"role": "GM", "team_unit_id": fixture.team_b}).to_string(),
        ))
        .unwrap();
    let (status, body) = send(&router, patch).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    // Double-manager assignment is rejected.
    let (status, body) = send(
        &router,
        Request::builder()
            .method("PUT")
            .uri(format!("/v1/admin/org/teams/{}/manager", fixture.team_b))
            .header("X-User-Email", "admin@example.com")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({"manager_user_id": fixture.manager.id}).to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    // Closure rebuild reports row count: 4 units + 2 dept/team links per team
    // + 1 for dept = self(4) + dept->sector(1) + teamA(2) + teamB(2).
    let (status, body) = send(
        &router,
        ui_post("/v1/admin/org/rebuild-closure", "admin@example.com", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["closure_entries"], json!(9));
}

#[tokio::test]
async fn admin_settings_reject_unknown_keys() {
    let state = test_state().await;
    let router = build_router(state.clone());
    seed_org(&state).await;

    let put = |body: Value| {
        Request::builder()
            .method("PUT")
            .uri("/v1/admin/settings")
            .header("X-User-Email", "admin@example.com")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    };

    let (status, _) = send(
        &router,
        put(json!({"settings": {"gm_vp_approved_only": "false"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&router, put(json!({"settings": {"nope": "1"}}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = send(&router, ui_get("/v1/admin/settings", "admin@example.com")).await;
    assert_eq!(body["settings"]["gm_vp_approved_only"], json!("false"));
}

#[tokio::test]
async fn admin_issues_api_keys_that_authenticate() {
    let state = test_state().await;
    let router = build_router(state.clone());
    let fixture = seed_org(&state).await;

    let (status, body) = send(
        &router,
        ui_post(
            "/v1/admin/api-keys",
            "admin@example.com",
            json!({"user_id": fixture.employee.id, "name": "ci"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_string();
    assert_eq!(body["prefix"], json!(token[..8].to_string()));

    let run_id = create_run_via_api(&router, &token).await;
    assert!(state.store.get_run(&run_id).await.unwrap().is_some());
}

#[tokio::test]
async fn bootstrap_creates_first_user_as_vp() {
    let state = test_state().await;
    let router = build_router(state.clone());

    // Without the secret: 401.
    let (status, _) = send(&router, ui_get("/api/runs", "first@example.com")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("GET")
        .uri("/api/runs")
        .header("X-User-Email", "first@example.com")
        .header("X-Admin-Bootstrap", "boot-secret")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);

    let user = state
        .store
        .get_user_by_email("first@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(user.role, UserRole::Vp);

    // Bootstrap only works while the table is empty.
    let request = Request::builder()
        .method("GET")
        .uri("/api/runs")
        .header("X-User-Email", "second@example.com")
        .header("X-Admin-Bootstrap", "boot-secret")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn csv_upload_creates_terminal_run() {
    let state = test_state().await;
    let router = build_router(state.clone());
    let fixture = seed_org(&state).await;
    let token = issue_key(&state, &fixture.employee.id).await;

    let csv = "item_id,input,expected_output,output,time,trace_id,exactness_score,exactness__meta__note\n\
               item_0,hello,hello,hello,0.120,t1,1.0,ok\n\
               item_1,bye,bye,ERROR: task exploded,,,,\n";
    let (status, body) = send(
        &router,
        api_post(
            "/v1/runs:upload?task=qa&dataset=ds&format=csv",
            &token,
            csv.to_string(),
            "text/csv",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let run_id = body["run_id"].as_str().unwrap();

    let run = state.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, gauge_types::RunWorkflowStatus::Completed);
    assert_eq!(run.metrics, vec!["exactness".to_string()]);

    let items = state.store.list_items(run_id).await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].latency_ms, Some(120.0));
    assert_eq!(items[1].error.as_deref(), Some("task exploded"));

    let scores = state.store.list_scores(run_id).await.unwrap();
    let errored = scores.iter().find(|s| s.item_id == "item_1").unwrap();
    assert_eq!(errored.score_numeric, Some(0.0));
    let scored = scores.iter().find(|s| s.item_id == "item_0").unwrap();
    assert_eq!(scored.score_numeric, Some(1.0));
    assert_eq!(scored.meta["note"], json!("ok"));
}

#[tokio::test]
async fn json_upload_creates_terminal_run() {
    let state = test_state().await;
    let router = build_router(state.clone());
    let fixture = seed_org(&state).await;
    let token = issue_key(&state, &fixture.employee.id).await;

    let results = json!({
        "dataset_name": "ds-json",
        "metrics": ["exactness"],
        "inputs": {"item_0": "hello", "item_1": "bye"},
        "metadatas": {"item_0": {"k": "v"}},
        "results": {
            "item_0": {
                "output": "hello",
                "expected": "hello",
                "time": 0.25,
                "trace_id": "t1",
                "scores": {"exactness": {"score": 1.0, "metadata": {"why": "match"}}}
            }
        },
        "errors": {"item_1": {"error": "boom", "trace_id": "t2"}}
    });
    let (status, body) = send(
        &router,
        api_post(
            "/v1/runs:upload?task=qa&dataset=ds",
            &token,
            results.to_string(),
            "application/json",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let run_id = body["run_id"].as_str().unwrap();

    let run = state.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.dataset, "ds-json");
    let items = state.store.list_items(run_id).await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].latency_ms, Some(250.0));
    assert_eq!(items[1].error.as_deref(), Some("boom"));

    let scores = state.store.list_scores(run_id).await.unwrap();
    assert_eq!(scores.len(), 1);
    assert_eq!(scores[0].score_numeric, Some(1.0));
    assert_eq!(scores[0].meta["why"], json!("match"));
}

#[tokio::test]
async fn metric_override_preserves_original() {
    let state = test_state().await;
    let router = build_router(state.clone());
    let fixture = seed_org(&state).await;
    let token = issue_key(&state, &fixture.employee.id).await;
    let run_id = create_run_via_api(&router, &token).await;
    send(
        &router,
        api_post(
            &format!("/v1/runs/{run_id}/events"),
            &token,
            encode_ndjson(&sample_batch(&run_id)),
            "application/x-ndjson",
        ),
    )
    .await;

    let (status, body) = send(
        &router,
        ui_post(
            "/api/runs/update_metric",
            "emp@example.com",
            json!({
                "run_id": run_id,
                "row_index": 0,
                "metric_name": "exactness",
                "new_score": 0.25,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["row"]["metric_values"][0], json!(0.25));

    let score = state
        .store
        .get_score(&run_id, "item_0", "exactness")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(score.score_numeric, Some(0.25));
    assert_eq!(score.meta["original_score"], json!(1.0));
    assert_eq!(score.meta["modified"], json!("true"));
}

#[tokio::test]
async fn root_cause_annotation_round_trip() {
    let state = test_state().await;
    let router = build_router(state.clone());
    let fixture = seed_org(&state).await;
    let token = issue_key(&state, &fixture.employee.id).await;
    let run_id = create_run_via_api(&router, &token).await;
    send(
        &router,
        api_post(
            &format!("/v1/runs/{run_id}/events"),
            &token,
            encode_ndjson(&sample_batch(&run_id)),
            "application/x-ndjson",
        ),
    )
    .await;

    let (status, _) = send(
        &router,
        ui_post(
            "/api/runs/update_root_cause",
            "emp@example.com",
            json!({"run_id": run_id, "item_id": "item_1", "root_cause": "bad prompt"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let item = state.store.get_item(&run_id, "item_1").await.unwrap().unwrap();
    assert_eq!(item.item_metadata["root_cause"], json!("bad prompt"));

    // Clearing removes the key.
    send(
        &router,
        ui_post(
            "/api/runs/update_root_cause",
            "emp@example.com",
            json!({"run_id": run_id, "item_id": "item_1", "root_cause": ""}),
        ),
    )
    .await;
    let item = state.store.get_item(&run_id, "item_1").await.unwrap().unwrap();
    assert!(item.item_metadata.get("root_cause").is_none());
}

#[tokio::test]
async fn run_delete_cascades_and_respects_permissions() {
    let state = test_state().await;
    let router = build_router(state.clone());
    let fixture = seed_org(&state).await;
    let token = issue_key(&state, &fixture.employee.id).await;
    let run_id = create_run_via_api(&router, &token).await;
    send(
        &router,
        api_post(
            &format!("/v1/runs/{run_id}/events"),
            &token,
            encode_ndjson(&sample_batch(&run_id)),
            "application/x-ndjson",
        ),
    )
    .await;

    let (status, _) = send(
        &router,
        ui_post("/api/runs/delete", "out@example.com", json!({"run_id": run_id})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &router,
        ui_post("/api/runs/delete", "mgr@example.com", json!({"run_id": run_id})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(state.store.get_run(&run_id).await.unwrap().is_none());
    assert_eq!(state.store.count_events(&run_id).await.unwrap(), 0);
}
