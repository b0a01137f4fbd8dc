use std::net::SocketAddr;

use axum::routing::{delete, get, patch, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::{admin, ingest, runs, AppState};

async fn healthz() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "time": chrono::Utc::now().to_rfc3339(),
    }))
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(healthz))
        // Engine surface (API key auth).
        .route("/v1/runs", post(ingest::create_run))
        .route("/v1/runs/{id}/events", post(ingest::ingest_events))
        .route("/v1/runs:upload", post(ingest::upload_run))
        // Workflow (UI auth).
        .route("/v1/runs/{id}/submit", post(runs::submit_run))
        .route("/v1/runs/{id}/approve", post(runs::approve_run))
        .route("/v1/runs/{id}/reject", post(runs::reject_run))
        // Dashboard reads and mutations (UI auth).
        .route("/api/runs", get(runs::list_runs))
        .route("/api/runs/delete", post(runs::delete_run))
        .route("/api/runs/update_metric", post(runs::update_metric))
        .route("/api/runs/update_root_cause", post(runs::update_root_cause))
        .route("/api/runs/{id}", get(runs::run_detail))
        // Admin (UI auth, ADMIN role).
        .route("/v1/admin/org/tree", get(admin::org_tree))
        .route("/v1/admin/org/teams", get(admin::list_teams))
        .route("/v1/admin/org/units", post(admin::create_org_unit))
        .route(
            "/v1/admin/org/units/{id}",
            patch(admin::update_org_unit).delete(admin::delete_org_unit),
        )
        .route(
            "/v1/admin/org/teams/{id}/manager",
            put(admin::assign_team_manager),
        )
        .route("/v1/admin/org/rebuild-closure", post(admin::rebuild_closure))
        .route("/v1/admin/users", get(admin::list_users))
        .route("/v1/admin/users/{id}", patch(admin::update_user))
        .route(
            "/v1/admin/settings",
            get(admin::get_settings).put(admin::update_settings),
        )
        .route("/v1/admin/api-keys", post(admin::create_api_key))
        .route("/v1/admin/api-keys/{id}", delete(admin::revoke_api_key))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "gauge platform listening");
    axum::serve(listener, router).await?;
    Ok(())
}
