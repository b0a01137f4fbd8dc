//! HTTP surface of the Gauge platform.
//!
//! Two classes of caller share the router: evaluation engines authenticate
//! with bearer API keys and write runs/events, dashboards authenticate with
//! reverse-proxy identity headers and read role-scoped views or drive the
//! approval workflow.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use gauge_store::{Store, StoreError};

mod admin;
mod auth;
mod http;
mod ingest;
mod runs;

pub use auth::{hash_api_key, new_api_key_token, token_prefix, Principal};
pub use http::{build_router, serve};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Local development: every UI request is an anonymous all-access
    /// principal. Never deploy with this.
    None,
    /// Identity arrives via `X-User-Email` from a trusted reverse proxy.
    ProxyHeaders,
}

impl AuthMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(AuthMode::None),
            "proxy_headers" => Some(AuthMode::ProxyHeaders),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public base URL used to build live run links.
    pub base_url: String,
    pub auth_mode: AuthMode,
    /// Shared secret enabling first-user bootstrap; empty disables it.
    pub admin_bootstrap_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            auth_mode: AuthMode::ProxyHeaders,
            admin_bootstrap_token: String::new(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(store: Store, config: ServerConfig) -> Self {
        Self { store, config }
    }

    pub fn live_url(&self, run_id: &str) -> String {
        format!("{}/run/{}", self.config.base_url.trim_end_matches('/'), run_id)
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(m)
            | ApiError::Unauthorized(m)
            | ApiError::Forbidden(m)
            | ApiError::NotFound(m)
            | ApiError::Internal(m) => m,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, ApiError::Internal(_)) {
            tracing::error!(error = self.message(), "request failed");
        }
        (self.status(), Json(json!({ "error": self.message() }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiError::NotFound(format!("{what} not found")),
            StoreError::Constraint(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
