use anyhow::Context;

use gauge_types::{CreateRunRequest, CreateRunResponse};

use crate::stream::EventStream;

/// Thin client for the platform's engine-facing endpoints.
#[derive(Clone)]
pub struct PlatformClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl PlatformClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http: reqwest::Client::new(),
        }
    }

    /// `POST /v1/runs`: open a run and get back its id and live URL.
    pub async fn create_run(&self, request: &CreateRunRequest) -> anyhow::Result<CreateRunResponse> {
        let response = self
            .http
            .post(format!("{}/v1/runs", self.base_url))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .context("platform unreachable")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("run creation rejected ({status}): {body}");
        }
        let created: CreateRunResponse = response
            .json()
            .await
            .context("platform returned malformed run handle")?;
        if created.run_id.is_empty() || created.live_url.is_empty() {
            anyhow::bail!("platform did not return run_id/live_url");
        }
        Ok(created)
    }

    /// Event stream bound to a run created by [`Self::create_run`].
    pub fn open_event_stream(&self, run_id: &str) -> EventStream {
        EventStream::http(self.http.clone(), &self.base_url, run_id, &self.api_key)
    }
}
