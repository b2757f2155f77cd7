use crate::config::AgentConfig;
use crate::errors::{AgentError, FetchError, Result};
use crate::presence::ConfiguredPrinter;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

/// HTTP client for the cloud print-job API.
///
/// Every request carries `Authorization: Bearer <token>` and `X-Store-Id`.
pub struct CloudClient {
    client: Client,
    base_url: String,
    store_id: String,
    token: String,
}

impl CloudClient {
    pub fn new(api_url: &str, store_id: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                error!("Failed to create HTTP client with custom config: {}. Using defaults.", e);
                Client::new()
            });

        let base_url = api_url.trim().trim_end_matches('/').to_string();
        info!("Initialized cloud client: {}", base_url);

        Self {
            client,
            base_url,
            store_id: store_id.into(),
            token: token.into(),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            &config.api_url,
            config.store_id.clone(),
            config.token.clone(),
            config.timings.http_timeout(),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.token)
            .header("X-Store-Id", &self.store_id)
    }

    /// `GET /printer-jobs`. 401/403 map to `FetchError::Auth`, anything else
    /// that is not a usable response maps to `NetworkUnavailable`.
    pub async fn fetch_pending_jobs(&self) -> std::result::Result<Vec<Value>, FetchError> {
        let url = format!("{}/printer-jobs", self.base_url);

        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| {
                warn!("Job fetch failed: {}", e);
                FetchError::NetworkUnavailable(e.to_string())
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!("Job fetch rejected: HTTP {}", status.as_u16());
            return Err(FetchError::Auth(status.as_u16()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Job fetch failed: {} - {}", status, body);
            return Err(FetchError::NetworkUnavailable(format!("HTTP {}", status.as_u16())));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::NetworkUnavailable(e.to_string()))?;
        let jobs = parse_job_list(&body).map_err(|e| {
            warn!("Job list is not valid JSON: {}", e);
            FetchError::NetworkUnavailable(format!("Parse error: {}", e))
        })?;

        debug!("Fetched {} pending job(s)", jobs.len());
        Ok(jobs)
    }

    /// `{base}/printer-jobs/{id}/{action}` with the id as one encoded segment.
    fn job_url(&self, job_id: &str, action: &str) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| AgentError::Cloud(format!("Invalid API URL '{}': {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| AgentError::Cloud(format!("API URL '{}' cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(["printer-jobs", job_id, action]);
        Ok(url)
    }

    /// `PATCH /printer-jobs/{id}/printed`
    pub async fn mark_printed(&self, job_id: &str) -> Result<()> {
        let url = self.job_url(job_id, "printed")?;
        self.patch(url, None).await
    }

    /// `PATCH /printer-jobs/{id}/error` with `{"error": message}`
    pub async fn mark_error(&self, job_id: &str, message: &str) -> Result<()> {
        let url = self.job_url(job_id, "error")?;
        self.patch(url, Some(json!({ "error": message }))).await
    }

    async fn patch(&self, url: Url, body: Option<Value>) -> Result<()> {
        let mut request = self.authorized(self.client.patch(url.clone()));
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::Cloud(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Cloud(format!("PATCH {} failed: {} - {}", url, status, body)));
        }
        Ok(())
    }

    /// `GET /printer-jobs/agent/printers`. Records that do not parse are
    /// dropped with a warning.
    pub async fn fetch_configured_printers(&self) -> Result<Vec<ConfiguredPrinter>> {
        let url = format!("{}/printer-jobs/agent/printers", self.base_url);

        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| AgentError::Cloud(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Cloud(format!("Printer list failed: {} - {}", status, body)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AgentError::Cloud(e.to_string()))?;

        let records = unwrap_list(&body, "printers")?;
        let printers = records
            .into_iter()
            .filter_map(|record| match serde_json::from_value::<ConfiguredPrinter>(record) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("Skipping unreadable printer record: {}", e);
                    None
                }
            })
            .collect();
        Ok(printers)
    }
}

/// Accepts a JSON array, `null`, an empty body, or `{"jobs": [...]}`.
pub fn parse_job_list(body: &str) -> std::result::Result<Vec<Value>, serde_json::Error> {
    unwrap_list(body, "jobs")
}

fn unwrap_list(body: &str, key: &str) -> std::result::Result<Vec<Value>, serde_json::Error> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(match serde_json::from_str::<Value>(body)? {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    })
}
