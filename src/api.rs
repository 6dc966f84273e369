//! Admin dashboard API client.
//!
//! Provides authenticated HTTP communication with the admin dashboard: the
//! health check used for connectivity transitions, mutation replay, and the
//! catalog delta endpoints.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::catalog::{CatalogDelta, CatalogSource};
use crate::config::SyncConfig;
use crate::error::ApiError;
use crate::queue::{HttpMethod, MutationEnvelope};
use crate::store::Collection;
use crate::value_str;

/// Timeout used specifically for the lightweight connectivity test.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// The authoritative server, as seen by the sync processor.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Re-issue a queued request. Returns the response body (`Null` for an
    /// empty response).
    ///
    /// Implementations bound each request with their own timeout and report
    /// it as [`ApiError::Timeout`]. The processor awaits every dispatched
    /// replay to completion and never cancels one mid-flight.
    async fn replay(&self, envelope: &MutationEnvelope) -> Result<Value, ApiError>;

    /// Lightweight reachability probe.
    async fn is_reachable(&self) -> bool;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the admin dashboard URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_admin_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Percent-encode a query parameter value.
pub(crate) fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if is_unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

// ---------------------------------------------------------------------------
// Connection strings
// ---------------------------------------------------------------------------

/// Terminals are provisioned with either a bare API key or a connection
/// string: JSON (or base64url JSON) carrying `key`, `url` and `tid`.
fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

pub fn extract_api_key_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw).and_then(|v| value_str(&v, &["key"]))
}

pub fn extract_admin_url_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| value_str(&v, &["url"]))
        .map(|u| normalize_admin_url(&u))
}

pub fn extract_terminal_id_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw).and_then(|v| value_str(&v, &["tid", "terminalId"]))
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn transport_error(url: &str, err: &reqwest::Error, timeout: Duration) -> ApiError {
    if err.is_timeout() {
        return ApiError::Timeout(timeout.as_millis() as u64);
    }
    if err.is_connect() {
        return ApiError::Network(format!("Cannot reach admin dashboard at {url}"));
    }
    if err.is_builder() {
        return ApiError::InvalidRequest(format!("Invalid admin dashboard URL: {url}"));
    }
    ApiError::Network(format!("Network error communicating with {url}: {err}"))
}

/// Convert an HTTP status code into a user-friendly message.
fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Admin dashboard endpoint not found".to_string(),
        409 => "Conflict reported by admin dashboard".to_string(),
        s if s >= 500 => "Admin dashboard server error".to_string(),
        _ => "Unexpected response from admin dashboard".to_string(),
    }
}

/// Build a status error, preserving validation details from the body.
fn status_error(status: StatusCode, body_text: &str) -> ApiError {
    let json = serde_json::from_str::<Value>(body_text).ok();
    let mut message = json
        .as_ref()
        .and_then(|j| value_str(j, &["error", "message"]))
        .unwrap_or_else(|| status_message(status));
    if let Some(details) = json
        .as_ref()
        .and_then(|j| j.get("details").or_else(|| j.get("errors")))
    {
        message = format!("{message}: {details}");
    } else if json.is_none() && !body_text.trim().is_empty() {
        message = format!("{message}: {}", body_text.trim());
    }
    ApiError::Status {
        status: status.as_u16(),
        message,
        body: json,
    }
}

// ---------------------------------------------------------------------------
// HTTP backend
// ---------------------------------------------------------------------------

/// Authenticated client for the admin dashboard.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: String,
    terminal_id: String,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(config: &SyncConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_admin_url(&config.admin_url),
            api_key: config.api_key.clone(),
            terminal_id: config.terminal_id.clone(),
            timeout: config.request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform an authenticated request. `path` includes the leading slash.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let full_url = format!("{}{path}", self.base_url);

        let mut req = self
            .client
            .request(method.clone(), &full_url)
            .header("X-POS-API-Key", &self.api_key)
            .header("x-terminal-id", &self.terminal_id)
            .header("Content-Type", "application/json");

        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e, self.timeout))?;
        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .map_err(|e| transport_error(&self.base_url, &e, self.timeout))?;

        if !status.is_success() {
            let err = status_error(status, &body_text);
            debug!(%method, path, error = %err, "admin request rejected");
            return Err(err);
        }

        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| ApiError::InvalidResponse(format!("Invalid JSON from admin dashboard: {e}")))
    }
}

fn to_reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Post => Method::POST,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Put => Method::PUT,
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn replay(&self, envelope: &MutationEnvelope) -> Result<Value, ApiError> {
        self.request(
            to_reqwest_method(envelope.method),
            &envelope.endpoint,
            Some(&envelope.body),
        )
        .await
    }

    async fn is_reachable(&self) -> bool {
        let health_url = format!("{}/api/health", self.base_url);
        let start = Instant::now();
        let resp = self
            .client
            .get(&health_url)
            .timeout(CONNECTIVITY_TIMEOUT)
            .header("X-POS-API-Key", &self.api_key)
            .send()
            .await;
        match resp {
            Ok(r) if r.status().is_success() => {
                debug!(
                    latency_ms = start.elapsed().as_millis() as u64,
                    "connectivity test passed"
                );
                true
            }
            Ok(r) => {
                warn!(status = r.status().as_u16(), "connectivity test failed");
                false
            }
            Err(_) => false,
        }
    }
}

#[async_trait]
impl CatalogSource for HttpBackend {
    async fn fetch_delta(
        &self,
        collection: Collection,
        since: Option<&str>,
    ) -> Result<CatalogDelta, ApiError> {
        let mut path = format!("/api/pos/{}", collection.api_name());
        if let Some(cursor) = since {
            path.push_str(&format!("?updated_since={}", percent_encode(cursor)));
        }
        let resp = self.request(Method::GET, &path, None).await?;

        // Accept { data: [...] }, { <collection>: [...] } or a bare array.
        let records = resp
            .get("data")
            .or_else(|| resp.get(collection.api_name()))
            .unwrap_or(&resp)
            .as_array()
            .cloned()
            .ok_or_else(|| {
                ApiError::InvalidResponse(format!(
                    "{} delta is not an array",
                    collection.api_name()
                ))
            })?;
        let max_updated_at = value_str(&resp, &["max_updated_at", "maxUpdatedAt"]);

        info!(
            collection = collection.api_name(),
            count = records.len(),
            "catalog delta fetched"
        );
        Ok(CatalogDelta {
            records,
            max_updated_at,
        })
    }
}
