//! HTTP client for the healing backend collaborators.
//!
//! The backend fronts credential issuance (`/generate-api-key`,
//! `/refresh-token`), synthetic mock generation (`/mock-response`), the
//! recovery queue (`/queue-failed`, `/queue-status`), and structured log
//! intake (`/log`, `/logs`). Log delivery is always best-effort.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::default_client;
use crate::state::{DegradedResponse, Degradation, DegradationSource};

/// Errors from backend collaborator calls.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Network-level failure reaching the backend.
    #[error("Backend request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// Backend answered with a non-2xx status.
    #[error("Backend error ({status}): {body}")]
    Status { status: u16, body: String },

    /// Response body did not match the expected shape.
    #[error("Backend response parse error: {0}")]
    Parse(String),

    /// Credential endpoint returned no usable token.
    #[error("Backend issued an empty token")]
    EmptyToken,
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Context handed to a token recovery handler by the transport.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryContext {
    pub status: u16,
    pub attempt: u32,
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_token: Option<String>,
}

/// Source of the initial bearer token for a healing run.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self) -> BackendResult<String>;
}

/// One-shot in-call token recovery, invoked by the transport on 401/403/429.
#[async_trait]
pub trait TokenRecovery: Send + Sync {
    /// Returns a replacement token, or `None` when recovery has nothing to
    /// offer (which the transport treats as terminal).
    async fn recover(&self, ctx: &RecoveryContext) -> BackendResult<Option<String>>;
}

/// Credential grant returned by `/generate-api-key`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    #[serde(default)]
    pub credential_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshTokenRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RefreshTokenResponse {
    token: String,
}

/// Request for a synthetic degradation payload.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MockRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_hint: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example_response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct MockResponseBody {
    #[serde(default)]
    mock: Option<Value>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    degradation: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    original_error: Option<String>,
}

/// Sanitized envelope accepted by `/queue-failed`.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEnvelope {
    pub request_id: String,
    pub correlation_id: String,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub method: String,
    pub url: String,
    /// Must already be sanitized; see [`crate::state::sanitize_headers`].
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_status: Option<u16>,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
}

/// Client for the healing backend.
#[derive(Clone)]
pub struct BackendClient {
    base_url: String,
    client: reqwest::Client,
}

impl BackendClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: default_client::client().clone(),
        }
    }

    /// Client with a caller-supplied reqwest client, for tests.
    pub fn with_client(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> BackendResult<T> {
        let response = self
            .client
            .post(self.endpoint(path))
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))
    }

    /// Issues a fresh credential for `user_id`.
    pub async fn generate_api_key(&self, user_id: &str) -> BackendResult<TokenGrant> {
        let grant: TokenGrant = self
            .post_json("generate-api-key", &json!({ "userId": user_id }))
            .await?;
        if grant.token.is_empty() {
            return Err(BackendError::EmptyToken);
        }
        Ok(grant)
    }

    /// Exchanges a failed credential for a replacement.
    pub async fn refresh_token(&self, request: &RefreshTokenRequest) -> BackendResult<String> {
        let response: RefreshTokenResponse = self.post_json("refresh-token", request).await?;
        if response.token.is_empty() {
            return Err(BackendError::EmptyToken);
        }
        Ok(response.token)
    }

    /// Requests a synthetic payload for mock degradation.
    pub async fn mock_response(&self, request: &MockRequest) -> BackendResult<DegradedResponse> {
        let body: MockResponseBody = self.post_json("mock-response", request).await?;
        let data = body.mock.or(body.payload);
        let degradation = match body.degradation.as_deref() {
            Some("stale-cache") => Degradation::StaleCache,
            Some("partial") => Degradation::Partial,
            Some("none") => Degradation::None,
            _ => Degradation::Mocked,
        };
        let source = match body.source.as_deref() {
            Some("cache") => Some(DegradationSource::Cache),
            Some("fallback-endpoint") => Some(DegradationSource::FallbackEndpoint),
            _ => Some(DegradationSource::LlmMock),
        };
        Ok(DegradedResponse {
            data,
            degradation,
            reason: body.reason,
            source,
            original_error: body.original_error,
        })
    }

    /// Hands a failed request to the asynchronous recovery queue.
    pub async fn queue_failed(&self, envelope: &QueueEnvelope) -> BackendResult<Value> {
        self.post_json("queue-failed", envelope).await
    }

    /// Emits a structured healing event. Never fails the caller.
    pub async fn log_event(&self, event: &str, metadata: Value) {
        let payload = json!({ "event": event, "metadata": metadata });
        match self
            .client
            .post(self.endpoint("log"))
            .json(&payload)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                tracing::warn!(event, status = response.status().as_u16(), "log intake refused");
            }
            Err(error) => {
                tracing::warn!(event, %error, "log intake unreachable");
            }
        }
    }

    /// Queue metrics snapshot.
    pub async fn queue_status(&self) -> BackendResult<Value> {
        let response = self.client.get(self.endpoint("queue-status")).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))
    }

    /// Recent healing log entries, optionally filtered by correlation id.
    pub async fn logs(&self, correlation_id: Option<&str>, limit: u32) -> BackendResult<Value> {
        let mut request = self
            .client
            .get(self.endpoint("logs"))
            .query(&[("limit", limit.to_string())]);
        if let Some(correlation_id) = correlation_id {
            request = request.query(&[("correlation_id", correlation_id)]);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))
    }
}

/// Default token source: `/generate-api-key` keyed by a fixed user id.
pub struct BackendTokenProvider {
    backend: BackendClient,
    user_id: String,
}

impl BackendTokenProvider {
    pub fn new(backend: BackendClient, user_id: &str) -> Self {
        Self {
            backend,
            user_id: user_id.to_string(),
        }
    }
}

#[async_trait]
impl TokenProvider for BackendTokenProvider {
    async fn fetch_token(&self) -> BackendResult<String> {
        Ok(self.backend.generate_api_key(&self.user_id).await?.token)
    }
}

/// Default in-call recovery: `/refresh-token` with the failure context.
pub struct BackendTokenRecovery {
    backend: BackendClient,
}

impl BackendTokenRecovery {
    pub fn new(backend: BackendClient) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl TokenRecovery for BackendTokenRecovery {
    async fn recover(&self, ctx: &RecoveryContext) -> BackendResult<Option<String>> {
        let token = self
            .backend
            .refresh_token(&RefreshTokenRequest {
                previous_token: ctx.previous_token.clone(),
                failure_status: Some(ctx.status),
                attempt: Some(ctx.attempt),
                requested_by: Some("transport".to_string()),
            })
            .await?;
        Ok(Some(token))
    }
}
