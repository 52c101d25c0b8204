//! Data model shared by the transport, planner, toolkit, and supervisor.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::regions::RegionHealth;
use crate::schema_adapter::SchemaHints;

/// Header carrying the region label of each attempt.
pub const REGION_HEADER: &str = "X-BattleHealer-Region";
/// Header propagated unchanged across every attempt of a logical request.
pub const CORRELATION_HEADER: &str = "X-Correlation-Id";
/// Header counting payload repairs applied to a request.
pub const REPAIR_ATTEMPT_HEADER: &str = "X-Healer-Repair-Attempt";

/// The outbound request being healed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestSpec {
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl HttpRequestSpec {
    pub fn new(method: &str) -> Self {
        Self {
            method: method.to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }

    /// Headers with credentials and cookies removed, for off-box envelopes.
    pub fn sanitized_headers(&self) -> HashMap<String, String> {
        sanitize_headers(&self.headers)
    }
}

/// Strips credential-bearing headers before a payload leaves the process.
pub fn sanitize_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    const BLOCKED: [&str; 3] = ["authorization", "proxy-authorization", "cookie"];
    headers
        .iter()
        .filter(|(k, _)| !BLOCKED.contains(&k.to_ascii_lowercase().as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Low-level healing step recorded by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FixAction {
    RetryStatus(u16),
    FallbackRegion(String),
    NetworkError,
    RefreshToken,
    RotateToken,
    RetryBudgetExhausted,
}

impl fmt::Display for FixAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixAction::RetryStatus(status) => write!(f, "retry_status_{status}"),
            FixAction::FallbackRegion(region) => write!(f, "fallback_region_{region}"),
            FixAction::NetworkError => write!(f, "network_error"),
            FixAction::RefreshToken => write!(f, "refresh_token"),
            FixAction::RotateToken => write!(f, "rotate_token"),
            FixAction::RetryBudgetExhausted => write!(f, "retry_budget_exhausted"),
        }
    }
}

impl Serialize for FixAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Telemetry for one HTTP exchange inside a transport call.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptLog {
    pub attempt_number: u32,
    pub region_id: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub fix_actions: Vec<FixAction>,
    pub correlation_id: String,
}

/// Aggregated telemetry for one transport call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportMeta {
    pub attempts: Vec<AttemptLog>,
    pub retries: u32,
    pub region: String,
    pub regions_tried: Vec<String>,
    /// Set-union of the per-attempt fix actions, first-seen order.
    pub fix_actions: Vec<FixAction>,
    pub correlation_id: String,
}

/// Structured terminal error; the transport never panics past its boundary.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl ErrorInfo {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            body: None,
        }
    }
}

/// Outcome of a single transport call.
#[derive(Debug, Clone, Serialize)]
pub struct TransportResult {
    pub data: Option<Value>,
    pub meta: TransportMeta,
    pub error: Option<ErrorInfo>,
}

impl TransportResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// One failed transport call as seen by the planner.
#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub cycle: u32,
    pub meta: TransportMeta,
    pub error: ErrorInfo,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_hints: Option<Value>,
}

/// One toolkit execution.
#[derive(Debug, Clone, Serialize)]
pub struct Intervention {
    pub cycle: u32,
    pub action: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// One planner verdict, as logged.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub cycle: u32,
    pub action: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// How far from a live upstream answer a returned payload is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Degradation {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "stale-cache")]
    StaleCache,
    #[serde(rename = "mocked")]
    Mocked,
    #[serde(rename = "partial")]
    Partial,
}

/// Where a degraded payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegradationSource {
    #[serde(rename = "cache")]
    Cache,
    #[serde(rename = "llm-mock")]
    LlmMock,
    #[serde(rename = "fallback-endpoint")]
    FallbackEndpoint,
}

/// Tagged outcome wrapper carrying degradation level and provenance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DegradedResponse {
    pub data: Option<Value>,
    #[serde(default)]
    pub degradation: Degradation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<DegradationSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_error: Option<String>,
}

impl DegradedResponse {
    /// The live, non-degraded placeholder.
    pub fn live() -> Self {
        Self::default()
    }

    pub fn stale_cache(data: Value, original_error: Option<String>) -> Self {
        Self {
            data: Some(data),
            degradation: Degradation::StaleCache,
            reason: Some("Serving stale cached response".to_string()),
            source: Some(DegradationSource::Cache),
            original_error,
        }
    }

    pub fn is_live(&self) -> bool {
        self.degradation == Degradation::None
    }
}

/// Mutable record of one supervisor invocation.
#[derive(Debug, Clone, Serialize)]
pub struct HealingState {
    pub request_id: String,
    pub correlation_id: String,
    pub url: String,
    pub request: HttpRequestSpec,
    pub regions: Vec<String>,
    pub region_index: usize,
    pub region_history: Vec<String>,
    pub region_health: RegionHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub repair_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_hints: Option<SchemaHints>,
    pub attempts: Vec<Observation>,
    pub interventions: Vec<Intervention>,
    pub decision_log: Vec<DecisionRecord>,
    pub cycles_used: u32,
    pub max_cycles: u32,
    pub queued: bool,
    pub degraded: DegradedResponse,
}

impl HealingState {
    /// Endpoint the next cycle will target.
    pub fn current_region_endpoint(&self) -> &str {
        self.regions
            .get(self.region_index)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn last_error(&self) -> Option<&ErrorInfo> {
        self.attempts.last().map(|obs| &obs.error)
    }
}

/// Final result handed back to the caller, state included for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct HealOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub degraded: DegradedResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_error: Option<ErrorInfo>,
    pub state: HealingState,
}
