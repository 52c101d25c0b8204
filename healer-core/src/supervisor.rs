//! The healing loop: transport → planner → toolkit, cycle-budgeted, with a
//! stale-cache → mock degradation pipeline behind it.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{BackendClient, BackendTokenProvider, MockRequest, TokenProvider, TokenRecovery};
use crate::cache::{DEFAULT_STALE_TTL_MS, ResponseCache};
use crate::planner::{HealingAction, Planner};
use crate::planner::HeuristicPlanner;
use crate::regions::{RegionRegistry, RegionStatus};
use crate::schema_adapter;
use crate::state::{
    DecisionRecord, DegradedResponse, ErrorInfo, HealOutcome, HealingState, HttpRequestSpec,
    Observation,
};
use crate::toolkit::Toolkit;
use crate::transport::{Transport, TransportConfig};

/// Default outer cycle budget.
pub const DEFAULT_MAX_CYCLES: u32 = 6;

/// Fallback behavior once the cycle budget is spent.
#[derive(Debug, Clone)]
pub struct DegradationConfig {
    pub cache_key: Option<String>,
    pub enable_stale_cache: bool,
    pub stale_ttl_ms: u64,
    pub enable_mock: bool,
    pub mock_schema: Option<serde_json::Value>,
    pub mock_example: Option<serde_json::Value>,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            cache_key: None,
            enable_stale_cache: true,
            stale_ttl_ms: DEFAULT_STALE_TTL_MS,
            enable_mock: true,
            mock_schema: None,
            mock_example: None,
        }
    }
}

/// Inputs for one healing run.
#[derive(Debug, Clone)]
pub struct HealParams {
    pub url: String,
    pub request: HttpRequestSpec,
    pub regions: Option<Vec<String>>,
    pub request_id: Option<String>,
    pub correlation_id: Option<String>,
    pub max_cycles: Option<u32>,
    pub degradation: Option<DegradationConfig>,
}

impl HealParams {
    pub fn new(url: &str, request: HttpRequestSpec) -> Self {
        Self {
            url: url.to_string(),
            request,
            regions: None,
            request_id: None,
            correlation_id: None,
            max_cycles: None,
            degradation: None,
        }
    }
}

/// Drives healing runs against one backend.
pub struct Supervisor {
    registry: Arc<RegionRegistry>,
    planner: Arc<dyn Planner>,
    toolkit: Toolkit,
    backend: BackendClient,
    transport: Transport,
    cache: Arc<ResponseCache>,
    token_provider: Arc<dyn TokenProvider>,
    token_recovery: Option<Arc<dyn TokenRecovery>>,
    cycle_transport: TransportConfig,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Supervisor with the default collaborators for `backend_base_url`.
    pub fn new(backend_base_url: &str) -> Self {
        let backend = BackendClient::new(backend_base_url);
        let registry = Arc::new(RegionRegistry::builtin(backend_base_url));
        let cancel = CancellationToken::new();
        Self {
            toolkit: Toolkit::new(backend.clone(), registry.clone()),
            token_provider: Arc::new(BackendTokenProvider::new(backend.clone(), "healer")),
            planner: Arc::new(HeuristicPlanner::new()),
            transport: Transport::new().with_cancellation(cancel.clone()),
            cache: ResponseCache::global(),
            token_recovery: None,
            cycle_transport: cycle_transport_defaults(),
            cancel,
            registry,
            backend,
        }
    }

    pub fn with_registry(mut self, registry: Arc<RegionRegistry>) -> Self {
        self.toolkit = Toolkit::new(self.backend.clone(), registry.clone());
        self.registry = registry;
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_toolkit(mut self, toolkit: Toolkit) -> Self {
        self.toolkit = toolkit;
        self
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = provider;
        self
    }

    pub fn with_token_recovery(mut self, recovery: Arc<dyn TokenRecovery>) -> Self {
        self.token_recovery = Some(recovery);
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Template for each cycle's transport call; regions and correlation id
    /// are replaced per cycle. Retries stay off unless explicitly re-enabled.
    pub fn with_cycle_transport(mut self, config: TransportConfig) -> Self {
        self.cycle_transport = config;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.transport = std::mem::take(&mut self.transport).with_cancellation(cancel.clone());
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the healing loop for one logical request.
    pub async fn run(&self, params: HealParams) -> HealOutcome {
        let request_id = params
            .request_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let correlation_id = params
            .correlation_id
            .unwrap_or_else(|| request_id.clone());
        let regions = params
            .regions
            .filter(|regions| !regions.is_empty())
            .unwrap_or_else(|| self.registry.top_level_endpoints());
        let degradation = params.degradation.unwrap_or_default();

        let token = match self.token_provider.fetch_token().await {
            Ok(token) => Some(token),
            Err(error) => {
                tracing::warn!(%error, "initial token fetch failed; continuing without");
                None
            }
        };

        let mut state = HealingState {
            request_id,
            correlation_id,
            url: params.url,
            request: params.request,
            regions,
            region_index: 0,
            region_history: Vec::new(),
            region_health: Default::default(),
            token,
            repair_attempts: 0,
            cached_response: None,
            schema_hints: None,
            attempts: Vec::new(),
            interventions: Vec::new(),
            decision_log: Vec::new(),
            cycles_used: 0,
            max_cycles: params.max_cycles.unwrap_or(DEFAULT_MAX_CYCLES),
            queued: false,
            degraded: DegradedResponse::live(),
        };

        while state.cycles_used < state.max_cycles && !self.cancel.is_cancelled() {
            let endpoint = state.current_region_endpoint().to_string();
            let region_id = self.region_id_of(&endpoint);

            let mut request = state.request.clone();
            if let Some(token) = &state.token {
                request
                    .headers
                    .retain(|name, _| !name.eq_ignore_ascii_case("authorization"));
                request
                    .headers
                    .insert("Authorization".to_string(), format!("Bearer {token}"));
            }

            let config = TransportConfig {
                regions: vec![endpoint.clone()],
                correlation_id: Some(state.correlation_id.clone()),
                ..self.cycle_transport.clone()
            };
            let result = self
                .transport
                .execute(
                    &state.url,
                    &request,
                    &config,
                    self.token_recovery.as_deref(),
                )
                .await;

            if result.is_success() {
                let data = match &state.schema_hints {
                    Some(hints) => result.data.map(|value| schema_adapter::apply(hints, value)),
                    None => result.data,
                };
                let key = cache_key(&degradation, &state.url, &region_id);
                if let Some(data) = &data {
                    self.cache.remember(&key, data.clone());
                }
                state
                    .region_health
                    .insert(region_id.clone(), RegionStatus::Healthy);
                tracing::info!(
                    correlation_id = %state.correlation_id,
                    region = %region_id,
                    cycles = state.cycles_used,
                    "healing run succeeded"
                );
                self.backend
                    .log_event(
                        "HEAL_SUCCESS",
                        json!({
                            "correlation_id": state.correlation_id,
                            "region": region_id,
                            "cycles_used": state.cycles_used,
                        }),
                    )
                    .await;
                return HealOutcome {
                    success: true,
                    data,
                    degraded: DegradedResponse::live(),
                    final_error: None,
                    state,
                };
            }

            let error = result
                .error
                .unwrap_or_else(|| ErrorInfo::network("transport returned no error detail"));
            let observation = Observation {
                cycle: state.cycles_used,
                meta: result.meta,
                error: error.clone(),
                timestamp: Utc::now(),
                trigger_hints: error.body.clone(),
            };
            state.attempts.push(observation.clone());
            state.cycles_used += 1;
            state.region_history.push(region_id.clone());
            match error.status {
                Some(410) => {
                    state
                        .region_health
                        .insert(region_id.clone(), RegionStatus::Deprecated);
                }
                Some(503) | Some(429) => {
                    state
                        .region_health
                        .insert(region_id.clone(), RegionStatus::Unhealthy);
                }
                _ => {}
            }

            let decision = self.planner.plan(&state, &observation).await;
            tracing::info!(
                correlation_id = %state.correlation_id,
                cycle = observation.cycle,
                status = ?error.status,
                action = decision.action.name(),
                "healing decision"
            );
            self.backend
                .log_event(
                    "HEAL_DECISION",
                    json!({
                        "correlation_id": state.correlation_id,
                        "cycle": observation.cycle,
                        "status": error.status,
                        "action": decision.action.name(),
                        "reason": decision.reason,
                    }),
                )
                .await;
            state.decision_log.push(DecisionRecord {
                cycle: observation.cycle,
                action: decision.action.name().to_string(),
                reason: decision.reason.clone(),
                params: decision.action.params(),
            });

            let intervention = self
                .toolkit
                .execute(&mut state, &decision, observation.cycle)
                .await;
            state.interventions.push(intervention);

            match decision.action {
                HealingAction::UseMock { .. } => {
                    if !state.degraded.is_live() {
                        let degraded = state.degraded.clone();
                        return HealOutcome {
                            success: degraded.data.is_some(),
                            data: degraded.data.clone(),
                            degraded,
                            final_error: Some(error),
                            state,
                        };
                    }
                    // Mock collaborator failed; let the pipeline try again.
                    break;
                }
                HealingAction::QueueRecovery { .. } | HealingAction::Abort => break,
                _ => {}
            }
        }

        self.degrade(state, &degradation).await
    }

    /// Stale-cache then synthetic-mock fallback, then plain failure.
    async fn degrade(
        &self,
        mut state: HealingState,
        degradation: &DegradationConfig,
    ) -> HealOutcome {
        let final_error = state.last_error().cloned();
        let region_id = self.region_id_of(state.current_region_endpoint());
        let key = cache_key(degradation, &state.url, &region_id);

        if degradation.enable_stale_cache {
            if let Some(data) = self.cache.recall(&key, degradation.stale_ttl_ms as i64) {
                tracing::info!(
                    correlation_id = %state.correlation_id,
                    cache_key = %key,
                    "serving stale cached response"
                );
                let degraded = DegradedResponse::stale_cache(
                    data.clone(),
                    final_error.as_ref().map(|error| error.message.clone()),
                );
                state.degraded = degraded.clone();
                self.backend
                    .log_event(
                        "HEAL_DEGRADED",
                        json!({
                            "correlation_id": state.correlation_id,
                            "degradation": "stale-cache",
                        }),
                    )
                    .await;
                return HealOutcome {
                    success: true,
                    data: Some(data),
                    degraded,
                    final_error,
                    state,
                };
            }
        }

        if degradation.enable_mock {
            let request = MockRequest {
                schema_hint: degradation.mock_schema.clone().or_else(|| {
                    state
                        .schema_hints
                        .as_ref()
                        .and_then(|hints| serde_json::to_value(hints).ok())
                }),
                example_response: degradation.mock_example.clone(),
                cached_payload: state.cached_response.clone(),
                provider: None,
                endpoint: Some(state.url.clone()),
                reason: Some("healing cycles exhausted".to_string()),
                error: final_error.as_ref().map(|error| error.message.clone()),
                metadata: Some(json!({
                    "request_id": state.request_id,
                    "correlation_id": state.correlation_id,
                })),
            };
            match self.backend.mock_response(&request).await {
                Ok(degraded) => {
                    state.degraded = degraded.clone();
                    self.backend
                        .log_event(
                            "HEAL_DEGRADED",
                            json!({
                                "correlation_id": state.correlation_id,
                                "degradation": degraded.degradation,
                            }),
                        )
                        .await;
                    return HealOutcome {
                        success: degraded.data.is_some(),
                        data: degraded.data.clone(),
                        degraded,
                        final_error,
                        state,
                    };
                }
                Err(error) => {
                    tracing::warn!(%error, "mock degradation failed");
                }
            }
        }

        HealOutcome {
            success: false,
            data: None,
            degraded: DegradedResponse::live(),
            final_error,
            state,
        }
    }

    fn region_id_of(&self, endpoint: &str) -> String {
        if endpoint.is_empty() {
            return "default".to_string();
        }
        self.registry
            .find_by_endpoint(endpoint)
            .map(|node| node.id.clone())
            .unwrap_or_else(|| endpoint.to_string())
    }
}

fn cycle_transport_defaults() -> TransportConfig {
    TransportConfig {
        max_retries: 0,
        ..TransportConfig::default()
    }
}

fn cache_key(degradation: &DegradationConfig, url: &str, region_id: &str) -> String {
    degradation
        .cache_key
        .clone()
        .unwrap_or_else(|| format!("{url}::{region_id}"))
}
