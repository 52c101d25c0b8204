//! Executes healing decisions against the mutable healing state.
//!
//! The toolkit owns every side effect a decision can have: credential
//! refresh, region switching, payload repair and rewrite, schema
//! adaptation, mock degradation, and recovery queueing. It mutates the
//! state in place and reports each execution as an [`Intervention`].

use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use serde_json::{Value, json};

use crate::backend::{BackendClient, MockRequest, QueueEnvelope, RefreshTokenRequest};
use crate::budget::RetryBudgetStore;
use crate::clock::{Clock, system_clock};
use crate::planner::{HealingAction, HealingDecision};
use crate::regions::RegionRegistry;
use crate::schema_adapter::{self, SchemaHints};
use crate::state::{HealingState, Intervention, REPAIR_ATTEMPT_HEADER};

/// Per-invocation cap on payload repairs.
pub const MAX_REPAIR_ATTEMPTS: u32 = 2;
/// Process-wide per-endpoint repair window.
pub const REPAIR_WINDOW_MS: u64 = 60_000;
pub const REPAIR_WINDOW_LIMIT: u32 = 4;

fn global_repair_window() -> Arc<RetryBudgetStore> {
    static GLOBAL: Lazy<Arc<RetryBudgetStore>> =
        Lazy::new(|| Arc::new(RetryBudgetStore::new(system_clock())));
    GLOBAL.clone()
}

/// Produces a replacement body when the upstream rejects the payload.
pub trait RepairStrategy: Send + Sync {
    /// Repairs `body` (the current request body, if any) into a payload the
    /// upstream should accept.
    fn repair(&self, body: Option<&Value>, now_ms: u64) -> Value;
}

/// Demo strategy: ensure `transactionId` and a non-null `amount`.
pub struct TransactionRepairStrategy;

impl RepairStrategy for TransactionRepairStrategy {
    fn repair(&self, body: Option<&Value>, now_ms: u64) -> Value {
        match body {
            Some(Value::Object(obj)) => {
                let mut repaired = obj.clone();
                let missing_txid = matches!(
                    repaired.get("transactionId"),
                    None | Some(Value::Null)
                );
                if missing_txid {
                    repaired.insert(
                        "transactionId".to_string(),
                        Value::String(format!("auto-{now_ms}")),
                    );
                }
                if matches!(repaired.get("amount"), None | Some(Value::Null)) {
                    repaired.insert("amount".to_string(), json!(0));
                }
                Value::Object(repaired)
            }
            _ => json!({
                "transactionId": format!("fallback-{now_ms}"),
                "amount": 0,
            }),
        }
    }
}

/// The action executor.
pub struct Toolkit {
    backend: BackendClient,
    registry: Arc<RegionRegistry>,
    repair_window: Arc<RetryBudgetStore>,
    repair_strategy: Arc<dyn RepairStrategy>,
    clock: Arc<dyn Clock>,
}

impl Toolkit {
    pub fn new(backend: BackendClient, registry: Arc<RegionRegistry>) -> Self {
        Self {
            backend,
            registry,
            repair_window: global_repair_window(),
            repair_strategy: Arc::new(TransactionRepairStrategy),
            clock: system_clock(),
        }
    }

    pub fn with_parts(
        backend: BackendClient,
        registry: Arc<RegionRegistry>,
        repair_window: Arc<RetryBudgetStore>,
        repair_strategy: Arc<dyn RepairStrategy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            registry,
            repair_window,
            repair_strategy,
            clock,
        }
    }

    /// Applies `decision` to `state`, returning the recorded intervention.
    pub async fn execute(
        &self,
        state: &mut HealingState,
        decision: &HealingDecision,
        cycle: u32,
    ) -> Intervention {
        match &decision.action {
            HealingAction::Retry => Intervention {
                cycle,
                action: "retry".to_string(),
                reason: decision.reason.clone(),
                details: None,
            },
            HealingAction::RefreshToken => self.refresh_token(state, decision, cycle).await,
            HealingAction::SwitchRegion => self.switch_region(state, decision, cycle),
            HealingAction::RepairPayload => self.repair_payload(state, decision, cycle),
            HealingAction::RewriteRequest { body, headers } => {
                self.rewrite_request(state, decision, cycle, body.as_ref(), headers.as_ref())
            }
            HealingAction::AdaptSchema { hints } | HealingAction::InferSchema { hints } => {
                self.adapt_schema(state, decision, cycle, hints)
            }
            HealingAction::UseMock { reason } => {
                self.use_mock(state, decision, cycle, reason.as_deref()).await
            }
            HealingAction::QueueRecovery { delay_seconds } => {
                self.queue_recovery(state, decision, cycle, *delay_seconds).await
            }
            HealingAction::Abort => {
                state.cycles_used = state.max_cycles;
                Intervention {
                    cycle,
                    action: "abort".to_string(),
                    reason: decision.reason.clone(),
                    details: None,
                }
            }
        }
    }

    async fn refresh_token(
        &self,
        state: &mut HealingState,
        decision: &HealingDecision,
        cycle: u32,
    ) -> Intervention {
        let request = RefreshTokenRequest {
            previous_token: state.token.clone(),
            failure_status: state.last_error().and_then(|e| e.status),
            attempt: Some(state.cycles_used),
            requested_by: Some("supervisor".to_string()),
        };
        match self.backend.refresh_token(&request).await {
            Ok(token) => {
                state.token = Some(token);
                Intervention {
                    cycle,
                    action: "refresh_token".to_string(),
                    reason: decision.reason.clone(),
                    details: Some(json!({ "rotated": true })),
                }
            }
            Err(error) => {
                tracing::warn!(%error, "token refresh failed");
                Intervention {
                    cycle,
                    action: "refresh_token".to_string(),
                    reason: format!("Token refresh failed: {error}"),
                    details: None,
                }
            }
        }
    }

    fn switch_region(
        &self,
        state: &mut HealingState,
        decision: &HealingDecision,
        cycle: u32,
    ) -> Intervention {
        let endpoint = state.current_region_endpoint().to_string();
        let current_id = self
            .registry
            .find_by_endpoint(&endpoint)
            .map(|node| node.id.clone())
            .unwrap_or_else(|| self.registry.root().id.clone());

        match self
            .registry
            .resolve_next(&current_id, &state.region_health, &[])
        {
            Some(node) => {
                let next_endpoint = node.endpoint.clone();
                let index = state
                    .regions
                    .iter()
                    .position(|region| region == &next_endpoint)
                    .unwrap_or_else(|| {
                        state.regions.push(next_endpoint.clone());
                        state.regions.len() - 1
                    });
                state.region_index = index;
                tracing::info!(from = %current_id, to = %node.id, "switching region");
                Intervention {
                    cycle,
                    action: "switch_region".to_string(),
                    reason: decision.reason.clone(),
                    details: Some(json!({
                        "region": node.id,
                        "endpoint": next_endpoint,
                    })),
                }
            }
            None => Intervention {
                cycle,
                action: "switch_region".to_string(),
                reason: "No alternate region available".to_string(),
                details: None,
            },
        }
    }

    fn repair_payload(
        &self,
        state: &mut HealingState,
        decision: &HealingDecision,
        cycle: u32,
    ) -> Intervention {
        if let Err(denied) = self.ensure_repair_allowance(state, cycle) {
            return denied;
        }
        let repaired = self
            .repair_strategy
            .repair(state.request.body.as_ref(), self.clock.now_ms());
        state.request.body = Some(repaired);
        self.mark_repair(state);
        Intervention {
            cycle,
            action: "repair_payload".to_string(),
            reason: decision.reason.clone(),
            details: Some(json!({ "repair_attempts": state.repair_attempts })),
        }
    }

    fn rewrite_request(
        &self,
        state: &mut HealingState,
        decision: &HealingDecision,
        cycle: u32,
        body: Option<&Value>,
        headers: Option<&std::collections::HashMap<String, String>>,
    ) -> Intervention {
        let Some(body) = body else {
            return Intervention {
                cycle,
                action: "rewrite_request".to_string(),
                reason: "Rewrite requested without a replacement body; request unchanged"
                    .to_string(),
                details: None,
            };
        };
        if let Err(denied) = self.ensure_repair_allowance(state, cycle) {
            return denied;
        }
        state.request.body = Some(body.clone());
        if let Some(headers) = headers {
            for (name, value) in headers {
                state.request.headers.insert(name.clone(), value.clone());
            }
        }
        self.mark_repair(state);
        Intervention {
            cycle,
            action: "rewrite_request".to_string(),
            reason: decision.reason.clone(),
            details: Some(json!({ "repair_attempts": state.repair_attempts })),
        }
    }

    fn adapt_schema(
        &self,
        state: &mut HealingState,
        decision: &HealingDecision,
        cycle: u32,
        hints: &SchemaHints,
    ) -> Intervention {
        let mut merged = state.schema_hints.clone().unwrap_or_default();
        merged.merge(hints);
        if let Some(cached) = state.cached_response.take() {
            state.cached_response = Some(schema_adapter::apply(&merged, cached));
        }
        let details = serde_json::to_value(&merged).ok();
        state.schema_hints = Some(merged);
        Intervention {
            cycle,
            action: decision.action.name().to_string(),
            reason: decision.reason.clone(),
            details,
        }
    }

    async fn use_mock(
        &self,
        state: &mut HealingState,
        decision: &HealingDecision,
        cycle: u32,
        reason: Option<&str>,
    ) -> Intervention {
        let request = MockRequest {
            schema_hint: state
                .schema_hints
                .as_ref()
                .and_then(|hints| serde_json::to_value(hints).ok()),
            cached_payload: state.cached_response.clone(),
            provider: Some(self.provider_of(state.current_region_endpoint())),
            endpoint: Some(state.url.clone()),
            reason: reason
                .map(str::to_string)
                .or_else(|| Some(decision.reason.clone())),
            error: state.last_error().map(|error| error.message.clone()),
            metadata: Some(json!({
                "request_id": state.request_id,
                "correlation_id": state.correlation_id,
            })),
            ..MockRequest::default()
        };
        match self.backend.mock_response(&request).await {
            Ok(degraded) => {
                state.cached_response = degraded.data.clone();
                let details = json!({
                    "degradation": degraded.degradation,
                    "source": degraded.source,
                });
                state.degraded = degraded;
                Intervention {
                    cycle,
                    action: "use_mock".to_string(),
                    reason: decision.reason.clone(),
                    details: Some(details),
                }
            }
            Err(error) => {
                tracing::warn!(%error, "mock collaborator failed");
                Intervention {
                    cycle,
                    action: "use_mock".to_string(),
                    reason: format!("Mock collaborator failed: {error}"),
                    details: None,
                }
            }
        }
    }

    async fn queue_recovery(
        &self,
        state: &mut HealingState,
        decision: &HealingDecision,
        cycle: u32,
        delay_seconds: Option<u64>,
    ) -> Intervention {
        let endpoint = state.current_region_endpoint().to_string();
        let (region, provider) = match self.registry.find_by_endpoint(&endpoint) {
            Some(node) => (node.id.clone(), node.provider.clone()),
            None => (endpoint.clone(), "battle-healer".to_string()),
        };
        let envelope = QueueEnvelope {
            request_id: state.request_id.clone(),
            correlation_id: state.correlation_id.clone(),
            endpoint: state.url.clone(),
            provider: Some(provider),
            region: Some(region),
            method: state.request.method.clone(),
            url: state.url.clone(),
            headers: state.request.sanitized_headers(),
            body: state.request.body.clone(),
            error_type: Some("healing.recovery".to_string()),
            error_message: state.last_error().map(|error| error.message.clone()),
            error_status: state.last_error().and_then(|error| error.status),
            timestamp: Utc::now(),
            retry_count: state.cycles_used,
        };
        match self.backend.queue_failed(&envelope).await {
            Ok(_) => {
                state.queued = true;
                Intervention {
                    cycle,
                    action: "queue_recovery".to_string(),
                    reason: decision.reason.clone(),
                    details: delay_seconds.map(|delay| json!({ "delay_seconds": delay })),
                }
            }
            Err(error) => {
                tracing::warn!(%error, "recovery queue rejected the request");
                Intervention {
                    cycle,
                    action: "queue_recovery".to_string(),
                    reason: format!("Recovery queue failed: {error}"),
                    details: None,
                }
            }
        }
    }

    /// Fails when the per-invocation or per-endpoint repair budget is spent.
    ///
    /// A denied repair forces the loop to its terminal state.
    fn ensure_repair_allowance(
        &self,
        state: &mut HealingState,
        cycle: u32,
    ) -> Result<(), Intervention> {
        if state.repair_attempts >= MAX_REPAIR_ATTEMPTS {
            state.cycles_used = state.max_cycles;
            return Err(Intervention {
                cycle,
                action: "abort".to_string(),
                reason: format!(
                    "Repair limit reached ({MAX_REPAIR_ATTEMPTS} attempts); aborting"
                ),
                details: None,
            });
        }
        let key = origin_and_path(&state.url);
        if !self
            .repair_window
            .consume(&key, REPAIR_WINDOW_LIMIT, REPAIR_WINDOW_MS)
        {
            state.cycles_used = state.max_cycles;
            return Err(Intervention {
                cycle,
                action: "abort".to_string(),
                reason: format!(
                    "Endpoint repair window exhausted for {key}; aborting"
                ),
                details: None,
            });
        }
        Ok(())
    }

    fn mark_repair(&self, state: &mut HealingState) {
        state.repair_attempts += 1;
        state.request.headers.insert(
            REPAIR_ATTEMPT_HEADER.to_string(),
            state.repair_attempts.to_string(),
        );
    }

    fn provider_of(&self, endpoint: &str) -> String {
        self.registry
            .find_by_endpoint(endpoint)
            .map(|node| node.provider.clone())
            .unwrap_or_else(|| "battle-healer".to_string())
    }
}

/// The url without query or fragment, the repair-window key.
fn origin_and_path(url: &str) -> String {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    url[..end].to_string()
}
