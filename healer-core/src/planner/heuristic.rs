//! Status-code driven fallback planner.

use async_trait::async_trait;
use serde_json::Value;

use crate::schema_adapter::SchemaHints;
use crate::state::{HealingState, Observation};

use super::{HealingAction, HealingDecision, Planner, extract_headers, extract_rewrite_body};

/// Deterministic baseline planner.
///
/// Schema-drift hints win over everything; otherwise the decision is a
/// straight dispatch on the failure status.
pub struct HeuristicPlanner {
    rewrite_enabled: bool,
}

impl HeuristicPlanner {
    pub fn new() -> Self {
        Self {
            rewrite_enabled: true,
        }
    }

    /// Routes 422 to `repair_payload` instead of `rewrite_request`.
    pub fn without_rewrite(mut self) -> Self {
        self.rewrite_enabled = false;
        self
    }
}

impl Default for HeuristicPlanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Planner for HeuristicPlanner {
    async fn plan(&self, _state: &HealingState, observation: &Observation) -> HealingDecision {
        if let Some(hints) = schema_drift_hints(observation) {
            return HealingDecision::new(
                HealingAction::AdaptSchema { hints },
                "upstream response shape drifted; applying schema hints",
            );
        }

        match observation.error.status {
            Some(401) => HealingDecision::new(
                HealingAction::RefreshToken,
                "credential rejected; requesting a fresh token",
            ),
            Some(503) => plan_for_unavailable(observation),
            Some(422) => {
                if self.rewrite_enabled {
                    let hints = observation.trigger_hints.as_ref();
                    HealingDecision::new(
                        HealingAction::RewriteRequest {
                            body: hints.and_then(extract_rewrite_body),
                            headers: hints.and_then(extract_headers),
                        },
                        "payload rejected; rewriting request",
                    )
                } else {
                    HealingDecision::new(
                        HealingAction::RepairPayload,
                        "payload rejected; applying repair defaults",
                    )
                }
            }
            Some(429) => plan_for_rate_limit(observation),
            Some(402) => HealingDecision::new(
                HealingAction::UseMock { reason: None },
                "payment required upstream; degrading to mock",
            ),
            _ => HealingDecision::new(HealingAction::Retry, "transient failure; retrying"),
        }
    }
}

fn plan_for_unavailable(observation: &Observation) -> HealingDecision {
    match detail_i64(observation, "retry_budget_remaining") {
        Some(remaining) if remaining <= 0 => HealingDecision::new(
            HealingAction::QueueRecovery {
                delay_seconds: Some(30),
            },
            "region down and retry budget spent; queueing recovery",
        ),
        Some(1) => HealingDecision::new(
            HealingAction::UseMock { reason: None },
            "region down with one retry left; degrading to mock",
        ),
        _ => HealingDecision::new(
            HealingAction::SwitchRegion,
            "region unavailable; failing over",
        ),
    }
}

fn plan_for_rate_limit(observation: &Observation) -> HealingDecision {
    let message = error_message_text(observation).to_lowercase();
    let quota_shaped = ["quota", "rate", "limit"]
        .iter()
        .any(|marker| message.contains(marker));
    if quota_shaped {
        HealingDecision::new(
            HealingAction::UseMock { reason: None },
            "quota exhausted; degrading to mock",
        )
    } else {
        HealingDecision::new(
            HealingAction::QueueRecovery {
                delay_seconds: Some(15),
            },
            "throttled; queueing recovery",
        )
    }
}

/// Schema hints from the error body or trigger hints, when present.
fn schema_drift_hints(observation: &Observation) -> Option<SchemaHints> {
    let from_body = observation
        .error
        .body
        .as_ref()
        .and_then(|body| body.get("detail"))
        .and_then(|detail| detail.get("schema_hint"))
        .and_then(SchemaHints::from_hint_value);
    if from_body.is_some() {
        return from_body;
    }
    observation
        .trigger_hints
        .as_ref()
        .and_then(|hints| hints.get("schema_hint"))
        .and_then(SchemaHints::from_hint_value)
}

fn detail_i64(observation: &Observation, key: &str) -> Option<i64> {
    observation
        .error
        .body
        .as_ref()?
        .get("detail")?
        .get(key)?
        .as_i64()
}

/// Every human-readable message the error body carries, concatenated.
fn error_message_text(observation: &Observation) -> String {
    let mut parts = vec![observation.error.message.clone()];
    if let Some(body) = &observation.error.body {
        for path in [
            &["detail", "error"][..],
            &["detail", "message"][..],
            &["error"][..],
            &["message"][..],
        ] {
            let mut cursor: &Value = body;
            let mut found = true;
            for segment in path {
                match cursor.get(segment) {
                    Some(next) => cursor = next,
                    None => {
                        found = false;
                        break;
                    }
                }
            }
            if found {
                if let Some(text) = cursor.as_str() {
                    parts.push(text.to_string());
                }
            }
        }
        if let Some(text) = body.as_str() {
            parts.push(text.to_string());
        }
    }
    parts.join(" ")
}
