//! Healing planners: observation in, decision out.
//!
//! A planner is a pure capability over `(state, last observation)`. Two
//! implementations ship: the mandatory [`HeuristicPlanner`] baseline and the
//! optional [`LlmPlanner`] that consults a model and falls back to the
//! heuristic on any failure.

mod heuristic;
mod llm;

pub use heuristic::HeuristicPlanner;
pub use llm::{LlmPlanner, LlmPlannerConfig};

use std::collections::HashMap;

use async_trait::async_trait;
use jsonschema::{Draft, JSONSchema};
use serde_json::{Value, json};

use crate::schema_adapter::SchemaHints;
use crate::state::{HealingState, Observation};

/// Chooses the next healing action for a failed cycle.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, state: &HealingState, observation: &Observation) -> HealingDecision;
}

/// A categorical healing intervention with its action-specific payload.
#[derive(Debug, Clone, PartialEq)]
pub enum HealingAction {
    Retry,
    RefreshToken,
    SwitchRegion,
    RepairPayload,
    RewriteRequest {
        body: Option<Value>,
        headers: Option<HashMap<String, String>>,
    },
    AdaptSchema {
        hints: SchemaHints,
    },
    /// Alias of [`HealingAction::AdaptSchema`] at the toolkit.
    InferSchema {
        hints: SchemaHints,
    },
    UseMock {
        reason: Option<String>,
    },
    QueueRecovery {
        delay_seconds: Option<u64>,
    },
    Abort,
}

impl HealingAction {
    pub fn name(&self) -> &'static str {
        match self {
            HealingAction::Retry => "retry",
            HealingAction::RefreshToken => "refresh_token",
            HealingAction::SwitchRegion => "switch_region",
            HealingAction::RepairPayload => "repair_payload",
            HealingAction::RewriteRequest { .. } => "rewrite_request",
            HealingAction::AdaptSchema { .. } => "adapt_schema",
            HealingAction::InferSchema { .. } => "infer_schema",
            HealingAction::UseMock { .. } => "use_mock",
            HealingAction::QueueRecovery { .. } => "queue_recovery",
            HealingAction::Abort => "abort",
        }
    }

    /// Action payload for telemetry, `None` when the action carries none.
    pub fn params(&self) -> Option<Value> {
        match self {
            HealingAction::RewriteRequest { body, headers } => Some(json!({
                "body": body,
                "headers": headers,
            })),
            HealingAction::AdaptSchema { hints } | HealingAction::InferSchema { hints } => {
                serde_json::to_value(hints).ok()
            }
            HealingAction::UseMock { reason } => reason
                .as_ref()
                .map(|reason| json!({ "reason": reason })),
            HealingAction::QueueRecovery { delay_seconds } => delay_seconds
                .map(|delay| json!({ "delay_seconds": delay })),
            _ => None,
        }
    }
}

/// Planner verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct HealingDecision {
    pub action: HealingAction,
    pub reason: String,
}

impl HealingDecision {
    pub fn new(action: HealingAction, reason: impl Into<String>) -> Self {
        Self {
            action,
            reason: reason.into(),
        }
    }

    /// Decodes a loose `{action, reason, params?}` envelope.
    ///
    /// Unknown or malformed actions coerce to `retry`; payload fields accept
    /// the aliases the wild emits (`body|newBody|payload|rewrittenBody`,
    /// `field_map|fieldMap|mapping|...`).
    pub fn from_json(value: &Value) -> HealingDecision {
        let action_name = value.get("action").and_then(Value::as_str).unwrap_or("");
        let reason = value
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("planner supplied no reason")
            .to_string();
        let params = value.get("params");

        let action = match action_name {
            "retry" => HealingAction::Retry,
            "refresh_token" => HealingAction::RefreshToken,
            "switch_region" => HealingAction::SwitchRegion,
            "repair_payload" => HealingAction::RepairPayload,
            "rewrite_request" => HealingAction::RewriteRequest {
                body: params.and_then(extract_rewrite_body),
                headers: params.and_then(extract_headers),
            },
            "adapt_schema" => HealingAction::AdaptSchema {
                hints: params.and_then(extract_hints).unwrap_or_default(),
            },
            "infer_schema" => HealingAction::InferSchema {
                hints: params.and_then(extract_hints).unwrap_or_default(),
            },
            "use_mock" => HealingAction::UseMock {
                reason: params
                    .and_then(|p| p.get("reason"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            "queue_recovery" => HealingAction::QueueRecovery {
                delay_seconds: params.and_then(extract_delay_seconds),
            },
            "abort" => HealingAction::Abort,
            other => {
                tracing::debug!(action = other, "unknown planner action, coercing to retry");
                return HealingDecision::new(
                    HealingAction::Retry,
                    format!("coerced unknown action '{other}' to retry"),
                );
            }
        };
        HealingDecision { action, reason }
    }
}

/// Body candidate under any of the accepted keys.
pub(crate) fn extract_rewrite_body(params: &Value) -> Option<Value> {
    for key in ["body", "newBody", "payload", "rewrittenBody"] {
        if let Some(body) = params.get(key) {
            if !body.is_null() {
                return Some(body.clone());
            }
        }
    }
    None
}

pub(crate) fn extract_headers(params: &Value) -> Option<HashMap<String, String>> {
    let headers = params.get("headers")?.as_object()?;
    let map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
        .collect();
    (!map.is_empty()).then_some(map)
}

fn extract_hints(params: &Value) -> Option<SchemaHints> {
    SchemaHints::from_hint_value(params)
        .or_else(|| params.get("schema_hint").and_then(SchemaHints::from_hint_value))
}

fn extract_delay_seconds(params: &Value) -> Option<u64> {
    for key in ["delay_seconds", "delaySeconds", "delay"] {
        if let Some(delay) = params.get(key).and_then(Value::as_u64) {
            return Some(delay);
        }
    }
    None
}

/// Draft-7 validator for the planner's decision envelope.
///
/// Only the envelope shape is schema-checked; unknown action names pass and
/// are coerced to `retry` by the typed decode.
pub struct DecisionValidator {
    #[allow(dead_code)]
    schema: Value,
    compiled: JSONSchema,
}

impl DecisionValidator {
    pub fn new() -> Self {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "title": "Healing decision envelope",
            "type": "object",
            "properties": {
                "action": { "type": "string", "minLength": 1 },
                "reason": { "type": "string" },
                "params": { "type": "object" }
            },
            "required": ["action", "reason"],
            "additionalProperties": true
        });
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema)
            .expect("decision schema compiles");
        Self { schema, compiled }
    }

    pub fn validate(&self, value: &Value) -> bool {
        match self.compiled.validate(value) {
            Ok(()) => true,
            Err(errors) => {
                for error in errors {
                    tracing::debug!(%error, "decision envelope rejected");
                }
                false
            }
        }
    }
}

impl Default for DecisionValidator {
    fn default() -> Self {
        Self::new()
    }
}
