//! Model-backed planner with silent heuristic fallback.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::default_client;
use crate::state::{HealingState, Observation, sanitize_headers};

use super::{DecisionValidator, HealingDecision, HeuristicPlanner, Planner};

const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Maximum request-body preview forwarded to the model.
const BODY_PREVIEW_BYTES: usize = 400;

const SYSTEM_PROMPT: &str = "You are the planning layer of a self-healing \
HTTP client. Given the current healing state and the latest failed attempt, \
pick exactly one action from the toolkit:\n\
retry, refresh_token, switch_region, repair_payload, rewrite_request, \
adapt_schema, infer_schema, use_mock, queue_recovery, abort.\n\
Respond with strict JSON only, no prose, shaped as \
{\"action\": string, \"reason\": string, \"params\": object?}.";

/// Configuration for the model-backed planner.
#[derive(Debug, Clone)]
pub struct LlmPlannerConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
}

impl LlmPlannerConfig {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: api_key.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 512,
        }
    }
}

/// Planner that consults a model and validates its JSON verdict.
///
/// Every transport, parse, or validation failure falls back silently to the
/// heuristic baseline; an unknown action in valid JSON coerces to `retry`.
pub struct LlmPlanner {
    client: reqwest::Client,
    config: LlmPlannerConfig,
    validator: DecisionValidator,
    fallback: HeuristicPlanner,
}

impl LlmPlanner {
    pub fn new(config: LlmPlannerConfig) -> Self {
        Self {
            client: default_client::client().clone(),
            config,
            validator: DecisionValidator::new(),
            fallback: HeuristicPlanner::new(),
        }
    }

    pub fn with_client(config: LlmPlannerConfig, client: reqwest::Client) -> Self {
        Self {
            client,
            config,
            validator: DecisionValidator::new(),
            fallback: HeuristicPlanner::new(),
        }
    }

    async fn consult(&self, state: &HealingState, observation: &Observation) -> Option<Value> {
        let prompt = build_prompt(state, observation);
        let body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "system": SYSTEM_PROMPT,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .client
            .post(&self.config.api_url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|error| tracing::warn!(%error, "planner model unreachable"))
            .ok()?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "planner model refused request");
            return None;
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|error| tracing::warn!(%error, "planner model response unreadable"))
            .ok()?;
        let text = payload
            .get("content")
            .and_then(Value::as_array)
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find_map(|block| block.get("text").and_then(Value::as_str))
            })?;
        parse_decision_text(text)
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, state: &HealingState, observation: &Observation) -> HealingDecision {
        if let Some(envelope) = self.consult(state, observation).await {
            if self.validator.validate(&envelope) {
                return HealingDecision::from_json(&envelope);
            }
            tracing::warn!("planner model emitted an invalid decision envelope");
        }
        self.fallback.plan(state, observation).await
    }
}

/// Strict-JSON parse of the model's reply, tolerating code fences.
fn parse_decision_text(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed).trim();
    serde_json::from_str(trimmed)
        .map_err(|error| tracing::warn!(%error, "planner model reply is not strict JSON"))
        .ok()
}

/// Prompt describing the state and the latest observation, secrets redacted.
fn build_prompt(state: &HealingState, observation: &Observation) -> String {
    let state_summary = json!({
        "request_id": state.request_id,
        "correlation_id": state.correlation_id,
        "url": state.url,
        "has_token": state.token.is_some(),
        "regions": state.regions,
        "region_index": state.region_index,
        "region_history": state.region_history,
        "region_health": state.region_health,
        "repair_attempts": state.repair_attempts,
        "schema_hints": state.schema_hints,
        "cycles_used": state.cycles_used,
        "max_cycles": state.max_cycles,
        "queued": state.queued,
    });
    let request_summary = json!({
        "method": state.request.method,
        "headers": sanitize_headers(&state.request.headers),
        "body_preview": body_preview(state.request.body.as_ref()),
    });
    let observation_summary = json!({
        "cycle": observation.cycle,
        "status": observation.error.status,
        "message": observation.error.message,
        "body": observation.error.body,
        "fix_actions": observation.meta.fix_actions,
    });
    format!(
        "Healing state:\n{state}\n\nPending request:\n{request}\n\nLatest failure:\n{observation}\n\nChoose the next action.",
        state = state_summary,
        request = request_summary,
        observation = observation_summary,
    )
}

fn body_preview(body: Option<&Value>) -> Option<String> {
    let rendered = serde_json::to_string(body?).ok()?;
    let mut preview: String = rendered.chars().take(BODY_PREVIEW_BYTES).collect();
    if rendered.len() > preview.len() {
        preview.push_str("…");
    }
    Some(preview)
}
