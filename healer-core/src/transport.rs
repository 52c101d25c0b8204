//! Region-rotating attempt loop with retries, backoff, and token recovery.
//!
//! One [`Transport::execute`] call drives a single logical request: it
//! rotates the target region per attempt, retries transient failures under
//! an optional windowed budget, performs at most one in-call token
//! recovery, and records an [`AttemptLog`] per HTTP exchange. It never
//! panics or errors past its boundary; the outcome is always a structured
//! [`TransportResult`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{RecoveryContext, TokenRecovery};
use crate::budget::{DEFAULT_BUDGET_WINDOW_MS, RetryBudgetStore};
use crate::default_client;
use crate::state::{
    AttemptLog, CORRELATION_HEADER, ErrorInfo, FixAction, HttpRequestSpec, REGION_HEADER,
    TransportMeta, TransportResult,
};

/// Windowed retry budget attached to a transport call.
#[derive(Debug, Clone)]
pub struct RetryBudgetSpec {
    pub key: String,
    pub limit: u32,
    pub window_ms: Option<u64>,
}

/// Tuning for one transport call.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_retries: u32,
    /// Region base URLs rotated per attempt; an empty string means "send
    /// the url as given".
    pub regions: Vec<String>,
    /// Statuses retried besides 5xx.
    pub retry_status_codes: HashSet<u16>,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub jitter_ratio: f64,
    pub retry_budget: Option<RetryBudgetSpec>,
    pub correlation_id: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            regions: vec![String::new()],
            retry_status_codes: HashSet::from([429]),
            backoff_base_ms: 300,
            backoff_max_ms: 3_000,
            jitter_ratio: 0.25,
            retry_budget: None,
            correlation_id: None,
        }
    }
}

impl TransportConfig {
    fn is_retryable(&self, status: u16) -> bool {
        (500..600).contains(&status) || self.retry_status_codes.contains(&status)
    }
}

/// The low-level transport.
pub struct Transport {
    client: reqwest::Client,
    budget_store: Arc<RetryBudgetStore>,
    cancel: CancellationToken,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        Self {
            client: default_client::client().clone(),
            budget_store: RetryBudgetStore::global(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_parts(
        client: reqwest::Client,
        budget_store: Arc<RetryBudgetStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            budget_store,
            cancel,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Rebinds the transport to a caller-owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs the attempt loop for one logical request.
    pub async fn execute(
        &self,
        url: &str,
        request: &HttpRequestSpec,
        config: &TransportConfig,
        recovery: Option<&dyn TokenRecovery>,
    ) -> TransportResult {
        let regions = if config.regions.is_empty() {
            vec![String::new()]
        } else {
            config.regions.clone()
        };
        let correlation_id = config
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut meta = TransportMeta {
            correlation_id: correlation_id.clone(),
            ..TransportMeta::default()
        };
        let mut headers = request.headers.clone();
        let mut recovery_used = false;
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Self::finish_error(
                    meta,
                    ErrorInfo::network("Request cancelled before send"),
                );
            }

            let region = regions[attempt as usize % regions.len()].clone();
            let region_tag = region_label(&region);
            let target = join_url(&region, url);
            meta.region = region_tag.clone();
            if !meta.regions_tried.contains(&region_tag) {
                meta.regions_tried.push(region_tag.clone());
            }

            let mut log = AttemptLog {
                attempt_number: attempt,
                region_id: region_tag.clone(),
                url: target.clone(),
                status: None,
                error_message: None,
                fix_actions: Vec::new(),
                correlation_id: correlation_id.clone(),
            };

            let send_result = self
                .send_once(&target, request, &headers, &region_tag, &correlation_id)
                .await;

            match send_result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    log.status = Some(status);

                    if response.status().is_success() {
                        let data = parse_success_body(response).await;
                        tracing::debug!(
                            %correlation_id,
                            attempt,
                            region = %region_tag,
                            status,
                            "attempt succeeded"
                        );
                        meta.attempts.push(log);
                        meta.retries = meta.attempts.len().saturating_sub(1) as u32;
                        return TransportResult {
                            data,
                            meta,
                            error: None,
                        };
                    }

                    // One-shot token recovery for auth-shaped failures.
                    if let Some(handler) = recovery.filter(|_| {
                        !recovery_used && matches!(status, 401 | 403 | 429)
                    }) {
                        recovery_used = true;
                        let ctx = RecoveryContext {
                            status,
                            attempt,
                            region: region_tag.clone(),
                            previous_token: bearer_token(&headers),
                        };
                        match handler.recover(&ctx).await {
                            Ok(Some(token)) if !token.is_empty() => {
                                let fix = if status == 403 {
                                    FixAction::RotateToken
                                } else {
                                    FixAction::RefreshToken
                                };
                                headers
                                    .retain(|name, _| !name.eq_ignore_ascii_case("authorization"));
                                headers.insert(
                                    "Authorization".to_string(),
                                    bearer_value(&token),
                                );
                                push_unique(&mut meta.fix_actions, fix.clone());
                                log.fix_actions.push(fix);
                                log.error_message =
                                    Some(format!("token recovery after status {status}"));
                                tracing::info!(
                                    %correlation_id,
                                    attempt,
                                    status,
                                    "token recovered, re-sending"
                                );
                                meta.attempts.push(log);
                                attempt += 1;
                                continue;
                            }
                            Ok(_) => {
                                log.error_message =
                                    Some("token recovery returned no token".to_string());
                                meta.attempts.push(log);
                                return Self::finish_error(
                                    meta,
                                    ErrorInfo {
                                        status: Some(status),
                                        message: format!(
                                            "Token recovery returned no token after status {status}"
                                        ),
                                        body: None,
                                    },
                                );
                            }
                            Err(error) => {
                                log.error_message = Some(error.to_string());
                                meta.attempts.push(log);
                                return Self::finish_error(
                                    meta,
                                    ErrorInfo {
                                        status: Some(status),
                                        message: format!("Token recovery failed: {error}"),
                                        body: None,
                                    },
                                );
                            }
                        }
                    }

                    let retryable = config.is_retryable(status);
                    if retryable {
                        let fix = FixAction::RetryStatus(status);
                        push_unique(&mut meta.fix_actions, fix.clone());
                        log.fix_actions.push(fix);
                        if matches!(status, 503 | 410) && regions.len() > 1 {
                            let next = region_label(
                                &regions[(attempt as usize + 1) % regions.len()],
                            );
                            let fix = FixAction::FallbackRegion(next);
                            push_unique(&mut meta.fix_actions, fix.clone());
                            log.fix_actions.push(fix);
                        }
                    }

                    if retryable && attempt < config.max_retries {
                        if let Some(denied) =
                            self.consume_budget(config, status, &mut meta, &mut log)
                        {
                            return denied;
                        }
                        let delay = retry_after_ms(response.headers(), config.backoff_max_ms)
                            .unwrap_or_else(|| backoff_delay_ms(attempt, config));
                        log.error_message = Some(format!("status {status}, retrying"));
                        meta.attempts.push(log);
                        tracing::debug!(
                            %correlation_id,
                            attempt,
                            status,
                            delay_ms = delay,
                            "retrying after backoff"
                        );
                        if self.sleep_or_cancel(delay).await {
                            return Self::finish_error(
                                meta,
                                ErrorInfo::network("Request cancelled during backoff"),
                            );
                        }
                        attempt += 1;
                        continue;
                    }

                    // Non-retryable failure or retries exhausted.
                    let body = parse_error_body(response).await;
                    let message = format!("Request failed with status {status}");
                    log.error_message = Some(message.clone());
                    meta.attempts.push(log);
                    return Self::finish_error(
                        meta,
                        ErrorInfo {
                            status: Some(status),
                            message,
                            body,
                        },
                    );
                }
                Err(error) => {
                    let fix = FixAction::NetworkError;
                    push_unique(&mut meta.fix_actions, fix.clone());
                    log.fix_actions.push(fix);
                    log.error_message = Some(error.to_string());

                    if attempt < config.max_retries {
                        if let Some(denied) = self.consume_budget(config, 0, &mut meta, &mut log)
                        {
                            return denied;
                        }
                        let delay = backoff_delay_ms(attempt, config);
                        meta.attempts.push(log);
                        tracing::debug!(
                            %correlation_id,
                            attempt,
                            %error,
                            delay_ms = delay,
                            "network error, retrying"
                        );
                        if self.sleep_or_cancel(delay).await {
                            return Self::finish_error(
                                meta,
                                ErrorInfo::network("Request cancelled during backoff"),
                            );
                        }
                        attempt += 1;
                        continue;
                    }

                    meta.attempts.push(log);
                    return Self::finish_error(meta, ErrorInfo::network(error.to_string()));
                }
            }
        }
    }

    async fn send_once(
        &self,
        target: &str,
        request: &HttpRequestSpec,
        headers: &std::collections::HashMap<String, String>,
        region_label: &str,
        correlation_id: &str,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .unwrap_or(reqwest::Method::GET);
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let parsed = HeaderName::from_bytes(name.as_bytes())
                .ok()
                .zip(HeaderValue::from_str(value).ok());
            match parsed {
                Some((name, value)) => {
                    header_map.insert(name, value);
                }
                None => tracing::warn!(header = %name, "skipping malformed header"),
            }
        }
        if let Ok(value) = HeaderValue::from_str(region_label) {
            header_map.insert(REGION_HEADER, value);
        }
        if let Ok(value) = HeaderValue::from_str(correlation_id) {
            header_map.insert(CORRELATION_HEADER, value);
        }

        let mut builder = self.client.request(method, target).headers(header_map);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder.send().await
    }

    /// Charges the retry budget, returning the terminal result on denial.
    fn consume_budget(
        &self,
        config: &TransportConfig,
        status: u16,
        meta: &mut TransportMeta,
        log: &mut AttemptLog,
    ) -> Option<TransportResult> {
        let budget = config.retry_budget.as_ref()?;
        let window = budget.window_ms.unwrap_or(DEFAULT_BUDGET_WINDOW_MS);
        if self.budget_store.consume(&budget.key, budget.limit, window) {
            return None;
        }
        let fix = FixAction::RetryBudgetExhausted;
        push_unique(&mut meta.fix_actions, fix.clone());
        log.fix_actions.push(fix);
        let message = format!("Retry budget exhausted for key {}", budget.key);
        log.error_message = Some(message.clone());
        meta.attempts.push(log.clone());
        let status = (status != 0).then_some(status);
        Some(Self::finish_error(
            std::mem::take(meta),
            ErrorInfo {
                status,
                message,
                body: None,
            },
        ))
    }

    /// True when cancelled before the delay elapsed.
    async fn sleep_or_cancel(&self, delay_ms: u64) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => false,
            _ = self.cancel.cancelled() => true,
        }
    }

    fn finish_error(mut meta: TransportMeta, error: ErrorInfo) -> TransportResult {
        meta.retries = meta.attempts.len().saturating_sub(1) as u32;
        TransportResult {
            data: None,
            meta,
            error: Some(error),
        }
    }
}

fn push_unique(actions: &mut Vec<FixAction>, action: FixAction) {
    if !actions.contains(&action) {
        actions.push(action);
    }
}

fn region_label(region: &str) -> String {
    if region.is_empty() {
        "default".to_string()
    } else {
        region.to_string()
    }
}

fn bearer_token(headers: &std::collections::HashMap<String, String>) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("authorization"))
        .map(|(_, v)| v.strip_prefix("Bearer ").unwrap_or(v).to_string())
}

fn bearer_value(token: &str) -> String {
    if token.starts_with("Bearer ") {
        token.to_string()
    } else {
        format!("Bearer {token}")
    }
}

/// Joins a region base and a path, passing absolute urls through.
fn join_url(region: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    if region.is_empty() {
        return url.to_string();
    }
    format!(
        "{}/{}",
        region.trim_end_matches('/'),
        url.trim_start_matches('/')
    )
}

/// Exponential backoff with additive jitter.
fn backoff_delay_ms(attempt: u32, config: &TransportConfig) -> u64 {
    let exponential = (config.backoff_base_ms.saturating_mul(1u64 << attempt.min(32)))
        .min(config.backoff_max_ms);
    let jitter_cap = (config.jitter_ratio.max(0.0) * exponential as f64) as u64;
    let jitter = if jitter_cap == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_cap)
    };
    exponential + jitter
}

/// `Retry-After` as milliseconds, accepting seconds or an HTTP-date.
fn retry_after_ms(headers: &HeaderMap, max_ms: u64) -> Option<u64> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = raw.parse::<i64>() {
        return Some((seconds.max(0) as u64 * 1_000).min(max_ms));
    }
    let date: DateTime<Utc> = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let delta_ms = (date - Utc::now()).num_milliseconds().max(0) as u64;
    Some(delta_ms.min(max_ms))
}

async fn parse_success_body(response: reqwest::Response) -> Option<Value> {
    if response.status().as_u16() == 204 {
        return None;
    }
    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("application/json"))
        .unwrap_or(false);
    let text = response.text().await.unwrap_or_default();
    if text.is_empty() {
        return None;
    }
    if is_json {
        match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(_) => Some(Value::String(text)),
        }
    } else {
        Some(Value::String(text))
    }
}

/// Best-effort body parse for terminal errors; decode failures become the
/// raw text, an empty body becomes `None`.
async fn parse_error_body(response: reqwest::Response) -> Option<Value> {
    let text = response.text().await.unwrap_or_default();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(_) => Some(Value::String(text)),
    }
}
