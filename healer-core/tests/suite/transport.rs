//! Transport attempt-loop behavior against a mock upstream.

use std::collections::HashSet;
use std::sync::Arc;

use healer_core::budget::RetryBudgetStore;
use healer_core::clock::SystemClock;
use healer_core::state::{FixAction, HttpRequestSpec};
use healer_core::transport::{RetryBudgetSpec, Transport, TransportConfig};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::StaticTokenRecovery;

fn transport() -> Transport {
    Transport::with_parts(
        reqwest::Client::new(),
        Arc::new(RetryBudgetStore::new(Arc::new(SystemClock))),
        CancellationToken::new(),
    )
}

fn fast_config(regions: Vec<String>, max_retries: u32) -> TransportConfig {
    TransportConfig {
        max_retries,
        regions,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        jitter_ratio: 0.0,
        ..TransportConfig::default()
    }
}

#[tokio::test]
async fn success_parses_json_and_tags_attempt_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/external-api"))
        .and(header("X-BattleHealer-Region", "default"))
        .and(header_exists("X-Correlation-Id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"amount": 10})))
        .expect(1)
        .mount(&server)
        .await;

    let config = fast_config(vec![String::new()], 2);
    let result = transport()
        .execute(
            &format!("{}/external-api", server.uri()),
            &HttpRequestSpec::new("GET"),
            &config,
            None,
        )
        .await;

    assert!(result.is_success());
    assert_eq!(result.data, Some(json!({"amount": 10})));
    assert_eq!(result.meta.retries, 0);
    assert_eq!(result.meta.attempts.len(), 1);
    assert_eq!(result.meta.attempts[0].status, Some(200));
    assert!(result.meta.fix_actions.is_empty());
}

#[tokio::test]
async fn retries_5xx_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let config = fast_config(vec![String::new()], 2);
    let result = transport()
        .execute(
            &format!("{}/flaky", server.uri()),
            &HttpRequestSpec::new("GET"),
            &config,
            None,
        )
        .await;

    assert!(result.is_success());
    assert_eq!(result.meta.retries, 1);
    assert_eq!(result.meta.attempts.len(), 2);
    assert!(result.meta.fix_actions.contains(&FixAction::RetryStatus(500)));
}

#[tokio::test]
async fn rotates_regions_and_records_fallback() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/regions/us/external-api"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "Region down"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/regions/eu/external-api"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"region": "eu"})))
        .mount(&server)
        .await;

    let us = format!("{}/regions/us", server.uri());
    let eu = format!("{}/regions/eu", server.uri());
    let config = fast_config(vec![us.clone(), eu.clone()], 2);
    let result = transport()
        .execute("/external-api", &HttpRequestSpec::new("GET"), &config, None)
        .await;

    assert!(result.is_success());
    assert_eq!(result.meta.regions_tried, vec![us, eu.clone()]);
    assert_eq!(result.meta.region, eu.clone());
    assert!(result.meta.fix_actions.contains(&FixAction::RetryStatus(503)));
    assert!(result
        .meta
        .fix_actions
        .contains(&FixAction::FallbackRegion(eu)));
}

#[tokio::test]
async fn recovers_token_once_on_401() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/secure"))
        .and(header("Authorization", "Bearer tok-A"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "Invalid token"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/secure"))
        .and(header("Authorization", "Bearer tok-B"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let mut request = HttpRequestSpec::new("GET");
    request
        .headers
        .insert("Authorization".to_string(), "Bearer tok-A".to_string());
    let recovery = StaticTokenRecovery(Some("tok-B".to_string()));
    // max_retries 0: the recovery attempt must not count against retries.
    let config = fast_config(vec![String::new()], 0);
    let result = transport()
        .execute(
            &format!("{}/secure", server.uri()),
            &request,
            &config,
            Some(&recovery),
        )
        .await;

    assert!(result.is_success());
    assert_eq!(result.meta.attempts.len(), 2);
    assert!(result.meta.fix_actions.contains(&FixAction::RefreshToken));
}

#[tokio::test]
async fn recovery_on_403_records_rotate_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/blocked"))
        .and(header("Authorization", "Bearer bad"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({"error": "blocked"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/blocked"))
        .and(header("Authorization", "Bearer good"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let mut request = HttpRequestSpec::new("GET");
    request
        .headers
        .insert("Authorization".to_string(), "Bearer bad".to_string());
    let recovery = StaticTokenRecovery(Some("good".to_string()));
    let config = fast_config(vec![String::new()], 0);
    let result = transport()
        .execute(
            &format!("{}/blocked", server.uri()),
            &request,
            &config,
            Some(&recovery),
        )
        .await;

    assert!(result.is_success());
    assert!(result.meta.fix_actions.contains(&FixAction::RotateToken));
}

#[tokio::test]
async fn empty_recovery_result_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/secure"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let recovery = StaticTokenRecovery(None);
    let config = fast_config(vec![String::new()], 2);
    let result = transport()
        .execute(
            &format!("{}/secure", server.uri()),
            &HttpRequestSpec::new("GET"),
            &config,
            Some(&recovery),
        )
        .await;

    let error = result.error.expect("terminal error");
    assert_eq!(error.status, Some(401));
    assert!(error.message.contains("no token"));
    assert_eq!(result.meta.attempts.len(), 1);
}

#[tokio::test]
async fn budget_denial_stops_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/always-500"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut config = fast_config(vec![String::new()], 5);
    config.retry_budget = Some(RetryBudgetSpec {
        key: "session::token".to_string(),
        limit: 1,
        window_ms: Some(60_000),
    });
    let result = transport()
        .execute(
            &format!("{}/always-500", server.uri()),
            &HttpRequestSpec::new("GET"),
            &config,
            None,
        )
        .await;

    let error = result.error.expect("terminal error");
    assert!(error.message.contains("Retry budget exhausted"));
    // First failure consumed the single unit; the second was denied.
    assert_eq!(result.meta.attempts.len(), 2);
    assert!(result
        .meta
        .fix_actions
        .contains(&FixAction::RetryBudgetExhausted));
}

#[tokio::test]
async fn retry_after_zero_fast_paths_the_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/throttled"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "0")
                .set_body_json(json!({"error": "slow down"})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/throttled"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    // A huge base backoff would stall the test unless Retry-After wins.
    let mut config = fast_config(vec![String::new()], 2);
    config.backoff_base_ms = 60_000;
    config.backoff_max_ms = 60_000;
    let result = transport()
        .execute(
            &format!("{}/throttled", server.uri()),
            &HttpRequestSpec::new("GET"),
            &config,
            None,
        )
        .await;

    assert!(result.is_success());
    assert_eq!(result.meta.attempts.len(), 2);
}

#[tokio::test]
async fn non_retryable_failure_carries_parsed_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({"detail": {"error": "nope"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = fast_config(vec![String::new()], 2);
    let result = transport()
        .execute(
            &format!("{}/missing", server.uri()),
            &HttpRequestSpec::new("GET"),
            &config,
            None,
        )
        .await;

    let error = result.error.expect("terminal error");
    assert_eq!(error.status, Some(404));
    assert_eq!(error.message, "Request failed with status 404");
    assert_eq!(error.body, Some(json!({"detail": {"error": "nope"}})));
    assert_eq!(result.meta.retries, 0);
}

#[tokio::test]
async fn network_errors_retry_then_surface() {
    let config = fast_config(vec![String::new()], 1);
    // Nothing listens on the discard port.
    let result = transport()
        .execute(
            "http://127.0.0.1:9/unreachable",
            &HttpRequestSpec::new("GET"),
            &config,
            None,
        )
        .await;

    let error = result.error.expect("terminal error");
    assert_eq!(error.status, None);
    assert_eq!(result.meta.attempts.len(), 2);
    assert!(result.meta.fix_actions.contains(&FixAction::NetworkError));
}

#[tokio::test]
async fn custom_retry_status_codes_extend_the_retry_set() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(410))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let mut config = fast_config(vec![String::new()], 2);
    config.retry_status_codes = HashSet::from([429, 410]);
    let result = transport()
        .execute(
            &format!("{}/gone", server.uri()),
            &HttpRequestSpec::new("GET"),
            &config,
            None,
        )
        .await;

    assert!(result.is_success());
    assert!(result.meta.fix_actions.contains(&FixAction::RetryStatus(410)));
}
