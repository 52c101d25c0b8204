//! End-to-end healing scenarios against a mock backend and upstream.

use std::sync::Arc;

use healer_core::backend::BackendClient;
use healer_core::budget::RetryBudgetStore;
use healer_core::cache::ResponseCache;
use healer_core::clock::{ManualClock, SystemClock};
use healer_core::planner::HeuristicPlanner;
use healer_core::regions::RegionStatus;
use healer_core::state::{Degradation, DegradationSource, HttpRequestSpec};
use healer_core::supervisor::{DegradationConfig, HealParams, Supervisor};
use healer_core::toolkit::{Toolkit, TransactionRepairStrategy};
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::{StaticTokenProvider, demo_registry, mount_log_sink};

fn fresh_cache() -> Arc<ResponseCache> {
    Arc::new(ResponseCache::new(Arc::new(SystemClock)))
}

async fn supervisor_for(server: &MockServer) -> Supervisor {
    mount_log_sink(server).await;
    Supervisor::new(&server.uri())
        .with_registry(demo_registry(&server.uri()))
        .with_token_provider(Arc::new(StaticTokenProvider("tok-A".to_string())))
        .with_cache(fresh_cache())
}

fn degradation_off() -> DegradationConfig {
    DegradationConfig {
        enable_stale_cache: false,
        enable_mock: false,
        ..DegradationConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn healthy_path_returns_live_data() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/regions/aws-us-east-1/external-api"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"amount": 10})))
        .expect(1)
        .mount(&server)
        .await;

    let supervisor = supervisor_for(&server).await;
    let outcome = supervisor
        .run(HealParams::new("/external-api", HttpRequestSpec::new("GET")))
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.data, Some(json!({"amount": 10})));
    assert_eq!(outcome.state.cycles_used, 0);
    assert_eq!(outcome.degraded.degradation, Degradation::None);
    assert_eq!(
        outcome.state.region_health.get("aws-us-east-1"),
        Some(&RegionStatus::Healthy)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn region_failover_on_503() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/regions/aws-us-east-1/external-api"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "Region down"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/regions/aws-eu-west-1/external-api"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"region": "eu"})))
        .mount(&server)
        .await;

    let supervisor = supervisor_for(&server).await;
    let mut params = HealParams::new("/external-api", HttpRequestSpec::new("GET"));
    params.regions = Some(vec![format!(
        "{}/regions/aws-us-east-1",
        server.uri()
    )]);
    let outcome = supervisor.run(params).await;

    assert!(outcome.success);
    assert_eq!(outcome.data, Some(json!({"region": "eu"})));
    assert_eq!(outcome.state.region_history, vec!["aws-us-east-1"]);
    assert_eq!(
        outcome.state.region_health.get("aws-us-east-1"),
        Some(&RegionStatus::Unhealthy)
    );
    let intervention = &outcome.state.interventions[0];
    assert_eq!(intervention.action, "switch_region");
    assert_eq!(
        intervention.details.as_ref().unwrap()["region"],
        json!("aws-eu-west-1")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refresh_token_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/regions/aws-us-east-1/external-api"))
        .and(header("Authorization", "Bearer tok-A"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "Invalid token"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/regions/aws-us-east-1/external-api"))
        .and(header("Authorization", "Bearer tok-B"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/refresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok-B"})))
        .expect(1)
        .mount(&server)
        .await;

    let supervisor = supervisor_for(&server).await;
    let mut params = HealParams::new("/external-api", HttpRequestSpec::new("GET"));
    params.regions = Some(vec![format!(
        "{}/regions/aws-us-east-1",
        server.uri()
    )]);
    let outcome = supervisor.run(params).await;

    assert!(outcome.success);
    assert_eq!(outcome.state.token, Some("tok-B".to_string()));
    assert_eq!(outcome.state.cycles_used, 1);
    assert_eq!(outcome.state.decision_log[0].action, "refresh_token");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repair_attempts_are_capped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/regions/aws-us-east-1/payments"))
        .respond_with(
            ResponseTemplate::new(422).set_body_json(json!({"detail": {"error": "bad payload"}})),
        )
        .mount(&server)
        .await;

    let clock = Arc::new(ManualClock::new(0));
    let registry = demo_registry(&server.uri());
    let toolkit = Toolkit::with_parts(
        BackendClient::new(&server.uri()),
        registry.clone(),
        Arc::new(RetryBudgetStore::new(clock.clone())),
        Arc::new(TransactionRepairStrategy),
        clock,
    );
    let supervisor = Supervisor::new(&server.uri())
        .with_registry(registry)
        .with_toolkit(toolkit)
        .with_token_provider(Arc::new(StaticTokenProvider("tok-A".to_string())))
        .with_cache(fresh_cache())
        .with_planner(Arc::new(HeuristicPlanner::new().without_rewrite()));
    mount_log_sink(&server).await;

    let mut request = HttpRequestSpec::new("POST");
    request.body = Some(json!({"transactionId": "demo", "amount": 10}));
    let mut params = HealParams::new("/payments", request);
    params.regions = Some(vec![format!(
        "{}/regions/aws-us-east-1",
        server.uri()
    )]);
    params.degradation = Some(degradation_off());
    let outcome = supervisor.run(params).await;

    assert!(!outcome.success);
    assert_eq!(outcome.state.repair_attempts, 2);
    assert_eq!(outcome.state.cycles_used, outcome.state.max_cycles);
    let actions: Vec<&str> = outcome
        .state
        .interventions
        .iter()
        .map(|i| i.action.as_str())
        .collect();
    assert_eq!(actions, vec!["repair_payload", "repair_payload", "abort"]);
    assert_eq!(outcome.final_error.unwrap().status, Some(422));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quota_exhaustion_degrades_to_mock() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/regions/aws-us-east-1/external-api"))
        .respond_with(
            ResponseTemplate::new(429)
                .set_body_json(json!({"detail": {"error": "quota exceeded"}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mock-response"))
        .and(body_partial_json(json!({"endpoint": "/external-api"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "mock": {"amount": 0},
            "degradation": "mocked",
            "reason": "Provider outage; synthetic mock generated",
            "source": "llm-mock",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let supervisor = supervisor_for(&server).await;
    let mut params = HealParams::new("/external-api", HttpRequestSpec::new("GET"));
    params.regions = Some(vec![format!(
        "{}/regions/aws-us-east-1",
        server.uri()
    )]);
    let outcome = supervisor.run(params).await;

    assert!(outcome.success);
    assert_eq!(outcome.data, Some(json!({"amount": 0})));
    assert_eq!(outcome.degraded.degradation, Degradation::Mocked);
    assert_eq!(outcome.degraded.source, Some(DegradationSource::LlmMock));
    assert_eq!(outcome.state.cycles_used, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhaustion_falls_back_to_stale_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "fail"})))
        .mount(&server)
        .await;

    let cache = fresh_cache();
    cache.remember("K", json!({"amount": 42}));

    mount_log_sink(&server).await;
    let supervisor = Supervisor::new(&server.uri())
        .with_registry(demo_registry(&server.uri()))
        .with_token_provider(Arc::new(StaticTokenProvider("tok-A".to_string())))
        .with_cache(cache);

    let mut params = HealParams::new("/external-api", HttpRequestSpec::new("GET"));
    params.max_cycles = Some(3);
    params.degradation = Some(DegradationConfig {
        cache_key: Some("K".to_string()),
        enable_mock: false,
        ..DegradationConfig::default()
    });
    let outcome = supervisor.run(params).await;

    assert!(outcome.success);
    assert_eq!(outcome.data, Some(json!({"amount": 42})));
    assert_eq!(outcome.degraded.degradation, Degradation::StaleCache);
    assert_eq!(outcome.degraded.source, Some(DegradationSource::Cache));
    assert!(outcome.degraded.original_error.is_some());
    assert_eq!(outcome.state.cycles_used, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn schema_drift_hints_adapt_the_next_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/regions/aws-us-east-1/external-api"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "detail": {"schema_hint": {"field_map": {"amount": "total"}}}
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/regions/aws-us-east-1/external-api"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"total": 5})))
        .mount(&server)
        .await;

    let supervisor = supervisor_for(&server).await;
    let mut params = HealParams::new("/external-api", HttpRequestSpec::new("GET"));
    params.regions = Some(vec![format!(
        "{}/regions/aws-us-east-1",
        server.uri()
    )]);
    let outcome = supervisor.run(params).await;

    assert!(outcome.success);
    assert_eq!(outcome.data, Some(json!({"total": 5, "amount": 5})));
    assert!(outcome.state.schema_hints.is_some());
    assert_eq!(outcome.state.decision_log[0].action, "adapt_schema");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_recovery_marks_state_and_sanitizes_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/regions/aws-us-east-1/external-api"))
        .respond_with(
            ResponseTemplate::new(429)
                .set_body_json(json!({"detail": {"error": "burst detected"}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/queue-failed"))
        .respond_with(
            ResponseTemplate::new(202).set_body_json(json!({"status": "queued", "id": "q-1"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let supervisor = supervisor_for(&server).await;
    let mut request = HttpRequestSpec::new("GET");
    request
        .headers
        .insert("Cookie".to_string(), "sid=1".to_string());
    let mut params = HealParams::new("/external-api", request);
    params.regions = Some(vec![format!(
        "{}/regions/aws-us-east-1",
        server.uri()
    )]);
    params.degradation = Some(degradation_off());
    let outcome = supervisor.run(params).await;

    assert!(!outcome.success);
    assert!(outcome.state.queued);
    assert_eq!(outcome.state.decision_log[0].action, "queue_recovery");

    // The queued envelope must not leak cookies or credentials.
    let requests = server.received_requests().await.unwrap();
    let queued = requests
        .iter()
        .find(|r| r.url.path() == "/queue-failed")
        .expect("queue-failed was called");
    let envelope: serde_json::Value = serde_json::from_slice(&queued.body).unwrap();
    assert!(envelope["headers"].get("Cookie").is_none());
    assert_eq!(envelope["correlation_id"], outcome.state.correlation_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_returns_a_result_without_cycles() {
    let server = MockServer::start().await;
    let supervisor = supervisor_for(&server).await;
    supervisor.cancellation_token().cancel();

    let mut params = HealParams::new("/external-api", HttpRequestSpec::new("GET"));
    params.degradation = Some(degradation_off());
    let outcome = supervisor.run(params).await;

    assert!(!outcome.success);
    assert_eq!(outcome.state.cycles_used, 0);
    assert!(outcome.state.attempts.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn observations_stay_in_lockstep_with_cycles() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "boom"})))
        .mount(&server)
        .await;

    let supervisor = supervisor_for(&server).await;
    let mut params = HealParams::new("/external-api", HttpRequestSpec::new("GET"));
    params.max_cycles = Some(4);
    params.degradation = Some(degradation_off());
    let outcome = supervisor.run(params).await;

    assert!(!outcome.success);
    assert_eq!(
        outcome.state.attempts.len() as u32,
        outcome.state.cycles_used
    );
    for (index, observation) in outcome.state.attempts.iter().enumerate() {
        assert_eq!(observation.cycle as usize, index);
        assert_eq!(
            observation.meta.attempts.last().unwrap().status,
            observation.error.status
        );
    }
}
