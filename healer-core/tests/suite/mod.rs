//! Shared fixtures for the integration suite.

mod supervisor;
mod transport;

use std::sync::Arc;

use async_trait::async_trait;
use healer_core::backend::{BackendResult, RecoveryContext, TokenProvider, TokenRecovery};
use healer_core::regions::{RegionNode, RegionRegistry};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Token provider handing out a fixed token.
pub struct StaticTokenProvider(pub String);

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn fetch_token(&self) -> BackendResult<String> {
        Ok(self.0.clone())
    }
}

/// Recovery handler handing out a fixed replacement token.
pub struct StaticTokenRecovery(pub Option<String>);

#[async_trait]
impl TokenRecovery for StaticTokenRecovery {
    async fn recover(&self, _ctx: &RecoveryContext) -> BackendResult<Option<String>> {
        Ok(self.0.clone())
    }
}

/// Two-region demo tree rooted at the mock server.
pub fn demo_registry(base: &str) -> Arc<RegionRegistry> {
    let regional = |id: &str| format!("{base}/regions/{id}");
    let root = RegionNode::new("global", "Global", "battle-healer", base).with_children(vec![
        RegionNode::new(
            "aws-us-east-1",
            "AWS US East",
            "aws",
            &regional("aws-us-east-1"),
        )
        .with_fallbacks(&["aws-eu-west-1"]),
        RegionNode::new(
            "aws-eu-west-1",
            "AWS EU West",
            "aws",
            &regional("aws-eu-west-1"),
        )
        .with_fallbacks(&["aws-us-east-1"]),
    ]);
    Arc::new(RegionRegistry::new(root))
}

/// Accepts `/log` so best-effort telemetry stays quiet in tests.
pub async fn mount_log_sink(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/log"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"status": "accepted"})))
        .mount(server)
        .await;
}
