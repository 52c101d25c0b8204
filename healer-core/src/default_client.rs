//! Shared reqwest client with harmonized defaults.

use std::time::Duration;

use once_cell::sync::OnceCell;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

fn user_agent() -> String {
    format!("battle-healer/{}", env!("CARGO_PKG_VERSION"))
}

/// Base builder; apply per-call `.timeout(...)` where a tighter bound helps.
pub fn builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .user_agent(user_agent())
        .connect_timeout(Duration::from_secs(
            env_u64("HEALER_HTTP_CONNECT_TIMEOUT_SECS", 3).max(1),
        ))
        .timeout(Duration::from_secs(
            env_u64("HEALER_HTTP_TIMEOUT_SECS", 30).max(1),
        ))
        .pool_idle_timeout(Duration::from_secs(
            env_u64("HEALER_HTTP_POOL_IDLE_SECS", 90).max(1),
        ))
}

/// Shared default client for every component in the process.
pub fn client() -> &'static reqwest::Client {
    static CLIENT: OnceCell<reqwest::Client> = OnceCell::new();
    CLIENT.get_or_init(|| builder().build().expect("http client"))
}
