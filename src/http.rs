use reqwest::Client;
use std::time::Duration;

/// Store and other short round trips.
pub fn build_client() -> Client {
    build_with(env_secs("HTTP_TIMEOUT_SECS", 15), env_secs("HTTP_CONNECT_TIMEOUT_SECS", 5))
}

/// Vision completions routinely take tens of seconds.
pub fn build_model_client() -> Client {
    build_with(env_secs("MODEL_TIMEOUT_SECS", 90), env_secs("HTTP_CONNECT_TIMEOUT_SECS", 5))
}

fn build_with(timeout_secs: u64, connect_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(connect_secs))
        .user_agent(concat!("relist-api-rs/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn env_secs(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
