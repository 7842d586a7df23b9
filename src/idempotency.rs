use crate::models::ListingResponse;
use redis::AsyncCommands;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::debug;

const KEY_PREFIX: &str = "relist:idempotency:";

/// Replays listing responses per `Idempotency-Key`. Redis when configured,
/// otherwise a process-local map with the same TTL.
#[derive(Clone)]
pub struct IdempotencyCache {
    redis: Option<redis::Client>,
    local: Arc<Mutex<HashMap<String, (Instant, ListingResponse)>>>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(redis: Option<redis::Client>, ttl: Duration) -> Self {
        Self {
            redis,
            local: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn from_env() -> Self {
        let redis = std::env::var("REDIS_URL")
            .ok()
            .and_then(|u| redis::Client::open(u).ok());
        let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(3600);
        Self::new(redis, Duration::from_secs(ttl))
    }

    pub async fn get(&self, key: &str) -> Option<ListingResponse> {
        if let Some(client) = &self.redis {
            return redis_get(client, key).await;
        }
        let mut local = self.local.lock().await;
        match local.get(key) {
            Some((stored, response)) if stored.elapsed() < self.ttl => {
                debug!(target = "relist.idempotency", key, "replayed");
                Some(response.clone())
            }
            Some(_) => {
                local.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn set(&self, key: &str, response: &ListingResponse) {
        if let Some(client) = &self.redis {
            redis_set(client, key, response, self.ttl.as_secs()).await;
            return;
        }
        self.local
            .lock()
            .await
            .insert(key.to_string(), (Instant::now(), response.clone()));
    }
}

async fn redis_get(client: &redis::Client, key: &str) -> Option<ListingResponse> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(_) => return None,
    };
    let s: Option<String> = conn.get(format!("{KEY_PREFIX}{key}")).await.ok();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

async fn redis_set(client: &redis::Client, key: &str, value: &ListingResponse, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(format!("{KEY_PREFIX}{key}"), json, ttl_secs).await;
    }
}
