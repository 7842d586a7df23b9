//! The model capability: send a system prompt plus text and image parts,
//! receive raw text back.

pub mod tensorzero;

#[cfg(test)]
pub mod scripted;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use tensorzero::{GatewayClient, GatewayConfig};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { url: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self::Image { url: url.into() }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub json_mode: bool,
    pub max_tokens: u32,
    pub model: Option<String>,
}

impl CompletionOptions {
    pub fn json(max_tokens: u32, model: Option<String>) -> Self {
        Self {
            json_mode: true,
            max_tokens,
            model,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("missing gateway url")]
    MissingGateway,
    #[error("rate limited by model provider")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("model quota exhausted")]
    QuotaExhausted,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        content: &[ContentPart],
        options: &CompletionOptions,
    ) -> Result<String, ModelError>;
}
