use crate::http::build_model_client;
use crate::llm::{CompletionOptions, ContentPart, ModelClient, ModelError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, header::RETRY_AFTER};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub function_name: Option<String>,
    pub model: Option<String>,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            gateway_url: std::env::var("TENSORZERO_GATEWAY_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
            api_key: std::env::var("TENSORZERO_API_KEY").ok(),
            function_name: std::env::var("TENSORZERO_FUNCTION").ok(),
            model: std::env::var("TENSORZERO_MODEL").ok(),
        }
    }
}

pub struct GatewayClient {
    http: Client,
    config: GatewayConfig,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            http: build_model_client(),
            config,
        }
    }
}

#[async_trait]
impl ModelClient for GatewayClient {
    async fn complete(
        &self,
        system: &str,
        content: &[ContentPart],
        options: &CompletionOptions,
    ) -> Result<String, ModelError> {
        let gateway = self.config.gateway_url.trim().trim_end_matches('/');
        if gateway.is_empty() {
            return Err(ModelError::MissingGateway);
        }

        let function_name = self
            .config
            .function_name
            .as_deref()
            .unwrap_or("vintage_listing");
        let model_name = options.model.as_deref().or(self.config.model.as_deref());

        let body = InferenceRequest {
            function_name,
            model_name,
            input: InferenceInput {
                system,
                messages: vec![InferenceMessage {
                    role: "user",
                    content,
                }],
            },
            params: InferenceParams {
                chat_completion: ChatCompletionParams {
                    max_tokens: options.max_tokens,
                    json_mode: options.json_mode.then_some("on"),
                },
            },
        };

        let mut request = self.http.post(format!("{gateway}/inference")).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ModelError::Http(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok());
            return Err(ModelError::RateLimited { retry_after_secs });
        }
        if status == StatusCode::PAYMENT_REQUIRED {
            return Err(ModelError::QuotaExhausted);
        }
        if !status.is_success() {
            return Err(ModelError::Http(format!("HTTP {status}")));
        }

        let payload: InferenceResponse = response
            .json()
            .await
            .map_err(|err| ModelError::InvalidResponse(err.to_string()))?;

        if let Some(usage) = &payload.usage {
            debug!(
                target = "relist.llm",
                input_tokens = usage.input_tokens.unwrap_or_default(),
                output_tokens = usage.output_tokens.unwrap_or_default(),
                "model_usage"
            );
        }

        let text = payload
            .content
            .into_iter()
            .filter(|item| item.r#type == "text")
            .filter_map(|item| item.text)
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            return Err(ModelError::InvalidResponse("missing text".into()));
        }
        Ok(text)
    }
}

#[derive(Debug, Serialize)]
struct InferenceRequest<'a> {
    function_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<&'a str>,
    input: InferenceInput<'a>,
    params: InferenceParams,
}

#[derive(Debug, Serialize)]
struct InferenceInput<'a> {
    system: &'a str,
    messages: Vec<InferenceMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct InferenceMessage<'a> {
    role: &'static str,
    content: &'a [ContentPart],
}

#[derive(Debug, Serialize)]
struct InferenceParams {
    chat_completion: ChatCompletionParams,
}

#[derive(Debug, Serialize)]
struct ChatCompletionParams {
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_mode: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct InferenceResponse {
    content: Vec<ResponseContent>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_body_carries_text_and_image_parts() {
        let content = vec![
            ContentPart::text("describe"),
            ContentPart::image("https://img.test/a.jpg"),
        ];
        let body = InferenceRequest {
            function_name: "vintage_listing",
            model_name: None,
            input: InferenceInput {
                system: "sys",
                messages: vec![InferenceMessage {
                    role: "user",
                    content: &content,
                }],
            },
            params: InferenceParams {
                chat_completion: ChatCompletionParams {
                    max_tokens: 100,
                    json_mode: Some("on"),
                },
            },
        };
        let value = serde_json::to_value(&body).expect("serialize");
        assert!(value.get("model_name").is_none());
        assert_eq!(
            value["input"]["messages"][0]["content"],
            json!([
                {"type": "text", "text": "describe"},
                {"type": "image", "url": "https://img.test/a.jpg"}
            ])
        );
        assert_eq!(value["params"]["chat_completion"]["json_mode"], json!("on"));
    }

    #[tokio::test]
    async fn empty_gateway_is_rejected_before_network() {
        let client = GatewayClient::new(GatewayConfig {
            gateway_url: "  ".into(),
            api_key: None,
            function_name: None,
            model: None,
        });
        let err = client
            .complete("sys", &[], &CompletionOptions::json(10, None))
            .await
            .expect_err("missing gateway");
        assert_eq!(err, ModelError::MissingGateway);
    }
}
