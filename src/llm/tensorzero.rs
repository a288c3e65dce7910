use crate::http::build_client;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_FUNCTION: &str = "listing_grader";

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub function_name: String,
    pub model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            gateway_url: std::env::var("TENSORZERO_GATEWAY_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
            api_key: std::env::var("TENSORZERO_API_KEY").ok(),
            function_name: std::env::var("TENSORZERO_FUNCTION")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FUNCTION.into()),
            model: std::env::var("TENSORZERO_MODEL").ok(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing gateway url")]
    MissingGateway,
    #[error("http error: {0}")]
    Http(String),
    #[error("rate limited by gateway")]
    RateLimited,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    #[serde(default)]
    pub usage: Option<LlmUsage>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LlmUsage {
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

/// Client for a TensorZero gateway's `/inference` endpoint.
pub struct LlmClient {
    http: Client,
    config: LlmConfig,
    label: String,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let label = config
            .model
            .clone()
            .unwrap_or_else(|| format!("tensorzero::{}", config.function_name));
        Self {
            http: build_client(),
            config,
            label,
        }
    }

    pub fn model_label(&self) -> &str {
        &self.label
    }

    pub async fn chat(&self, messages: &[LlmMessage]) -> Result<LlmResponse, LlmError> {
        let gateway = self.config.gateway_url.trim().trim_end_matches('/');
        if gateway.is_empty() {
            return Err(LlmError::MissingGateway);
        }

        let body = ChatRequest {
            function_name: self.config.function_name.clone(),
            model_name: self.config.model.clone(),
            input: ChatInput {
                messages: messages.to_vec(),
            },
        };

        let mut request = self.http.post(format!("{gateway}/inference")).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimited);
        }
        if !response.status().is_success() {
            return Err(LlmError::Http(format!("HTTP {}", response.status())));
        }

        let payload: TensorZeroResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        payload.into_response()
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    function_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<String>,
    input: ChatInput,
}

#[derive(Debug, Serialize)]
struct ChatInput {
    messages: Vec<LlmMessage>,
}

#[derive(Debug, Deserialize)]
struct TensorZeroResponse {
    content: Vec<ResponseContent>,
    #[serde(default)]
    usage: Option<LlmUsage>,
}

impl TensorZeroResponse {
    /// Joins the text blocks in order; tool calls and other block types are dropped.
    fn into_response(self) -> Result<LlmResponse, LlmError> {
        let text: String = self
            .content
            .into_iter()
            .filter(|item| item.r#type == "text")
            .filter_map(|item| item.text)
            .collect();
        if text.trim().is_empty() {
            return Err(LlmError::InvalidResponse("missing text".into()));
        }
        Ok(LlmResponse {
            text,
            usage: self.usage,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_joins_text_blocks_and_skips_others() {
        let payload: TensorZeroResponse = serde_json::from_str(
            r#"{"content":[{"type":"text","text":"{\"score\":"},{"type":"tool_call"},{"type":"text","text":"70}"}]}"#,
        )
        .expect("payload");
        let response = payload.into_response().expect("text");
        assert_eq!(response.text, "{\"score\":70}");
        assert!(response.usage.is_none());

        let tools_only: TensorZeroResponse =
            serde_json::from_str(r#"{"content":[{"type":"tool_call"},{"type":"text","text":"  "}]}"#)
                .expect("payload");
        assert!(matches!(
            tools_only.into_response(),
            Err(LlmError::InvalidResponse(_))
        ));
    }

    #[test]
    fn model_label_falls_back_to_function_name() {
        let client = LlmClient::new(LlmConfig {
            gateway_url: "http://localhost:3000".into(),
            api_key: None,
            function_name: "listing_grader".into(),
            model: None,
        });
        assert_eq!(client.model_label(), "tensorzero::listing_grader");
    }

    #[tokio::test]
    async fn empty_gateway_is_rejected_before_any_request() {
        let client = LlmClient::new(LlmConfig {
            gateway_url: "  ".into(),
            api_key: None,
            function_name: "listing_grader".into(),
            model: None,
        });
        let err = client.chat(&[]).await.expect_err("missing gateway");
        assert!(matches!(err, LlmError::MissingGateway));
    }
}
