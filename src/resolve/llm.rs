//! LLM completion provider.
//!
//! [`CompletionProvider`] is the transport seam for the resolution stages.
//! [`HttpCompletionProvider`] speaks the OpenAI-compatible chat completions
//! API with JSON mode. Timeouts map to [`LlmError::Timeout`]; cancellation
//! and connection failures map to [`LlmError::Unavailable`] and are never
//! retried here.

use crate::config::{env_duration_millis, env_string, env_usize};
use crate::resolve::error::LlmError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tokio::time::timeout;

/// Backend settings, read from `LLM_*` variables.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub request_timeout: Duration,
    /// Extra attempts after a malformed response, with an escalating
    /// JSON-only instruction appended each time.
    pub max_retries: usize,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env_string("LLM_BASE_URL", "http://localhost:11434/v1"),
            api_key: env::var("LLM_API_KEY").ok().filter(|key| !key.is_empty()),
            model: env_string("LLM_MODEL", "qwen2.5:14b"),
            request_timeout: env_duration_millis("LLM_TIMEOUT_MS", 60_000),
            max_retries: env_usize("LLM_MAX_RETRIES", 2),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub json_mode: bool,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub finish_reason: Option<String>,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

pub struct HttpCompletionProvider {
    base_url: String,
    api_key: Option<String>,
    http: Client,
    request_timeout: Duration,
}

impl HttpCompletionProvider {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            http: Client::new(),
            request_timeout: config.request_timeout,
        }
    }

    async fn dispatch(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        #[derive(Serialize)]
        struct Message<'a> {
            role: &'static str,
            content: &'a str,
        }

        #[derive(Serialize)]
        struct ResponseFormat {
            #[serde(rename = "type")]
            format_type: &'static str,
        }

        #[derive(Serialize)]
        struct ChatRequest<'a> {
            model: &'a str,
            messages: Vec<Message<'a>>,
            temperature: f64,
            #[serde(skip_serializing_if = "Option::is_none")]
            response_format: Option<ResponseFormat>,
        }

        let payload = ChatRequest {
            model: &request.model,
            messages: vec![
                Message {
                    role: "system",
                    content: &request.system_prompt,
                },
                Message {
                    role: "user",
                    content: &request.user_prompt,
                },
            ],
            temperature: 0.0,
            response_format: request.json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.http.post(url).json(&payload);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                LlmError::Timeout(self.request_timeout)
            } else {
                LlmError::Unavailable(err.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimit);
        }
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            return Err(LlmError::ContentTooLong);
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());
            return Err(LlmError::Unavailable(format!("status {}: {}", status, body)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| LlmError::ParseFailure(err.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidSchema("response carried no choices".to_string()))?;

        Ok(CompletionResponse {
            content: choice.message.content,
            finish_reason: choice.finish_reason,
            prompt_tokens: parsed.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
            completion_tokens: parsed
                .usage
                .as_ref()
                .map(|u| u.completion_tokens)
                .unwrap_or(0),
        })
    }
}

#[async_trait]
impl CompletionProvider for HttpCompletionProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        match timeout(self.request_timeout, self.dispatch(request)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(self.request_timeout)),
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: i32,
    completion_tokens: i32,
}
