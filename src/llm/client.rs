//! Chat-completions client for worker identities.
//!
//! Each worker identity carries its own endpoint, credential and model; the
//! client fills gaps from its process-wide fallbacks (CLI flags or
//! environment). A worker that ends up with no endpoint or no model is a
//! configuration error, surfaced before any request is sent.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::catalog::WorkerIdentity;
use crate::error::CompletionError;

/// A message in a conversation with a worker identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender ("system", "user", "assistant").
    pub role: String,
    /// Content of the message.
    pub content: String,
}

impl ChatMessage {
    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Trait for backends that complete a worker conversation.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Produce the next assistant message for `worker`'s conversation.
    async fn complete(
        &self,
        worker: &WorkerIdentity,
        messages: &[ChatMessage],
    ) -> Result<String, CompletionError>;
}

/// HTTP client for OpenAI-compatible chat-completions endpoints.
pub struct HttpChatClient {
    /// Endpoint used when an identity does not carry its own.
    fallback_endpoint: Option<String>,
    /// Credential used when an identity does not carry its own.
    fallback_api_key: Option<String>,
    /// Model used when an identity does not carry its own.
    fallback_model: Option<String>,
    /// HTTP client for making API requests.
    http_client: Client,
}

impl HttpChatClient {
    /// Create a client with no fallbacks; identities must be fully bound.
    pub fn new() -> Self {
        Self {
            fallback_endpoint: None,
            fallback_api_key: None,
            fallback_model: None,
            http_client: Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// Create a client picking up fallbacks from the environment.
    ///
    /// Reads `STAGECREW_API_BASE`, `STAGECREW_API_KEY` and `STAGECREW_MODEL`.
    /// All are optional since identities may carry their own bindings.
    pub fn from_env() -> Self {
        Self::new()
            .maybe_endpoint(env::var("STAGECREW_API_BASE").ok())
            .maybe_api_key(env::var("STAGECREW_API_KEY").ok())
            .maybe_model(env::var("STAGECREW_MODEL").ok())
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.fallback_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.fallback_api_key = Some(api_key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = Some(model.into());
        self
    }

    pub fn maybe_endpoint(mut self, endpoint: Option<String>) -> Self {
        if let Some(endpoint) = endpoint {
            self.fallback_endpoint = Some(endpoint);
        }
        self
    }

    pub fn maybe_api_key(mut self, api_key: Option<String>) -> Self {
        if let Some(api_key) = api_key {
            self.fallback_api_key = Some(api_key);
        }
        self
    }

    pub fn maybe_model(mut self, model: Option<String>) -> Self {
        if let Some(model) = model {
            self.fallback_model = Some(model);
        }
        self
    }

    fn resolve_endpoint(&self, worker: &WorkerIdentity) -> Result<String, CompletionError> {
        worker
            .endpoint
            .clone()
            .or_else(|| self.fallback_endpoint.clone())
            .ok_or_else(|| CompletionError::MissingEndpoint {
                role: worker.name.clone(),
            })
    }

    fn resolve_model(&self, worker: &WorkerIdentity) -> Result<String, CompletionError> {
        worker
            .model
            .clone()
            .or_else(|| self.fallback_model.clone())
            .ok_or_else(|| CompletionError::MissingModel {
                role: worker.name.clone(),
            })
    }

    fn resolve_api_key(&self, worker: &WorkerIdentity) -> Option<String> {
        worker
            .api_key
            .clone()
            .or_else(|| self.fallback_api_key.clone())
    }
}

impl Default for HttpChatClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Internal request structure for the OpenAI-compatible API.
#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: String,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

/// Internal response structure from the OpenAI-compatible API.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: String,
}

/// Error response from the API.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[async_trait]
impl CompletionBackend for HttpChatClient {
    async fn complete(
        &self,
        worker: &WorkerIdentity,
        messages: &[ChatMessage],
    ) -> Result<String, CompletionError> {
        let endpoint = self.resolve_endpoint(worker)?;
        let model = self.resolve_model(worker)?;

        let api_request = ApiRequest {
            model,
            messages,
            temperature: worker.temperature,
            max_tokens: worker.max_tokens,
        };

        let url = format!("{}/chat/completions", endpoint.trim_end_matches('/'));

        let mut http_request = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(api_key) = self.resolve_api_key(worker) {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        let http_response = http_request
            .json(&api_request)
            .send()
            .await
            .map_err(|e| CompletionError::RequestFailed(e.to_string()))?;

        let status = http_response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error response".to_string());

            if let Ok(parsed) = serde_json::from_str::<ApiErrorResponse>(&error_text) {
                if status_code == 429 {
                    return Err(CompletionError::RateLimited(parsed.error.message));
                }
                return Err(CompletionError::ApiError {
                    code: status_code,
                    message: parsed.error.message,
                });
            }

            return Err(CompletionError::ApiError {
                code: status_code,
                message: error_text,
            });
        }

        let api_response: ApiResponse = http_response
            .json()
            .await
            .map_err(|e| CompletionError::ParseError(e.to_string()))?;

        let content = api_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(CompletionError::EmptyResponse)?;

        Ok(content)
    }
}
