// src/adapters/openai.rs

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ports::{CompletionError, CompletionService};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: Option<String>,
}

/// Chat completions client for OpenAI-compatible endpoints.
pub struct OpenAiCompletion {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiCompletion {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletion {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        info!("Requesting completion with model {} (prompt length: {} chars)", self.model, prompt.len());

        let body = ChatRequest {
            model: &self.model,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
            temperature: 0.0,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CompletionError::Failed(format!("request error: {}", e)))?;

        let status = response.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            warn!("Completion service responded 503");
            return Err(CompletionError::Overloaded);
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .ok()
                .and_then(|e| e.error.message)
                .unwrap_or(text);
            return Err(CompletionError::Failed(format!("{}: {}", status, message)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::Failed(format!("unreadable response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| CompletionError::Failed("missing response text".to_string()))
    }
}
