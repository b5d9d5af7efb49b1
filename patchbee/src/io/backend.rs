//! Edit request client.
//!
//! The [`EditBackend`] trait decouples the workflow from the generative
//! backend. Production code talks to an OpenAI-compatible chat completions
//! endpoint; tests use scripted backends that return canned text.

use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::BackendError;
use crate::io::config::BackendConfig;

/// One blocking prompt/response round-trip. Implementations never retry.
pub trait EditBackend {
    fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, BackendError>;
}

impl<B: EditBackend + ?Sized> EditBackend for &B {
    fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, BackendError> {
        (**self).complete(system_prompt, user_prompt)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Backend speaking `POST {base_url}/chat/completions`.
#[derive(Debug, Clone)]
pub struct ChatCompletionsBackend {
    client: Client,
    config: BackendConfig,
}

impl ChatCompletionsBackend {
    /// Build a client bounded by `config.request_timeout_secs`.
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| BackendError::Transport {
                url: config.base_url.clone(),
                message: err.to_string(),
            })?;
        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

impl EditBackend for ChatCompletionsBackend {
    #[instrument(skip_all, fields(model = %self.config.model, prompt_bytes = system_prompt.len() + user_prompt.len()))]
    fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, BackendError> {
        let url = self.endpoint();
        info!(model = %self.config.model, "calling backend");
        let body = ChatRequest {
            model: &self.config.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .map_err(|err| BackendError::Transport {
                url: url.clone(),
                message: err.to_string(),
            })?;

        let status = response.status();
        let text = response.text().map_err(|err| BackendError::Transport {
            url: url.clone(),
            message: err.to_string(),
        })?;

        if !status.is_success() {
            let message = error_message(&text);
            warn!(status = status.as_u16(), %message, "backend returned an error");
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Authentication {
                    status: status.as_u16(),
                    message,
                },
                _ => BackendError::Status {
                    status: status.as_u16(),
                    message,
                },
            });
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|err| BackendError::InvalidResponse(err.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(BackendError::EmptyResponse)?;
        debug!(response_bytes = content.len(), "backend responded");
        Ok(content)
    }
}

/// Pull `error.message` out of an OpenAI-style error body, else return a prefix of it.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(500).collect())
}
