//! [`Completion`] adapter for the OpenRouter chat completions API.

use crate::api::{Completion, CompletionFuture};
use crate::context::transcript::{Rendering, render_message};
use crate::{Message, MessageRole, Part};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

// ── Wire types ─────────────────────────────────────────────────────

#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "is_zero_u32")]
    max_tokens: u32,
    #[serde(skip_serializing_if = "is_zero_f32")]
    temperature: f32,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}
fn is_zero_f32(v: &f32) -> bool {
    *v == 0.0
}

#[derive(Serialize, Debug, PartialEq)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

#[derive(Deserialize, Debug, Clone)]
struct UsageInfo {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

/// Flatten a conversation into role/content pairs.
///
/// Plain text turns pass through; turns carrying tool invocations or results
/// are rendered as text, so the request never references tool-call ids the
/// provider has not seen.
fn to_wire(system: &str, conversation: &[Message]) -> Vec<WireMessage> {
    let mut out = Vec::with_capacity(conversation.len() + 1);
    if !system.is_empty() {
        out.push(WireMessage {
            role: "system",
            content: system.to_string(),
        });
    }
    for msg in conversation {
        let plain = msg.parts.iter().all(|p| matches!(p, Part::Text { .. }));
        let content = if plain {
            msg.text()
        } else {
            render_message(msg, Rendering::Full)
        };
        let role = match msg.role {
            MessageRole::Agent => "assistant",
            MessageRole::User | MessageRole::ToolResult => "user",
        };
        out.push(WireMessage { role, content });
    }
    out
}

// ── Adapter ────────────────────────────────────────────────────────

/// Async HTTP completion against OpenRouter for one model.
pub struct OpenRouterCompletion {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenRouterCompletion {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent("baton-rs/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: 4096,
            temperature: 0.3,
        })
    }

    /// Read the API key from the `OPENROUTER_KEY` environment variable.
    pub fn from_env(model: impl Into<String>) -> Result<Self, String> {
        let api_key = std::env::var("OPENROUTER_KEY")
            .map_err(|_| "OPENROUTER_KEY environment variable is not set".to_string())?;
        Self::new(api_key, model)
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Same key and settings, different model.
    pub fn for_model(&self, model: impl Into<String>) -> Self {
        Self {
            client: self.client.clone(),
            api_key: self.api_key.clone(),
            model: model.into(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }

    async fn send(&self, system: &str, conversation: &[Message]) -> Result<String, String> {
        let body = ChatRequest {
            model: &self.model,
            messages: to_wire(system, conversation),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        debug!(
            "LLM request: model={}, messages={}, max_tokens={}",
            self.model,
            body.messages.len(),
            body.max_tokens,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(&body).map_or(0, |s| s.len())
        );

        let start = Instant::now();
        let resp = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("X-Title", "baton-rs")
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("failed to read response: {e}"))?;
        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(format!("OpenRouter API HTTP {status}: {text}"));
        }
        parse_response(&text)
    }
}

fn parse_response(text: &str) -> Result<String, String> {
    let parsed: RawChatResponse =
        serde_json::from_str(text).map_err(|e| format!("failed to parse response: {e}"))?;

    if let Some(err) = parsed.error {
        return Err(format!("OpenRouter API error: {}", err.message));
    }
    if let Some(ref usage) = parsed.usage {
        debug!(
            "Token usage: prompt={}, completion={}, total={}",
            usage.prompt_tokens.unwrap_or(0),
            usage.completion_tokens.unwrap_or(0),
            usage.total_tokens.unwrap_or(0),
        );
    }

    parsed
        .choices
        .and_then(|c| c.into_iter().next())
        .and_then(|c| c.message.content)
        .ok_or_else(|| "OpenRouter API returned no content".to_string())
}

impl Completion for OpenRouterCompletion {
    fn complete<'a>(
        &'a self,
        system: &'a str,
        conversation: &'a [Message],
    ) -> CompletionFuture<'a> {
        Box::pin(self.send(system, conversation))
    }
}
