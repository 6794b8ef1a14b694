//! Model transport: the [`ModelClient`] seam plus an OpenAI-compatible HTTP client.
//!
//! The controller and the delegation channel only see [`ModelClient`]. Tests
//! use scripted clients that return canned completions without network access.

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::types::{Completion, Message, Usage};
use crate::io::config::ModelConfig;

/// Abstraction over chat-completion backends.
pub trait ModelClient {
    /// Identifier recorded in run logs.
    fn model(&self) -> &str;

    /// Complete one conversation.
    fn chat(&self, messages: &[Message]) -> impl Future<Output = Result<Completion>>;

    /// Complete several conversations concurrently.
    ///
    /// Results are positionally aligned with `conversations` whatever order
    /// the requests finish in. Any failure fails the whole batch.
    fn chat_batch(
        &self,
        conversations: &[Vec<Message>],
    ) -> impl Future<Output = Result<Vec<Completion>>> {
        try_join_all(conversations.iter().map(|messages| self.chat(messages)))
    }
}

/// Client for any `/chat/completions` endpoint speaking the OpenAI wire format.
pub struct OpenAiClient {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl OpenAiClient {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("build http client")?;
        let api_key = config.api_key();
        if api_key.is_none() {
            warn!(model = %config.model, "no API key found; sending unauthenticated requests");
        }
        Ok(Self {
            http,
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl ChatResponse {
    fn into_parts(self) -> Result<(String, Usage)> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("completion response has no choices"))?;
        let usage = self.usage.unwrap_or_default();
        Ok((
            choice.message.content.unwrap_or_default(),
            Usage::new(usage.prompt_tokens, usage.completion_tokens),
        ))
    }
}

impl ModelClient for OpenAiClient {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, messages = messages.len()))]
    async fn chat(&self, messages: &[Message]) -> Result<Completion> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let started = Instant::now();
        let mut request = self.http.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("send completion request to {}", self.url))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "completion request to {} failed with status {status}: {text}",
                self.url
            ));
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .context("decode completion response")?;
        let (text, usage) = parsed.into_parts()?;
        let elapsed = started.elapsed();
        debug!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            elapsed_ms = elapsed.as_millis() as u64,
            "completion finished"
        );
        Ok(Completion {
            text,
            usage,
            model: self.model.clone(),
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_omits_unset_sampling_fields() {
        let messages = vec![Message::system("sys"), Message::user("hi")];
        let body = ChatRequest {
            model: "m",
            messages: &messages,
            temperature: None,
            max_tokens: Some(512),
        };
        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "model": "m",
                "messages": [
                    {"role": "system", "content": "sys"},
                    {"role": "user", "content": "hi"}
                ],
                "max_tokens": 512
            })
        );
    }

    #[test]
    fn response_extracts_text_and_usage() {
        let raw = r#"{
            "id": "x",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;
        let parsed: ChatResponse = serde_json::from_str(raw).expect("parse");
        let (text, usage) = parsed.into_parts().expect("parts");
        assert_eq!(text, "hello");
        assert_eq!(usage, Usage::new(12, 3));
    }

    #[test]
    fn null_content_and_missing_usage_default_to_empty() {
        let raw = r#"{"choices": [{"message": {"content": null}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).expect("parse");
        let (text, usage) = parsed.into_parts().expect("parts");
        assert_eq!(text, "");
        assert_eq!(usage, Usage::default());
    }

    #[test]
    fn empty_choices_is_an_error() {
        let parsed: ChatResponse = serde_json::from_str(r#"{"choices": []}"#).expect("parse");
        assert!(parsed.into_parts().is_err());
    }

    #[test]
    fn url_joins_base_without_double_slash() {
        let config = ModelConfig {
            base_url: "http://localhost:8000/v1/".to_string(),
            ..ModelConfig::worker()
        };
        let client = OpenAiClient::new(&config).expect("client");
        assert_eq!(client.url, "http://localhost:8000/v1/chat/completions");
        assert_eq!(client.model(), config.model);
    }
}
