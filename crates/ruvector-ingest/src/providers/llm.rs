//! Chat model trait used for keyword, question, tag and summary generation

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Marker some backends put in a response body instead of failing the call
pub const ERROR_SENTINEL: &str = "**ERROR**";

static THINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>.*</think>").expect("Invalid regex"));

/// One turn of a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

/// Generation parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenConf {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
}

impl GenConf {
    pub fn temperature(temperature: f32) -> Self {
        Self { temperature: Some(temperature), max_tokens: None }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Trait for chat completion
///
/// Implementations:
/// - `OllamaChat`: Local Ollama server
/// - `MockChat`: scripted responses for tests
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Complete a conversation; returns the answer and tokens used
    async fn chat(
        &self,
        system: &str,
        history: &[ChatMessage],
        conf: &GenConf,
    ) -> Result<(String, usize)>;

    /// Context window in tokens
    fn max_length(&self) -> usize;

    /// Model name, used in cache keys
    fn model(&self) -> &str;

    /// Check if the provider is healthy and available
    async fn health_check(&self) -> Result<bool>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}

/// Whether a response carries the backend error marker
pub fn is_error_response(text: &str) -> bool {
    text.contains(ERROR_SENTINEL)
}

/// Remove `<think>...</think>` reasoning blocks
pub fn strip_think(text: &str) -> String {
    THINK_RE.replace_all(text, "").to_string()
}
