//! Ollama client and the embedding / chat providers built on it

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::LlmConfig;
use crate::error::{Error, Result};

use super::embedding::EmbeddingProvider;
use super::llm::{ChatMessage, ChatProvider, GenConf};

/// Ollama API client with automatic retry
pub struct OllamaClient {
    /// HTTP client
    client: Client,
    /// Server base URL
    base_url: String,
    /// Maximum retries
    max_retries: u32,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    prompt_eval_count: usize,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<usize>,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatMessage,
    #[serde(default)]
    prompt_eval_count: usize,
    #[serde(default)]
    eval_count: usize,
}

impl OllamaClient {
    /// Create a new Ollama client with retry support
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(5)
            .build()
            .map_err(|e| Error::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
        })
    }

    /// Retry a request with exponential backoff
    async fn retry_request<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        let delay = Duration::from_secs(2u64.pow(attempt));
                        tracing::warn!(
                            "Request failed (attempt {}/{}), retrying in {:?}",
                            attempt + 1,
                            self.max_retries + 1,
                            delay
                        );
                        sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::llm("Unknown error")))
    }

    /// Check if Ollama is available
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/api/tags", self.base_url);

        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    /// Embed a batch of texts with retry
    pub async fn embed(&self, model: &str, texts: &[String]) -> Result<(Vec<Vec<f32>>, usize)> {
        let url = format!("{}/api/embed", self.base_url);
        let url = url.as_str();
        let client = &self.client;

        self.retry_request(|| async move {
            let response = client
                .post(url)
                .json(&EmbedRequest { model, input: texts })
                .send()
                .await
                .map_err(|e| Error::embedding(format!("Embedding request failed: {}", e)))?;

            if !response.status().is_success() {
                return Err(Error::embedding(format!(
                    "Embedding failed: HTTP {}",
                    response.status()
                )));
            }

            let body: EmbedResponse = response
                .json()
                .await
                .map_err(|e| Error::embedding(format!("Failed to parse embedding response: {}", e)))?;

            if body.embeddings.len() != texts.len() {
                return Err(Error::embedding(format!(
                    "Expected {} embeddings, got {}",
                    texts.len(),
                    body.embeddings.len()
                )));
            }

            Ok((body.embeddings, body.prompt_eval_count))
        })
        .await
    }

    /// Non-streaming chat completion with retry
    pub async fn chat(
        &self,
        model: &str,
        system: &str,
        history: &[ChatMessage],
        conf: &GenConf,
    ) -> Result<(String, usize)> {
        let url = format!("{}/api/chat", self.base_url);

        let mut messages = Vec::with_capacity(history.len() + 1);
        if !system.is_empty() {
            messages.push(ChatMessage { role: "system".to_string(), content: system.to_string() });
        }
        messages.extend(history.iter().cloned());

        tracing::debug!("Chat request to {} ({} messages)", model, messages.len());

        let url = url.as_str();
        let client = &self.client;
        let messages = &messages;

        self.retry_request(|| {
            let request = ChatRequest {
                model,
                messages: messages.clone(),
                stream: false,
                options: ChatOptions {
                    temperature: conf.temperature,
                    num_predict: conf.max_tokens,
                },
            };

            async move {
                let response = client
                    .post(url)
                    .json(&request)
                    .send()
                    .await
                    .map_err(|e| Error::llm(format!("Chat request failed: {}", e)))?;

                if !response.status().is_success() {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(Error::llm(format!("Chat failed: HTTP {} - {}", status, body)));
                }

                let body: ChatResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::llm(format!("Failed to parse chat response: {}", e)))?;

                Ok((body.message.content, body.prompt_eval_count + body.eval_count))
            }
        })
        .await
    }
}

/// Ollama embedding provider
pub struct OllamaEmbedder {
    client: Arc<OllamaClient>,
    model: String,
    max_length: usize,
}

impl OllamaEmbedder {
    /// Create from existing OllamaClient
    pub fn from_client(client: Arc<OllamaClient>, model: impl Into<String>, max_length: usize) -> Self {
        Self {
            client,
            model: model.into(),
            max_length,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    async fn encode(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, usize)> {
        if texts.is_empty() {
            return Ok((Vec::new(), 0));
        }
        self.client.embed(&self.model, texts).await
    }

    fn max_length(&self) -> usize {
        self.max_length
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn health_check(&self) -> Result<bool> {
        self.client.health_check().await
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

/// Ollama chat provider
pub struct OllamaChat {
    client: Arc<OllamaClient>,
    model: String,
    max_length: usize,
}

impl OllamaChat {
    /// Create from existing OllamaClient
    pub fn from_client(client: Arc<OllamaClient>, model: impl Into<String>, max_length: usize) -> Self {
        Self {
            client,
            model: model.into(),
            max_length,
        }
    }
}

#[async_trait]
impl ChatProvider for OllamaChat {
    async fn chat(
        &self,
        system: &str,
        history: &[ChatMessage],
        conf: &GenConf,
    ) -> Result<(String, usize)> {
        self.client.chat(&self.model, system, history, conf).await
    }

    fn max_length(&self) -> usize {
        self.max_length
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn health_check(&self) -> Result<bool> {
        self.client.health_check().await
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_shape() {
        let request = ChatRequest {
            model: "llama3.2:3b",
            messages: vec![ChatMessage::user("hi")],
            stream: false,
            options: ChatOptions { temperature: Some(0.3), num_predict: None },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["options"], serde_json::json!({"temperature": 0.3f32}));
    }

    #[test]
    fn test_parse_responses() {
        let embed: EmbedResponse =
            serde_json::from_str(r#"{"embeddings": [[0.1, 0.2]], "prompt_eval_count": 3}"#).unwrap();
        assert_eq!(embed.embeddings.len(), 1);
        assert_eq!(embed.prompt_eval_count, 3);

        let chat: ChatResponse = serde_json::from_str(
            r#"{"message": {"role": "assistant", "content": "ok"}, "eval_count": 2}"#,
        )
        .unwrap();
        assert_eq!(chat.message.content, "ok");
        assert_eq!(chat.prompt_eval_count + chat.eval_count, 2);
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_after_retries() {
        let config = LlmConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout_secs: 1,
            max_retries: 0,
            ..Default::default()
        };
        let client = OllamaClient::new(&config).unwrap();
        assert!(!client.health_check().await.unwrap());
        assert!(client.embed("m", &["x".to_string()]).await.is_err());
    }
}
