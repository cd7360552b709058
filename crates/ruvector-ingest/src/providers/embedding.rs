//! Embedding provider trait for generating text embeddings

use async_trait::async_trait;
use crate::error::Result;

/// Trait for generating text embeddings
///
/// Implementations:
/// - `OllamaEmbedder`: Local Ollama server (nomic-embed-text)
/// - `MockEmbedder`: deterministic vectors for tests
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Encode a batch of texts
    ///
    /// Returns one vector per input (same order) and the number of tokens consumed.
    async fn encode(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, usize)>;

    /// Maximum input length in tokens
    fn max_length(&self) -> usize;

    /// Model name, used in cache keys
    fn model(&self) -> &str;

    /// Check if the provider is healthy and available
    async fn health_check(&self) -> Result<bool>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
