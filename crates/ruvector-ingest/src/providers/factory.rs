//! Binds model ids to provider instances per tenant

use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::Result;

use super::embedding::EmbeddingProvider;
use super::llm::ChatProvider;
use super::ollama::{OllamaChat, OllamaClient, OllamaEmbedder};

/// Resolves the embedding and chat models a task should use
pub trait ModelFactory: Send + Sync {
    /// Bind an embedding model; an empty id selects the deployment default
    fn embedding_model(&self, tenant_id: &str, model_id: &str) -> Result<Arc<dyn EmbeddingProvider>>;

    /// Bind a chat model; an empty id selects the deployment default
    fn chat_model(&self, tenant_id: &str, model_id: &str) -> Result<Arc<dyn ChatProvider>>;
}

/// Every tenant shares one Ollama server
pub struct OllamaModelFactory {
    client: Arc<OllamaClient>,
    config: LlmConfig,
}

impl OllamaModelFactory {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            client: Arc::new(OllamaClient::new(config)?),
            config: config.clone(),
        })
    }
}

/// Model ids may carry a factory suffix (`model@Ollama`)
fn strip_factory(model_id: &str) -> &str {
    model_id.split('@').next().unwrap_or(model_id)
}

impl ModelFactory for OllamaModelFactory {
    fn embedding_model(&self, tenant_id: &str, model_id: &str) -> Result<Arc<dyn EmbeddingProvider>> {
        let model = match strip_factory(model_id) {
            "" => self.config.embed_model.as_str(),
            name => name,
        };
        tracing::debug!("Binding embedding model {} for tenant {}", model, tenant_id);
        Ok(Arc::new(OllamaEmbedder::from_client(
            Arc::clone(&self.client),
            model,
            self.config.context_size,
        )))
    }

    fn chat_model(&self, tenant_id: &str, model_id: &str) -> Result<Arc<dyn ChatProvider>> {
        let model = match strip_factory(model_id) {
            "" => self.config.chat_model.as_str(),
            name => name,
        };
        tracing::debug!("Binding chat model {} for tenant {}", model, tenant_id);
        Ok(Arc::new(OllamaChat::from_client(
            Arc::clone(&self.client),
            model,
            self.config.context_size,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_and_explicit_models() {
        let factory = OllamaModelFactory::new(&LlmConfig::default()).unwrap();

        let embd = factory.embedding_model("t1", "").unwrap();
        assert_eq!(embd.model(), "nomic-embed-text");

        let chat = factory.chat_model("t1", "qwen2.5:7b@Ollama").unwrap();
        assert_eq!(chat.model(), "qwen2.5:7b");
        assert_eq!(chat.max_length(), 8192);
    }
}
