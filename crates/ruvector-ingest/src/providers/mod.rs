//! Provider abstractions for models, chunk storage and blob storage
//!
//! The executor only talks to these traits, so backends can be swapped
//! per deployment (Ollama + SQLite + filesystem by default).

pub mod blob_store;
pub mod doc_store;
pub mod embedding;
pub mod factory;
pub mod llm;
pub mod local;
pub mod mock;
pub mod ollama;

pub use blob_store::BlobStore;
pub use doc_store::{index_name, ChunkFilter, DocStore};
pub use embedding::EmbeddingProvider;
pub use factory::{ModelFactory, OllamaModelFactory};
pub use llm::{ChatMessage, ChatProvider, GenConf};
pub use local::LocalBlobStore;
pub use ollama::{OllamaChat, OllamaClient, OllamaEmbedder};
