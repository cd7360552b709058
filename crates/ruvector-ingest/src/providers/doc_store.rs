//! Document store trait: the combined full-text / vector index for chunks

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::types::{Chunk, ParserKind};

/// Index holding every knowledge base of a tenant
pub fn index_name(tenant_id: &str) -> String {
    format!("ruvector_{}", tenant_id)
}

/// Selects chunks by id and/or owning document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkFilter {
    pub ids: Vec<String>,
    pub doc_id: Option<String>,
}

impl ChunkFilter {
    pub fn ids(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            doc_id: None,
        }
    }

    pub fn doc(doc_id: impl Into<String>) -> Self {
        Self {
            ids: Vec::new(),
            doc_id: Some(doc_id.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.doc_id.is_none()
    }
}

/// Trait for chunk storage
///
/// Implementations:
/// - `SqliteDocStore`: SQLite table with an FTS5 shadow index
#[async_trait]
pub trait DocStore: Send + Sync {
    /// Create the index for a knowledge base; no-op when it exists
    async fn create_index(&self, index: &str, kb_id: &str, vector_size: usize) -> Result<()>;

    async fn index_exists(&self, index: &str, kb_id: &str) -> Result<bool>;

    /// Upsert chunks by id
    async fn insert(&self, chunks: &[Chunk], index: &str, kb_id: &str) -> Result<()>;

    /// Merge `patch` (a JSON object of chunk fields) into matching chunks
    async fn update(
        &self,
        filter: &ChunkFilter,
        patch: &serde_json::Value,
        index: &str,
        kb_id: &str,
    ) -> Result<usize>;

    /// Delete matching chunks; an empty filter deletes nothing
    async fn delete(&self, filter: &ChunkFilter, index: &str, kb_id: &str) -> Result<usize>;

    /// All chunks of a document ordered by `idx`, vectors included
    async fn chunk_list(&self, doc_id: &str, index: &str, kb_ids: &[String]) -> Result<Vec<Chunk>>;

    /// Tag occurrence counts across the given knowledge bases
    async fn all_tags(&self, index: &str, kb_ids: &[String]) -> Result<BTreeMap<String, u64>>;

    /// Whether chunks produced by this parser can be stored
    fn supports_parser(&self, _parser: ParserKind) -> bool {
        true
    }

    /// Get provider name for logging
    fn name(&self) -> &str;
}
