//! Chunk records written to the document store

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Deterministic chunk id: hex digest of content followed by the document id
pub fn chunk_id(content: &str, doc_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update(doc_id.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// Name of the vector field for a given dimension, e.g. `q_768_vec`
pub fn vector_field_name(dim: usize) -> String {
    format!("q_{}_vec", dim)
}

/// Leaf chunk summarized by a RAPTOR chunk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MixedRef {
    pub idx: i64,
    pub id: String,
}

/// A unit of indexed content
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub doc_id: String,
    pub kb_id: String,
    /// Ordering key; standard chunks `from_page * 1000 + i + 1`, RAPTOR chunks above 100000000
    pub idx: i64,
    pub content_with_weight: String,
    pub content_ltks: String,
    pub content_sm_ltks: String,
    pub docnm_kwd: String,
    pub title_tks: String,
    pub title_sm_tks: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub important_kwd: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub important_tks: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub question_kwd: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub question_tks: String,
    /// Tags carried by chunks of a tag knowledge base
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_kwd: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tag_feas: BTreeMap<String, f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub page_num_int: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagerank_fea: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mixed: Vec<MixedRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raptor_kwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
    pub created_at: String,
    pub create_timestamp_flt: f64,
}

impl Chunk {
    /// New chunk with id and timestamps filled in
    pub fn new(doc_id: &str, kb_id: &str, content: impl Into<String>) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            id: chunk_id(&content, doc_id),
            doc_id: doc_id.to_string(),
            kb_id: kb_id.to_string(),
            content_with_weight: content,
            created_at: now.format("%Y-%m-%d %H:%M:%S").to_string(),
            create_timestamp_flt: now.timestamp_millis() as f64 / 1000.0,
            ..Default::default()
        }
    }

    /// Vector field name derived from the stored vector
    pub fn vector_field(&self) -> Option<String> {
        self.vector.as_ref().map(|v| vector_field_name(v.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_is_deterministic() {
        assert_eq!(chunk_id("hello", "doc1"), chunk_id("hello", "doc1"));
        assert_ne!(chunk_id("hello", "doc1"), chunk_id("hello", "doc2"));
        assert_eq!(chunk_id("hello", "doc1").len(), 16);
    }

    #[test]
    fn test_new_chunk_uses_content_id() {
        let chunk = Chunk::new("doc1", "kb1", "some text");
        assert_eq!(chunk.id, chunk_id("some text", "doc1"));
        assert_eq!(chunk.kb_id, "kb1");
        assert!(chunk.vector_field().is_none());
    }

    #[test]
    fn test_vector_field_name() {
        let mut chunk = Chunk::new("d", "k", "x");
        chunk.vector = Some(vec![0.0; 768]);
        assert_eq!(chunk.vector_field().as_deref(), Some("q_768_vec"));
    }
}
