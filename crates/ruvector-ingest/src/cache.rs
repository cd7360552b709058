//! Response cache for model calls
//!
//! Entries are keyed by `(model, input digest, params digest)`. The cache is
//! a pure optimisation: a miss falls through to the backend and populates it.

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Default capacity per entry kind
const DEFAULT_MAX_ENTRIES: usize = 50_000;

/// Cache key for one model call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub model: String,
    pub input_digest: String,
    pub params_digest: String,
}

impl CacheKey {
    pub fn new<P: Serialize + ?Sized>(model: &str, input: &str, params: &P) -> Self {
        let params = serde_json::to_string(params).unwrap_or_default();
        Self {
            model: model.to_string(),
            input_digest: digest(input),
            params_digest: digest(&params),
        }
    }
}

fn digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// In-process cache for chat answers, embeddings and tag sets
pub struct ResponseCache {
    chat: DashMap<CacheKey, String>,
    embeddings: DashMap<CacheKey, Vec<f32>>,
    tag_sets: DashMap<String, BTreeMap<String, f32>>,
    max_entries: usize,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            chat: DashMap::new(),
            embeddings: DashMap::new(),
            tag_sets: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn get_chat(&self, key: &CacheKey) -> Option<String> {
        let hit = self.chat.get(key).map(|v| v.clone());
        if hit.is_some() {
            tracing::debug!("Chat cache hit for {}", key.model);
        }
        hit
    }

    pub fn put_chat(&self, key: CacheKey, answer: String) {
        make_room(&self.chat, self.max_entries);
        self.chat.insert(key, answer);
    }

    pub fn get_embedding(&self, key: &CacheKey) -> Option<Vec<f32>> {
        self.embeddings.get(key).map(|v| v.clone())
    }

    pub fn put_embedding(&self, key: CacheKey, vector: Vec<f32>) {
        make_room(&self.embeddings, self.max_entries);
        self.embeddings.insert(key, vector);
    }

    /// Tag portions for a set of tag knowledge bases
    pub fn get_tags(&self, kb_ids: &[String]) -> Option<BTreeMap<String, f32>> {
        self.tag_sets.get(&tag_key(kb_ids)).map(|v| v.clone())
    }

    pub fn put_tags(&self, kb_ids: &[String], tags: BTreeMap<String, f32>) {
        make_room(&self.tag_sets, self.max_entries);
        self.tag_sets.insert(tag_key(kb_ids), tags);
    }

    pub fn len(&self) -> usize {
        self.chat.len() + self.embeddings.len() + self.tag_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.chat.clear();
        self.embeddings.clear();
        self.tag_sets.clear();
    }
}

fn tag_key(kb_ids: &[String]) -> String {
    let mut ids = kb_ids.to_vec();
    ids.sort();
    ids.join(",")
}

/// Drop an arbitrary entry once the map is full
fn make_room<K, V>(map: &DashMap<K, V>, max_entries: usize)
where
    K: Eq + std::hash::Hash + Clone,
{
    if map.len() < max_entries {
        return;
    }
    let victim = map.iter().next().map(|entry| entry.key().clone());
    if let Some(key) = victim {
        map.remove(&key);
    }
}
