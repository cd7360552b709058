//! Work units: one page range (or row range) of one document

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::document::{ChunkingConfig, Document, Knowledgebase, Tenant};

/// Upper page bound meaning "until the end of the document"
pub const UNBOUNDED_PAGE: u32 = 100_000_000;

/// Kind of work a task performs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Parse, chunk, embed and store a page range
    #[default]
    Standard,
    /// Hierarchical summarization over a document's stored chunks
    Raptor,
    /// Knowledge graph extraction (queued for a downstream extractor; skipped by this worker)
    Graphrag,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Raptor => "raptor",
            Self::Graphrag => "graphrag",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "raptor" => Self::Raptor,
            "graphrag" => Self::Graphrag,
            _ => Self::Standard,
        }
    }
}

/// Persistent task record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub doc_id: String,
    /// First page, inclusive
    pub from_page: u32,
    /// Last page, exclusive
    pub to_page: u32,
    pub task_type: TaskType,
    pub digest: String,
    /// `[0, 1]` while healthy, negative once failed
    pub progress: f32,
    pub progress_msg: String,
    pub retry_count: u32,
    /// Space separated ids of stored chunks
    pub chunk_ids: String,
    pub begin_at: Option<DateTime<Utc>>,
    pub process_duration: f64,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(doc_id: impl Into<String>, from_page: u32, to_page: u32, task_type: TaskType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            doc_id: doc_id.into(),
            from_page,
            to_page,
            task_type,
            digest: String::new(),
            progress: 0.0,
            progress_msg: String::new(),
            retry_count: 0,
            chunk_ids: String::new(),
            begin_at: None,
            process_duration: 0.0,
            created_at: Utc::now(),
        }
    }

    pub fn chunk_id_list(&self) -> Vec<String> {
        self.chunk_ids.split_whitespace().map(str::to_string).collect()
    }

    /// `Page(a~b)` label for bounded ranges, 1-based
    pub fn page_label(&self) -> Option<String> {
        page_label(self.from_page, self.to_page)
    }
}

pub(crate) fn page_label(from_page: u32, to_page: u32) -> Option<String> {
    if to_page > 0 && from_page < to_page && to_page < UNBOUNDED_PAGE {
        Some(format!("Page({}~{})", from_page + 1, to_page + 1))
    } else {
        None
    }
}

/// Queue payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMessage {
    pub id: String,
    pub doc_id: String,
    #[serde(default)]
    pub task_type: TaskType,
    pub from_page: u32,
    pub to_page: u32,
}

impl From<&Task> for TaskMessage {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            doc_id: task.doc_id.clone(),
            task_type: task.task_type,
            from_page: task.from_page,
            to_page: task.to_page,
        }
    }
}

/// A claimed task joined with everything needed to execute it
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task: Task,
    pub doc: Document,
    pub kb: Knowledgebase,
    pub tenant: Tenant,
}

impl TaskContext {
    /// Embedding model: knowledge base setting, then tenant default
    pub fn embd_id(&self) -> &str {
        if self.kb.embd_id.is_empty() {
            &self.tenant.embd_id
        } else {
            &self.kb.embd_id
        }
    }

    pub fn llm_id(&self) -> &str {
        &self.tenant.llm_id
    }

    pub fn language(&self) -> &str {
        &self.kb.language
    }

    pub fn chunking_config(&self) -> ChunkingConfig {
        ChunkingConfig::from_parts(&self.doc, &self.kb, &self.tenant)
    }
}

/// Stable digest of everything that determines a task's output
///
/// Fields are hashed in key order with nested objects canonicalized, so the
/// digest does not depend on how the configuration was serialized.
pub fn task_digest(
    config: &ChunkingConfig,
    doc_id: &str,
    from_page: u32,
    to_page: u32,
    task_type: Option<TaskType>,
) -> String {
    let mut hasher = Sha256::new();

    if let Ok(Value::Object(fields)) = serde_json::to_value(config) {
        let mut keys: Vec<&String> = fields.keys().collect();
        keys.sort();
        for key in keys {
            hasher.update(canonical_json(&fields[key.as_str()]).as_bytes());
        }
    }

    hasher.update(doc_id.as_bytes());
    hasher.update(from_page.to_string().as_bytes());
    hasher.update(to_page.to_string().as_bytes());
    if let Some(task_type) = task_type {
        hasher.update(task_type.as_str().as_bytes());
    }

    hex::encode(&hasher.finalize()[..8])
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k.as_str()])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(parser_config: Value) -> ChunkingConfig {
        ChunkingConfig {
            id: "doc1".into(),
            kb_id: "kb1".into(),
            parser_id: "naive".into(),
            parser_config,
            language: "English".into(),
            embd_id: "embed".into(),
            tenant_id: "t1".into(),
            img2txt_id: String::new(),
            asr_id: String::new(),
            llm_id: "chat".into(),
        }
    }

    #[test]
    fn test_digest_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"a": 1, "b": {"x": 1, "y": [1, 2]}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b": {"y": [1, 2], "x": 1}, "a": 1}"#).unwrap();
        assert_eq!(
            task_digest(&config(a), "doc1", 0, 12, None),
            task_digest(&config(b), "doc1", 0, 12, None)
        );
    }

    #[test]
    fn test_digest_changes_with_inputs() {
        let base = task_digest(&config(json!({"chunk_token_num": 128})), "doc1", 0, 12, None);
        assert_ne!(base, task_digest(&config(json!({"chunk_token_num": 256})), "doc1", 0, 12, None));
        assert_ne!(base, task_digest(&config(json!({"chunk_token_num": 128})), "doc1", 12, 24, None));
        assert_ne!(
            base,
            task_digest(&config(json!({"chunk_token_num": 128})), "doc1", 0, 12, Some(TaskType::Raptor))
        );
        assert_eq!(base.len(), 16);
    }

    #[test]
    fn test_page_label() {
        assert_eq!(page_label(0, 12).as_deref(), Some("Page(1~13)"));
        assert_eq!(page_label(0, UNBOUNDED_PAGE), None);
        assert_eq!(page_label(0, 0), None);
        assert_eq!(page_label(5, 5), None);
    }

    #[test]
    fn test_chunk_id_list() {
        let mut task = Task::new("doc", 0, 12, TaskType::Standard);
        task.chunk_ids = "a b  c".into();
        assert_eq!(task.chunk_id_list(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_message_defaults_to_standard() {
        let msg: TaskMessage =
            serde_json::from_str(r#"{"id":"t","doc_id":"d","from_page":0,"to_page":1}"#).unwrap();
        assert_eq!(msg.task_type, TaskType::Standard);
    }
}
