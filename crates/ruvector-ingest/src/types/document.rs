//! Document, knowledge base and tenant records referenced by ingestion tasks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::parser_config::ParserConfig;

/// Coarse document type, decided at upload time
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    /// PDF document
    Pdf,
    /// Word processing / spreadsheet / plain text
    Doc,
    /// Image
    Visual,
    /// Audio
    Aural,
    /// Placeholder without a blob
    Virtual,
    /// Anything else
    #[default]
    Other,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Doc => "doc",
            Self::Visual => "visual",
            Self::Aural => "aural",
            Self::Virtual => "virtual",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pdf" => Self::Pdf,
            "doc" => Self::Doc,
            "visual" => Self::Visual,
            "aural" => Self::Aural,
            "virtual" => Self::Virtual,
            _ => Self::Other,
        }
    }
}

/// Document run state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Unstarted,
    Running,
    Canceled,
    Done,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Running => "running",
            Self::Canceled => "canceled",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "canceled" => Self::Canceled,
            "done" => Self::Done,
            "failed" => Self::Failed,
            _ => Self::Unstarted,
        }
    }
}

/// Chunking method selected for a document
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    Naive,
    Qa,
    Resume,
    Manual,
    Table,
    Paper,
    Book,
    Laws,
    Presentation,
    Picture,
    One,
    Audio,
    Email,
    KnowledgeGraph,
    Tag,
}

impl ParserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Naive => "naive",
            Self::Qa => "qa",
            Self::Resume => "resume",
            Self::Manual => "manual",
            Self::Table => "table",
            Self::Paper => "paper",
            Self::Book => "book",
            Self::Laws => "laws",
            Self::Presentation => "presentation",
            Self::Picture => "picture",
            Self::One => "one",
            Self::Audio => "audio",
            Self::Email => "email",
            Self::KnowledgeGraph => "knowledge_graph",
            Self::Tag => "tag",
        }
    }

    /// Parse a stored parser id; unknown ids yield `None`
    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s.to_lowercase().as_str() {
            "naive" | "general" => Self::Naive,
            "qa" => Self::Qa,
            "resume" => Self::Resume,
            "manual" => Self::Manual,
            "table" => Self::Table,
            "paper" => Self::Paper,
            "book" => Self::Book,
            "laws" => Self::Laws,
            "presentation" => Self::Presentation,
            "picture" => Self::Picture,
            "one" => Self::One,
            "audio" => Self::Audio,
            "email" => Self::Email,
            "knowledge_graph" => Self::KnowledgeGraph,
            "tag" => Self::Tag,
            _ => return None,
        };
        Some(kind)
    }
}

impl std::fmt::Display for ParserKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uploaded document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub kb_id: String,
    pub parser_id: ParserKind,
    pub parser_config: ParserConfig,
    pub name: String,
    pub doc_type: DocumentType,
    /// Blob key inside the knowledge base bucket
    pub location: String,
    pub size: u64,
    pub token_num: u64,
    pub chunk_num: u64,
    pub progress: f32,
    pub progress_msg: String,
    pub run: RunStatus,
    pub process_begin_at: Option<DateTime<Utc>>,
    pub process_duration: f64,
    pub meta_fields: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Create a fresh, unstarted document
    pub fn new(
        kb_id: impl Into<String>,
        name: impl Into<String>,
        location: impl Into<String>,
        doc_type: DocumentType,
        parser_id: ParserKind,
        size: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            kb_id: kb_id.into(),
            parser_id,
            parser_config: ParserConfig::default(),
            name: name.into(),
            doc_type,
            location: location.into(),
            size,
            token_num: 0,
            chunk_num: 0,
            progress: 0.0,
            progress_msg: String::new(),
            run: RunStatus::Unstarted,
            process_begin_at: None,
            process_duration: 0.0,
            meta_fields: serde_json::Value::Object(Default::default()),
            created_at: Utc::now(),
        }
    }

    pub fn with_parser_config(mut self, parser_config: ParserConfig) -> Self {
        self.parser_config = parser_config;
        self
    }

    /// Lower-cased file extension of the document name
    pub fn extension(&self) -> String {
        std::path::Path::new(&self.name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default()
    }
}

/// A knowledge base groups documents sharing an index and embedding model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Knowledgebase {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub language: String,
    /// Embedding model id
    pub embd_id: String,
    pub pagerank: i64,
    pub parser_config: ParserConfig,
    pub token_num: u64,
    pub chunk_num: u64,
}

impl Knowledgebase {
    pub fn new(tenant_id: impl Into<String>, name: impl Into<String>, embd_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            language: "English".to_string(),
            embd_id: embd_id.into(),
            pagerank: 0,
            parser_config: ParserConfig::default(),
            token_num: 0,
            chunk_num: 0,
        }
    }
}

/// Model defaults of the owning account
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub llm_id: String,
    pub embd_id: String,
    pub img2txt_id: String,
    pub asr_id: String,
}

/// Every field that influences chunk output; hashed into the task digest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkingConfig {
    pub id: String,
    pub kb_id: String,
    pub parser_id: String,
    /// Parser config without the `raptor` and `graphrag` sections
    pub parser_config: serde_json::Value,
    pub language: String,
    pub embd_id: String,
    pub tenant_id: String,
    pub img2txt_id: String,
    pub asr_id: String,
    pub llm_id: String,
}

impl ChunkingConfig {
    pub fn from_parts(doc: &Document, kb: &Knowledgebase, tenant: &Tenant) -> Self {
        Self {
            id: doc.id.clone(),
            kb_id: kb.id.clone(),
            parser_id: doc.parser_id.as_str().to_string(),
            parser_config: doc.parser_config.without_keys(&["raptor", "graphrag"]),
            language: kb.language.clone(),
            embd_id: kb.embd_id.clone(),
            tenant_id: tenant.id.clone(),
            img2txt_id: tenant.img2txt_id.clone(),
            asr_id: tenant.asr_id.clone(),
            llm_id: tenant.llm_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_kind_roundtrip() {
        for kind in [ParserKind::Naive, ParserKind::Table, ParserKind::KnowledgeGraph] {
            assert_eq!(ParserKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ParserKind::parse("general"), Some(ParserKind::Naive));
        assert_eq!(ParserKind::parse("unknown"), None);
    }

    #[test]
    fn test_chunking_config_strips_raptor() {
        let config = ParserConfig::from_value(serde_json::json!({
            "chunk_token_num": 256,
            "raptor": {"use_raptor": true},
            "graphrag": {"use_graphrag": false}
        }));
        let doc = Document::new("kb", "a.pdf", "a.pdf", DocumentType::Pdf, ParserKind::Naive, 10)
            .with_parser_config(config);
        let kb = Knowledgebase::new("t1", "kb", "embed");
        let tenant = Tenant { id: "t1".into(), ..Default::default() };

        let cfg = ChunkingConfig::from_parts(&doc, &kb, &tenant);
        assert_eq!(cfg.parser_config, serde_json::json!({"chunk_token_num": 256}));
        assert_eq!(cfg.parser_id, "naive");
    }

    #[test]
    fn test_extension() {
        let doc = Document::new("kb", "Report.PDF", "x", DocumentType::Pdf, ParserKind::Naive, 1);
        assert_eq!(doc.extension(), "pdf");
    }
}
