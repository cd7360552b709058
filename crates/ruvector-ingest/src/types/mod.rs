//! Core types for the ingestion pipeline

pub mod chunk;
pub mod document;
pub mod parser_config;
pub mod task;

pub use chunk::{chunk_id, vector_field_name, Chunk, MixedRef};
pub use document::{
    ChunkingConfig, Document, DocumentType, Knowledgebase, ParserKind, RunStatus, Tenant,
};
pub use parser_config::{ParserConfig, RaptorConfig};
pub use task::{task_digest, Task, TaskContext, TaskMessage, TaskType, UNBOUNDED_PAGE};
