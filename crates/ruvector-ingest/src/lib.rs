//! ruvector-ingest: document ingestion pipeline for the ruvector knowledge base
//!
//! Documents are split into page-range tasks, queued on a durable work
//! queue and executed by worker processes: parse, chunk, enrich, embed,
//! optionally summarize into a RAPTOR tree, then store. Progress and
//! cancellation flow through the metadata database at every step.

pub mod cache;
pub mod config;
pub mod error;
pub mod generation;
pub mod ingestion;
pub mod processing;
pub mod providers;
pub mod raptor;
pub mod storage;
pub mod types;

pub use config::IngestConfig;
pub use error::{Error, Result};
pub use processing::{
    MemoryQueue, ProgressSync, TaskDecomposer, TaskExecutor, TaskOutcome, WorkQueue, WorkerState,
};
pub use types::{
    Chunk, Document, DocumentType, Knowledgebase, ParserConfig, ParserKind, RunStatus, Task,
    TaskMessage, TaskType, Tenant, UNBOUNDED_PAGE,
};
