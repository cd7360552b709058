//! Decomposition through execution and progress sync, with in-process backends

use async_trait::async_trait;
use std::sync::Arc;
use tempfile::TempDir;

use ruvector_ingest::config::{DecomposeConfig, WorkerConfig};
use ruvector_ingest::ingestion::{ChunkParser, ParseRequest, ParsedChunk, ParserRegistry, ProgressFn};
use ruvector_ingest::processing::{MemoryQueue, ProgressSync, TaskDecomposer, TaskExecutor, TaskOutcome, WorkQueue};
use ruvector_ingest::providers::mock::{sample_pdf, MockChat, MockEmbedder, MockModelFactory};
use ruvector_ingest::providers::{index_name, BlobStore, DocStore, LocalBlobStore};
use ruvector_ingest::storage::{MetadataDb, SqliteDocStore};
use ruvector_ingest::{Document, DocumentType, Knowledgebase, ParserConfig, ParserKind, RunStatus, Tenant};
use serde_json::json;

struct Pipeline {
    _dir: TempDir,
    db: MetadataDb,
    blobs: Arc<LocalBlobStore>,
    store: Arc<SqliteDocStore>,
    queue: Arc<MemoryQueue>,
    decomposer: Arc<TaskDecomposer>,
    kb: Knowledgebase,
}

impl Pipeline {
    fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let db = MetadataDb::in_memory().expect("metadata db");
        let blobs = Arc::new(LocalBlobStore::new(dir.path().join("blobs")).expect("blob store"));
        let store = Arc::new(SqliteDocStore::in_memory().expect("doc store"));
        let queue = Arc::new(MemoryQueue::default());
        let decomposer = Arc::new(TaskDecomposer::new(
            db.clone(),
            blobs.clone(),
            store.clone(),
            queue.clone(),
            DecomposeConfig::default(),
        ));

        let tenant = Tenant {
            id: "tenant-1".into(),
            llm_id: "chat".into(),
            ..Default::default()
        };
        let kb = Knowledgebase::new(&tenant.id, "manuals", "embed");
        db.upsert_tenant(&tenant).expect("tenant");
        db.upsert_knowledgebase(&kb).expect("kb");

        Self { _dir: dir, db, blobs, store, queue, decomposer, kb }
    }

    fn executor(&self, registry: ParserRegistry) -> TaskExecutor {
        let models = MockModelFactory::new(
            Arc::new(MockEmbedder::new(16)),
            Arc::new(MockChat::fixed("nothing to add")),
        );
        TaskExecutor::new(
            "task_consumer_0",
            self.db.clone(),
            self.queue.clone(),
            self.blobs.clone(),
            self.store.clone(),
            Arc::new(models),
            Arc::new(registry),
            WorkerConfig::default(),
        )
    }

    async fn upload_pdf(&self, name: &str, pages: usize) -> Document {
        let texts: Vec<String> = (1..=pages)
            .map(|i| format!("Section {} explains part {} of the manual.", i, i))
            .collect();
        let pdf = sample_pdf(&texts).expect("pdf");
        let doc = Document::new(&self.kb.id, name, name, DocumentType::Pdf, ParserKind::Naive, pdf.len() as u64);
        self.blobs.put(&self.kb.id, name, &pdf).await.expect("upload");
        self.db.upsert_document(&doc).expect("document");
        doc
    }

    fn stored_chunks(&self) -> usize {
        self.store.count(&index_name("tenant-1"), &self.kb.id).expect("count")
    }

    fn kb_counters(&self) -> (u64, u64) {
        let kb = self.db.get_knowledgebase(&self.kb.id).expect("load").expect("kb");
        (kb.token_num, kb.chunk_num)
    }
}

async fn drain(executor: &TaskExecutor) -> Vec<TaskOutcome> {
    let mut outcomes = Vec::new();
    while let Some(outcome) = executor.handle_task().await.expect("handle task") {
        outcomes.push(outcome);
    }
    outcomes
}

#[tokio::test]
async fn pdf_is_split_executed_and_completed() {
    let pipeline = Pipeline::new();
    let doc = pipeline.upload_pdf("manual.pdf", 25).await;

    let tasks = pipeline.decomposer.queue_tasks(&doc.id).await.expect("decompose");
    let ranges: Vec<(u32, u32)> = tasks.iter().map(|t| (t.from_page, t.to_page)).collect();
    assert_eq!(ranges, vec![(0, 12), (12, 24), (24, 25)]);

    let executor = pipeline.executor(ParserRegistry::with_defaults());
    let outcomes = drain(&executor).await;
    assert_eq!(outcomes, vec![TaskOutcome::Completed; 3]);

    let tasks = pipeline.db.get_tasks(&doc.id).expect("tasks");
    let chunk_ids: Vec<String> = tasks.iter().flat_map(|t| t.chunk_id_list()).collect();
    assert!(tasks.iter().all(|t| t.progress == 1.0));
    assert!(!chunk_ids.is_empty());
    assert_eq!(pipeline.stored_chunks(), chunk_ids.len());

    // standard chunks of the second range start after page 12
    let chunks = pipeline
        .store
        .chunk_list(&doc.id, &index_name("tenant-1"), &[pipeline.kb.id.clone()])
        .await
        .expect("chunk list");
    assert!(chunks.iter().any(|c| c.idx == 12_001));
    assert!(chunks.iter().all(|c| c.vector.as_ref().map(Vec::len) == Some(16)));

    let sync = ProgressSync::new(pipeline.db.clone(), pipeline.decomposer.clone());
    assert_eq!(sync.sync_once().await.expect("sync"), 1);
    let doc = pipeline.db.get_document(&doc.id).expect("load").expect("document");
    assert_eq!(doc.run, RunStatus::Done);
    assert_eq!(doc.progress, 1.0);
    assert_eq!(doc.chunk_num, chunk_ids.len() as u64);
}

#[tokio::test]
async fn reparse_with_same_config_reuses_every_range() {
    let pipeline = Pipeline::new();
    let doc = pipeline.upload_pdf("manual.pdf", 14).await;
    pipeline.decomposer.queue_tasks(&doc.id).await.expect("decompose");
    let executor = pipeline.executor(ParserRegistry::with_defaults());
    drain(&executor).await;
    let stored = pipeline.stored_chunks();

    let tasks = pipeline.decomposer.queue_tasks(&doc.id).await.expect("requeue");
    assert!(tasks.iter().all(|t| t.progress == 1.0));
    assert!(tasks
        .iter()
        .all(|t| t.progress_msg.ends_with("Reused previous task's chunks.")));

    // nothing new to do and nothing deleted
    assert!(executor.handle_task().await.expect("handle").is_none());
    assert_eq!(pipeline.stored_chunks(), stored);
    let doc = pipeline.db.get_document(&doc.id).expect("load").expect("document");
    assert_eq!(doc.chunk_num, stored as u64);
    assert_eq!(pipeline.kb_counters().1, stored as u64);
}

#[tokio::test]
async fn reparse_with_new_config_keeps_counters_in_step() {
    let pipeline = Pipeline::new();
    let doc = pipeline.upload_pdf("manual.pdf", 3).await;
    pipeline.decomposer.queue_tasks(&doc.id).await.expect("decompose");
    let executor = pipeline.executor(ParserRegistry::with_defaults());
    drain(&executor).await;
    let (first_tokens, first_chunks) = pipeline.kb_counters();
    assert!(first_tokens > 0);
    assert_eq!(first_chunks, pipeline.stored_chunks() as u64);

    let changed = doc
        .clone()
        .with_parser_config(ParserConfig::from_value(json!({"chunk_token_num": 64})));
    pipeline.db.upsert_document(&changed).expect("update config");
    pipeline.decomposer.queue_tasks(&doc.id).await.expect("requeue");
    assert_eq!(pipeline.stored_chunks(), 0);
    assert_eq!(pipeline.kb_counters(), (0, 0));

    assert_eq!(drain(&executor).await, vec![TaskOutcome::Completed]);
    let (tokens, chunks) = pipeline.kb_counters();
    assert_eq!(chunks, pipeline.stored_chunks() as u64);
    assert!(tokens > 0);
    let doc = pipeline.db.get_document(&doc.id).expect("load").expect("document");
    assert_eq!((doc.token_num, doc.chunk_num), (tokens, chunks));
}

/// Cancels its own document while parsing
struct CancelingParser {
    db: MetadataDb,
    doc_id: String,
}

#[async_trait]
impl ChunkParser for CancelingParser {
    async fn chunk(
        &self,
        _request: &ParseRequest<'_>,
        progress: ProgressFn<'_>,
    ) -> ruvector_ingest::Result<Vec<ParsedChunk>> {
        self.db.set_document_run(&self.doc_id, RunStatus::Canceled)?;
        progress(Some(0.3), "Parsing")?;
        Ok(vec![ParsedChunk::text("never stored", vec![1])])
    }

    fn name(&self) -> &str {
        "canceling"
    }
}

#[tokio::test]
async fn cancellation_stops_the_task_without_storing() {
    let pipeline = Pipeline::new();
    let doc = pipeline.upload_pdf("manual.pdf", 3).await;
    let tasks = pipeline.decomposer.queue_tasks(&doc.id).await.expect("decompose");

    let mut registry = ParserRegistry::new();
    registry.register(
        ParserKind::Naive,
        Arc::new(CancelingParser {
            db: pipeline.db.clone(),
            doc_id: doc.id.clone(),
        }),
    );
    let executor = pipeline.executor(registry);

    assert_eq!(drain(&executor).await, vec![TaskOutcome::Canceled]);
    let task = pipeline.db.get_task(&tasks[0].id).expect("load").expect("task");
    assert_eq!(task.progress, -1.0);
    assert!(task.progress_msg.contains("[Canceled]"));
    assert_eq!(pipeline.stored_chunks(), 0);

    let state = executor.state().lock().clone();
    assert_eq!((state.done, state.failed), (1, 0));
    assert_eq!(pipeline.queue.group_info().await.expect("info").pending, 0);
}
