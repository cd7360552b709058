//! Splits documents into page-range tasks and queues them

use chrono::Local;
use std::sync::Arc;

use crate::config::DecomposeConfig;
use crate::error::{Error, Result};
use crate::ingestion::page_count::{pdf_page_count, table_row_count};
use crate::providers::{index_name, BlobStore, ChunkFilter, DocStore};
use crate::storage::MetadataDb;
use crate::types::{
    task_digest, ChunkingConfig, Document, DocumentType, ParserKind, Task, TaskMessage, TaskType,
    UNBOUNDED_PAGE,
};

use super::queue::WorkQueue;

/// Page size that keeps a whole PDF in one task
const WHOLE_DOCUMENT: u32 = 1_000_000_000;

/// Turns a document into tasks, reusing chunks of unchanged ranges
pub struct TaskDecomposer {
    db: MetadataDb,
    blobs: Arc<dyn BlobStore>,
    doc_store: Arc<dyn DocStore>,
    queue: Arc<dyn WorkQueue>,
    config: DecomposeConfig,
}

impl TaskDecomposer {
    pub fn new(
        db: MetadataDb,
        blobs: Arc<dyn BlobStore>,
        doc_store: Arc<dyn DocStore>,
        queue: Arc<dyn WorkQueue>,
        config: DecomposeConfig,
    ) -> Self {
        Self {
            db,
            blobs,
            doc_store,
            queue,
            config,
        }
    }

    /// Replace the task set of a document and queue the units left to do
    ///
    /// Units whose digest and start page match a finished previous unit take
    /// over its chunks instead of being queued. Chunks of previous units that
    /// were not taken over are deleted from the document store.
    pub async fn queue_tasks(&self, doc_id: &str) -> Result<Vec<Task>> {
        let doc = self
            .db
            .get_document(doc_id)?
            .ok_or_else(|| Error::DocumentNotFound(doc_id.to_string()))?;
        let config = self
            .db
            .get_chunking_config(doc_id)?
            .ok_or_else(|| Error::DocumentNotFound(doc_id.to_string()))?;

        let mut tasks: Vec<Task> = self
            .ranges(&doc)
            .await?
            .into_iter()
            .map(|(from, to)| {
                let mut task = Task::new(&doc.id, from, to, TaskType::Standard);
                task.digest = task_digest(&config, &doc.id, from, to, None);
                task
            })
            .collect();

        let mut previous = self.db.get_tasks(&doc.id)?;
        let mut reused = 0u64;
        for task in &mut tasks {
            reused += reuse_previous_chunks(task, &mut previous) as u64;
        }

        self.db.replace_tasks(&doc.id, &tasks, reused)?;

        let stale: Vec<String> = previous.iter().flat_map(Task::chunk_id_list).collect();
        if !stale.is_empty() {
            let deleted = self
                .doc_store
                .delete(&ChunkFilter::ids(stale), &index_name(&config.tenant_id), &config.kb_id)
                .await?;
            tracing::info!("Deleted {} stale chunk(s) of {}", deleted, doc.name);
        }

        self.db.begin_to_parse(&doc.id)?;

        let mut queued = 0usize;
        for task in tasks.iter().filter(|t| t.progress < 1.0) {
            self.queue
                .enqueue(&TaskMessage::from(task))
                .await
                .map_err(|e| Error::queue(format!("Can't access the work queue: {}", e)))?;
            queued += 1;
        }
        tracing::info!(
            "Document {} split into {} task(s): {} queued, {} chunk(s) reused",
            doc.name,
            tasks.len(),
            queued,
            reused
        );
        Ok(tasks)
    }

    /// Queue a whole-document follow-up task (RAPTOR or GraphRAG)
    ///
    /// Returns `None` when the document already has a task of that type.
    pub async fn queue_followup(&self, doc_id: &str, task_type: TaskType) -> Result<Option<Task>> {
        if self.db.has_task_of_type(doc_id, task_type)? {
            tracing::debug!("Document {} already has a {} task", doc_id, task_type.as_str());
            return Ok(None);
        }
        let config: ChunkingConfig = self
            .db
            .get_chunking_config(doc_id)?
            .ok_or_else(|| Error::DocumentNotFound(doc_id.to_string()))?;

        let mut task = Task::new(doc_id, UNBOUNDED_PAGE, UNBOUNDED_PAGE, task_type);
        task.digest = task_digest(&config, doc_id, UNBOUNDED_PAGE, UNBOUNDED_PAGE, Some(task_type));
        task.progress_msg = format!(
            "{} Start to do {}",
            Local::now().format("%H:%M:%S"),
            task_type.as_str().to_uppercase()
        );
        self.db.insert_task(&task)?;
        self.queue
            .enqueue(&TaskMessage::from(&task))
            .await
            .map_err(|e| Error::queue(format!("Can't access the work queue: {}", e)))?;

        tracing::info!("Queued {} task {} for document {}", task_type.as_str(), task.id, doc_id);
        Ok(Some(task))
    }

    /// `[from, to)` ranges for the document's work units
    async fn ranges(&self, doc: &Document) -> Result<Vec<(u32, u32)>> {
        if doc.doc_type == DocumentType::Pdf {
            let binary = self.blobs.get(&doc.kb_id, &doc.location).await?;
            let pages = pdf_page_count(&doc.name, &binary)?;
            return Ok(pdf_ranges(doc, pages, &self.config));
        }

        if doc.parser_id == ParserKind::Table {
            let binary = self.blobs.get(&doc.kb_id, &doc.location).await?;
            let rows = table_row_count(&doc.name, &binary)?;
            let step = self.config.table_rows_per_task.max(1);
            return Ok((0..rows)
                .step_by(step as usize)
                .map(|from| (from, from.saturating_add(step).min(rows)))
                .collect());
        }

        Ok(vec![(0, UNBOUNDED_PAGE)])
    }
}

/// Page ranges of a PDF with `pages` pages
fn pdf_ranges(doc: &Document, pages: u32, config: &DecomposeConfig) -> Vec<(u32, u32)> {
    let parser_config = &doc.parser_config;
    let mut page_size = match doc.parser_id {
        ParserKind::Paper => parser_config.task_page_size().unwrap_or(config.paper_page_size),
        _ => parser_config.task_page_size().unwrap_or(config.task_page_size),
    };
    if matches!(doc.parser_id, ParserKind::One | ParserKind::KnowledgeGraph)
        || parser_config.layout_recognize() != "DeepDOC"
    {
        page_size = WHOLE_DOCUMENT;
    }
    let page_size = page_size.max(1);

    let mut ranges = Vec::new();
    for (start, end) in parser_config.pages() {
        let start = start.saturating_sub(1);
        let end = end.saturating_sub(1).min(pages);
        let mut from = start;
        while from < end {
            let to = from.saturating_add(page_size).min(end);
            ranges.push((from, to));
            from = to;
        }
    }
    ranges
}

/// Take over the chunks of the first previous unit with the same start and digest
///
/// Returns how many chunk ids were reused. The previous unit gives up its
/// ids so they are not deleted afterwards.
fn reuse_previous_chunks(task: &mut Task, previous: &mut [Task]) -> usize {
    let Some(prev) = previous
        .iter_mut()
        .find(|p| p.from_page == task.from_page && p.digest == task.digest)
    else {
        return 0;
    };
    if prev.progress < 1.0 || prev.chunk_ids.trim().is_empty() {
        return 0;
    }

    task.chunk_ids = std::mem::take(&mut prev.chunk_ids);
    task.progress = 1.0;
    let label = task
        .page_label()
        .map(|l| format!("{}: ", l))
        .unwrap_or_default();
    task.progress_msg = format!(
        "{} {}Reused previous task's chunks.",
        Local::now().format("%H:%M:%S"),
        label
    );
    task.chunk_id_list().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::queue::MemoryQueue;
    use crate::providers::mock::sample_pdf;
    use crate::providers::LocalBlobStore;
    use crate::storage::SqliteDocStore;
    use crate::types::{Chunk, Knowledgebase, ParserConfig, Tenant};
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: MetadataDb,
        blobs: Arc<LocalBlobStore>,
        store: Arc<SqliteDocStore>,
        queue: Arc<MemoryQueue>,
        decomposer: TaskDecomposer,
        kb: Knowledgebase,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = MetadataDb::in_memory().unwrap();
        let blobs = Arc::new(LocalBlobStore::new(dir.path().to_path_buf()).unwrap());
        let store = Arc::new(SqliteDocStore::in_memory().unwrap());
        let queue = Arc::new(MemoryQueue::default());
        let tenant = Tenant { id: "t1".into(), ..Default::default() };
        let kb = Knowledgebase::new("t1", "kb", "embed");
        db.upsert_tenant(&tenant).unwrap();
        db.upsert_knowledgebase(&kb).unwrap();

        let decomposer = TaskDecomposer::new(
            db.clone(),
            blobs.clone(),
            store.clone(),
            queue.clone(),
            DecomposeConfig::default(),
        );
        Fixture { _dir: dir, db, blobs, store, queue, decomposer, kb }
    }

    async fn add_pdf(f: &Fixture, pages: usize, config: serde_json::Value) -> Document {
        let texts: Vec<String> = (1..=pages).map(|i| format!("Page {} text", i)).collect();
        let pdf = sample_pdf(&texts).unwrap();
        let doc = Document::new(&f.kb.id, "report.pdf", "report.pdf", DocumentType::Pdf, ParserKind::Naive, pdf.len() as u64)
            .with_parser_config(ParserConfig::from_value(config));
        f.blobs.put(&f.kb.id, &doc.location, &pdf).await.unwrap();
        f.db.upsert_document(&doc).unwrap();
        doc
    }

    #[tokio::test]
    async fn test_pdf_split_into_page_ranges() {
        let f = fixture();
        let doc = add_pdf(&f, 25, json!({})).await;

        let tasks = f.decomposer.queue_tasks(&doc.id).await.unwrap();
        let ranges: Vec<(u32, u32)> = tasks.iter().map(|t| (t.from_page, t.to_page)).collect();
        assert_eq!(ranges, vec![(0, 12), (12, 24), (24, 25)]);
        assert_eq!(f.queue.group_info().await.unwrap().lag, 3);

        let stored = f.db.get_document(&doc.id).unwrap().unwrap();
        assert!(stored.progress > 0.0 && stored.progress < 0.01);
        assert_eq!(f.db.get_tasks(&doc.id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_selected_pages_and_whole_document_parsers() {
        let f = fixture();
        let doc = add_pdf(&f, 25, json!({"pages": [[3, 8]], "task_page_size": 2})).await;
        let ranges: Vec<(u32, u32)> = f
            .decomposer
            .queue_tasks(&doc.id)
            .await
            .unwrap()
            .iter()
            .map(|t| (t.from_page, t.to_page))
            .collect();
        assert_eq!(ranges, vec![(2, 4), (4, 6), (6, 7)]);

        let plain = add_pdf(&f, 25, json!({"layout_recognize": "Plain Text"})).await;
        let tasks = f.decomposer.queue_tasks(&plain.id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!((tasks[0].from_page, tasks[0].to_page), (0, 25));
    }

    #[tokio::test]
    async fn test_table_rows_and_plain_documents() {
        let f = fixture();
        let decomposer = TaskDecomposer::new(
            f.db.clone(),
            f.blobs.clone(),
            f.store.clone(),
            f.queue.clone(),
            DecomposeConfig { table_rows_per_task: 2, ..Default::default() },
        );

        let csv = b"name,age\na,1\nb,2\nc,3\nd,4\ne,5\n";
        let table = Document::new(&f.kb.id, "people.csv", "people.csv", DocumentType::Doc, ParserKind::Table, csv.len() as u64);
        f.blobs.put(&f.kb.id, &table.location, csv).await.unwrap();
        f.db.upsert_document(&table).unwrap();
        let ranges: Vec<(u32, u32)> = decomposer
            .queue_tasks(&table.id)
            .await
            .unwrap()
            .iter()
            .map(|t| (t.from_page, t.to_page))
            .collect();
        assert_eq!(ranges, vec![(0, 2), (2, 4), (4, 5)]);

        let note = Document::new(&f.kb.id, "note.txt", "note.txt", DocumentType::Doc, ParserKind::Naive, 5);
        f.db.upsert_document(&note).unwrap();
        let tasks = decomposer.queue_tasks(&note.id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!((tasks[0].from_page, tasks[0].to_page), (0, UNBOUNDED_PAGE));
    }

    #[tokio::test]
    async fn test_unchanged_ranges_reuse_chunks() {
        let f = fixture();
        let doc = add_pdf(&f, 25, json!({})).await;
        let first = f.decomposer.queue_tasks(&doc.id).await.unwrap();

        // Finish the first unit with two stored chunks and the last with one
        let index = index_name("t1");
        f.store.create_index(&index, &f.kb.id, 4).await.unwrap();
        let chunks: Vec<Chunk> = (0..3).map(|i| Chunk::new(&doc.id, &f.kb.id, format!("c{}", i))).collect();
        f.store.insert(&chunks, &index, &f.kb.id).await.unwrap();
        f.db.update_chunk_ids(&first[0].id, &format!("{} {}", chunks[0].id, chunks[1].id)).unwrap();
        f.db.update_task_progress(&first[0].id, Some(1.0), "").unwrap();
        f.db.update_chunk_ids(&first[2].id, &chunks[2].id).unwrap();
        f.db.update_task_progress(&first[2].id, Some(0.5), "").unwrap();

        let second = f.decomposer.queue_tasks(&doc.id).await.unwrap();
        assert_eq!(second[0].progress, 1.0);
        assert_eq!(second[0].chunk_id_list().len(), 2);
        assert!(second[0].progress_msg.ends_with("Page(1~13): Reused previous task's chunks."));
        assert_eq!(second[1].progress, 0.0);

        // Unfinished unit's chunk is gone, reused ones stay
        assert_eq!(f.store.count(&index, &f.kb.id).unwrap(), 2);
        let stored = f.db.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(stored.chunk_num, 2);
        // 3 from the first round plus the 2 unfinished units of the second
        assert_eq!(f.queue.group_info().await.unwrap().lag, 5);
    }

    #[tokio::test]
    async fn test_config_change_invalidates_reuse() {
        let f = fixture();
        let doc = add_pdf(&f, 25, json!({})).await;
        let first = f.decomposer.queue_tasks(&doc.id).await.unwrap();
        assert_eq!(first.len(), 3);

        // every unit finished with one stored chunk
        let index = index_name("t1");
        f.store.create_index(&index, &f.kb.id, 4).await.unwrap();
        for (i, task) in first.iter().enumerate() {
            let chunk = Chunk::new(&doc.id, &f.kb.id, format!("unit {}", i));
            f.store.insert(std::slice::from_ref(&chunk), &index, &f.kb.id).await.unwrap();
            f.db.update_chunk_ids(&task.id, &chunk.id).unwrap();
            f.db.update_task_progress(&task.id, Some(1.0), "").unwrap();
        }
        assert_eq!(f.store.count(&index, &f.kb.id).unwrap(), 3);

        let changed = doc.clone().with_parser_config(ParserConfig::from_value(json!({"chunk_token_num": 64})));
        f.db.upsert_document(&changed).unwrap();
        let second = f.decomposer.queue_tasks(&doc.id).await.unwrap();

        assert_eq!(second.len(), 3);
        for (new, old) in second.iter().zip(&first) {
            assert_eq!(new.progress, 0.0);
            assert!(new.chunk_ids.is_empty());
            assert_ne!(new.digest, old.digest);
        }
        assert_eq!(f.store.count(&index, &f.kb.id).unwrap(), 0);
        assert_eq!(f.db.get_document(&doc.id).unwrap().unwrap().chunk_num, 0);
    }

    #[tokio::test]
    async fn test_missing_config_aborts_without_changes() {
        let f = fixture();
        let orphan = Document::new("no-such-kb", "a.txt", "a.txt", DocumentType::Doc, ParserKind::Naive, 1);
        f.db.upsert_document(&orphan).unwrap();

        assert!(f.decomposer.queue_tasks(&orphan.id).await.is_err());
        assert!(f.db.get_tasks(&orphan.id).unwrap().is_empty());
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_followup_queued_once() {
        let f = fixture();
        let note = Document::new(&f.kb.id, "note.txt", "note.txt", DocumentType::Doc, ParserKind::Naive, 5);
        f.db.upsert_document(&note).unwrap();

        let task = f.decomposer.queue_followup(&note.id, TaskType::Raptor).await.unwrap().unwrap();
        assert_eq!((task.from_page, task.to_page), (UNBOUNDED_PAGE, UNBOUNDED_PAGE));
        assert_eq!(task.task_type, TaskType::Raptor);
        assert!(f.decomposer.queue_followup(&note.id, TaskType::Raptor).await.unwrap().is_none());

        let claimed = f.queue.claim("c").await.unwrap().unwrap();
        assert_eq!(claimed.payload.task_type, TaskType::Raptor);
    }
}
