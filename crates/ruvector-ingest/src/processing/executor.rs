//! Task executor: claim, validate, process, store, acknowledge

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::ResponseCache;
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::ingestion::{extract_doc_metadata, ChunkBuilder, ParserRegistry};
use crate::providers::{index_name, BlobStore, ChunkFilter, DocStore, EmbeddingProvider, ModelFactory};
use crate::raptor::run_raptor;
use crate::storage::MetadataDb;
use crate::types::{Chunk, RunStatus, TaskContext, TaskMessage, TaskType};

use super::embedder::embed_chunks;
use super::progress::ProgressReporter;
use super::queue::{QueueMessage, WorkQueue};

/// Counters shared with the heartbeat
#[derive(Debug, Clone, Default)]
pub struct WorkerState {
    pub done: u64,
    pub failed: u64,
    pub pending: u64,
    pub lag: u64,
    pub current_task: Option<TaskMessage>,
}

pub type SharedWorkerState = Arc<Mutex<WorkerState>>;

/// How one claimed message ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Chunks stored (or nothing to store), progress 1
    Completed,
    /// Stopped by a cancellation request
    Canceled,
    /// Progress -1
    Failed,
    /// Not executed: unknown, abandoned, already started or canceled before start
    Discarded,
}

/// Single-consumer task loop
pub struct TaskExecutor {
    consumer: String,
    db: MetadataDb,
    queue: Arc<dyn WorkQueue>,
    doc_store: Arc<dyn DocStore>,
    models: Arc<dyn ModelFactory>,
    builder: ChunkBuilder,
    cache: Arc<ResponseCache>,
    config: WorkerConfig,
    state: SharedWorkerState,
}

impl TaskExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumer: impl Into<String>,
        db: MetadataDb,
        queue: Arc<dyn WorkQueue>,
        blobs: Arc<dyn BlobStore>,
        doc_store: Arc<dyn DocStore>,
        models: Arc<dyn ModelFactory>,
        registry: Arc<ParserRegistry>,
        config: WorkerConfig,
    ) -> Self {
        let cache = Arc::new(ResponseCache::default());
        let builder = ChunkBuilder::new(
            registry,
            blobs,
            doc_store.clone(),
            cache.clone(),
            config.max_content_length,
        );
        Self {
            consumer: consumer.into(),
            db,
            queue,
            doc_store,
            models,
            builder,
            cache,
            config,
            state: Arc::new(Mutex::new(WorkerState::default())),
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Handle on the counters, for the heartbeat
    pub fn state(&self) -> SharedWorkerState {
        self.state.clone()
    }

    /// Claim and run tasks until the future is dropped
    pub async fn run(&self) {
        tracing::info!("{} started on the {} queue", self.consumer, self.queue.name());
        let idle = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            match self.handle_task().await {
                Ok(Some(outcome)) => tracing::debug!("{} finished a task: {:?}", self.consumer, outcome),
                Ok(None) => tokio::time::sleep(idle).await,
                Err(e) => {
                    tracing::error!("{} failed to claim a task: {}", self.consumer, e);
                    tokio::time::sleep(idle).await;
                }
            }
        }
    }

    /// Run one claimed message to completion; `None` when the queue is empty
    ///
    /// The message is acknowledged whatever the outcome.
    pub async fn handle_task(&self) -> Result<Option<TaskOutcome>> {
        let Some(message) = self.claim().await? else {
            return Ok(None);
        };

        let outcome = self.process(&message).await;
        if let Err(e) = self.queue.ack(&message).await {
            tracing::error!("Failed to ack {}: {}", message.message_id, e);
        }
        Ok(Some(outcome))
    }

    /// Messages left unacknowledged by an earlier run come first
    async fn claim(&self) -> Result<Option<QueueMessage>> {
        if let Some(message) = self.queue.claim_pending(&self.consumer).await? {
            tracing::info!("{} resumes unacked task {}", self.consumer, message.payload.id);
            return Ok(Some(message));
        }
        self.queue.claim(&self.consumer).await
    }

    async fn process(&self, message: &QueueMessage) -> TaskOutcome {
        let task_id = &message.payload.id;
        let ctx = match self.db.get_pending_task(task_id, self.config.max_retries) {
            Ok(Some(ctx)) => ctx,
            Ok(None) => {
                tracing::warn!("{} task {} is not pending, discarded", self.consumer, task_id);
                self.state.lock().done += 1;
                return TaskOutcome::Discarded;
            }
            Err(e) => {
                tracing::error!("{} could not load task {}: {}", self.consumer, task_id, e);
                self.state.lock().failed += 1;
                return TaskOutcome::Failed;
            }
        };
        if ctx.doc.run == RunStatus::Canceled || ctx.doc.progress < 0.0 {
            tracing::info!("Document {} was canceled before task {} started", ctx.doc.id, task_id);
            self.state.lock().done += 1;
            return TaskOutcome::Discarded;
        }

        self.state.lock().current_task = Some(message.payload.clone());
        if let Err(e) = self.db.set_task_begin(task_id) {
            tracing::error!("Failed to stamp begin of task {}: {}", task_id, e);
        }

        let reporter = ProgressReporter::new(self.db.clone(), task_id, ctx.task.from_page, ctx.task.to_page);
        let outcome = match self.do_handle_task(&ctx, &reporter).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_canceled() => {
                tracing::info!("Task {} canceled", task_id);
                let _ = reporter.fail("handle_task got TaskCanceledException");
                TaskOutcome::Canceled
            }
            Err(e) => {
                tracing::error!("Task {} failed: {}", task_id, e);
                let _ = reporter.fail(&format!("[Exception]: {}", e));
                TaskOutcome::Failed
            }
        };

        let mut state = self.state.lock();
        match outcome {
            TaskOutcome::Failed => state.failed += 1,
            _ => state.done += 1,
        }
        state.current_task = None;
        outcome
    }

    async fn do_handle_task(&self, ctx: &TaskContext, reporter: &ProgressReporter) -> Result<TaskOutcome> {
        let task = &ctx.task;
        let doc = &ctx.doc;
        let started = Instant::now();

        if self.db.check_cancel(&task.id)? {
            reporter.fail("Task has been canceled.")?;
            return Err(Error::Canceled);
        }

        if !self.doc_store.supports_parser(doc.parser_id) {
            reporter.fail(&format!(
                "{} parsing method is not supported by the document store, please use other parsing methods",
                capitalize(doc.parser_id.as_str())
            ))?;
            return Ok(TaskOutcome::Failed);
        }

        let embedder = match self.models.embedding_model(&ctx.tenant.id, ctx.embd_id()) {
            Ok(model) => model,
            Err(e) => {
                tracing::error!("Binding embedding model {} failed: {}", ctx.embd_id(), e);
                reporter.fail(&format!("Fail to bind embedding model: {}", e))?;
                return Err(e);
            }
        };
        let (probe, _) = embedder.encode(&["ok".to_string()]).await?;
        let vector_size = probe
            .first()
            .map(Vec::len)
            .ok_or_else(|| Error::embedding("Empty probe embedding"))?;
        let index = index_name(&ctx.tenant.id);
        self.doc_store.create_index(&index, &doc.kb_id, vector_size).await?;

        let (chunks, token_count) = match task.task_type {
            TaskType::Raptor => {
                let chat = match self.models.chat_model(&ctx.tenant.id, ctx.llm_id()) {
                    Ok(model) => model,
                    Err(e) => {
                        reporter.fail(&format!("Fail to bind LLM used by RAPTOR: {}", e))?;
                        return Err(e);
                    }
                };
                let progress = |p: Option<f32>, msg: &str| reporter.set(p, msg);
                let (chunks, tokens) = run_raptor(
                    ctx,
                    self.doc_store.as_ref(),
                    chat,
                    embedder.clone(),
                    self.cache.clone(),
                    &progress,
                )
                .await?;
                reporter.message(&format!("RAPTOR produced {} summary chunk(s)", chunks.len()))?;
                (chunks, tokens)
            }
            TaskType::Graphrag => {
                reporter.set(
                    Some(1.0),
                    "Knowledge graph extraction is not available in this worker, skipped.",
                )?;
                return Ok(TaskOutcome::Completed);
            }
            TaskType::Standard => {
                let mut chunks = self.builder.build(ctx, self.models.as_ref(), reporter).await?;
                tracing::info!(
                    "Build document {}: {} chunk(s) in {:.2}s",
                    doc.name,
                    chunks.len(),
                    started.elapsed().as_secs_f64()
                );
                if chunks.is_empty() {
                    reporter.set(Some(1.0), &format!("No chunk built from {}", doc.name))?;
                    return Ok(TaskOutcome::Completed);
                }

                if doc.parser_config.extract_metadata() {
                    self.extract_metadata(ctx, &chunks).await;
                }
                reporter.message(&format!("Generate {} chunks", chunks.len()))?;

                let tokens = self.embed(ctx, embedder.as_ref(), &mut chunks, reporter).await?;
                (chunks, tokens)
            }
        };

        if !self.store(ctx, &chunks, reporter).await? {
            return Ok(TaskOutcome::Discarded);
        }

        self.db
            .increment_chunk_num(&doc.id, &doc.kb_id, token_count, chunks.len() as u64, 0.0)?;
        let elapsed = started.elapsed().as_secs_f64();
        self.db.set_task_duration(&task.id, elapsed)?;
        reporter.set(Some(1.0), &format!("Done ({:.2}s)", elapsed))?;
        tracing::info!(
            "Chunk doc({}), page({}-{}), chunks({}), token({}), elapsed:{:.2}",
            doc.id,
            task.from_page,
            task.to_page,
            chunks.len(),
            token_count,
            elapsed
        );
        Ok(TaskOutcome::Completed)
    }

    /// Best effort: failures are logged and the task goes on
    async fn extract_metadata(&self, ctx: &TaskContext, chunks: &[Chunk]) {
        let chat = match self.models.chat_model(&ctx.tenant.id, ctx.llm_id()) {
            Ok(chat) => chat,
            Err(e) => {
                tracing::warn!("Metadata extraction skipped for {}: {}", ctx.doc.name, e);
                return;
            }
        };
        match extract_doc_metadata(chat.as_ref(), &ctx.doc.name, chunks).await {
            Ok(Some(meta)) => {
                if let Err(e) = self.db.update_meta_fields(&ctx.doc.id, &meta) {
                    tracing::warn!("Saving metadata of {} failed: {}", ctx.doc.name, e);
                }
            }
            Ok(None) => tracing::debug!("No metadata found in {}", ctx.doc.name),
            Err(e) => tracing::warn!("Metadata extraction failed for {}: {}", ctx.doc.name, e),
        }
    }

    async fn embed(
        &self,
        ctx: &TaskContext,
        embedder: &dyn EmbeddingProvider,
        chunks: &mut [Chunk],
        reporter: &ProgressReporter,
    ) -> Result<u64> {
        let weight = ctx
            .doc
            .parser_config
            .filename_embd_weight()
            .unwrap_or(self.config.filename_embd_weight);
        let progress = |p: Option<f32>, msg: &str| reporter.set(p, msg);

        let start = Instant::now();
        match embed_chunks(chunks, embedder, weight, self.config.embed_batch_size, &progress).await {
            Ok((tokens, _)) => {
                reporter.message(&format!("Embedding chunks ({:.2}s)", start.elapsed().as_secs_f64()))?;
                Ok(tokens)
            }
            Err(e) if e.is_canceled() => Err(e),
            Err(e) => {
                tracing::error!("Embedding {} failed: {}", ctx.doc.name, e);
                reporter.fail(&format!("Generate embedding error:{}", e))?;
                Err(e)
            }
        }
    }

    /// Insert chunks batch by batch, recording stored ids on the task
    ///
    /// Returns `false` when the task disappeared mid-way; its chunks are
    /// removed again.
    async fn store(&self, ctx: &TaskContext, chunks: &[Chunk], reporter: &ProgressReporter) -> Result<bool> {
        let index = index_name(&ctx.tenant.id);
        let kb_id = &ctx.doc.kb_id;
        let batch_size = self.config.insert_batch_size.max(1);
        let progress_every = self.config.progress_every.max(1);
        let mut stored_ids: Vec<String> = Vec::with_capacity(chunks.len());
        let start = Instant::now();

        for (b, batch) in chunks.chunks(batch_size).enumerate() {
            let offset = b * batch_size;
            let batch_ids: Vec<String> = batch.iter().map(|c| c.id.clone()).collect();

            if let Err(e) = self.doc_store.insert(batch, &index, kb_id).await {
                tracing::error!("Insert chunk error for {}: {}", ctx.doc.name, e);
                if let Err(cleanup) = self.doc_store.delete(&ChunkFilter::ids(batch_ids), &index, kb_id).await {
                    tracing::warn!("Removing a failed batch of {} failed: {}", ctx.doc.name, cleanup);
                }
                reporter.fail(&format!(
                    "Insert chunk error: {}, please check log file and document store status!",
                    e
                ))?;
                return Err(e);
            }

            // Recorded before the checkpoint: a canceled task still owns what it stored
            stored_ids.extend(batch_ids);
            if let Err(e) = self.db.update_chunk_ids(&ctx.task.id, &stored_ids.join(" ")) {
                tracing::warn!("Recording chunk ids of task {} failed: {}", ctx.task.id, e);
                self.doc_store
                    .delete(&ChunkFilter::ids(stored_ids), &index, kb_id)
                    .await?;
                return match e {
                    Error::TaskNotFound(_) => Ok(false),
                    other => Err(other),
                };
            }

            if offset % progress_every == 0 {
                reporter.set(Some(0.8 + 0.1 * (offset + 1) as f32 / chunks.len() as f32), "")?;
            }
        }

        tracing::info!(
            "Indexing doc({}), page({}-{}), chunks({}), elapsed: {:.2}",
            ctx.doc.name,
            ctx.task.from_page,
            ctx.task.to_page,
            chunks.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(true)
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
