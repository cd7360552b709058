//! Turns one task's page range into enriched chunks

use std::sync::Arc;
use std::time::Instant;

use crate::cache::ResponseCache;
use crate::error::{Error, Result};
use crate::processing::progress::ProgressReporter;
use crate::providers::{BlobStore, ChatProvider, DocStore, ModelFactory};
use crate::types::{Chunk, TaskContext};

use super::augment::Augmenter;
use super::parser::{ParseRequest, ParserRegistry};
use super::text::{fine_grained_tokenize, tokenize};

/// Parses, stores images and runs augmentation passes for a task
pub struct ChunkBuilder {
    registry: Arc<ParserRegistry>,
    blobs: Arc<dyn BlobStore>,
    doc_store: Arc<dyn DocStore>,
    cache: Arc<ResponseCache>,
    max_content_length: u64,
}

impl ChunkBuilder {
    pub fn new(
        registry: Arc<ParserRegistry>,
        blobs: Arc<dyn BlobStore>,
        doc_store: Arc<dyn DocStore>,
        cache: Arc<ResponseCache>,
        max_content_length: u64,
    ) -> Self {
        Self {
            registry,
            blobs,
            doc_store,
            cache,
            max_content_length,
        }
    }

    /// Build the chunks of `ctx.task`; empty when the parser found nothing
    pub async fn build(
        &self,
        ctx: &TaskContext,
        models: &dyn ModelFactory,
        reporter: &ProgressReporter,
    ) -> Result<Vec<Chunk>> {
        let doc = &ctx.doc;
        if doc.size > self.max_content_length {
            let message = format!(
                "File size exceeds( <= {}Mb )",
                self.max_content_length / 1024 / 1024
            );
            reporter.fail(&message)?;
            return Err(Error::file_parse(&doc.name, message));
        }

        let parser = match self.registry.get(doc.parser_id) {
            Ok(parser) => parser,
            Err(e) => {
                reporter.fail(&e.to_string())?;
                return Err(e);
            }
        };

        let start = Instant::now();
        let binary = match self.blobs.get(&doc.kb_id, &doc.location).await {
            Ok(binary) => binary,
            Err(e) => {
                let message = match &e {
                    Error::ObjectNotFound { .. } => format!(
                        "Can not find file <{}> from storage. Could you try it again?",
                        doc.name
                    ),
                    other => format!("Get file from storage: {}", other),
                };
                tracing::error!("Fetching {}/{} failed: {}", doc.kb_id, doc.location, e);
                reporter.fail(&message)?;
                return Err(e);
            }
        };
        tracing::info!(
            "From storage({}/{}) got {} bytes in {:.2}s",
            doc.kb_id,
            doc.location,
            binary.len(),
            start.elapsed().as_secs_f64()
        );

        let request = ParseRequest {
            name: &doc.name,
            binary: &binary,
            from_page: ctx.task.from_page,
            to_page: ctx.task.to_page,
            language: ctx.language(),
            kb_id: &doc.kb_id,
            tenant_id: &ctx.tenant.id,
            parser_config: &doc.parser_config,
        };
        let progress = |p: Option<f32>, msg: &str| reporter.set(p, msg);

        let start = Instant::now();
        let parsed = match parser.chunk(&request, &progress).await {
            Ok(parsed) => parsed,
            Err(e) if e.is_canceled() => return Err(e),
            Err(e) => {
                tracing::error!("Chunking {} with {} failed: {}", doc.name, parser.name(), e);
                reporter.fail(&format!("Internal server error while chunking: {}", e))?;
                return Err(e);
            }
        };
        tracing::info!(
            "Chunking({:.2}s) {}/{} produced {} chunk(s)",
            start.elapsed().as_secs_f64(),
            doc.kb_id,
            doc.name,
            parsed.len()
        );

        let title_tks = tokenize(&doc.name);
        let title_sm_tks = fine_grained_tokenize(&title_tks);
        let mut chunks = Vec::with_capacity(parsed.len());
        let start = Instant::now();

        for (i, item) in parsed.into_iter().enumerate() {
            let mut chunk = Chunk::new(&doc.id, &doc.kb_id, item.content);
            chunk.idx = ctx.task.from_page as i64 * 1000 + i as i64 + 1;
            chunk.docnm_kwd = doc.name.clone();
            chunk.title_tks = title_tks.clone();
            chunk.title_sm_tks = title_sm_tks.clone();
            chunk.content_ltks = tokenize(&chunk.content_with_weight);
            chunk.content_sm_ltks = fine_grained_tokenize(&chunk.content_ltks);
            chunk.page_num_int = item.page_num_int;
            if ctx.kb.pagerank != 0 {
                chunk.pagerank_fea = Some(ctx.kb.pagerank);
            }

            if let Some(image) = item.image {
                self.blobs.put(&doc.kb_id, &chunk.id, &image).await?;
                chunk.img_id = Some(format!("{}-{}", doc.kb_id, chunk.id));
            }
            chunks.push(chunk);
        }
        if start.elapsed().as_secs_f64() > 0.1 {
            tracing::info!("Stored chunk images in {:.2}s", start.elapsed().as_secs_f64());
        }

        if chunks.is_empty() {
            return Ok(chunks);
        }

        self.augment(ctx, models, &mut chunks, &progress).await?;
        Ok(chunks)
    }

    async fn augment(
        &self,
        ctx: &TaskContext,
        models: &dyn ModelFactory,
        chunks: &mut [Chunk],
        progress: super::parser::ProgressFn<'_>,
    ) -> Result<()> {
        let config = &ctx.doc.parser_config;
        let keywords = config.auto_keywords();
        let questions = config.auto_questions();
        let tag_kb_ids = ctx.kb.parser_config.tag_kb_ids();

        if keywords == 0 && questions == 0 && tag_kb_ids.is_empty() {
            return Ok(());
        }

        let chat: Arc<dyn ChatProvider> = match models.chat_model(&ctx.tenant.id, ctx.llm_id()) {
            Ok(chat) => chat,
            Err(e) => {
                tracing::warn!("Augmentation skipped for {}, chat model unavailable: {}", ctx.doc.name, e);
                return Ok(());
            }
        };
        let augmenter = Augmenter::new(chat, self.cache.clone());

        if keywords > 0 {
            augmenter.add_keywords(chunks, keywords, progress).await?;
        }
        if questions > 0 {
            augmenter.add_questions(chunks, questions, progress).await?;
        }
        if !tag_kb_ids.is_empty() {
            let topn = ctx.kb.parser_config.topn_tags();
            if let Err(e) = augmenter
                .add_tags(chunks, self.doc_store.as_ref(), &ctx.tenant.id, &tag_kb_ids, topn, progress)
                .await
            {
                if e.is_canceled() {
                    return Err(e);
                }
                tracing::warn!("Tagging skipped for {}: {}", ctx.doc.name, e);
            }
        }
        Ok(())
    }
}
