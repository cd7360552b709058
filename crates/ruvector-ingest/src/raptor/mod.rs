//! RAPTOR: recursive abstractive summaries over a document's chunks

pub mod gmm;
pub mod projection;
pub mod summarizer;

pub use summarizer::{RaptorItem, RaptorSummarizer};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::cache::ResponseCache;
use crate::error::Result;
use crate::ingestion::parser::ProgressFn;
use crate::ingestion::text::{fine_grained_tokenize, num_tokens, tokenize};
use crate::providers::{index_name, ChatProvider, DocStore, EmbeddingProvider};
use crate::types::{Chunk, MixedRef, TaskContext};

/// First `idx` handed to summary chunks
pub const RAPTOR_IDX_BASE: i64 = 100_000_001;

/// Default cluster ceiling when the configuration leaves it out
pub const DEFAULT_MAX_CLUSTER: usize = 64;

/// Summarize the indexed chunks of `ctx.doc` into new chunks
///
/// Returns the summary chunks and their token count. Summaries covering a
/// single leaf and repeated leaf sets are dropped.
pub async fn run_raptor(
    ctx: &TaskContext,
    doc_store: &dyn DocStore,
    chat: Arc<dyn ChatProvider>,
    embedder: Arc<dyn EmbeddingProvider>,
    cache: Arc<ResponseCache>,
    progress: ProgressFn<'_>,
) -> Result<(Vec<Chunk>, u64)> {
    let config = ctx.doc.parser_config.raptor();
    let stored = doc_store
        .chunk_list(&ctx.doc.id, &index_name(&ctx.tenant.id), &[ctx.doc.kb_id.clone()])
        .await?;

    let mut ids_by_idx: HashMap<i64, String> = HashMap::new();
    let mut items = Vec::new();
    for chunk in stored.into_iter().filter(|c| c.mixed.is_empty() && c.raptor_kwd.is_none()) {
        let Some(vector) = chunk.vector else { continue };
        ids_by_idx.insert(chunk.idx, chunk.id.clone());
        items.push(RaptorItem::leaf(chunk.content_with_weight, vector, chunk.idx));
    }
    tracing::info!("RAPTOR over {} chunk(s) of {}", items.len(), ctx.doc.name);

    let max_cluster = if config.max_cluster == 0 {
        DEFAULT_MAX_CLUSTER
    } else {
        config.max_cluster
    };
    let summarizer = RaptorSummarizer::new(
        max_cluster,
        chat,
        embedder,
        config.prompt.clone(),
        config.max_token,
        config.threshold,
        cache,
    );
    let summaries = summarizer.build(items, config.random_seed, progress).await?;

    let title_tks = tokenize(&ctx.doc.name);
    let title_sm_tks = fine_grained_tokenize(&title_tks);
    let mut seen: HashSet<BTreeSet<i64>> = HashSet::new();
    let mut chunks = Vec::new();
    let mut tokens = 0u64;

    for item in summaries {
        if item.leaves.len() <= 1 || !seen.insert(item.leaves.clone()) {
            continue;
        }

        let mut chunk = Chunk::new(&ctx.doc.id, &ctx.doc.kb_id, item.content);
        chunk.idx = RAPTOR_IDX_BASE + chunks.len() as i64;
        chunk.docnm_kwd = ctx.doc.name.clone();
        chunk.title_tks = title_tks.clone();
        chunk.title_sm_tks = title_sm_tks.clone();
        chunk.content_ltks = tokenize(&chunk.content_with_weight);
        chunk.content_sm_ltks = fine_grained_tokenize(&chunk.content_ltks);
        chunk.raptor_kwd = Some("raptor".to_string());
        chunk.mixed = item
            .leaves
            .iter()
            .filter_map(|idx| {
                ids_by_idx.get(idx).map(|id| MixedRef { idx: *idx, id: id.clone() })
            })
            .collect();
        if ctx.kb.pagerank != 0 {
            chunk.pagerank_fea = Some(ctx.kb.pagerank);
        }
        chunk.vector = Some(item.vector);

        tokens += num_tokens(&chunk.content_with_weight) as u64;
        chunks.push(chunk);
    }

    Ok((chunks, tokens))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::{MockChat, MockEmbedder};
    use crate::storage::SqliteDocStore;
    use crate::types::{
        Document, DocumentType, Knowledgebase, ParserConfig, ParserKind, Task, TaskType, Tenant,
        UNBOUNDED_PAGE,
    };
    use serde_json::json;

    fn noop(_: Option<f32>, _: &str) -> Result<()> {
        Ok(())
    }

    fn context(texts: &[&str], embedder: &MockEmbedder) -> (TaskContext, SqliteDocStore, Vec<Chunk>) {
        let store = SqliteDocStore::in_memory().unwrap();
        let tenant = Tenant { id: "t1".into(), ..Default::default() };
        let kb = Knowledgebase::new("t1", "kb", "embed");
        let doc = Document::new(&kb.id, "a.txt", "a.txt", DocumentType::Doc, ParserKind::Naive, 10)
            .with_parser_config(ParserConfig::from_value(json!({
                "raptor": {"use_raptor": true, "max_cluster": 4, "random_seed": 42}
            })));
        let task = Task::new(&doc.id, UNBOUNDED_PAGE, UNBOUNDED_PAGE, TaskType::Raptor);
        let leaves: Vec<Chunk> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let mut c = Chunk::new(&doc.id, &kb.id, *text);
                c.idx = i as i64 + 1;
                c.vector = Some(embedder.vector_for(text));
                c
            })
            .collect();
        (TaskContext { task, doc, kb, tenant }, store, leaves)
    }

    #[tokio::test]
    async fn test_run_raptor_builds_summary_chunks() {
        let embedder = Arc::new(MockEmbedder::new(8));
        let (ctx, store, leaves) = context(&["first part", "second part"], &embedder);
        let index = index_name("t1");
        store.create_index(&index, &ctx.kb.id, 8).await.unwrap();
        store.insert(&leaves, &index, &ctx.kb.id).await.unwrap();

        let (chunks, tokens) = run_raptor(
            &ctx,
            &store,
            Arc::new(MockChat::fixed("both parts together")),
            embedder,
            Arc::new(ResponseCache::default()),
            &noop,
        )
        .await
        .unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].idx, RAPTOR_IDX_BASE);
        assert_eq!(chunks[0].mixed.len(), 2);
        assert_eq!(chunks[0].mixed[0].id, leaves[0].id);
        assert_eq!(tokens, 3);
        assert!(chunks[0].vector.is_some());
    }

    #[tokio::test]
    async fn test_summary_chunks_cover_distinct_leaf_sets() {
        let embedder = Arc::new(MockEmbedder::new(16));
        let texts = [
            "apples and pears", "apple orchards", "pear trees", "fruit harvest",
            "rust ownership", "rust borrowing", "lifetimes in rust", "trait objects",
        ];
        let (ctx, store, leaves) = context(&texts, &embedder);
        let index = index_name("t1");
        store.create_index(&index, &ctx.kb.id, 16).await.unwrap();
        store.insert(&leaves, &index, &ctx.kb.id).await.unwrap();

        let counter = std::sync::atomic::AtomicUsize::new(0);
        let chat = MockChat::new(move |_, _| {
            let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            format!("summary number {}", n)
        });
        let (chunks, _) = run_raptor(
            &ctx,
            &store,
            Arc::new(chat),
            embedder,
            Arc::new(ResponseCache::default()),
            &noop,
        )
        .await
        .unwrap();

        let all: BTreeSet<i64> = (1..=8).collect();
        let sets: Vec<BTreeSet<i64>> = chunks
            .iter()
            .map(|c| c.mixed.iter().map(|m| m.idx).collect())
            .collect();
        assert!(!sets.is_empty());
        assert!(sets.iter().all(|s| s.len() > 1 && s.is_subset(&all)));
        let distinct: HashSet<&BTreeSet<i64>> = sets.iter().collect();
        assert_eq!(distinct.len(), sets.len());
    }
}
