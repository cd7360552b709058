//! Recursive cluster-and-summarize tree builder

use ndarray::Array2;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cache::{CacheKey, ResponseCache};
use crate::error::{Error, Result};
use crate::generation::prompt::SUMMARY_SYSTEM;
use crate::ingestion::parser::ProgressFn;
use crate::ingestion::text::truncate;
use crate::providers::llm::{is_error_response, strip_think};
use crate::providers::{ChatMessage, ChatProvider, EmbeddingProvider, GenConf};

use super::gmm::{optimal_clusters, GaussianMixture};
use super::projection::Projection;

/// One node of the tree: text, its embedding and the leaf indices it covers
#[derive(Debug, Clone, PartialEq)]
pub struct RaptorItem {
    pub content: String,
    pub vector: Vec<f32>,
    pub leaves: BTreeSet<i64>,
}

impl RaptorItem {
    pub fn leaf(content: impl Into<String>, vector: Vec<f32>, idx: i64) -> Self {
        Self {
            content: content.into(),
            vector,
            leaves: BTreeSet::from([idx]),
        }
    }
}

/// Builds summary layers until a single node remains
pub struct RaptorSummarizer {
    max_cluster: usize,
    chat: Arc<dyn ChatProvider>,
    embedder: Arc<dyn EmbeddingProvider>,
    prompt: String,
    max_token: usize,
    threshold: f64,
    cache: Arc<ResponseCache>,
}

impl RaptorSummarizer {
    pub fn new(
        max_cluster: usize,
        chat: Arc<dyn ChatProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        prompt: impl Into<String>,
        max_token: usize,
        threshold: f64,
        cache: Arc<ResponseCache>,
    ) -> Self {
        Self {
            max_cluster,
            chat,
            embedder,
            prompt: prompt.into(),
            max_token,
            threshold,
            cache,
        }
    }

    /// Summary nodes built on top of `items`, in creation order
    pub async fn build(
        &self,
        items: Vec<RaptorItem>,
        seed: u64,
        progress: ProgressFn<'_>,
    ) -> Result<Vec<RaptorItem>> {
        if items.len() <= 1 {
            return Ok(Vec::new());
        }
        let mut nodes: Vec<RaptorItem> = items
            .into_iter()
            .filter(|item| !item.content.is_empty() && !item.vector.is_empty())
            .collect();
        let original_len = nodes.len();

        let (mut start, mut end) = (0usize, nodes.len());
        while end - start > 1 {
            let layer = &nodes[start..end];

            if layer.len() == 2 {
                self.summarize(&mut nodes, &[start, start + 1]).await;
            } else {
                let labels = self.cluster(layer, seed);
                let n_clusters = labels.iter().copied().max().map_or(0, |m| m + 1);
                for c in 0..n_clusters {
                    let members: Vec<usize> = labels
                        .iter()
                        .enumerate()
                        .filter(|(_, l)| **l == c)
                        .map(|(i, _)| i + start)
                        .collect();
                    if members.is_empty() {
                        continue;
                    }
                    self.summarize(&mut nodes, &members).await;
                }
            }

            progress(
                None,
                &format!("Cluster one layer: {} -> {}", end - start, nodes.len() - end),
            )?;

            // A layer that does not shrink can never reach the root
            if nodes.len() - end >= end - start {
                tracing::warn!("RAPTOR layer did not shrink ({} -> {})", end - start, nodes.len() - end);
                break;
            }
            start = end;
            end = nodes.len();
        }

        Ok(nodes.split_off(original_len))
    }

    /// Cluster label per item of one layer
    fn cluster(&self, layer: &[RaptorItem], seed: u64) -> Vec<usize> {
        let vectors: Vec<Vec<f32>> = layer.iter().map(|i| i.vector.clone()).collect();
        let reduced: Array2<f64> = Projection::for_layer(layer.len(), seed).fit_transform(&vectors);

        let n_clusters = optimal_clusters(&reduced, self.max_cluster, seed);
        if n_clusters == 1 {
            return vec![0; layer.len()];
        }
        match GaussianMixture::fit(&reduced, n_clusters, seed) {
            Ok(model) => model
                .predict_proba(&reduced)
                .rows()
                .into_iter()
                .map(|probs| probs.iter().position(|p| *p > self.threshold).unwrap_or(0))
                .collect(),
            Err(e) => {
                tracing::warn!("Mixture fit failed, using a single cluster: {}", e);
                vec![0; layer.len()]
            }
        }
    }

    /// Append the summary of `members` to `nodes`; failures skip the cluster
    async fn summarize(&self, nodes: &mut Vec<RaptorItem>, members: &[usize]) {
        let leaves: BTreeSet<i64> = members
            .iter()
            .flat_map(|&i| nodes[i].leaves.iter().copied())
            .collect();

        if let Some(&covering) = members.iter().find(|&&i| nodes[i].leaves == leaves) {
            let carried = nodes[covering].clone();
            nodes.push(carried);
            return;
        }

        let texts: Vec<&str> = members.iter().map(|&i| nodes[i].content.as_str()).collect();
        match self.summarize_texts(&texts).await {
            Ok((content, vector)) => nodes.push(RaptorItem { content, vector, leaves }),
            Err(e) => {
                if !e.is_canceled() {
                    tracing::warn!("RAPTOR summarization of {} item(s) skipped: {}", members.len(), e);
                }
            }
        }
    }

    async fn summarize_texts(&self, texts: &[&str]) -> Result<(String, Vec<f32>)> {
        let budget = self.chat.max_length().saturating_sub(self.max_token) / texts.len().max(1);
        let per_text = budget.max(1);
        let cluster_content = texts
            .iter()
            .map(|t| truncate(t, per_text))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = self.prompt.replace("{cluster_content}", &cluster_content);

        let conf = GenConf::temperature(0.3).with_max_tokens(self.max_token);
        let key = CacheKey::new(self.chat.model(), &prompt, &json!({"kind": "raptor", "conf": &conf}));
        let summary = match self.cache.get_chat(&key) {
            Some(hit) => hit,
            None => {
                let (answer, _) = self
                    .chat
                    .chat(SUMMARY_SYSTEM, &[ChatMessage::user(prompt.clone())], &conf)
                    .await?;
                let answer = strip_think(&answer);
                if is_error_response(&answer) {
                    return Err(Error::llm(answer));
                }
                self.cache.put_chat(key, answer.clone());
                answer
            }
        };

        let vector = self.embed(&summary).await?;
        Ok((summary, vector))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = CacheKey::new(self.embedder.model(), text, &json!({}));
        if let Some(hit) = self.cache.get_embedding(&key) {
            return Ok(hit);
        }
        let (vectors, _) = self.embedder.encode(&[text.to_string()]).await?;
        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| Error::embedding("Empty embedding response"))?;
        self.cache.put_embedding(key, vector.clone());
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::{MockChat, MockEmbedder};
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn noop(_: Option<f32>, _: &str) -> Result<()> {
        Ok(())
    }

    fn summarizer(chat: MockChat, max_cluster: usize) -> (RaptorSummarizer, Arc<MockEmbedder>) {
        let embedder = Arc::new(MockEmbedder::new(16));
        let summarizer = RaptorSummarizer::new(
            max_cluster,
            Arc::new(chat),
            embedder.clone(),
            "Summarize:\n{cluster_content}",
            64,
            0.1,
            Arc::new(ResponseCache::default()),
        );
        (summarizer, embedder)
    }

    fn leaves(embedder: &MockEmbedder, texts: &[&str]) -> Vec<RaptorItem> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| RaptorItem::leaf(*t, embedder.vector_for(t), i as i64 + 1))
            .collect()
    }

    #[tokio::test]
    async fn test_single_item_yields_nothing() {
        let (s, embedder) = summarizer(MockChat::fixed("sum"), 8);
        let out = s.build(leaves(&embedder, &["only"]), 0, &noop).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_pair_is_summarized_directly() {
        let (s, embedder) = summarizer(MockChat::fixed("joint summary"), 8);
        let out = s.build(leaves(&embedder, &["alpha", "beta"]), 0, &noop).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content, "joint summary");
        assert_eq!(out[0].leaves, BTreeSet::from([1, 2]));
    }

    #[tokio::test]
    async fn test_tree_terminates_with_distinct_leaf_sets() {
        let counter = Mutex::new(0usize);
        let chat = MockChat::new(move |_, history| {
            let mut n = counter.lock().unwrap();
            *n += 1;
            format!("summary {} of {}", n, history[0].content.len())
        });
        let (s, embedder) = summarizer(chat, 4);
        let texts = [
            "apples and pears", "apple orchards", "pear trees", "fruit harvest",
            "rust ownership", "rust borrowing", "lifetimes in rust", "trait objects",
        ];
        let out = s.build(leaves(&embedder, &texts), 42, &noop).await.unwrap();

        assert!(!out.is_empty());
        assert!(out.iter().all(|item| !item.leaves.is_empty()));
        let all: BTreeSet<i64> = (1..=8).collect();
        assert_eq!(out.last().unwrap().leaves, all);
        assert!(out.iter().all(|item| item.leaves.is_subset(&all)));

        // carried-forward nodes repeat a set; every summary has its own
        let summaries: Vec<&RaptorItem> = out.iter().filter(|i| i.content.starts_with("summary ")).collect();
        let distinct: HashSet<&BTreeSet<i64>> = summaries.iter().map(|i| &i.leaves).collect();
        assert_eq!(distinct.len(), summaries.len());
    }

    #[tokio::test]
    async fn test_error_answers_skip_cluster() {
        let (s, embedder) = summarizer(MockChat::fixed("**ERROR**: down"), 8);
        let out = s.build(leaves(&embedder, &["a", "b"]), 0, &noop).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_empty_items_are_dropped() {
        let (s, embedder) = summarizer(MockChat::fixed("s"), 8);
        let mut items = leaves(&embedder, &["x", "y"]);
        items.push(RaptorItem::leaf("", vec![1.0], 3));
        items.push(RaptorItem::leaf("no vector", Vec::new(), 4));
        let out = s.build(items, 0, &noop).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].leaves, BTreeSet::from([1, 2]));
    }
}
