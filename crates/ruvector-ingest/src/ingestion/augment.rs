//! LLM augmentation passes: keywords, questions and tags per chunk
//!
//! Every call goes through the response cache first. Failures are logged and
//! leave the chunk untouched; they never fail the task.

use futures::StreamExt;
use rand::seq::SliceRandom;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::cache::{CacheKey, ResponseCache};
use crate::error::{Error, Result};
use crate::generation::prompt::{PromptBuilder, TagExample, OUTPUT_TURN};
use crate::providers::llm::{is_error_response, strip_think};
use crate::providers::{index_name, ChatMessage, ChatProvider, DocStore, GenConf};
use crate::types::Chunk;

use super::parser::ProgressFn;
use super::text::{tokenize, truncate};

/// Smoothing constant for tag portions
const TAG_PORTION_SMOOTHING: f32 = 1000.0;

/// Tokens kept free for the instructions around the content
const PROMPT_RESERVE: usize = 256;

/// Model calls in flight per pass
const CHAT_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Copy)]
enum TextPass {
    Keywords,
    Questions,
}

impl TextPass {
    fn params(self, topn: usize) -> serde_json::Value {
        match self {
            TextPass::Keywords => json!({"kind": "keywords", "topn": topn}),
            TextPass::Questions => json!({"kind": "questions", "topn": topn}),
        }
    }

    fn label(self) -> &'static str {
        match self {
            TextPass::Keywords => "Keyword extraction",
            TextPass::Questions => "Question proposal",
        }
    }
}

/// Runs augmentation passes against one chat model
pub struct Augmenter {
    chat: Arc<dyn ChatProvider>,
    cache: Arc<ResponseCache>,
}

impl Augmenter {
    pub fn new(chat: Arc<dyn ChatProvider>, cache: Arc<ResponseCache>) -> Self {
        Self { chat, cache }
    }

    fn fit(&self, content: &str) -> String {
        truncate(content, self.chat.max_length().saturating_sub(PROMPT_RESERVE).max(1)).to_string()
    }

    async fn ask(&self, prompt: &str, temperature: f32) -> Result<String> {
        let (answer, _) = self
            .chat
            .chat(prompt, &[ChatMessage::user(OUTPUT_TURN)], &GenConf::temperature(temperature))
            .await?;
        Ok(strip_think(&answer))
    }

    /// Comma separated keywords; empty when the model reports an error
    pub async fn keyword_extraction(&self, content: &str, topn: usize) -> Result<String> {
        let prompt = PromptBuilder::keywords(&self.fit(content), topn);
        let answer = self.ask(&prompt, 0.2).await?;
        if is_error_response(&answer) {
            return Ok(String::new());
        }
        Ok(answer)
    }

    /// Newline separated questions; empty when the model reports an error
    pub async fn question_proposal(&self, content: &str, topn: usize) -> Result<String> {
        let prompt = PromptBuilder::questions(&self.fit(content), topn);
        let answer = self.ask(&prompt, 0.2).await?;
        if is_error_response(&answer) {
            return Ok(String::new());
        }
        Ok(answer)
    }

    /// Tag → score map drawn from `tag_set`
    pub async fn content_tagging(
        &self,
        content: &str,
        tag_set: &[String],
        examples: &[TagExample],
        topn: usize,
    ) -> Result<BTreeMap<String, f32>> {
        let prompt = PromptBuilder::tagging(&self.fit(content), tag_set, examples, topn);
        let answer = self.ask(&prompt, 0.5).await?;
        if is_error_response(&answer) {
            return Err(Error::llm(answer));
        }
        parse_tag_scores(&answer, tag_set)
    }

    /// One cached model answer per chunk, `None` where the call failed
    async fn generate_all(&self, chunks: &[Chunk], topn: usize, pass: TextPass) -> Vec<Option<String>> {
        let params = pass.params(topn);
        futures::stream::iter(chunks)
            .map(|chunk| {
                let key = CacheKey::new(self.chat.model(), &chunk.content_with_weight, &params);
                async move {
                    if let Some(hit) = self.cache.get_chat(&key) {
                        return Some(hit);
                    }
                    let answer = match pass {
                        TextPass::Keywords => self.keyword_extraction(&chunk.content_with_weight, topn).await,
                        TextPass::Questions => self.question_proposal(&chunk.content_with_weight, topn).await,
                    };
                    match answer {
                        Ok(answer) => {
                            if !answer.is_empty() {
                                self.cache.put_chat(key, answer.clone());
                            }
                            Some(answer)
                        }
                        Err(e) => {
                            tracing::warn!("{} failed for chunk {}: {}", pass.label(), chunk.id, e);
                            None
                        }
                    }
                }
            })
            .buffered(CHAT_CONCURRENCY)
            .collect()
            .await
    }

    /// Fill `important_kwd` / `important_tks`
    pub async fn add_keywords(&self, chunks: &mut [Chunk], topn: usize, progress: ProgressFn<'_>) -> Result<()> {
        let start = Instant::now();
        progress(None, "Start to generate keywords for every chunk ...")?;

        let answers = self.generate_all(chunks, topn, TextPass::Keywords).await;
        for (chunk, keywords) in chunks.iter_mut().zip(answers) {
            let Some(keywords) = keywords else { continue };
            chunk.important_kwd = split_list(&keywords, ',');
            chunk.important_tks = tokenize(&chunk.important_kwd.join(" "));
        }

        progress(
            None,
            &format!("Keywords generation completed in {:.2}s", start.elapsed().as_secs_f64()),
        )
    }

    /// Fill `question_kwd` / `question_tks`
    pub async fn add_questions(&self, chunks: &mut [Chunk], topn: usize, progress: ProgressFn<'_>) -> Result<()> {
        let start = Instant::now();
        progress(None, "Start to generate questions for every chunk ...")?;

        let answers = self.generate_all(chunks, topn, TextPass::Questions).await;
        for (chunk, questions) in chunks.iter_mut().zip(answers) {
            let Some(questions) = questions else { continue };
            chunk.question_kwd = split_list(&questions, '\n');
            chunk.question_tks = tokenize(&chunk.question_kwd.join("\n"));
        }

        progress(
            None,
            &format!("Question generation completed in {:.2}s", start.elapsed().as_secs_f64()),
        )
    }

    /// Fill `tag_feas` from the tag sets of `tag_kb_ids`
    pub async fn add_tags(
        &self,
        chunks: &mut [Chunk],
        doc_store: &dyn DocStore,
        tenant_id: &str,
        tag_kb_ids: &[String],
        topn: usize,
        progress: ProgressFn<'_>,
    ) -> Result<()> {
        let start = Instant::now();
        progress(None, "Start to tag for every chunk ...")?;

        let all_tags = match self.cache.get_tags(tag_kb_ids) {
            Some(tags) => tags,
            None => {
                let counts = doc_store.all_tags(&index_name(tenant_id), tag_kb_ids).await?;
                let portions = tag_portions(&counts);
                self.cache.put_tags(tag_kb_ids, portions.clone());
                portions
            }
        };
        if all_tags.is_empty() {
            tracing::info!("No tags found in knowledge bases {:?}", tag_kb_ids);
            return progress(None, "No tag set available, tagging skipped.");
        }

        let tag_set: Vec<String> = all_tags.keys().cloned().collect();
        let params = json!({"kind": "tags", "topn": topn, "tag_set": &all_tags});
        let mut examples: Vec<TagExample> = Vec::new();

        for chunk in chunks.iter_mut() {
            let key = CacheKey::new(self.chat.model(), &chunk.content_with_weight, &params);
            let cached = self
                .cache
                .get_chat(&key)
                .and_then(|hit| serde_json::from_str::<BTreeMap<String, f32>>(&hit).ok());

            let tags = match cached {
                Some(tags) => tags,
                None => {
                    let sample: Vec<TagExample> = if examples.len() > 2 {
                        examples
                            .choose_multiple(&mut rand::thread_rng(), 2)
                            .cloned()
                            .collect()
                    } else {
                        examples.clone()
                    };
                    match self
                        .content_tagging(&chunk.content_with_weight, &tag_set, &sample, topn)
                        .await
                    {
                        Ok(tags) => {
                            if let Ok(encoded) = serde_json::to_string(&tags) {
                                self.cache.put_chat(key, encoded);
                            }
                            tags
                        }
                        Err(e) => {
                            tracing::warn!("Tagging failed for chunk {}: {}", chunk.id, e);
                            continue;
                        }
                    }
                }
            };

            if !tags.is_empty() {
                examples.push(TagExample {
                    content: chunk.content_with_weight.clone(),
                    tags: tags.clone(),
                });
                chunk.tag_feas = tags;
            }
        }

        progress(
            None,
            &format!("Tagging completed in {:.2}s", start.elapsed().as_secs_f64()),
        )
    }
}

/// Occurrence counts to smoothed portions: `(count + 1) / (total + S)`
pub fn tag_portions(counts: &BTreeMap<String, u64>) -> BTreeMap<String, f32> {
    let total: u64 = counts.values().sum();
    counts
        .iter()
        .map(|(tag, count)| {
            (
                tag.clone(),
                (*count as f32 + 1.0) / (total as f32 + TAG_PORTION_SMOOTHING),
            )
        })
        .collect()
}

fn split_list(text: &str, separator: char) -> Vec<String> {
    text.split(separator)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `{"tag": score}` from a model answer, keeping known tags only
fn parse_tag_scores(answer: &str, tag_set: &[String]) -> Result<BTreeMap<String, f32>> {
    let body = match (answer.find('{'), answer.rfind('}')) {
        (Some(start), Some(end)) if start < end => &answer[start..=end],
        _ => return Err(Error::llm(format!("No JSON object in tagging answer: {}", answer))),
    };
    let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(body)
        .map_err(|e| Error::llm(format!("Invalid tagging answer: {}", e)))?;

    Ok(raw
        .into_iter()
        .filter(|(tag, _)| tag_set.contains(tag))
        .filter_map(|(tag, score)| {
            let score = score
                .as_f64()
                .or_else(|| score.as_str().and_then(|s| s.trim().parse().ok()))?;
            Some((tag, score as f32))
        })
        .collect())
}
