//! Document level metadata extraction
//!
//! Two model passes: the first reads the opening chunks and proposes
//! metadata plus a chapter heading pattern, the second cleans the headings
//! that pattern matched across the whole document.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::generation::prompt::{PromptBuilder, OUTPUT_TURN};
use crate::providers::llm::{is_error_response, strip_think};
use crate::providers::{ChatMessage, ChatProvider, GenConf};
use crate::types::Chunk;

use super::text::truncate;

static JSON_FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("Invalid regex"));

/// Token budget for the opening content shown to the model
const OPENING_TOKENS: usize = 2048;

/// Upper bound on chapter candidates sent to the verifier
const MAX_CHAPTER_CANDIDATES: usize = 200;

/// Pull the JSON object out of a model answer, fenced or bare
pub fn parse_json_answer(answer: &str) -> Result<Value> {
    let answer = strip_think(answer);
    let body = match JSON_FENCE_RE.captures(&answer).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().to_string(),
        None => match (answer.find('{'), answer.rfind('}')) {
            (Some(start), Some(end)) if start < end => answer[start..=end].to_string(),
            _ => return Err(Error::llm("No JSON object in metadata answer")),
        },
    };
    serde_json::from_str(body.trim()).map_err(|e| Error::llm(format!("Invalid metadata JSON: {}", e)))
}

async fn ask(chat: &dyn ChatProvider, prompt: &str) -> Result<Value> {
    let (answer, _) = chat
        .chat(prompt, &[ChatMessage::user(OUTPUT_TURN)], &GenConf::temperature(0.2))
        .await?;
    if is_error_response(&answer) {
        return Err(Error::llm(answer));
    }
    parse_json_answer(&answer)
}

/// Extract `{..metadata, "chapters": [...]}` for a document
///
/// Returns `None` when the model gave nothing usable.
pub async fn extract_doc_metadata(
    chat: &dyn ChatProvider,
    file_name: &str,
    chunks: &[Chunk],
) -> Result<Option<Value>> {
    if chunks.is_empty() {
        return Ok(None);
    }

    let opening: String = chunks
        .iter()
        .map(|c| c.content_with_weight.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let opening = truncate(&opening, OPENING_TOKENS);

    let analysis = ask(chat, &PromptBuilder::metadata_analysis(file_name, opening)).await?;

    let mut meta: Map<String, Value> = analysis
        .get("metadata")
        .and_then(Value::as_object)
        .map(|m| m.iter().filter(|(_, v)| !v.is_null()).map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    let pattern = analysis
        .get("chapter_regex")
        .and_then(|r| r.get("pattern"))
        .and_then(Value::as_str)
        .filter(|p| !p.trim().is_empty());

    if let Some(pattern) = pattern {
        match Regex::new(pattern) {
            Ok(re) => {
                let candidates = match_chapters(&re, chunks);
                if !candidates.is_empty() {
                    match ask(chat, &PromptBuilder::metadata_verifier(&candidates)).await {
                        Ok(verified) => {
                            if let Some(chapters) = verified.get("cleaned_chapters").and_then(Value::as_array) {
                                meta.insert("chapters".to_string(), Value::Array(chapters.clone()));
                            }
                        }
                        Err(e) if e.is_canceled() => return Err(e),
                        Err(e) => tracing::warn!("Chapter verification of {} failed: {}", file_name, e),
                    }
                }
            }
            Err(e) => tracing::warn!("Ignoring invalid chapter pattern '{}': {}", pattern, e),
        }
    }

    if meta.is_empty() {
        return Ok(None);
    }
    Ok(Some(Value::Object(meta)))
}

/// Distinct lines starting with a heading match, in document order
fn match_chapters(re: &Regex, chunks: &[Chunk]) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for line in chunks.iter().flat_map(|c| c.content_with_weight.lines()) {
        let line = line.trim();
        if line.is_empty() || !re.find(line).is_some_and(|m| m.start() == 0) {
            continue;
        }
        if !found.iter().any(|f| f == line) {
            found.push(line.to_string());
        }
        if found.len() >= MAX_CHAPTER_CANDIDATES {
            break;
        }
    }
    found
}
