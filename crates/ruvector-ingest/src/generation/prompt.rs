//! Prompt templates for chunk augmentation and document metadata

use std::collections::BTreeMap;

/// System message used for cluster summaries
pub const SUMMARY_SYSTEM: &str = "You're a helpful assistant.";

/// User turn that asks for the answer after a system prompt
pub const OUTPUT_TURN: &str = "Output: ";

/// A labelled example for the tagging prompt
#[derive(Debug, Clone)]
pub struct TagExample {
    pub content: String,
    pub tags: BTreeMap<String, f32>,
}

/// Prompt builder for augmentation passes
pub struct PromptBuilder;

impl PromptBuilder {
    /// Top-n keyword extraction
    pub fn keywords(content: &str, topn: usize) -> String {
        format!(
            r#"
Role: You are a text analyzer.
Task: Extract the most important keywords or phrases from the given text.
Requirements:
  - Summarize the text and give the top {topn} important keywords/phrases.
  - Keywords MUST be in the language of the text.
  - Separate keywords with an ENGLISH COMMA.
  - Output keywords ONLY.

### Text Content
{content}

"#,
            topn = topn,
            content = content
        )
    }

    /// Top-n question proposal
    pub fn questions(content: &str, topn: usize) -> String {
        format!(
            r#"
Role: You are a text analyzer.
Task: Propose {topn} questions about the given text.
Requirements:
  - Understand and summarize the text, then propose the top {topn} important questions.
  - Questions SHOULD NOT overlap in meaning.
  - Questions SHOULD cover the main content of the text as much as possible.
  - Questions MUST be in the language of the text.
  - One question per line.
  - Output questions ONLY.

### Text Content
{content}

"#,
            topn = topn,
            content = content
        )
    }

    /// Tag assignment against a fixed tag set
    pub fn tagging(content: &str, tag_set: &[String], examples: &[TagExample], topn: usize) -> String {
        let mut prompt = format!(
            r#"
Role: You are a text analyzer.

Task: Label the given text using the tag set and the examples.

Steps:
  - Understand the tag set.
  - Understand the examples, each a text with its tags and relevance scores as JSON.
  - Summarize the text and label it with the top {topn} most relevant tags from the set, with scores.

Requirements:
  - Tags MUST come from the tag set.
  - Output MUST be JSON only: keys are tags, values are relevance scores.
  - Scores range from 1 to 10.

# TAG SET
{tags}

"#,
            topn = topn,
            tags = tag_set.join(", ")
        );

        for (i, example) in examples.iter().enumerate() {
            let tags = serde_json::to_string_pretty(&example.tags).unwrap_or_default();
            prompt.push_str(&format!(
                "\n# Example {}\n### Text Content\n{}\n\nOutput:\n{}\n\n",
                i, example.content, tags
            ));
        }

        prompt.push_str(&format!("\n# Real Data\n### Text Content\n{}\n\n", content));
        prompt
    }

    /// First metadata pass: propose fields and a chapter heading pattern
    pub fn metadata_analysis(file_name: &str, file_content: &str) -> String {
        format!(
            r#"You analyze the opening of a document and describe it.

File name: {file_name}

Opening content:
{file_content}

Respond with a single JSON object inside a ```json fence:
{{
  "metadata": {{ "title": "...", "author": "...", "date": "...", "summary": "..." }},
  "chapter_regex": {{ "pattern": "<regex matching one chapter heading line>" }}
}}
Leave out "chapter_regex" when the document has no chapter structure. Use null for unknown fields."#,
            file_name = file_name,
            file_content = file_content
        )
    }

    /// Second metadata pass: clean candidate chapter headings
    pub fn metadata_verifier(matched_chapters: &[String]) -> String {
        let chapters = serde_json::to_string_pretty(matched_chapters).unwrap_or_default();
        format!(
            r#"The lines below were matched as chapter headings of one document.
Remove false positives and duplicates, keep document order.

Candidates:
{chapters}

Respond with a single JSON object inside a ```json fence:
{{ "cleaned_chapters": ["..."] }}"#,
            chapters = chapters
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_prompt_mentions_count() {
        let prompt = PromptBuilder::keywords("Rust ownership rules", 5);
        assert!(prompt.contains("top 5"));
        assert!(prompt.contains("Rust ownership rules"));
    }

    #[test]
    fn test_tagging_prompt_includes_examples() {
        let mut tags = BTreeMap::new();
        tags.insert("finance".to_string(), 8.0);
        let examples = vec![TagExample { content: "bank rates".into(), tags }];
        let prompt = PromptBuilder::tagging("loan terms", &["finance".into(), "sport".into()], &examples, 3);
        assert!(prompt.contains("finance, sport"));
        assert!(prompt.contains("# Example 0"));
        assert!(prompt.contains("loan terms"));
    }
}
