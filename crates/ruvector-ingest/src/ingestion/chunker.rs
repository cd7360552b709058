//! Token-budgeted text chunking

use unicode_segmentation::UnicodeSegmentation;

use super::text::num_tokens;

/// Default delimiter set: newline plus ASCII and CJK sentence ends
pub const DEFAULT_DELIMITERS: &str = "\n!?。；！？";

/// Merges sentence-sized sections into chunks of roughly `chunk_token_num` tokens
pub struct TextChunker {
    /// Target chunk size in tokens
    chunk_token_num: usize,
    /// Characters that end a section in addition to sentence bounds
    delimiters: Vec<char>,
}

impl TextChunker {
    /// Create a new chunker
    pub fn new(chunk_token_num: usize) -> Self {
        Self {
            chunk_token_num: chunk_token_num.max(1),
            delimiters: DEFAULT_DELIMITERS.chars().collect(),
        }
    }

    /// Replace the delimiter set; an empty string keeps the default
    pub fn with_delimiters(mut self, delimiters: &str) -> Self {
        let delimiters: Vec<char> = delimiters.chars().filter(|c| *c != '`').collect();
        if !delimiters.is_empty() {
            self.delimiters = delimiters;
        }
        self
    }

    /// Chunk a block of text
    pub fn chunk(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut current_tokens = 0usize;

        for section in self.split_sections(text) {
            let tokens = num_tokens(section);
            if tokens == 0 {
                if !current.is_empty() {
                    current.push_str(section);
                }
                continue;
            }

            // Start a new chunk once the budget would be exceeded
            if current_tokens > 0 && current_tokens + tokens > self.chunk_token_num {
                let finished = current.trim();
                if !finished.is_empty() {
                    chunks.push(finished.to_string());
                }
                current.clear();
                current_tokens = 0;
            }

            current.push_str(section);
            current_tokens += tokens;
        }

        let finished = current.trim();
        if !finished.is_empty() {
            chunks.push(finished.to_string());
        }

        chunks
    }

    /// Split text into sentences, then again at every delimiter
    fn split_sections<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let mut sections = Vec::new();
        for sentence in text.split_sentence_bounds() {
            let mut start = 0;
            for (i, c) in sentence.char_indices() {
                if self.delimiters.contains(&c) {
                    let end = i + c.len_utf8();
                    sections.push(&sentence[start..end]);
                    start = end;
                }
            }
            if start < sentence.len() {
                sections.push(&sentence[start..]);
            }
        }
        sections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_respects_token_budget() {
        let text = "One two three. Four five six. Seven eight nine. Ten eleven twelve.";
        let chunks = TextChunker::new(6).chunk(text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "One two three. Four five six.");
        assert!(chunks.iter().all(|c| num_tokens(c) <= 6));
    }

    #[test]
    fn test_oversized_section_kept_whole() {
        let text = "a b c d e f g h";
        let chunks = TextChunker::new(3).chunk(text);
        assert_eq!(chunks, vec!["a b c d e f g h".to_string()]);
    }

    #[test]
    fn test_custom_delimiters() {
        let chunks = TextChunker::new(2).with_delimiters(";").chunk("a b;c d;e");
        assert_eq!(chunks, vec!["a b;", "c d;", "e"]);
    }

    #[test]
    fn test_empty_text() {
        assert!(TextChunker::new(10).chunk("   \n ").is_empty());
    }
}
