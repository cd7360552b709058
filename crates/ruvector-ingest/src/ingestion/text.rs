//! Token helpers for the derived text fields of a chunk

use unicode_segmentation::UnicodeSegmentation;

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF
        | 0x3400..=0x4DBF
        | 0x4E00..=0x9FFF
        | 0xAC00..=0xD7AF
        | 0xF900..=0xFAFF)
}

/// Lowercased, whitespace separated word tokens (`*_ltks` fields)
pub fn tokenize(text: &str) -> String {
    text.unicode_words()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Finer split of an already tokenized string (`*_sm_ltks` fields)
///
/// Compound tokens are broken on `-`, `_`, `.` and `'`, CJK runs into
/// single characters.
pub fn fine_grained_tokenize(tokens: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    for token in tokens.split_whitespace() {
        if token.chars().any(is_cjk) {
            out.extend(token.chars().map(|c| c.to_string()));
            continue;
        }
        let parts: Vec<&str> = token
            .split(['-', '_', '.', '\''])
            .filter(|p| !p.is_empty())
            .collect();
        if parts.len() > 1 {
            out.extend(parts.into_iter().map(str::to_string));
        } else {
            out.push(token.to_string());
        }
    }
    out.join(" ")
}

/// Approximate model token count: words plus one per CJK character
pub fn num_tokens(text: &str) -> usize {
    text.unicode_words()
        .map(|w| {
            let cjk = w.chars().filter(|c| is_cjk(*c)).count();
            if cjk > 0 {
                cjk
            } else {
                1
            }
        })
        .sum()
}

/// Cut `text` after `max_tokens` tokens, keeping the original spacing
pub fn truncate(text: &str, max_tokens: usize) -> &str {
    let mut count = 0usize;
    for (offset, word) in text.unicode_word_indices() {
        let weight = word.chars().filter(|c| is_cjk(*c)).count().max(1);
        if count + weight > max_tokens {
            if count == 0 {
                return "";
            }
            return text[..offset].trim_end();
        }
        count += weight;
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_lowercases_words() {
        assert_eq!(tokenize("Hello, World! It's 2024."), "hello world it's 2024");
    }

    #[test]
    fn test_fine_grained_splits_compounds() {
        assert_eq!(fine_grained_tokenize("state-of-art plain"), "state of art plain");
        assert_eq!(fine_grained_tokenize("中文"), "中 文");
    }

    #[test]
    fn test_num_tokens() {
        assert_eq!(num_tokens("one two three"), 3);
        assert_eq!(num_tokens(""), 0);
        assert!(num_tokens("中文字") >= 3);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("one two three four", 2), "one two");
        assert_eq!(truncate("one two", 10), "one two");
        assert_eq!(truncate("one two", 0), "");
    }
}
