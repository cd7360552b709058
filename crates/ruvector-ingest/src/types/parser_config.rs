//! Typed accessors over the free-form parser configuration JSON

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parser configuration attached to a document or knowledge base
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ParserConfig(Value);

impl Default for ParserConfig {
    fn default() -> Self {
        Self(Value::Object(Default::default()))
    }
}

impl ParserConfig {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(_) => Self(value),
            _ => Self::default(),
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Copy of the configuration with the given top-level keys removed
    pub fn without_keys(&self, keys: &[&str]) -> Value {
        let mut value = self.0.clone();
        if let Value::Object(map) = &mut value {
            for key in keys {
                map.remove(*key);
            }
        }
        value
    }

    fn u64_field(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Pages per PDF work unit, when overridden
    pub fn task_page_size(&self) -> Option<u32> {
        self.u64_field("task_page_size").map(|v| v as u32).filter(|v| *v > 0)
    }

    /// Layout engine name; `true` and absence both mean the built-in engine
    pub fn layout_recognize(&self) -> String {
        match self.0.get("layout_recognize") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Bool(false)) => "Plain Text".to_string(),
            _ => "DeepDOC".to_string(),
        }
    }

    /// Selected 1-based inclusive page ranges, default `[(1, 100000)]`
    pub fn pages(&self) -> Vec<(u32, u32)> {
        let ranges: Vec<(u32, u32)> = self
            .0
            .get("pages")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|r| {
                        let r = r.as_array()?;
                        let s = r.first()?.as_u64()?;
                        let e = r.get(1)?.as_u64()?;
                        Some((s as u32, e as u32))
                    })
                    .collect()
            })
            .unwrap_or_default();

        if ranges.is_empty() {
            vec![(1, 100_000)]
        } else {
            ranges
        }
    }

    pub fn filename_embd_weight(&self) -> Option<f32> {
        self.0
            .get("filename_embd_weight")
            .and_then(|v| v.as_f64())
            .map(|v| v as f32)
    }

    /// Number of keywords to generate per chunk (0 disables)
    pub fn auto_keywords(&self) -> usize {
        self.u64_field("auto_keywords").unwrap_or(0) as usize
    }

    /// Number of questions to generate per chunk (0 disables)
    pub fn auto_questions(&self) -> usize {
        self.u64_field("auto_questions").unwrap_or(0) as usize
    }

    /// Knowledge bases whose tag sets are applied to new chunks
    pub fn tag_kb_ids(&self) -> Vec<String> {
        self.0
            .get("tag_kb_ids")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn topn_tags(&self) -> usize {
        self.u64_field("topn_tags").unwrap_or(3) as usize
    }

    /// Target chunk size in tokens for the text splitter
    pub fn chunk_token_num(&self) -> usize {
        self.u64_field("chunk_token_num").filter(|v| *v > 0).unwrap_or(128) as usize
    }

    pub fn delimiter(&self) -> String {
        self.0
            .get("delimiter")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("\n!?。；！？")
            .to_string()
    }

    /// Whether the two-pass document metadata extraction runs
    pub fn extract_metadata(&self) -> bool {
        self.0
            .get("extract_metadata")
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }

    pub fn raptor(&self) -> RaptorConfig {
        self.0
            .get("raptor")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn use_graphrag(&self) -> bool {
        self.0
            .get("graphrag")
            .and_then(|g| g.get("use_graphrag"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Hierarchical summarization settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RaptorConfig {
    #[serde(default)]
    pub use_raptor: bool,
    #[serde(default = "default_raptor_prompt")]
    pub prompt: String,
    #[serde(default = "default_max_token")]
    pub max_token: usize,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_max_cluster")]
    pub max_cluster: usize,
    #[serde(default)]
    pub random_seed: u64,
}

fn default_raptor_prompt() -> String {
    "Please summarize the following paragraphs. Be careful with the numbers, do not make things up. \
     Paragraphs as following:\n      {cluster_content}\nThe above is the content you need to summarize."
        .to_string()
}
fn default_max_token() -> usize { 512 }
fn default_threshold() -> f64 { 0.1 }
fn default_max_cluster() -> usize { 64 }

impl Default for RaptorConfig {
    fn default() -> Self {
        Self {
            use_raptor: false,
            prompt: default_raptor_prompt(),
            max_token: default_max_token(),
            threshold: default_threshold(),
            max_cluster: default_max_cluster(),
            random_seed: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_on_empty_config() {
        let config = ParserConfig::default();
        assert_eq!(config.task_page_size(), None);
        assert_eq!(config.layout_recognize(), "DeepDOC");
        assert_eq!(config.pages(), vec![(1, 100_000)]);
        assert_eq!(config.topn_tags(), 3);
        assert_eq!(config.chunk_token_num(), 128);
        assert!(!config.raptor().use_raptor);
        assert_eq!(config.raptor().max_cluster, 64);
    }

    #[test]
    fn test_reads_overrides() {
        let config = ParserConfig::from_value(json!({
            "task_page_size": 5,
            "layout_recognize": "Plain Text",
            "pages": [[1, 3], [10, 20]],
            "auto_keywords": "4",
            "tag_kb_ids": ["tags1"],
            "raptor": {"use_raptor": true, "max_cluster": 8, "random_seed": 7}
        }));
        assert_eq!(config.task_page_size(), Some(5));
        assert_eq!(config.layout_recognize(), "Plain Text");
        assert_eq!(config.pages(), vec![(1, 3), (10, 20)]);
        assert_eq!(config.auto_keywords(), 4);
        assert_eq!(config.tag_kb_ids(), vec!["tags1".to_string()]);

        let raptor = config.raptor();
        assert!(raptor.use_raptor);
        assert_eq!(raptor.max_cluster, 8);
        assert_eq!(raptor.random_seed, 7);
        assert_eq!(raptor.max_token, 512);
        assert!(raptor.prompt.contains("{cluster_content}"));
    }

    #[test]
    fn test_non_object_becomes_empty() {
        let config = ParserConfig::from_value(json!([1, 2]));
        assert_eq!(config.as_value(), &json!({}));
    }
}
