//! In-process model providers with deterministic output
//!
//! Used by the test suites and for dry runs without a model server.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

use super::embedding::EmbeddingProvider;
use super::factory::ModelFactory;
use super::llm::{ChatMessage, ChatProvider, GenConf};

type Responder = dyn Fn(&str, &[ChatMessage]) -> String + Send + Sync;

/// Bag-of-characters embedder: similar texts get similar vectors
pub struct MockEmbedder {
    dim: usize,
    calls: AtomicUsize,
    texts_seen: AtomicUsize,
    fail: AtomicBool,
}

impl MockEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim: dim.max(1),
            calls: AtomicUsize::new(0),
            texts_seen: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `encode` call fail
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn texts_seen(&self) -> usize {
        self.texts_seen.load(Ordering::SeqCst)
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        for c in text.chars() {
            v[c as usize % self.dim] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        } else {
            v[0] = 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn encode(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, usize)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::embedding("mock embedder configured to fail"));
        }
        self.texts_seen.fetch_add(texts.len(), Ordering::SeqCst);
        let tokens = texts.iter().map(|t| t.split_whitespace().count()).sum();
        Ok((texts.iter().map(|t| self.vector_for(t)).collect(), tokens))
    }

    fn max_length(&self) -> usize {
        8192
    }

    fn model(&self) -> &str {
        "mock-embedding"
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Chat model answering through a caller supplied function
pub struct MockChat {
    responder: Box<Responder>,
    calls: AtomicUsize,
    max_length: usize,
}

impl MockChat {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, &[ChatMessage]) -> String + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
            max_length: 8192,
        }
    }

    /// Always answer with the same text
    pub fn fixed(answer: impl Into<String>) -> Self {
        let answer = answer.into();
        Self::new(move |_, _| answer.clone())
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for MockChat {
    async fn chat(
        &self,
        system: &str,
        history: &[ChatMessage],
        _conf: &GenConf,
    ) -> Result<(String, usize)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = (self.responder)(system, history);
        let tokens = answer.split_whitespace().count();
        Ok((answer, tokens))
    }

    fn max_length(&self) -> usize {
        self.max_length
    }

    fn model(&self) -> &str {
        "mock-chat"
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Factory handing out shared mock models
pub struct MockModelFactory {
    pub embedder: Arc<MockEmbedder>,
    pub chat: Arc<MockChat>,
    bind_error: Option<String>,
    chat_bind_error: Option<String>,
}

impl MockModelFactory {
    pub fn new(embedder: Arc<MockEmbedder>, chat: Arc<MockChat>) -> Self {
        Self {
            embedder,
            chat,
            bind_error: None,
            chat_bind_error: None,
        }
    }

    /// Fail every embedding bind with the given message
    pub fn with_bind_error(mut self, message: impl Into<String>) -> Self {
        self.bind_error = Some(message.into());
        self
    }

    /// Fail every chat model bind with the given message
    pub fn with_chat_bind_error(mut self, message: impl Into<String>) -> Self {
        self.chat_bind_error = Some(message.into());
        self
    }
}

impl ModelFactory for MockModelFactory {
    fn embedding_model(&self, _tenant_id: &str, model_id: &str) -> Result<Arc<dyn EmbeddingProvider>> {
        if let Some(message) = &self.bind_error {
            return Err(Error::config(format!("{} ({})", message, model_id)));
        }
        Ok(self.embedder.clone())
    }

    fn chat_model(&self, _tenant_id: &str, model_id: &str) -> Result<Arc<dyn ChatProvider>> {
        if let Some(message) = &self.chat_bind_error {
            return Err(Error::config(format!("{} ({})", message, model_id)));
        }
        Ok(self.chat.clone())
    }
}

/// Minimal PDF with one line of text per page
pub fn sample_pdf<S: AsRef<str>>(pages: &[S]) -> Result<Vec<u8>> {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Object, Stream};

    let mut doc = lopdf::Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
    for text in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(text.as_ref())]),
                Operation::new("ET", vec![]),
            ],
        };
        let encoded = content
            .encode()
            .map_err(|e| Error::internal(format!("Failed to encode PDF content: {}", e)))?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_embedder_is_deterministic() {
        let embedder = MockEmbedder::new(16);
        let (a, _) = embedder.encode(&["hello world".to_string()]).await.unwrap();
        let (b, _) = embedder.encode(&["hello world".to_string()]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 16);
        assert_eq!(embedder.calls(), 2);

        embedder.set_failing(true);
        assert!(embedder.encode(&["x".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn test_chat_responder() {
        let chat = MockChat::new(|_, history| format!("echo {}", history.len()));
        let (answer, _) = chat
            .chat("sys", &[ChatMessage::user("hi")], &GenConf::default())
            .await
            .unwrap();
        assert_eq!(answer, "echo 1");
        assert_eq!(chat.calls(), 1);
    }
}
