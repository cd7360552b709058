//! Chunk embedding with title weighting

use ndarray::Array1;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};
use crate::ingestion::parser::ProgressFn;
use crate::providers::EmbeddingProvider;
use crate::types::Chunk;

static TABLE_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"</?(table|td|caption|tr|th)( [^<>]{0,12})?>").expect("Invalid regex")
});

/// Text embedded for the body of a chunk
///
/// Generated questions stand in for the content when present; table markup
/// is blanked so it does not dominate the vector.
pub fn embedding_text(chunk: &Chunk) -> String {
    let text = if chunk.question_kwd.is_empty() {
        TABLE_TAG_RE
            .replace_all(&chunk.content_with_weight, " ")
            .to_string()
    } else {
        chunk.question_kwd.join("\n")
    };
    if text.trim().is_empty() {
        "None".to_string()
    } else {
        text
    }
}

/// Set `vector` on every chunk to `w * title + (1 - w) * content`
///
/// Progress moves from 0.7 to 0.9 across the batches. Returns the tokens
/// consumed and the vector dimension.
pub async fn embed_chunks(
    chunks: &mut [Chunk],
    model: &dyn EmbeddingProvider,
    title_weight: f32,
    batch_size: usize,
    progress: ProgressFn<'_>,
) -> Result<(u64, usize)> {
    if chunks.is_empty() {
        return Ok((0, 0));
    }
    let batch_size = batch_size.max(1);

    // Every chunk of a document shares one title, so it is embedded once
    let title = chunks
        .iter()
        .map(|c| c.docnm_kwd.as_str())
        .find(|t| !t.is_empty())
        .unwrap_or("Title")
        .to_string();
    let (title_vectors, mut tokens) = model.encode(&[title]).await?;
    let title_vector = title_vectors
        .into_iter()
        .next()
        .map(Array1::from)
        .ok_or_else(|| Error::embedding("Empty title embedding"))?;

    let texts: Vec<String> = chunks.iter().map(embedding_text).collect();
    let batches = texts.len().div_ceil(batch_size);
    let mut content_vectors: Vec<Vec<f32>> = Vec::with_capacity(texts.len());

    for (i, batch) in texts.chunks(batch_size).enumerate() {
        let (vectors, used) = model.encode(batch).await?;
        if vectors.len() != batch.len() {
            return Err(Error::embedding(format!(
                "Expected {} vectors, got {}",
                batch.len(),
                vectors.len()
            )));
        }
        content_vectors.extend(vectors);
        tokens += used;
        progress(Some(0.7 + 0.2 * (i + 1) as f32 / batches as f32), "")?;
    }

    let weight = title_weight.clamp(0.0, 1.0);
    let mut dim = 0;
    for (chunk, content) in chunks.iter_mut().zip(content_vectors) {
        let content = Array1::from(content);
        if content.len() != title_vector.len() {
            return Err(Error::embedding(format!(
                "Dimension mismatch: title {} vs content {}",
                title_vector.len(),
                content.len()
            )));
        }
        let combined = &title_vector * weight + &content * (1.0 - weight);
        dim = combined.len();
        chunk.vector = Some(combined.to_vec());
    }

    Ok((tokens as u64, dim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::MockEmbedder;

    fn noop(_: Option<f32>, _: &str) -> Result<()> {
        Ok(())
    }

    fn chunks(n: usize) -> Vec<Chunk> {
        (0..n)
            .map(|i| {
                let mut c = Chunk::new("d", "k", format!("chunk body number {}", i));
                c.docnm_kwd = "report.pdf".to_string();
                c
            })
            .collect()
    }

    #[tokio::test]
    async fn test_title_weighting() {
        let embedder = MockEmbedder::new(12);
        let mut items = chunks(10);
        let (_, dim) = embed_chunks(&mut items, &embedder, 0.1, 16, &noop).await.unwrap();
        assert_eq!(dim, 12);

        let title = embedder.vector_for("report.pdf");
        for chunk in &items {
            let content = embedder.vector_for(&chunk.content_with_weight);
            let vector = chunk.vector.as_ref().unwrap();
            for d in 0..12 {
                let expected = 0.1 * title[d] + 0.9 * content[d];
                assert!((vector[d] - expected).abs() < 1e-5);
            }
        }
        // one title request plus one batch
        assert_eq!(embedder.calls(), 2);
    }

    #[tokio::test]
    async fn test_batches_and_progress() {
        let embedder = MockEmbedder::new(4);
        let seen = parking_lot::Mutex::new(Vec::new());
        let record = |p: Option<f32>, _: &str| -> Result<()> {
            seen.lock().push(p.unwrap_or_default());
            Ok(())
        };
        let mut items = chunks(20);
        embed_chunks(&mut items, &embedder, 0.1, 16, &record).await.unwrap();

        let seen = seen.into_inner();
        assert_eq!(seen.len(), 2);
        assert!((seen[0] - 0.8).abs() < 1e-6);
        assert!((seen[1] - 0.9).abs() < 1e-6);
        assert_eq!(embedder.texts_seen(), 21);
    }

    #[test]
    fn test_embedding_text() {
        let mut chunk = Chunk::new("d", "k", "<table><tr><td>a</td></tr></table>");
        assert_eq!(embedding_text(&chunk).split_whitespace().collect::<Vec<_>>(), vec!["a"]);

        chunk.question_kwd = vec!["Why?".into(), "How?".into()];
        assert_eq!(embedding_text(&chunk), "Why?\nHow?");

        let empty = Chunk::new("d", "k", "<tr></tr>");
        assert_eq!(embedding_text(&empty), "None");
    }

    #[tokio::test]
    async fn test_encode_failure_propagates() {
        let embedder = MockEmbedder::new(4);
        embedder.set_failing(true);
        let mut items = chunks(2);
        assert!(embed_chunks(&mut items, &embedder, 0.1, 16, &noop).await.is_err());
    }
}
