//! Embedding client and vector helpers
//!
//! [`EmbeddingClient`] turns embedding failures into `None` so callers can
//! degrade (skip similarity routing, fall back to neutral relevance) instead
//! of failing the request.

use std::sync::Arc;

use tracing::warn;

use crate::llm::Embedder;

#[derive(Clone)]
pub struct EmbeddingClient {
    embedder: Arc<dyn Embedder>,
}

impl std::fmt::Debug for EmbeddingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingClient")
            .field("available", &self.embedder.is_available())
            .finish()
    }
}

impl EmbeddingClient {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    pub fn is_available(&self) -> bool {
        self.embedder.is_available()
    }

    /// Embed `text`, or `None` when it is blank or the embedder is unavailable or fails
    pub async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        if text.trim().is_empty() || !self.embedder.is_available() {
            return None;
        }
        match self.embedder.embed(text).await {
            Ok(vector) if !vector.is_empty() => Some(vector),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Embedding failed");
                None
            }
        }
    }
}

/// Cosine similarity; 0 for mismatched lengths or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Little-endian f32 BLOB encoding used by the reward store
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEmbedder;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_blob_encoding() {
        let vector = vec![0.25f32, -1.5, 3.0];
        let bytes = encode_embedding(&vector);
        assert_eq!(bytes.len(), 12);
        assert_eq!(decode_embedding(&bytes), Some(vector));
        assert_eq!(decode_embedding(&[1, 2, 3]), None);
        assert_eq!(decode_embedding(&[]), None);
    }

    #[tokio::test]
    async fn test_embed_degrades_to_none() {
        let client = EmbeddingClient::new(Arc::new(FakeEmbedder::unavailable()));
        assert!(client.embed("hello").await.is_none());

        let client = EmbeddingClient::new(Arc::new(FakeEmbedder::failing()));
        assert!(client.embed("hello").await.is_none());

        let client = EmbeddingClient::new(Arc::new(FakeEmbedder::new()));
        assert!(client.embed("   ").await.is_none());
        assert!(client.embed("hello").await.is_some());
    }
}
