// src/embedding.rs
//
// =============================================================================
// RAGKEEPER: EMBEDDING PROVIDER
// =============================================================================
//
// The hexagonal port for turning text into vectors: a trait plus a factory
// that dispatches on whether a remote endpoint is configured.

use crate::error::IndexError;
use async_trait::async_trait;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, IndexError>;

    async fn embed_batch_async(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        let borrowed: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
        self.embed_batch(&borrowed)
    }

    fn dimensions(&self) -> usize;
}

/// Deterministic hash-based embedding. Stands in for a real model so the
/// pipeline is runnable end to end without network access; dimensions and
/// hashing choice mirror the shape of a small sentence-transformer output,
/// not its semantics.
pub struct HashEmbeddingProvider {
    dimensions: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl EmbeddingProvider for HashEmbeddingProvider {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, IndexError> {
        Ok(texts.iter().map(|t| hash_embed(t, self.dimensions)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

fn hash_embed(text: &str, dimensions: usize) -> Vec<f32> {
    let mut vector = vec![0f32; dimensions];
    for (i, byte) in text.bytes().enumerate() {
        let slot = i % dimensions;
        vector[slot] += byte as f32;
    }
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
    vector
}

/// HTTP client over a remote embedding API. The wire contract is narrow: POST
/// `{model, input}`, expect `{embeddings: [[f32; N]]}`.
pub struct RemoteEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimensions: usize,
}

impl RemoteEmbeddingProvider {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            dimensions,
        }
    }

    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            model: &'a str,
            input: &'a [String],
        }
        #[derive(serde::Deserialize)]
        struct Resp {
            embeddings: Vec<Vec<f32>>,
        }

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&Req {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| IndexError::Embedding(format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(IndexError::Embedding(format!(
                "embedding provider returned status {}",
                resp.status()
            )));
        }
        let parsed: Resp = resp
            .json()
            .await
            .map_err(|e| IndexError::Embedding(format!("invalid response: {e}")))?;
        Ok(parsed.embeddings)
    }
}

impl EmbeddingProvider for RemoteEmbeddingProvider {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, IndexError> {
        let owned: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
        let handle = tokio::runtime::Handle::try_current();
        match handle {
            Ok(h) => tokio::task::block_in_place(|| h.block_on(self.embed(&owned))),
            Err(_) => Err(IndexError::Embedding(
                "remote embedding provider requires a tokio runtime".into(),
            )),
        }
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Builds a remote HTTP provider when an endpoint is configured, otherwise
/// falls back to the deterministic hash embedder.
pub fn build_provider(model_name: &str, remote_endpoint: Option<&str>) -> Box<dyn EmbeddingProvider> {
    match remote_endpoint {
        Some(endpoint) => Box::new(RemoteEmbeddingProvider::new(endpoint, model_name, 384)),
        None => Box::new(HashEmbeddingProvider::new(384)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_embeddings_are_deterministic() {
        let provider = HashEmbeddingProvider::new(16);
        let a = provider.embed_batch(&["hello"]).unwrap();
        let b = provider.embed_batch(&["hello"]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 16);
    }

    #[test]
    fn different_text_yields_different_vectors() {
        let provider = HashEmbeddingProvider::new(16);
        let a = provider.embed_batch(&["hello"]).unwrap();
        let b = provider.embed_batch(&["goodbye world"]).unwrap();
        assert_ne!(a, b);
    }
}
