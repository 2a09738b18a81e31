// src/vector_store.rs
//
// =============================================================================
// RAGKEEPER: VECTOR-STORE MANAGER
// =============================================================================
//
// Owns the vector collection; every mutation flows through this module. The
// local backend shards chunk files by a two-character prefix of the
// source's hash, keeping each shard small and independently rewritable. The
// remote backend is a thin `reqwest` client over a narrow JSON contract.

use crate::batch::{self, BatchResult};
use crate::chunker::Chunk;
use crate::embedding::EmbeddingProvider;
use crate::error::IndexError;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct IncrementalUpdateResult {
    pub removed_count: usize,
    pub added_count: usize,
    pub failed_sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredChunk {
    id: String,
    source: String,
    ordinal: usize,
    content: String,
    title: String,
    url: String,
    categories: Vec<String>,
    embedding: Vec<f32>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn add(&self, chunks: &[Chunk], embedder: &dyn EmbeddingProvider) -> Result<usize, IndexError>;
    async fn remove_by_source(&self, source: &str) -> Result<usize, IndexError>;
    async fn validate_health(&self) -> bool;

    async fn incremental_update(
        &self,
        deleted_or_modified: &[String],
        new_or_modified_chunks: &HashMap<String, Vec<Chunk>>,
        embedder: &dyn EmbeddingProvider,
        max_concurrency: usize,
    ) -> Result<IncrementalUpdateResult, IndexError> {
        let mut removed_count = 0;
        for source in deleted_or_modified {
            removed_count += self.remove_by_source(source).await?;
        }

        let added = Mutex::new(0usize);
        let failed = Mutex::new(Vec::new());

        // Each source is embedded and inserted as its own call, so a
        // whole-source failure attaches to that source alone rather than
        // aborting (and losing attribution for) every source in the batch.
        stream::iter(new_or_modified_chunks.iter())
            .for_each_concurrent(max_concurrency.max(1), |(source, chunks)| {
                let added = &added;
                let failed = &failed;
                async move {
                    let texts: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
                    let outcome = match embedder.embed_batch(&texts) {
                        Ok(vectors) => {
                            let pairs: Vec<(Chunk, Vec<f32>)> =
                                chunks.iter().cloned().zip(vectors).collect();
                            self.insert_precomputed(&pairs).await
                        }
                        Err(e) => Err(e),
                    };
                    match outcome {
                        Ok(()) => *added.lock().unwrap() += chunks.len(),
                        Err(_) => failed.lock().unwrap().push(source.clone()),
                    }
                }
            })
            .await;

        let added_count = *added.lock().unwrap();
        let failed_sources = failed.into_inner().unwrap();
        Ok(IncrementalUpdateResult {
            removed_count,
            added_count,
            failed_sources,
        })
    }

    /// Hook for backends that can accept pre-embedded vectors directly,
    /// skipping a second embedding pass inside `add`.
    async fn insert_precomputed(&self, items: &[(Chunk, Vec<f32>)]) -> Result<(), IndexError>;
}

/// A sharded directory of JSON-lines shard files, one per two-character
/// source-hash prefix, with a small in-memory index loaded at open time.
pub struct LocalVectorStore {
    root: PathBuf,
    index: Mutex<HashMap<String, Vec<StoredChunk>>>,
}

fn shard_key(source: &str) -> String {
    let digest = crate::ledger::checksum_hex(crate::config::ChecksumAlgorithm::Sha256, source.as_bytes());
    digest[0..2].to_string()
}

impl LocalVectorStore {
    pub fn open_or_create(root: impl Into<PathBuf>, force_recreate: bool) -> Result<Self, IndexError> {
        let root = root.into();
        if force_recreate && root.exists() {
            fs::remove_dir_all(&root)
                .map_err(|e| IndexError::Store(format!("cannot clear store dir {:?}: {e}", root)))?;
        }
        fs::create_dir_all(&root)
            .map_err(|e| IndexError::Store(format!("cannot create store dir {:?}: {e}", root)))?;

        let mut index: HashMap<String, Vec<StoredChunk>> = HashMap::new();
        if root.exists() {
            for entry in fs::read_dir(&root)
                .map_err(|e| IndexError::Store(format!("cannot read store dir: {e}")))?
            {
                let entry = entry.map_err(|e| IndexError::Store(format!("cannot read store entry: {e}")))?;
                if entry.path().extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                let text = fs::read_to_string(entry.path())
                    .map_err(|e| IndexError::Store(format!("cannot read shard: {e}")))?;
                for line in text.lines() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let chunk: StoredChunk = serde_json::from_str(line)
                        .map_err(|e| IndexError::Store(format!("corrupt shard entry: {e}")))?;
                    index.entry(chunk.source.clone()).or_default().push(chunk);
                }
            }
        }

        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    fn shard_path(&self, source: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", shard_key(source)))
    }

    fn persist_shard(&self, source: &str) -> Result<(), IndexError> {
        let index = self.index.lock().unwrap();
        let shard_key_val = shard_key(source);
        let mut lines = Vec::new();
        for (src, chunks) in index.iter() {
            if shard_key(src) == shard_key_val {
                for chunk in chunks {
                    lines.push(
                        serde_json::to_string(chunk)
                            .map_err(|e| IndexError::Store(format!("cannot serialize chunk: {e}")))?,
                    );
                }
            }
        }
        let path = self.root.join(format!("{}.jsonl", shard_key_val));
        fs::write(&path, lines.join("\n") + if lines.is_empty() { "" } else { "\n" })
            .map_err(|e| IndexError::Store(format!("cannot write shard {:?}: {e}", path)))
    }
}

#[async_trait]
impl VectorStore for LocalVectorStore {
    async fn add(&self, chunks: &[Chunk], embedder: &dyn EmbeddingProvider) -> Result<usize, IndexError> {
        let texts: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        let vectors = embedder.embed_batch(&texts)?;
        let pairs: Vec<(Chunk, Vec<f32>)> = chunks.iter().cloned().zip(vectors).collect();
        self.insert_precomputed(&pairs).await?;
        Ok(pairs.len())
    }

    async fn remove_by_source(&self, source: &str) -> Result<usize, IndexError> {
        let removed = {
            let mut index = self.index.lock().unwrap();
            index.remove(source).map(|v| v.len()).unwrap_or(0)
        };
        if removed > 0 {
            self.persist_shard(source)?;
        }
        Ok(removed)
    }

    async fn validate_health(&self) -> bool {
        self.root.exists()
    }

    async fn insert_precomputed(&self, items: &[(Chunk, Vec<f32>)]) -> Result<(), IndexError> {
        let mut touched_sources = Vec::new();
        {
            let mut index = self.index.lock().unwrap();
            for (chunk, vector) in items {
                index
                    .entry(chunk.source.clone())
                    .or_default()
                    .push(StoredChunk {
                        id: format!("{}#{}", chunk.source, chunk.ordinal),
                        source: chunk.source.clone(),
                        ordinal: chunk.ordinal,
                        content: chunk.content.clone(),
                        title: chunk.title.clone(),
                        url: chunk.url.clone(),
                        categories: chunk.categories.clone(),
                        embedding: vector.clone(),
                    });
                touched_sources.push(chunk.source.clone());
            }
        }
        touched_sources.sort();
        touched_sources.dedup();
        for source in touched_sources {
            self.persist_shard(&source)?;
        }
        Ok(())
    }
}

/// HTTP client over a remote vector collection service.
pub struct RemoteVectorStore {
    client: reqwest::Client,
    base_url: String,
    collection_name: String,
}

impl RemoteVectorStore {
    pub fn new(base_url: impl Into<String>, collection_name: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            collection_name: collection_name.into(),
        }
    }
}

#[async_trait]
impl VectorStore for RemoteVectorStore {
    async fn add(&self, chunks: &[Chunk], embedder: &dyn EmbeddingProvider) -> Result<usize, IndexError> {
        let texts: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        let vectors = embedder.embed_batch(&texts)?;
        let pairs: Vec<(Chunk, Vec<f32>)> = chunks.iter().cloned().zip(vectors).collect();
        self.insert_precomputed(&pairs).await?;
        Ok(pairs.len())
    }

    async fn remove_by_source(&self, source: &str) -> Result<usize, IndexError> {
        #[derive(Serialize)]
        struct Req<'a> {
            collection: &'a str,
            source: &'a str,
        }
        #[derive(Deserialize)]
        struct Resp {
            removed: usize,
        }
        let resp = self
            .client
            .post(format!("{}/points/delete-by-source", self.base_url))
            .json(&Req {
                collection: &self.collection_name,
                source,
            })
            .send()
            .await
            .map_err(|e| IndexError::Store(format!("delete request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(IndexError::Store(format!("store returned {}", resp.status())));
        }
        let parsed: Resp = resp
            .json()
            .await
            .map_err(|e| IndexError::Store(format!("invalid delete response: {e}")))?;
        Ok(parsed.removed)
    }

    async fn validate_health(&self) -> bool {
        self.client
            .get(format!("{}/collections/{}", self.base_url, self.collection_name))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn insert_precomputed(&self, items: &[(Chunk, Vec<f32>)]) -> Result<(), IndexError> {
        if items.is_empty() {
            return Ok(());
        }
        #[derive(Serialize)]
        struct Point<'a> {
            id: String,
            vector: &'a [f32],
            source: &'a str,
            content: &'a str,
            title: &'a str,
            url: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            collection: &'a str,
            points: Vec<Point<'a>>,
        }

        let points: Vec<Point> = items
            .iter()
            .map(|(c, v)| Point {
                id: format!("{}#{}", c.source, c.ordinal),
                vector: v,
                source: &c.source,
                content: &c.content,
                title: &c.title,
                url: &c.url,
            })
            .collect();

        let resp = self
            .client
            .post(format!("{}/points/upsert", self.base_url))
            .json(&Req {
                collection: &self.collection_name,
                points,
            })
            .send()
            .await
            .map_err(|e| IndexError::Store(format!("upsert request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(IndexError::Store(format!("store returned {}", resp.status())));
        }
        Ok(())
    }
}

pub fn open_store(config: &crate::config::PipelineConfig) -> Result<Box<dyn VectorStore>, IndexError> {
    match &config.vector_store_url {
        Some(url) => Ok(Box::new(RemoteVectorStore::new(url.clone(), config.collection_name.clone()))),
        None => Ok(Box::new(LocalVectorStore::open_or_create(
            &config.vector_store_path,
            config.force_recreate,
        )?)),
    }
}

/// Thin façade used by the Pipeline Engine so add/remove can be delegated to
/// the Batch Processor when `enable_batch_processing` is set.
pub async fn add_chunks_batched(
    store: Arc<dyn VectorStore>,
    chunks: Vec<Chunk>,
    embedder: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    pause: Duration,
    max_concurrency: usize,
) -> BatchResult<Chunk, IndexError> {
    batch::process(chunks, batch_size, pause, max_concurrency, move |chunk| {
        let embedder = embedder.clone();
        let store = store.clone();
        async move {
            store
                .add(std::slice::from_ref(&chunk), embedder.as_ref())
                .await
                .map(|_| chunk.clone())
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbeddingProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn chunk(source: &str, ordinal: usize) -> Chunk {
        Chunk {
            content: format!("content for {source}#{ordinal}"),
            source: source.to_string(),
            ordinal,
            title: "T".into(),
            url: "u".into(),
            categories: vec![],
        }
    }

    #[tokio::test]
    async fn local_store_add_and_remove_round_trips() {
        let dir = tempdir().unwrap();
        let store = LocalVectorStore::open_or_create(dir.path(), false).unwrap();
        let embedder = HashEmbeddingProvider::new(8);
        let chunks = vec![chunk("a.md", 0), chunk("a.md", 1), chunk("b.md", 0)];
        let added = store.add(&chunks, &embedder).await.unwrap();
        assert_eq!(added, 3);

        let removed = store.remove_by_source("a.md").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.remove_by_source("a.md").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn force_recreate_clears_existing_shards() {
        let dir = tempdir().unwrap();
        {
            let store = LocalVectorStore::open_or_create(dir.path(), false).unwrap();
            let embedder = HashEmbeddingProvider::new(8);
            store.add(&[chunk("a.md", 0)], &embedder).await.unwrap();
        }
        let reopened = LocalVectorStore::open_or_create(dir.path(), true).unwrap();
        assert_eq!(reopened.remove_by_source("a.md").await.unwrap(), 0);
    }

    /// A store whose `insert_precomputed` fails for any source after the
    /// first `fail_after` sources it has seen -- stands in for "the backing
    /// store starts erroring partway through a large update."
    struct FlakyStore {
        inner: LocalVectorStore,
        seen: AtomicUsize,
        fail_after: usize,
    }

    #[async_trait]
    impl VectorStore for FlakyStore {
        async fn add(&self, chunks: &[Chunk], embedder: &dyn EmbeddingProvider) -> Result<usize, IndexError> {
            self.inner.add(chunks, embedder).await
        }

        async fn remove_by_source(&self, source: &str) -> Result<usize, IndexError> {
            self.inner.remove_by_source(source).await
        }

        async fn validate_health(&self) -> bool {
            true
        }

        async fn insert_precomputed(&self, items: &[(Chunk, Vec<f32>)]) -> Result<(), IndexError> {
            let call = self.seen.fetch_add(1, Ordering::SeqCst);
            if call >= self.fail_after {
                return Err(IndexError::Store("simulated store failure".into()));
            }
            self.inner.insert_precomputed(items).await
        }
    }

    #[tokio::test]
    async fn partial_failure_during_incremental_update_reports_failed_sources() {
        let dir = tempdir().unwrap();
        let store = FlakyStore {
            inner: LocalVectorStore::open_or_create(dir.path(), false).unwrap(),
            seen: AtomicUsize::new(0),
            fail_after: 1,
        };
        let embedder = HashEmbeddingProvider::new(8);

        let mut new_chunks = HashMap::new();
        new_chunks.insert("a.md".to_string(), vec![chunk("a.md", 0)]);
        new_chunks.insert("b.md".to_string(), vec![chunk("b.md", 0)]);

        let result = store.incremental_update(&[], &new_chunks, &embedder, 1).await.unwrap();

        // Concurrency is capped at 1, so the two sources are inserted one at a
        // time: the first call succeeds, the second trips fail_after. Which
        // source lands in which bucket depends on HashMap iteration order,
        // but exactly one of each is guaranteed.
        assert_eq!(result.added_count, 1);
        assert_eq!(result.failed_sources.len(), 1);
    }
}
