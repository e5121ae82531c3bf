//! In-memory [`VectorStore`] for local runs and tests.
//!
//! Chunks live in a `Vec` behind `std::sync::RwLock`. Scoring depends on
//! whether an embedding provider is configured:
//!
//! - **with embeddings**: brute-force cosine similarity against every stored vector;
//! - **without**: keyword overlap (number of distinct query terms found in
//!   the chunk, case-insensitive). Chunks matching no term are not returned.
//!
//! Ties keep insertion order. Uploading a file again replaces every chunk
//! previously stored under the same `file_name`; vectors of chunks whose
//! text is unchanged (same SHA-256) are reused instead of re-embedded.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::VectorStore;
use crate::embedding::{cosine_similarity, embed_batched, embed_query, EmbeddingProvider};
use crate::error::{RagError, Stage};
use crate::models::{Chunk, RetrievedPassage};

struct StoredChunk {
    chunk: Chunk,
    hash: String,
    vector: Option<Vec<f32>>,
}

pub struct MemoryStore {
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    batch_size: usize,
    chunks: RwLock<Vec<StoredChunk>>,
}

impl MemoryStore {
    pub fn new(embedder: Option<Arc<dyn EmbeddingProvider>>, batch_size: usize) -> Self {
        Self {
            embedder,
            batch_size,
            chunks: RwLock::new(Vec::new()),
        }
    }

    /// Number of chunks currently stored.
    pub fn len(&self) -> Result<usize> {
        Ok(self.chunks.read().map_err(|_| Self::poisoned())?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn poisoned() -> anyhow::Error {
        anyhow::anyhow!("memory store lock poisoned")
    }

    /// Vectors for `chunks`, reusing any already stored for identical text.
    async fn vectors_for(
        &self,
        embedder: &dyn EmbeddingProvider,
        chunks: &[Chunk],
        hashes: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let cached: HashMap<String, Vec<f32>> = {
            let stored = self.chunks.read().map_err(|_| Self::poisoned())?;
            stored
                .iter()
                .filter(|sc| hashes.contains(&sc.hash))
                .filter_map(|sc| sc.vector.clone().map(|v| (sc.hash.clone(), v)))
                .collect()
        };

        let missing: Vec<String> = chunks
            .iter()
            .zip(hashes)
            .filter(|(_, h)| !cached.contains_key(*h))
            .map(|(c, _)| c.content.clone())
            .collect();
        if !cached.is_empty() {
            tracing::debug!(
                reused = cached.len(),
                embedding = missing.len(),
                "reusing cached vectors"
            );
        }
        let mut fresh = embed_batched(embedder, &missing, self.batch_size)
            .await
            .map_err(|e| RagError::upstream(Stage::Embedding, e))?
            .into_iter();

        let mut out = Vec::with_capacity(chunks.len());
        for hash in hashes {
            match cached.get(hash) {
                Some(v) => out.push(v.clone()),
                None => out.push(
                    fresh
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("embedding count mismatch"))?,
                ),
            }
        }
        Ok(out)
    }
}

fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn keyword_score(terms: &[String], text: &str) -> f32 {
    let text_lower = text.to_lowercase();
    terms.iter().filter(|t| text_lower.contains(t.as_str())).count() as f32
}

#[async_trait]
impl VectorStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn add_chunks(&self, chunks: &[Chunk]) -> Result<usize> {
        let hashes: Vec<String> = chunks.iter().map(|c| content_hash(&c.content)).collect();

        let vectors = match &self.embedder {
            Some(embedder) => Some(self.vectors_for(embedder.as_ref(), chunks, &hashes).await?),
            None => None,
        };

        let replaced: HashSet<Option<String>> =
            chunks.iter().map(|c| c.metadata.file_name.clone()).collect();

        let mut stored = self.chunks.write().map_err(|_| Self::poisoned())?;
        stored.retain(|sc| !replaced.contains(&sc.chunk.metadata.file_name));

        let mut vectors = vectors.map(Vec::into_iter);
        for (chunk, hash) in chunks.iter().zip(hashes) {
            stored.push(StoredChunk {
                chunk: chunk.clone(),
                hash,
                vector: vectors.as_mut().and_then(|v| v.next()),
            });
        }

        Ok(chunks.len())
    }

    async fn similarity_search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedPassage>> {
        let mut scored: Vec<(f32, Chunk)> = match &self.embedder {
            Some(embedder) => {
                let query_vec = embed_query(embedder.as_ref(), query)
                    .await
                    .map_err(|e| RagError::upstream(Stage::Embedding, e))?;
                let stored = self.chunks.read().map_err(|_| Self::poisoned())?;
                stored
                    .iter()
                    .filter_map(|sc| {
                        sc.vector
                            .as_ref()
                            .map(|v| (cosine_similarity(&query_vec, v), sc.chunk.clone()))
                    })
                    .collect()
            }
            None => {
                let terms: Vec<String> = query
                    .to_lowercase()
                    .split_whitespace()
                    .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
                    .filter(|t| !t.is_empty())
                    .collect();
                let stored = self.chunks.read().map_err(|_| Self::poisoned())?;
                stored
                    .iter()
                    .map(|sc| (keyword_score(&terms, &sc.chunk.content), sc.chunk.clone()))
                    .filter(|(score, _)| *score > 0.0)
                    .collect()
            }
        };

        // Stable sort keeps insertion order for equal scores.
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(rank, (score, chunk))| RetrievedPassage {
                content: chunk.content,
                metadata: chunk.metadata,
                rank,
                score: Some(score),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_text;
    use crate::models::DocumentMetadata;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn doc_chunks(file: &str, text: &str) -> Vec<Chunk> {
        let meta = DocumentMetadata {
            file_name: Some(file.to_string()),
            content_type: None,
        };
        chunk_text(text, &meta, 2, 1).unwrap()
    }

    #[tokio::test]
    async fn test_keyword_search_ranks_by_overlap() {
        let store = MemoryStore::new(None, 16);
        store
            .add_chunks(&doc_chunks("rust.md", "Cargo builds crates"))
            .await
            .unwrap();
        store
            .add_chunks(&doc_chunks("py.md", "Pip installs packages"))
            .await
            .unwrap();
        store
            .add_chunks(&doc_chunks("both.md", "Cargo and pip install crates"))
            .await
            .unwrap();

        let results = store.similarity_search("cargo crates?", 3).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].metadata.file_name.as_deref(), Some("rust.md"));
        assert_eq!(results[0].rank, 0);
        assert_eq!(results[1].metadata.file_name.as_deref(), Some("both.md"));
        assert_eq!(results[1].rank, 1);
    }

    #[tokio::test]
    async fn test_reupload_replaces_file_chunks() {
        let store = MemoryStore::new(None, 16);
        store
            .add_chunks(&doc_chunks("a.md", "One. Two. Three. Four"))
            .await
            .unwrap();
        assert_eq!(store.len().unwrap(), 3);
        store.add_chunks(&doc_chunks("a.md", "Only one")).await.unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_top_k_truncates() {
        let store = MemoryStore::new(None, 16);
        for i in 0..5 {
            store
                .add_chunks(&doc_chunks(&format!("{}.md", i), "shared term"))
                .await
                .unwrap();
        }
        let results = store.similarity_search("shared", 3).await.unwrap();
        assert_eq!(results.len(), 3);
        let names: Vec<_> = results
            .iter()
            .map(|r| r.metadata.file_name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["0.md", "1.md", "2.md"]);
    }

    /// Embeds text as (count of 'a', count of 'b') and counts calls.
    struct LetterEmbedder {
        embedded: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for LetterEmbedder {
        fn model_name(&self) -> &str {
            "letters"
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.embedded.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    vec![
                        t.matches('a').count() as f32,
                        t.matches('b').count() as f32,
                    ]
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_vector_search_and_cache() {
        let embedder = Arc::new(LetterEmbedder {
            embedded: AtomicUsize::new(0),
        });
        let store = MemoryStore::new(Some(embedder.clone()), 16);
        store.add_chunks(&doc_chunks("a.txt", "aaaa")).await.unwrap();
        store.add_chunks(&doc_chunks("b.txt", "bbbb")).await.unwrap();
        assert_eq!(embedder.embedded.load(Ordering::SeqCst), 2);

        let results = store.similarity_search("bb", 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].metadata.file_name.as_deref(), Some("b.txt"));

        // Same text again: vector reused, only the query is embedded.
        store.add_chunks(&doc_chunks("a.txt", "aaaa")).await.unwrap();
        assert_eq!(embedder.embedded.load(Ordering::SeqCst), 3);
        assert_eq!(store.len().unwrap(), 2);
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        fn model_name(&self) -> &str {
            "failing"
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            anyhow::bail!("invalid api key")
        }
    }

    #[tokio::test]
    async fn test_embedding_failure_is_tagged_and_stores_nothing() {
        let store = MemoryStore::new(Some(Arc::new(FailingEmbedder)), 16);
        let err = store
            .add_chunks(&doc_chunks("a.md", "One. Two"))
            .await
            .unwrap_err();
        let err = err.downcast::<RagError>().unwrap();
        assert!(matches!(err, RagError::Upstream { stage: Stage::Embedding, .. }));
        assert!(store.is_empty().unwrap());

        let err = store.similarity_search("one", 3).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RagError>(),
            Some(RagError::Upstream { stage: Stage::Embedding, .. })
        ));
    }

    #[test]
    fn test_poisoned_lock_is_reported() {
        let store = Arc::new(MemoryStore::new(None, 16));
        let poisoner = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.chunks.write().unwrap();
            panic!("poison the lock");
        })
        .join();

        let err = store.len().unwrap_err();
        assert!(err.to_string().contains("poisoned"));
        assert!(store.is_empty().is_err());
    }
}
