//! Vector store abstraction.
//!
//! The [`VectorStore`] trait is the narrow contract the query pipeline
//! needs from storage: index chunks, and return a ranked list of passages
//! for a query. Embedding happens inside the store, so callers pass raw
//! text in both directions.
//!
//! Implementations must be `Send + Sync`: one store instance is shared by
//! every concurrent query.
//!
//! | Backend | Module | Notes |
//! |---------|--------|-------|
//! | `memory` | [`memory`] | In-process; cosine or keyword scoring |
//! | `weaviate` | [`weaviate`] | REST + GraphQL `nearVector` |

pub mod memory;
pub mod weaviate;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::models::{Chunk, RetrievedPassage};

/// Abstract storage backend for chunks.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Backend name for logs (e.g. `"memory"`).
    fn name(&self) -> &str;

    /// Index chunks. Returns the number of chunks stored.
    async fn add_chunks(&self, chunks: &[Chunk]) -> Result<usize>;

    /// Return up to `top_k` passages, most relevant first, with
    /// `rank` set to the position in the returned list.
    async fn similarity_search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedPassage>>;
}

/// Create the store named by `store.provider`.
///
/// `embedder` is `None` when embeddings are disabled; only the memory store
/// accepts that.
pub fn create_store(
    config: &Config,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
) -> Result<Arc<dyn VectorStore>> {
    match config.store.provider.as_str() {
        "memory" => Ok(Arc::new(memory::MemoryStore::new(
            embedder,
            config.embedding.batch_size,
        ))),
        "weaviate" => {
            let embedder = embedder.ok_or_else(|| {
                anyhow::anyhow!("store.provider 'weaviate' requires an embedding provider")
            })?;
            Ok(Arc::new(weaviate::WeaviateStore::new(config, embedder)?))
        }
        other => bail!("Unknown store provider: {}", other),
    }
}
