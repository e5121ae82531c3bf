//! Weaviate-backed [`VectorStore`].
//!
//! Vectors are computed client-side with the configured embedding provider
//! and sent explicitly, so the Weaviate class needs no vectorizer module.
//! Chunk metadata is stored as object properties:
//!
//! | Property | Type |
//! |----------|------|
//! | `text` | text |
//! | `file_name` | text |
//! | `content_type` | text |
//! | `chunk_index` | int |
//! | `chunk_count` | int |
//! | `chunk_info` | text |
//!
//! Properties missing from a stored object come back as `null` and map to
//! `None`, which the aggregator handles by falling back to arrival order.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use super::VectorStore;
use crate::config::Config;
use crate::embedding::{embed_batched, embed_query, EmbeddingProvider};
use crate::error::{RagError, Stage};
use crate::http::{client, post_json_with_retry};
use crate::models::{Chunk, ChunkMetadata, ContentType, RetrievedPassage};

const PROPERTIES: &str = "text file_name content_type chunk_index chunk_count chunk_info";

pub struct WeaviateStore {
    client: reqwest::Client,
    url: String,
    class_name: String,
    embedder: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    max_retries: u32,
}

impl WeaviateStore {
    pub fn new(config: &Config, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        Ok(Self {
            client: client(config.store.timeout_secs)?,
            url: config.weaviate_url(),
            class_name: config.store.class_name.clone(),
            embedder,
            batch_size: config.embedding.batch_size,
            max_retries: config.store.max_retries,
        })
    }
}

fn chunk_object(class_name: &str, chunk: &Chunk, vector: &[f32]) -> Value {
    let m = &chunk.metadata;
    json!({
        "class": class_name,
        "id": Uuid::new_v4().to_string(),
        "properties": {
            "text": chunk.content,
            "file_name": m.file_name,
            "content_type": m.content_type.map(|c| c.as_str()),
            "chunk_index": m.chunk_index,
            "chunk_count": m.chunk_count,
            "chunk_info": m.chunk_info,
        },
        "vector": vector,
    })
}

/// Collect per-object errors from a `/v1/batch/objects` response.
fn batch_errors(response: &Value) -> Vec<String> {
    response
        .as_array()
        .map(|objects| {
            objects
                .iter()
                .filter_map(|o| o.pointer("/result/errors/error"))
                .filter_map(|e| e.as_array())
                .flatten()
                .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn near_vector_query(class_name: &str, vector: &[f32], limit: usize) -> Result<String> {
    Ok(format!(
        "{{ Get {{ {}(nearVector: {{vector: {}}}, limit: {}) {{ {} {} }} }} }}",
        class_name,
        serde_json::to_string(vector)?,
        limit,
        PROPERTIES,
        "_additional { distance }"
    ))
}

fn opt_usize(v: Option<&Value>) -> Option<usize> {
    let v = v?;
    v.as_u64()
        .or_else(|| v.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
        .map(|n| n as usize)
}

fn opt_string(v: Option<&Value>) -> Option<String> {
    v.and_then(|s| s.as_str()).map(str::to_string)
}

/// Parse the `data.Get.<class>` array of a GraphQL response.
fn parse_search_response(class_name: &str, json: &Value) -> Result<Vec<RetrievedPassage>> {
    if let Some(errors) = json.get("errors").and_then(|e| e.as_array()) {
        let messages: Vec<&str> = errors
            .iter()
            .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
            .collect();
        bail!("Weaviate query error: {}", messages.join("; "));
    }

    let objects = match json.pointer(&format!("/data/Get/{}", class_name)) {
        Some(Value::Array(objects)) => objects,
        Some(Value::Null) | None => return Ok(Vec::new()),
        Some(_) => bail!("Invalid Weaviate response: Get.{} is not an array", class_name),
    };

    Ok(objects
        .iter()
        .enumerate()
        .map(|(rank, o)| RetrievedPassage {
            content: opt_string(o.get("text")).unwrap_or_default(),
            metadata: ChunkMetadata {
                file_name: opt_string(o.get("file_name")),
                content_type: o
                    .get("content_type")
                    .and_then(|c| c.as_str())
                    .and_then(ContentType::parse),
                chunk_index: opt_usize(o.get("chunk_index")),
                chunk_count: opt_usize(o.get("chunk_count")),
                chunk_info: opt_string(o.get("chunk_info")),
            },
            rank,
            score: o
                .pointer("/_additional/distance")
                .and_then(|d| d.as_f64())
                .map(|d| 1.0 - d as f32),
        })
        .collect())
}

#[async_trait]
impl VectorStore for WeaviateStore {
    fn name(&self) -> &str {
        "weaviate"
    }

    async fn add_chunks(&self, chunks: &[Chunk]) -> Result<usize> {
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = embed_batched(self.embedder.as_ref(), &texts, self.batch_size)
            .await
            .map_err(|e| RagError::upstream(Stage::Embedding, e))?;

        for (batch, batch_vectors) in chunks
            .chunks(self.batch_size.max(1))
            .zip(vectors.chunks(self.batch_size.max(1)))
        {
            let objects: Vec<Value> = batch
                .iter()
                .zip(batch_vectors)
                .map(|(c, v)| chunk_object(&self.class_name, c, v))
                .collect();
            let response = post_json_with_retry(
                &self.client,
                &format!("{}/v1/batch/objects", self.url),
                &[],
                &json!({ "objects": objects }),
                self.max_retries,
                "Weaviate",
            )
            .await?;

            let errors = batch_errors(&response);
            if !errors.is_empty() {
                bail!("Weaviate rejected {} object(s): {}", errors.len(), errors.join("; "));
            }
        }

        tracing::debug!(store = "weaviate", chunks = chunks.len(), "chunks indexed");
        Ok(chunks.len())
    }

    async fn similarity_search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedPassage>> {
        let vector = embed_query(self.embedder.as_ref(), query)
            .await
            .map_err(|e| RagError::upstream(Stage::Embedding, e))?;
        let graphql = near_vector_query(&self.class_name, &vector, top_k)?;
        let response = post_json_with_retry(
            &self.client,
            &format!("{}/v1/graphql", self.url),
            &[],
            &json!({ "query": graphql }),
            self.max_retries,
            "Weaviate",
        )
        .await?;
        parse_search_response(&self.class_name, &response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_object_properties() {
        let chunk = Chunk {
            content: "body".to_string(),
            metadata: ChunkMetadata {
                file_name: Some("a.md".to_string()),
                content_type: Some(ContentType::Markdown),
                chunk_index: Some(1),
                chunk_count: Some(2),
                chunk_info: Some(" (part 2/2)".to_string()),
            },
        };
        let obj = chunk_object("Documents", &chunk, &[0.5, 1.0]);
        assert_eq!(obj["class"], "Documents");
        assert_eq!(obj["properties"]["text"], "body");
        assert_eq!(obj["properties"]["content_type"], "text/markdown");
        assert_eq!(obj["properties"]["chunk_index"], 1);
        assert_eq!(obj["vector"], json!([0.5, 1.0]));
        assert!(Uuid::parse_str(obj["id"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_near_vector_query() {
        let q = near_vector_query("Documents", &[1.0, 0.5], 3).unwrap();
        assert_eq!(
            q,
            "{ Get { Documents(nearVector: {vector: [1.0,0.5]}, limit: 3) { text file_name content_type chunk_index chunk_count chunk_info _additional { distance } } } }"
        );
    }

    #[test]
    fn test_parse_search_response_with_missing_metadata() {
        let json = json!({
            "data": { "Get": { "Documents": [
                { "text": "first", "file_name": "a.md", "content_type": "text/markdown",
                  "chunk_index": 2, "chunk_count": 3, "chunk_info": " (part 3/3)",
                  "_additional": { "distance": 0.25 } },
                { "text": "second", "file_name": null, "chunk_index": null }
            ] } }
        });
        let passages = parse_search_response("Documents", &json).unwrap();
        assert_eq!(passages.len(), 2);
        assert_eq!(passages[0].metadata.chunk_index, Some(2));
        assert_eq!(passages[0].metadata.content_type, Some(ContentType::Markdown));
        assert_eq!(passages[0].score, Some(0.75));
        assert_eq!(passages[1].rank, 1);
        assert_eq!(passages[1].metadata.file_name, None);
        assert_eq!(passages[1].metadata.chunk_index, None);
    }

    #[test]
    fn test_parse_search_response_errors() {
        let json = json!({ "errors": [{ "message": "class not found" }] });
        let err = parse_search_response("Documents", &json).unwrap_err();
        assert!(err.to_string().contains("class not found"));

        let empty = json!({ "data": { "Get": { "Documents": null } } });
        assert!(parse_search_response("Documents", &empty).unwrap().is_empty());
    }

    #[test]
    fn test_batch_errors() {
        let resp = json!([
            { "result": {} },
            { "result": { "errors": { "error": [{ "message": "bad vector" }] } } }
        ]);
        assert_eq!(batch_errors(&resp), vec!["bad vector".to_string()]);
    }
}
