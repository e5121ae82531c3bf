//! Core data models used throughout the RAG server.
//!
//! These types represent the documents, chunks, retrieved passages, and
//! stream frames that flow through the ingestion and query pipelines.
//! Metadata is carried as typed records rather than string-keyed maps, so
//! a missing `chunk_index` is an explicit `None` instead of a failed
//! type assertion.

use serde::{Deserialize, Serialize};

/// Content type of an ingested document.
///
/// Inferred solely from the file name: a `.md` suffix (any case) means
/// Markdown, everything else is plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    #[serde(rename = "text/markdown")]
    Markdown,
    #[serde(rename = "text/plain")]
    PlainText,
}

impl ContentType {
    pub fn from_file_name(name: &str) -> Self {
        if name.to_lowercase().ends_with(".md") {
            ContentType::Markdown
        } else {
            ContentType::PlainText
        }
    }

    /// MIME string, e.g. `"text/markdown"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Markdown => "text/markdown",
            ContentType::PlainText => "text/plain",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text/markdown" => Some(ContentType::Markdown),
            "text/plain" => Some(ContentType::PlainText),
            _ => None,
        }
    }
}

/// Metadata attached to a document at upload time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub file_name: Option<String>,
    pub content_type: Option<ContentType>,
}

/// A raw document handed to the chunker.
#[derive(Debug, Clone)]
pub struct Document {
    pub text: String,
    pub metadata: DocumentMetadata,
}

impl Document {
    /// Build a document from an uploaded file, inferring its content type.
    pub fn from_upload(file_name: &str, bytes: &[u8]) -> Self {
        Self {
            text: String::from_utf8_lossy(bytes).into_owned(),
            metadata: DocumentMetadata {
                file_name: Some(file_name.to_string()),
                content_type: Some(ContentType::from_file_name(file_name)),
            },
        }
    }
}

/// Per-chunk metadata: the document metadata plus sequencing fields.
///
/// Every field is optional because passages coming back from a vector
/// store may have lost any of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub file_name: Option<String>,
    pub content_type: Option<ContentType>,
    /// 0-based position of the chunk within its document.
    pub chunk_index: Option<usize>,
    /// Total number of chunks produced for the document.
    pub chunk_count: Option<usize>,
    /// Human-readable position marker, e.g. `" (part 2/5)"`.
    pub chunk_info: Option<String>,
}

impl ChunkMetadata {
    /// Extend a document's metadata with sequencing fields.
    pub fn for_chunk(doc: &DocumentMetadata, index: usize, count: usize) -> Self {
        let chunk_info = if count == 1 {
            String::new()
        } else {
            format!(" (part {}/{})", index + 1, count)
        };
        Self {
            file_name: doc.file_name.clone(),
            content_type: doc.content_type,
            chunk_index: Some(index),
            chunk_count: Some(count),
            chunk_info: Some(chunk_info),
        }
    }
}

/// A sentence-aligned window of a document's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub content: String,
    pub metadata: ChunkMetadata,
}

/// A chunk returned by similarity search, with its rank in the result list.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedPassage {
    pub content: String,
    pub metadata: ChunkMetadata,
    /// 0-based position in the ranked result list.
    pub rank: usize,
    /// Backend-specific relevance score, when the store reports one.
    pub score: Option<f32>,
}

/// Discriminator for [`StreamFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Context,
    Answer,
}

/// One unit of the streamed query response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub content: String,
}

impl StreamFrame {
    pub fn context(content: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::Context,
            content: content.into(),
        }
    }

    pub fn answer(content: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::Answer,
            content: content.into(),
        }
    }
}
