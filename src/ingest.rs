//! Document ingestion: upload bytes → [`Document`] → chunks → store.
//!
//! Used by `POST /context` for uploaded files and by `rag-server ingest`
//! for files on disk. Directory walking follows the include/exclude globs
//! of the `[ingest]` config section; `.git`, `target`, and `node_modules`
//! are always skipped.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::chunk::chunk_text;
use crate::config::{ChunkingConfig, IngestConfig};
use crate::error::{self, RagError, Stage};
use crate::models::{Chunk, Document};
use crate::store::VectorStore;

/// Chunk every document, failing before anything is stored.
pub fn chunk_documents(
    docs: &[Document],
    chunking: &ChunkingConfig,
) -> error::Result<Vec<Chunk>> {
    let mut chunks = Vec::new();
    for doc in docs {
        chunks.extend(chunk_text(
            &doc.text,
            &doc.metadata,
            chunking.window_size,
            chunking.overlap,
        )?);
    }
    Ok(chunks)
}

/// Chunk all documents, then add the chunks to the store in one call.
///
/// Returns the number of chunks stored. Nothing is written when chunking
/// fails.
pub async fn ingest_documents(
    docs: &[Document],
    chunking: &ChunkingConfig,
    store: &dyn VectorStore,
) -> error::Result<usize> {
    let chunks = chunk_documents(docs, chunking)?;
    let stored = store
        .add_chunks(&chunks)
        .await
        .map_err(|e| RagError::from_collaborator(Stage::Store, e))?;

    tracing::info!(
        documents = docs.len(),
        chunks = stored,
        store = store.name(),
        "documents ingested"
    );
    Ok(stored)
}

/// Chunk one file and add its chunks to the store. Returns the chunk count.
pub async fn ingest_file(
    file_name: &str,
    bytes: &[u8],
    chunking: &ChunkingConfig,
    store: &dyn VectorStore,
) -> error::Result<usize> {
    ingest_documents(&[Document::from_upload(file_name, bytes)], chunking, store).await
}

/// A file selected for ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestTarget {
    pub path: PathBuf,
    /// Name recorded as the chunk `file_name`.
    pub name: String,
}

/// Expand `paths` into the files to ingest.
///
/// Files named explicitly are always taken. Directories are walked and
/// filtered by glob against the path relative to the directory. Output is
/// sorted by name.
pub fn collect_files(paths: &[PathBuf], config: &IngestConfig) -> Result<Vec<IngestTarget>> {
    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut targets = Vec::new();
    for root in paths {
        if root.is_file() {
            targets.push(IngestTarget {
                path: root.clone(),
                name: file_name_of(root),
            });
            continue;
        }
        if !root.is_dir() {
            bail!("Path does not exist: {}", root.display());
        }

        for entry in WalkDir::new(root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
                continue;
            }
            targets.push(IngestTarget {
                path: path.to_path_buf(),
                name: rel_str,
            });
        }
    }

    targets.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(targets)
}

/// Read every target, then ingest them together. Returns `(files, chunks)`.
pub async fn ingest_paths(
    targets: &[IngestTarget],
    chunking: &ChunkingConfig,
    store: &dyn VectorStore,
) -> Result<(usize, usize)> {
    let mut docs = Vec::with_capacity(targets.len());
    for target in targets {
        let bytes = tokio::fs::read(&target.path)
            .await
            .with_context(|| format!("Failed to read {}", target.path.display()))?;
        docs.push(Document::from_upload(&target.name, &bytes));
    }
    let chunks = ingest_documents(&docs, chunking, store).await?;
    Ok((docs.len(), chunks))
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
