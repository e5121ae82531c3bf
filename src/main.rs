//! # RAG Server CLI (`rag-server`)
//!
//! ## Usage
//!
//! ```bash
//! rag-server --config ./config/rag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag-server serve` | Start the HTTP server |
//! | `rag-server ingest <paths...>` | Chunk and store files or directories |
//! | `rag-server query "<question>"` | Run one streaming query, frames to stdout |
//! | `rag-server chunk <file>` | Preview how a file is chunked |
//!
//! Logs go to stderr; set `RUST_LOG` to change the level
//! (default `rag_server=info`).

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rag_server::chunk::{chunk_text, split_sentences};
use rag_server::config::{self, Config};
use rag_server::embedding::{create_provider, EmbeddingProvider};
use rag_server::generation::{create_generator, Generator};
use rag_server::ingest::{collect_files, ingest_paths};
use rag_server::models::Document;
use rag_server::server;
use rag_server::store::{create_store, VectorStore};
use rag_server::stream::{QueryPipeline, WriterSink};

/// Retrieval-augmented question answering over your documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "rag-server",
    about = "Retrieval-augmented question answering over uploaded documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/rag.toml`. A missing file means built-in defaults.
    #[arg(long, global = true, default_value = "./config/rag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server on `[server].bind` (or `0.0.0.0:$PORT`).
    Serve,

    /// Chunk files and add them to the configured store.
    ///
    /// Directories are walked using `[ingest]` include/exclude globs.
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Answer a question, printing SSE frames to stdout.
    Query {
        question: String,

        /// Ingest these files first (useful with the in-memory store).
        #[arg(long = "with", value_name = "PATH")]
        with: Vec<PathBuf>,
    },

    /// Show how a file would be chunked, without storing anything.
    Chunk {
        file: PathBuf,

        /// Sentences per chunk (default from `[chunking]`).
        #[arg(long)]
        window_size: Option<usize>,

        /// Sentences shared by consecutive chunks (default from `[chunking]`).
        #[arg(long)]
        overlap: Option<usize>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_store(cfg: &Config) -> anyhow::Result<Arc<dyn VectorStore>> {
    let embedder: Option<Arc<dyn EmbeddingProvider>> = if cfg.embedding.is_enabled() {
        Some(Arc::from(create_provider(&cfg.embedding)?))
    } else {
        None
    };
    create_store(cfg, embedder)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ingest { paths } => {
            let store = build_store(&cfg)?;
            if store.name() == "memory" {
                tracing::warn!("in-memory store: ingested chunks are discarded on exit");
            }
            let targets = collect_files(&paths, &cfg.ingest)?;
            let (files, chunks) = ingest_paths(&targets, &cfg.chunking, store.as_ref()).await?;
            println!("ingest");
            println!("  files: {}", files);
            println!("  chunks written: {}", chunks);
            println!("ok");
        }
        Commands::Query { question, with } => {
            let store = build_store(&cfg)?;
            if !with.is_empty() {
                let targets = collect_files(&with, &cfg.ingest)?;
                ingest_paths(&targets, &cfg.chunking, store.as_ref()).await?;
            }
            let generator: Arc<dyn Generator> = Arc::from(create_generator(&cfg)?);
            let pipeline = QueryPipeline::from_config(&cfg, store, generator);

            let mut sink = WriterSink::new(std::io::stdout());
            pipeline.run(&question, &mut sink).await?;
        }
        Commands::Chunk {
            file,
            window_size,
            overlap,
        } => {
            let window_size = window_size.unwrap_or(cfg.chunking.window_size);
            let overlap = overlap.unwrap_or(cfg.chunking.overlap);

            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let doc = Document::from_upload(&name, &bytes);
            let chunks = chunk_text(&doc.text, &doc.metadata, window_size, overlap)?;

            let content_type = doc
                .metadata
                .content_type
                .map(|c| c.as_str())
                .unwrap_or("unknown");
            println!("file: {} ({})", name, content_type);
            println!("sentences: {}", split_sentences(&doc.text).len());
            println!("chunks: {}", chunks.len());
            for (i, chunk) in chunks.iter().enumerate() {
                println!();
                println!("--- chunk {}/{} ---", i + 1, chunks.len());
                println!("{}", chunk.content);
            }
        }
    }

    Ok(())
}
