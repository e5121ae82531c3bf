//! # RAG Server
//!
//! Retrieval-augmented question answering over uploaded documents.
//!
//! Documents are split into overlapping sentence windows and indexed in a
//! vector store. A query retrieves the closest passages, groups them by
//! source file, and builds a prompt for a language model. The answer is
//! streamed back to the client as Server-Sent Events: one `context` frame
//! per source, then a single `answer` frame.
//!
//! ## Architecture
//!
//! ```text
//!   upload ──▶ ┌─────────┐   ┌──────────────┐
//!              │ Chunker │──▶│ Vector store │
//!              └─────────┘   └──────┬───────┘
//!                                   │ top-k passages
//!   query ──▶ ┌────────────┐  ┌─────▼──────┐  ┌────────┐  ┌───────────┐
//!             │  Stream    │◀─│ Aggregator │─▶│ Prompt │─▶│ Generator │
//!             │ responder  │  └────────────┘  └────────┘  └─────┬─────┘
//!             └─────┬──────┘◀───────────────────────────────────┘
//!                   ▼
//!              SSE frames
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Pipeline error type |
//! | [`chunk`] | Sentence-window chunking |
//! | [`aggregate`] | Grouping retrieved passages by source |
//! | [`prompt`] | RAG prompt construction |
//! | [`stream`] | Query pipeline and SSE framing |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`generation`] | Text generation provider abstraction |
//! | [`store`] | Vector store abstraction and backends |
//! | [`ingest`] | Upload and filesystem ingestion |
//! | [`server`] | HTTP server |

pub mod aggregate;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generation;
mod http;
pub mod ingest;
pub mod models;
pub mod prompt;
pub mod server;
pub mod store;
pub mod stream;
