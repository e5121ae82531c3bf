//! HTTP server for document upload and retrieval-augmented queries.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/context` | Upload documents (multipart, field `documents` or `files`) |
//! | `POST` | `/query` | Answer `{"content": "..."}` with a JSON string |
//! | `POST` | `/enhanced-query` | Stream context + answer frames for `{"query": "..."}` over SSE |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! Errors raised before a response starts use one JSON shape:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `upstream_error` (500), `internal` (500).
//!
//! Once `/enhanced-query` has returned its 200 headers, later failures can
//! only end the event stream early; the missing `answer` frame is the
//! client's signal.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted for browser clients.

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::RagError;
use crate::generation::{create_generator, Generator};
use crate::ingest::ingest_documents;
use crate::models::Document;
use crate::store::{create_store, VectorStore};
use crate::stream::{channel_sink, QueryPipeline};

/// Multipart field names accepted by `POST /context`.
const UPLOAD_FIELDS: &[&str] = &["documents", "files"];

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    store: Arc<dyn VectorStore>,
    pipeline: QueryPipeline,
}

/// Build the configured collaborators and serve until the process exits.
///
/// This is the entry point used by `rag-server serve`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let embedder: Option<Arc<dyn EmbeddingProvider>> = if config.embedding.is_enabled() {
        Some(Arc::from(create_provider(&config.embedding)?))
    } else {
        None
    };
    let store = create_store(config, embedder)?;
    let generator: Arc<dyn Generator> = Arc::from(create_generator(config)?);

    run_server_with(config, store, generator).await
}

/// Serve with caller-supplied store and generator.
///
/// Binds to `[server].bind`.
pub async fn run_server_with(
    config: &Config,
    store: Arc<dyn VectorStore>,
    generator: Arc<dyn Generator>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    tracing::info!(
        store = store.name(),
        model = generator.model_name(),
        "starting server"
    );

    let app = router(config, store, generator);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// The application router with CORS and upload limits applied.
pub fn router(
    config: &Config,
    store: Arc<dyn VectorStore>,
    generator: Arc<dyn Generator>,
) -> Router {
    let state = AppState {
        config: Arc::new(config.clone()),
        pipeline: QueryPipeline::from_config(config, store.clone(), generator),
        store,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/context", post(handle_upload))
        .route("/query", post(handle_query))
        .route("/enhanced-query", post(handle_enhanced_query))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(config.ingest.max_upload_bytes))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Error type that converts into a JSON HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        AppError {
            status: err.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ POST /context ============

#[derive(Serialize)]
struct UploadResponse {
    message: String,
    chunks: usize,
}

/// Handler for `POST /context`.
///
/// Every file part under an accepted field name is read and validated
/// first; the store is only written once all parts are accepted. Other
/// fields are ignored. Returns 400 when no file was uploaded.
async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut docs = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        if !field.name().is_some_and(|n| UPLOAD_FIELDS.contains(&n)) {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| bad_request("file part is missing a filename"))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("failed to read {}: {}", file_name, e)))?;
        docs.push(Document::from_upload(&file_name, &bytes));
    }

    if docs.is_empty() {
        return Err(bad_request("no files uploaded"));
    }

    let chunks = ingest_documents(&docs, &state.config.chunking, state.store.as_ref())
        .await
        .map_err(|e| {
            tracing::error!(files = docs.len(), error = %e, "upload failed");
            AppError::from(e)
        })?;

    Ok(Json(UploadResponse {
        message: format!("Successfully uploaded {} files", docs.len()),
        chunks,
    }))
}

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryRequest {
    #[serde(alias = "query")]
    content: String,
}

/// Handler for `POST /query`: the whole answer as a JSON string.
async fn handle_query(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<String>, AppError> {
    let Json(req) = payload?;
    let span = tracing::info_span!("query", id = %Uuid::new_v4());
    let answer = state.pipeline.answer(&req.content).instrument(span).await?;
    Ok(Json(answer))
}

// ============ POST /enhanced-query ============

#[derive(Deserialize)]
struct EnhancedQueryRequest {
    #[serde(alias = "content")]
    query: String,
}

/// Handler for `POST /enhanced-query`.
///
/// Validation and retrieval run before the response is committed, so their
/// failures still produce a JSON error. The rest of the query runs in a
/// spawned task writing into the response body.
async fn handle_enhanced_query(
    State(state): State<AppState>,
    payload: Result<Json<EnhancedQueryRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(req) = payload?;
    let span = tracing::info_span!("query", id = %Uuid::new_v4());

    let prepared = state
        .pipeline
        .retrieve(&req.query)
        .instrument(span.clone())
        .await?;

    let (mut sink, rx) = channel_sink(1);
    let pipeline = state.pipeline.clone();
    tokio::spawn(
        async move {
            // Failures are logged by the pipeline; the stream just ends.
            let _ = pipeline.stream(prepared, &mut sink).await;
        }
        .instrument(span),
    );

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .map_err(|e| internal_error(e.to_string()))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
