//! Error taxonomy for the query and ingestion pipelines.
//!
//! | Variant | Cause | Client sees |
//! |---------|-------|-------------|
//! | [`RagError::Validation`] | malformed request, bad chunking parameters | 400 |
//! | [`RagError::Upstream`] | embedding, store, or generation failure | 500 |
//! | [`RagError::Transport`] | write/flush failure mid-stream, disconnect | nothing (stream ends) |
//!
//! None of these are retried by the pipeline. Retry policy belongs to the
//! provider clients in [`crate::embedding`] and [`crate::generation`].

use axum::http::StatusCode;
use thiserror::Error;

/// The pipeline stage an upstream failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Embedding,
    Store,
    Generation,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Embedding => "embedding",
            Stage::Store => "vector store",
            Stage::Generation => "generation",
        };
        f.write_str(s)
    }
}

/// Errors raised by the RAG pipeline.
#[derive(Debug, Error)]
pub enum RagError {
    /// Malformed request body or invalid parameters.
    #[error("invalid request: {0}")]
    Validation(String),

    /// An external collaborator failed.
    #[error("{stage} failed: {message}")]
    Upstream { stage: Stage, message: String },

    /// The response channel to the client failed or was closed.
    #[error("transport error: {0}")]
    Transport(String),
}

impl RagError {
    pub fn upstream(stage: Stage, err: impl std::fmt::Display) -> Self {
        RagError::Upstream {
            stage,
            message: err.to_string(),
        }
    }

    /// Classify a collaborator failure as `stage`, unless the collaborator
    /// already attached a [`RagError`] (e.g. a store reporting that its
    /// embedding call failed).
    pub fn from_collaborator(stage: Stage, err: anyhow::Error) -> Self {
        match err.downcast::<RagError>() {
            Ok(inner) => inner,
            Err(err) => RagError::upstream(stage, err),
        }
    }

    /// HTTP status for errors reported before streaming starts.
    ///
    /// Transport errors have no status: the response is already in flight.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RagError::Validation(_) => Some(StatusCode::BAD_REQUEST),
            RagError::Upstream { .. } => Some(StatusCode::INTERNAL_SERVER_ERROR),
            RagError::Transport(_) => None,
        }
    }

    /// Machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::Validation(_) => "bad_request",
            RagError::Upstream { .. } => "upstream_error",
            RagError::Transport(_) => "transport_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            RagError::Validation("x".into()).status(),
            Some(StatusCode::BAD_REQUEST)
        );
        assert_eq!(
            RagError::upstream(Stage::Store, "down").status(),
            Some(StatusCode::INTERNAL_SERVER_ERROR)
        );
        assert_eq!(RagError::Transport("closed".into()).status(), None);
    }

    #[test]
    fn test_from_collaborator_keeps_attached_stage() {
        let inner = anyhow::Error::from(RagError::upstream(Stage::Embedding, "401"));
        let err = RagError::from_collaborator(Stage::Store, inner);
        assert!(matches!(err, RagError::Upstream { stage: Stage::Embedding, .. }));

        let plain = anyhow::anyhow!("connection refused");
        let err = RagError::from_collaborator(Stage::Store, plain);
        assert!(matches!(err, RagError::Upstream { stage: Stage::Store, .. }));
        assert_eq!(err.to_string(), "vector store failed: connection refused");
    }

    #[test]
    fn test_upstream_message() {
        let err = RagError::upstream(Stage::Generation, "quota exceeded");
        assert_eq!(err.to_string(), "generation failed: quota exceeded");
    }
}
