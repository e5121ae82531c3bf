//! Streaming query responder.
//!
//! Runs one query through retrieval, aggregation, prompting, and
//! generation, emitting [`StreamFrame`]s to a [`FrameSink`] as it goes.
//!
//! # Lifecycle
//!
//! ```text
//! Received ──▶ Retrieving ──▶ StreamingContext ──▶ Generating ──▶ StreamingAnswer ──▶ Done
//!     │            │                 │                  │                 │
//!     └────────────┴─────────────────┴──────────────────┴─────────────────┴──▶ Error
//! ```
//!
//! The server calls [`QueryPipeline::retrieve`] before committing to a
//! response, so a failed search still gets a proper 500 and no frames.
//! Everything after that happens inside [`QueryPipeline::stream`].
//!
//! # Wire format
//!
//! Each frame is written as one Server-Sent-Events block and flushed on its
//! own:
//!
//! ```text
//! data: {"type":"context","content":"From a.md:\n..."}
//!
//! data: {"type":"answer","content":"..."}
//!
//! ```
//!
//! A stream that ends without an `answer` frame is a failed query.
//!
//! # Guarantees
//!
//! - at most one similarity search and one generation call per query;
//! - no retries here (the provider clients own retry policy);
//! - the first transport failure stops the stream;
//! - a client disconnect during generation drops the in-flight request.

use std::io::{self, Write};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use tokio::sync::mpsc;

use crate::aggregate::{group_passages, SourceGroup};
use crate::config::Config;
use crate::error::{RagError, Result, Stage};
use crate::generation::Generator;
use crate::models::StreamFrame;
use crate::prompt::{prompt_for_groups, RAG_INSTRUCTIONS};
use crate::store::VectorStore;

/// States of a single query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Received,
    Retrieving,
    StreamingContext,
    Generating,
    StreamingAnswer,
    Done,
    Error,
}

impl QueryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, QueryState::Done | QueryState::Error)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: QueryState) -> bool {
        use QueryState::*;
        match (self, next) {
            (s, Error) => !s.is_terminal(),
            (Received, Retrieving)
            | (Retrieving, StreamingContext)
            | (Retrieving, Generating)
            | (StreamingContext, StreamingContext)
            | (StreamingContext, Generating)
            | (Generating, StreamingAnswer)
            | (StreamingAnswer, Done) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueryState::Received => "received",
            QueryState::Retrieving => "retrieving",
            QueryState::StreamingContext => "streaming_context",
            QueryState::Generating => "generating",
            QueryState::StreamingAnswer => "streaming_answer",
            QueryState::Done => "done",
            QueryState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Tracks and logs state transitions of one query.
#[derive(Debug)]
struct Transitions {
    state: QueryState,
}

impl Transitions {
    fn new(state: QueryState) -> Self {
        Self { state }
    }

    fn advance(&mut self, next: QueryState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        tracing::debug!(from = %self.state, to = %next, "query state");
        self.state = next;
    }

    fn fail(&mut self, err: RagError) -> RagError {
        match &err {
            RagError::Transport(msg) => {
                tracing::warn!(state = %self.state, error = %msg, "stream aborted")
            }
            other => tracing::error!(state = %self.state, error = %other, "query failed"),
        }
        self.advance(QueryState::Error);
        err
    }
}

// ============ Transport ============

/// A response channel that accepts bytes and can be flushed to the client.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Append bytes to the pending output.
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Push pending output to the client now.
    async fn flush(&mut self) -> io::Result<()>;

    /// Whether the client is known to be gone.
    fn is_closed(&self) -> bool {
        false
    }

    /// Resolves once the client is gone. Never resolves by default.
    async fn closed(&self) {
        std::future::pending::<()>().await
    }
}

/// Sink feeding an HTTP response body through a bounded channel.
///
/// Each flush becomes one body chunk. Sending fails once the receiving
/// side (the response body) has been dropped, i.e. the client disconnected.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
    buf: Vec<u8>,
}

/// Create a sink and the receiver to turn into a response body.
pub fn channel_sink(capacity: usize) -> (ChannelSink, mpsc::Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ChannelSink {
            tx,
            buf: Vec::new(),
        },
        rx,
    )
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.tx.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"));
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::take(&mut self.buf));
        self.tx
            .send(chunk)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Sink over a blocking writer (stdout for the CLI, buffers in tests).
pub struct WriterSink<W> {
    writer: W,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: Write + Send + Sync> FrameSink for WriterSink<W> {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Encode a frame as an SSE `data:` block.
pub fn encode_frame(frame: &StreamFrame) -> Result<Vec<u8>> {
    let json = serde_json::to_string(frame)
        .map_err(|e| RagError::Transport(format!("failed to encode frame: {}", e)))?;
    Ok(format!("data: {}\n\n", json).into_bytes())
}

async fn send_frame(sink: &mut dyn FrameSink, frame: &StreamFrame) -> Result<()> {
    let bytes = encode_frame(frame)?;
    sink.write(&bytes)
        .await
        .map_err(|e| RagError::Transport(e.to_string()))?;
    sink.flush()
        .await
        .map_err(|e| RagError::Transport(e.to_string()))
}

// ============ Pipeline ============

/// Retrieval results for one query, ready to stream.
#[derive(Debug)]
pub struct PreparedQuery {
    question: String,
    groups: Vec<SourceGroup>,
    transitions: Transitions,
}

impl PreparedQuery {
    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn groups(&self) -> &[SourceGroup] {
        &self.groups
    }
}

/// Frame counts of a completed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub context_frames: usize,
    pub answer_frames: usize,
}

/// Shared query handler: one instance serves every concurrent query.
///
/// Holds only the shared collaborators; all per-query state lives in
/// [`PreparedQuery`] and the stream call.
#[derive(Clone)]
pub struct QueryPipeline {
    store: Arc<dyn VectorStore>,
    generator: Arc<dyn Generator>,
    top_k: usize,
    instructions: Arc<str>,
}

impl QueryPipeline {
    pub fn new(store: Arc<dyn VectorStore>, generator: Arc<dyn Generator>, top_k: usize) -> Self {
        Self {
            store,
            generator,
            top_k,
            instructions: Arc::from(RAG_INSTRUCTIONS),
        }
    }

    pub fn from_config(
        config: &Config,
        store: Arc<dyn VectorStore>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        let pipeline = Self::new(store, generator, config.retrieval.top_k);
        match &config.generation.instructions {
            Some(text) => pipeline.with_instructions(text),
            None => pipeline,
        }
    }

    /// Replace the RAG instruction block.
    pub fn with_instructions(mut self, instructions: &str) -> Self {
        self.instructions = Arc::from(instructions);
        self
    }

    /// Received → Retrieving: validate the question and run similarity search once.
    pub async fn retrieve(&self, question: &str) -> Result<PreparedQuery> {
        let mut transitions = Transitions::new(QueryState::Received);

        let question = question.trim();
        if question.is_empty() {
            return Err(transitions.fail(RagError::Validation(
                "query must not be empty".to_string(),
            )));
        }

        transitions.advance(QueryState::Retrieving);
        let passages = match self.store.similarity_search(question, self.top_k).await {
            Ok(p) => p,
            Err(e) => {
                return Err(transitions.fail(RagError::from_collaborator(Stage::Store, e)))
            }
        };
        let groups = group_passages(passages);
        tracing::info!(
            store = self.store.name(),
            groups = groups.len(),
            "documents retrieved"
        );

        Ok(PreparedQuery {
            question: question.to_string(),
            groups,
            transitions,
        })
    }

    /// Stream context frames, generate, and stream the answer frame.
    ///
    /// On error no further frames are written; the caller only logs.
    pub async fn stream(
        &self,
        prepared: PreparedQuery,
        sink: &mut dyn FrameSink,
    ) -> Result<StreamSummary> {
        let PreparedQuery {
            question,
            groups,
            mut transitions,
        } = prepared;
        let mut summary = StreamSummary {
            context_frames: 0,
            answer_frames: 0,
        };

        let contexts: Vec<String> = groups.iter().map(SourceGroup::merged_text).collect();
        for context in &contexts {
            transitions.advance(QueryState::StreamingContext);
            if let Err(e) = send_frame(sink, &StreamFrame::context(context.as_str())).await {
                return Err(transitions.fail(e));
            }
            summary.context_frames += 1;
        }

        transitions.advance(QueryState::Generating);
        if sink.is_closed() {
            return Err(transitions.fail(RagError::Transport(
                "client disconnected before generation".to_string(),
            )));
        }
        let prompt = prompt_for_groups(&self.instructions, &question, &groups);

        let generated = tokio::select! {
            res = self.generator.generate(&prompt) => res,
            _ = sink.closed() => {
                return Err(transitions.fail(RagError::Transport(
                    "client disconnected during generation".to_string(),
                )));
            }
        };
        let answer = match generated {
            Ok(a) => a,
            Err(e) => return Err(transitions.fail(RagError::upstream(Stage::Generation, e))),
        };
        tracing::info!(model = self.generator.model_name(), "response generated");

        transitions.advance(QueryState::StreamingAnswer);
        if let Err(e) = send_frame(sink, &StreamFrame::answer(answer)).await {
            return Err(transitions.fail(e));
        }
        summary.answer_frames = 1;

        transitions.advance(QueryState::Done);
        Ok(summary)
    }

    /// Retrieve and stream in one call.
    ///
    /// Retrieval errors are returned before anything is written.
    pub async fn run(&self, question: &str, sink: &mut dyn FrameSink) -> Result<StreamSummary> {
        let prepared = self.retrieve(question).await?;
        self.stream(prepared, sink).await
    }

    /// Non-streaming variant: retrieve, prompt, and return the answer text.
    pub async fn answer(&self, question: &str) -> Result<String> {
        let prepared = self.retrieve(question).await?;
        let PreparedQuery {
            question,
            groups,
            mut transitions,
        } = prepared;

        transitions.advance(QueryState::Generating);
        let prompt = prompt_for_groups(&self.instructions, &question, &groups);
        match self.generator.generate(&prompt).await {
            Ok(answer) => {
                tracing::info!(model = self.generator.model_name(), "response generated");
                transitions.advance(QueryState::StreamingAnswer);
                transitions.advance(QueryState::Done);
                Ok(answer)
            }
            Err(e) => Err(transitions.fail(RagError::upstream(Stage::Generation, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, ChunkMetadata, FrameType, RetrievedPassage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FixedStore {
        passages: Vec<RetrievedPassage>,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl VectorStore for FixedStore {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn add_chunks(&self, chunks: &[Chunk]) -> anyhow::Result<usize> {
            Ok(chunks.len())
        }
        async fn similarity_search(
            &self,
            _query: &str,
            top_k: usize,
        ) -> anyhow::Result<Vec<RetrievedPassage>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("connection refused");
            }
            Ok(self.passages.iter().take(top_k).cloned().collect())
        }
    }

    struct EchoGenerator {
        fail: bool,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Generator for EchoGenerator {
        fn model_name(&self) -> &str {
            "echo"
        }
        async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if self.fail {
                anyhow::bail!("quota exceeded");
            }
            Ok("the answer".to_string())
        }
    }

    fn passage(file: &str, idx: usize, content: &str) -> RetrievedPassage {
        RetrievedPassage {
            content: content.to_string(),
            metadata: ChunkMetadata {
                file_name: Some(file.to_string()),
                chunk_index: Some(idx),
                chunk_info: Some(String::new()),
                ..Default::default()
            },
            rank: 0,
            score: None,
        }
    }

    fn make_pipeline(
        fail_store: bool,
        fail_gen: bool,
    ) -> (QueryPipeline, Arc<FixedStore>, Arc<EchoGenerator>) {
        let store = Arc::new(FixedStore {
            passages: vec![
                passage("a.md", 1, "a-one"),
                passage("b.md", 0, "b-zero"),
                passage("a.md", 0, "a-zero"),
            ],
            fail: fail_store,
            calls: AtomicUsize::new(0),
        });
        let generator = Arc::new(EchoGenerator {
            fail: fail_gen,
            prompts: Mutex::new(Vec::new()),
        });
        (
            QueryPipeline::new(store.clone(), generator.clone(), 3),
            store,
            generator,
        )
    }

    fn frames(output: &[u8]) -> Vec<StreamFrame> {
        String::from_utf8(output.to_vec())
            .unwrap()
            .split_terminator("\n\n")
            .map(|block| {
                let json = block.strip_prefix("data: ").expect("data prefix");
                serde_json::from_str(json).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_encode_frame_wire_format() {
        let bytes = encode_frame(&StreamFrame::answer("hi \"there\"")).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "data: {\"type\":\"answer\",\"content\":\"hi \\\"there\\\"\"}\n\n"
        );
    }

    #[test]
    fn test_transition_table() {
        use QueryState::*;
        assert!(Received.can_transition_to(Retrieving));
        assert!(Retrieving.can_transition_to(Generating));
        assert!(StreamingContext.can_transition_to(StreamingContext));
        assert!(Generating.can_transition_to(Error));
        assert!(!Received.can_transition_to(Generating));
        assert!(!StreamingAnswer.can_transition_to(StreamingContext));
        assert!(!Done.can_transition_to(Error));
        assert!(!Error.can_transition_to(Error));
    }

    #[tokio::test]
    async fn test_two_groups_then_answer() {
        let (pipeline, store, generator) = make_pipeline(false, false);
        let mut sink = WriterSink::new(Vec::new());
        let summary = pipeline.run("what is a?", &mut sink).await.unwrap();
        assert_eq!(
            summary,
            StreamSummary {
                context_frames: 2,
                answer_frames: 1
            }
        );

        let frames = frames(&sink.into_inner());
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], StreamFrame::context("From a.md:\na-zero\na-one\n"));
        assert_eq!(frames[1], StreamFrame::context("From b.md:\nb-zero\n"));
        assert_eq!(frames[2].frame_type, FrameType::Answer);
        assert_eq!(frames[2].content, "the answer");

        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        let prompts = generator.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains(
            "Context:\nFrom a.md:\na-zero\na-one\n\nFrom b.md:\nb-zero\n\n"
        ));
        assert!(prompts[0].contains("Question:\nwhat is a?\n"));
    }

    #[tokio::test]
    async fn test_generation_failure_ends_without_answer() {
        let (pipeline, _, generator) = make_pipeline(false, true);
        let mut sink = WriterSink::new(Vec::new());
        let err = pipeline.run("q", &mut sink).await.unwrap_err();
        assert!(matches!(err, RagError::Upstream { stage: Stage::Generation, .. }));

        let frames = frames(&sink.into_inner());
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.frame_type == FrameType::Context));
        assert_eq!(generator.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_search_failure_writes_nothing() {
        let (pipeline, store, generator) = make_pipeline(true, false);
        let mut sink = WriterSink::new(Vec::new());
        let err = pipeline.run("q", &mut sink).await.unwrap_err();
        assert!(matches!(err, RagError::Upstream { stage: Stage::Store, .. }));
        assert_eq!(err.status(), Some(axum::http::StatusCode::INTERNAL_SERVER_ERROR));
        assert!(sink.into_inner().is_empty());
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert!(generator.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_question_rejected_before_search() {
        let (pipeline, store, _) = make_pipeline(false, false);
        let err = pipeline.retrieve("   ").await.unwrap_err();
        assert!(matches!(err, RagError::Validation(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    /// Fails the nth write (0-based).
    struct FailingSink {
        fail_at: usize,
        writes: usize,
        flushed: Vec<Vec<u8>>,
        pending: Vec<u8>,
    }

    #[async_trait]
    impl FrameSink for FailingSink {
        async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
            if self.writes == self.fail_at {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "reset by peer"));
            }
            self.writes += 1;
            self.pending.extend_from_slice(bytes);
            Ok(())
        }
        async fn flush(&mut self) -> io::Result<()> {
            self.flushed.push(std::mem::take(&mut self.pending));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_write_failure_aborts_stream() {
        let (pipeline, _, generator) = make_pipeline(false, false);
        let mut sink = FailingSink {
            fail_at: 1,
            writes: 0,
            flushed: Vec::new(),
            pending: Vec::new(),
        };
        let err = pipeline.run("q", &mut sink).await.unwrap_err();
        assert!(matches!(err, RagError::Transport(_)));
        assert_eq!(err.status(), None);
        assert_eq!(sink.flushed.len(), 1);
        assert!(generator.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_each_frame_flushed_separately() {
        let (pipeline, _, _) = make_pipeline(false, false);
        let mut sink = FailingSink {
            fail_at: usize::MAX,
            writes: 0,
            flushed: Vec::new(),
            pending: Vec::new(),
        };
        pipeline.run("q", &mut sink).await.unwrap();
        assert_eq!(sink.flushed.len(), 3);
        for chunk in &sink.flushed {
            let text = String::from_utf8(chunk.clone()).unwrap();
            assert!(text.starts_with("data: "));
            assert!(text.ends_with("\n\n"));
            assert_eq!(text.matches("data: ").count(), 1);
        }
    }

    #[tokio::test]
    async fn test_no_passages_streams_answer_only() {
        let store = Arc::new(FixedStore {
            passages: Vec::new(),
            fail: false,
            calls: AtomicUsize::new(0),
        });
        let generator = Arc::new(EchoGenerator {
            fail: false,
            prompts: Mutex::new(Vec::new()),
        });
        let pipeline = QueryPipeline::new(store, generator, 3);
        let mut sink = WriterSink::new(Vec::new());
        let summary = pipeline.run("q", &mut sink).await.unwrap();
        assert_eq!(summary.context_frames, 0);
        assert_eq!(frames(&sink.into_inner()), vec![StreamFrame::answer("the answer")]);
    }

    /// Generator that never finishes, counting how many calls were dropped.
    struct HangingGenerator {
        started: AtomicUsize,
    }

    #[async_trait]
    impl Generator for HangingGenerator {
        fn model_name(&self) -> &str {
            "hang"
        }
        async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_disconnect_cancels_generation() {
        let store = Arc::new(FixedStore {
            passages: vec![passage("a.md", 0, "x")],
            fail: false,
            calls: AtomicUsize::new(0),
        });
        let generator = Arc::new(HangingGenerator {
            started: AtomicUsize::new(0),
        });
        let pipeline = QueryPipeline::new(store, generator.clone(), 3);
        let (mut sink, mut rx) = channel_sink(4);

        let handle = tokio::spawn(async move { pipeline.run("q", &mut sink).await });

        let first = rx.recv().await.unwrap();
        assert!(String::from_utf8_lossy(&first).contains("\"type\":\"context\""));
        while generator.started.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        drop(rx);

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, RagError::Transport(_)));
    }

    #[tokio::test]
    async fn test_answer_non_streaming() {
        let (pipeline, _, _) = make_pipeline(false, false);
        assert_eq!(pipeline.answer("q").await.unwrap(), "the answer");

        let (pipeline, _, _) = make_pipeline(false, true);
        assert!(matches!(
            pipeline.answer("q").await,
            Err(RagError::Upstream { stage: Stage::Generation, .. })
        ));
    }

    #[tokio::test]
    async fn test_custom_instructions_used() {
        let (pipeline, _, generator) = make_pipeline(false, false);
        let pipeline = pipeline.with_instructions("Answer tersely.\n");
        pipeline.answer("q").await.unwrap();
        let prompt = generator.prompts.lock().unwrap()[0].clone();
        assert!(prompt.starts_with("Answer tersely.\n\nQuestion:\nq\n"));
    }
}
