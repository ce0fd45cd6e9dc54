//! Streaming aggregator.
//!
//! Wraps an adapter's chunk stream. Every chunk is forwarded unchanged and
//! in order while text, finish reason, and usage are accumulated. When the
//! source is exhausted one synthesized final chunk is emitted, followed by
//! the `[DONE]` sentinel. A source error is forwarded as the last frame, in
//! the same envelope a JSON error response uses, and no sentinel follows it.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::stream::Stream;
use tracing::{info, warn};

use halo_core::error::HaloError;
use halo_core::types::*;

/// One frame on the outbound event stream.
#[derive(Debug)]
pub enum StreamFrame {
    Chunk(SseChunk),
    Final(FinalChunk),
    Done,
    Error { error: HaloError, request_id: String },
}

impl StreamFrame {
    /// Payload of the `data:` line.
    pub fn data(&self) -> String {
        match self {
            Self::Chunk(chunk) => serde_json::to_string(chunk).unwrap_or_default(),
            Self::Final(chunk) => serde_json::to_string(chunk).unwrap_or_default(),
            Self::Done => "[DONE]".to_string(),
            Self::Error { error, request_id } => error.envelope(request_id).to_string(),
        }
    }

    /// Full wire form: `data: <payload>\n\n`.
    pub fn to_wire(&self) -> String {
        format!("data: {}\n\n", self.data())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Streaming,
    Finalizing,
    Done,
}

#[derive(Debug, Default)]
struct UsageMaxima {
    seen: bool,
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
    reasoning_tokens: Option<u64>,
}

impl UsageMaxima {
    fn update(&mut self, usage: &Usage) {
        self.seen = true;
        self.prompt_tokens = self.prompt_tokens.max(usage.prompt_tokens);
        self.completion_tokens = self.completion_tokens.max(usage.completion_tokens);
        self.total_tokens = self.total_tokens.max(usage.total_tokens);
        if let Some(r) = usage.reasoning_tokens() {
            self.reasoning_tokens = Some(self.reasoning_tokens.unwrap_or(0).max(r));
        }
    }

    fn to_usage(&self) -> Option<Usage> {
        if !self.seen {
            return None;
        }
        let mut usage = Usage::new(self.prompt_tokens, self.completion_tokens);
        usage.total_tokens = usage.total_tokens.max(self.total_tokens);
        Some(match self.reasoning_tokens {
            Some(r) => usage.with_reasoning_tokens(r),
            None => usage,
        })
    }
}

pub struct StreamAggregator<S> {
    inner: S,
    state: State,
    started: Instant,
    content: String,
    finish_reason: Option<String>,
    maxima: UsageMaxima,
    last_usage: Option<Usage>,
    chunks_count: u64,
    id: String,
    model: String,
    created: i64,
    request_id: String,
}

impl<S> StreamAggregator<S> {
    pub fn new(inner: S, model: impl Into<String>) -> Self {
        Self {
            inner,
            state: State::Streaming,
            started: Instant::now(),
            content: String::new(),
            finish_reason: None,
            maxima: UsageMaxima::default(),
            last_usage: None,
            chunks_count: 0,
            id: String::new(),
            model: model.into(),
            created: 0,
            request_id: String::new(),
        }
    }

    /// Measure latency from `started` rather than from construction.
    pub fn with_start(mut self, started: Instant) -> Self {
        self.started = started;
        self
    }

    /// Request id stamped on an error frame.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    fn observe(&mut self, chunk: &SseChunk) {
        self.chunks_count += 1;
        if self.id.is_empty() && !chunk.id.is_empty() {
            self.id = chunk.id.clone();
        }
        if !chunk.model.is_empty() {
            self.model = chunk.model.clone();
        }
        if chunk.created != 0 {
            self.created = chunk.created;
        }
        // The aggregate describes the primary choice only.
        for choice in chunk.choices.iter().filter(|c| c.index == 0) {
            if let Some(text) = &choice.delta.content {
                self.content.push_str(text);
            }
            if let Some(reason) = &choice.finish_reason {
                self.finish_reason = Some(reason.clone());
            }
        }
        if let Some(usage) = &chunk.usage {
            self.maxima.update(usage);
        }
        self.last_usage = chunk.usage.clone();
    }

    fn finalize(&mut self) -> FinalChunk {
        let latency_ms = self.started.elapsed().as_millis() as u64;
        let usage = self.last_usage.clone().or_else(|| self.maxima.to_usage());
        let finish_reason = self
            .finish_reason
            .clone()
            .unwrap_or_else(|| "stop".to_string());

        info!(
            model = %self.model,
            chunks = self.chunks_count,
            finish_reason = %finish_reason,
            latency_ms,
            "Stream complete"
        );

        FinalChunk {
            chunk: SseChunk {
                id: if self.id.is_empty() { completion_id() } else { self.id.clone() },
                object: "chat.completion.chunk".to_string(),
                created: if self.created == 0 {
                    chrono::Utc::now().timestamp()
                } else {
                    self.created
                },
                model: self.model.clone(),
                choices: vec![ChunkChoice {
                    index: 0,
                    delta: Delta {
                        role: Some(Role::Assistant),
                        content: Some(std::mem::take(&mut self.content)),
                        tool_calls: None,
                    },
                    finish_reason: Some(finish_reason),
                }],
                usage,
            },
            halo_metadata: HaloMetadata {
                chunks_count: self.chunks_count,
                latency_ms,
            },
        }
    }
}

impl<S> Stream for StreamAggregator<S>
where
    S: Stream<Item = halo_core::Result<SseChunk>> + Unpin,
{
    type Item = StreamFrame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match this.state {
            State::Streaming => match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.observe(&chunk);
                    Poll::Ready(Some(StreamFrame::Chunk(chunk)))
                }
                Poll::Ready(Some(Err(e))) => {
                    warn!(
                        request_id = %this.request_id,
                        model = %this.model,
                        chunks = this.chunks_count,
                        error = %e,
                        "Stream aborted by upstream error"
                    );
                    this.state = State::Done;
                    Poll::Ready(Some(StreamFrame::Error {
                        error: e,
                        request_id: this.request_id.clone(),
                    }))
                }
                Poll::Ready(None) => {
                    this.state = State::Finalizing;
                    let final_chunk = this.finalize();
                    Poll::Ready(Some(StreamFrame::Final(final_chunk)))
                }
                Poll::Pending => Poll::Pending,
            },
            State::Finalizing => {
                this.state = State::Done;
                Poll::Ready(Some(StreamFrame::Done))
            }
            State::Done => Poll::Ready(None),
        }
    }
}
