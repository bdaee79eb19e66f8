//! Mock backend for testing without a live service.
//!
//! [`MockBackend`] either replays scripted replies in order or computes a
//! reply from each request, and records every request it receives so
//! tests can assert on what was sent.
//!
//! # Example
//!
//! ```
//! use llm_docflow::backend::MockBackend;
//!
//! let mock = MockBackend::fixed(r#"{"doc_type": "PO"}"#);
//! assert_eq!(mock.request_count(), 0);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::Client;

use super::{Backend, LlmRequest, LlmResponse};
use crate::error::Result;
use crate::PipelineError;

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Return this response.
    Respond(LlmResponse),
    /// Fail with a throttling error carrying this message.
    Throttle(String),
    /// Fail with a non-retryable HTTP 500 carrying this body.
    Fail(String),
}

impl MockReply {
    /// Shorthand for a terminal text reply.
    pub fn text(text: impl Into<String>) -> Self {
        MockReply::Respond(LlmResponse::from_text(text))
    }
}

type Responder = Arc<dyn Fn(&LlmRequest) -> MockReply + Send + Sync>;

enum Source {
    Script(Vec<MockReply>),
    Responder(Responder),
}

/// A test backend returning canned or computed replies.
///
/// Scripted replies cycle back to the beginning when exhausted.
pub struct MockBackend {
    source: Source,
    index: AtomicUsize,
    requests: Mutex<Vec<LlmRequest>>,
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend")
            .field("calls", &self.index.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockBackend {
    /// Replay text responses in order.
    pub fn new(responses: Vec<String>) -> Self {
        Self::scripted(responses.into_iter().map(MockReply::text).collect())
    }

    /// Replay arbitrary outcomes in order. An empty script behaves like
    /// a single empty text reply.
    pub fn scripted(replies: Vec<MockReply>) -> Self {
        let replies = if replies.is_empty() {
            vec![MockReply::text("")]
        } else {
            replies
        };
        Self {
            source: Source::Script(replies),
            index: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always return the same text.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// Compute each reply from the request. Useful when concurrent callers
    /// make call order nondeterministic.
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&LlmRequest) -> MockReply + Send + Sync + 'static,
    {
        Self {
            source: Source::Responder(Arc::new(responder)),
            index: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Number of requests received so far.
    pub fn request_count(&self) -> usize {
        self.index.load(Ordering::SeqCst)
    }

    /// Snapshot of every request received so far.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn next_reply(&self, request: &LlmRequest) -> MockReply {
        let idx = self.index.fetch_add(1, Ordering::SeqCst);
        match &self.source {
            Source::Script(replies) => replies[idx % replies.len()].clone(),
            Source::Responder(f) => f(request),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn complete(
        &self,
        _client: &Client,
        _base_url: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        if let Ok(mut log) = self.requests.lock() {
            log.push(request.clone());
        }
        match self.next_reply(request) {
            MockReply::Respond(resp) => Ok(resp),
            MockReply::Throttle(message) => Err(PipelineError::Throttling {
                message,
                retry_after: None,
            }),
            MockReply::Fail(body) => Err(PipelineError::HttpError {
                status: 500,
                body,
                retry_after: None,
            }),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
