use std::time::Duration;
use thiserror::Error;

/// Errors produced by the pipeline and its components.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON encoding or decoding failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem or subprocess I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A document could not be brought under the size ceiling.
    #[error("document '{name}' is {size} bytes after preprocessing, limit is {limit}")]
    Oversize {
        /// Document name.
        name: String,
        /// Final size in bytes.
        size: usize,
        /// Configured ceiling in bytes.
        limit: usize,
    },

    /// Retryable rate-limit signal from the remote service.
    ///
    /// Surfaces past the retry controller only once attempts are exhausted.
    #[error("throttled by service: {message}")]
    Throttling {
        /// Provider message or response body.
        message: String,
        /// Parsed `Retry-After` hint, if the provider sent one.
        retry_after: Option<Duration>,
    },

    /// Malformed or unrecognized response or tool-invocation shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Response text did not contain recoverable JSON.
    #[error("could not parse JSON from response: {message}")]
    Parse {
        /// What went wrong.
        message: String,
        /// The full raw text, kept for diagnostics.
        raw: String,
    },

    /// A node's input key was absent from the state snapshot.
    #[error("state key '{0}' is not available")]
    MissingInput(String),

    /// A conditional edge produced a label with no matching branch.
    #[error("router on '{node}' returned unmatched label '{label}'")]
    Router {
        /// Source node of the conditional edge.
        node: String,
        /// The label the router returned.
        label: String,
    },

    /// Invalid graph definition detected at build time.
    #[error("invalid graph: {0}")]
    Graph(String),

    /// A preprocessing codec (trimmer, compressor) failed.
    #[error("codec failure: {0}")]
    Codec(String),

    /// A locally executed capability failed.
    #[error("capability '{name}' failed: {message}")]
    Capability {
        /// Capability name.
        name: String,
        /// Failure description.
        message: String,
    },

    /// The run was cancelled via its cancellation token.
    #[error("Pipeline was cancelled")]
    Cancelled,

    /// Invalid configuration detected at build or load time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    ///
    /// Returned by [`Backend`](crate::backend::Backend) implementations for
    /// non-success statuses that are not throttling signals.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 400, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Stable snake_case tag for the error class.
    ///
    /// Written into error entries so downstream consumers can branch on
    /// the class without parsing messages.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Request(_) => "request",
            PipelineError::Json(_) => "json",
            PipelineError::Io(_) => "io",
            PipelineError::Oversize { .. } => "oversize",
            PipelineError::Throttling { .. } => "throttling",
            PipelineError::Protocol(_) => "protocol",
            PipelineError::Parse { .. } => "parse",
            PipelineError::MissingInput(_) => "missing_input",
            PipelineError::Router { .. } => "router",
            PipelineError::Graph(_) => "graph",
            PipelineError::Codec(_) => "codec",
            PipelineError::Capability { .. } => "capability",
            PipelineError::Cancelled => "cancelled",
            PipelineError::InvalidConfig(_) => "invalid_config",
            PipelineError::HttpError { .. } => "http",
            PipelineError::Other(_) => "other",
        }
    }

    /// Raw response text carried by the error, if any.
    pub fn raw(&self) -> Option<&str> {
        match self {
            PipelineError::Parse { raw, .. } => Some(raw),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
