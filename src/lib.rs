//! # LLM Docflow
//!
//! Orchestration core for document pipelines built on a hosted generative
//! service.
//!
//! Documents go through a size-bounded preprocessor, are sent to the service
//! one exchange per document (with an optional local tool protocol), and
//! the parsed replies flow through a graph of task nodes. The executor runs
//! ready nodes concurrently, streams every result to an observer, and
//! deep-merges it into a single shared state. Failures of a document or a
//! node are stored as error entries, so one bad input never stops a batch.
//!
//! ## Core Concepts
//!
//! - **[`TaskNode`]**: object-safe unit of work. Reads an immutable state
//!   snapshot and returns a partial update.
//! - **[`PipelineGraph`]**: nodes plus unconditional and routed edges,
//!   validated once by [`GraphBuilder::build`].
//! - **[`Executor`]**: runs a graph and owns the live [`PipelineState`].
//! - **[`DocumentParseNode`]**: per-document fan-out with batching and
//!   isolation.
//! - **[`LlmCall`]**: prompt node over earlier results.
//! - **[`ExecCtx`]**: run-scoped HTTP client, backend, retry policy,
//!   cancellation and event handler.
//!
//! ## Quick Start
//!
//! ```
//! use llm_docflow::{
//!     DocumentParseNode, Document, ExecCtx, Executor, GraphBuilder, LlmCall, MockBackend,
//!     PipelineState, Router, END,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = Arc::new(MockBackend::fixed(r#"{"doc_type": "PO"}"#));
//!     let ctx = ExecCtx::builder("http://localhost:8080").backend(backend).build();
//!
//!     let graph = GraphBuilder::new()
//!         .add_node(Arc::new(DocumentParseNode::new("Parse Documents", "Classify this document.")))
//!         .add_node(Arc::new(
//!             LlmCall::new("Check PO Exists", "Is there a PO in {parsed_data}? Answer Yes or No.")
//!                 .with_inputs(["parsed_data"])
//!                 .with_output_key("po_check"),
//!         ))
//!         .add_node(Arc::new(LlmCall::new("Validate PO data", "Validate {parsed_data}").with_inputs(["parsed_data"])))
//!         .set_entry("Parse Documents")
//!         .add_edge("Parse Documents", "Check PO Exists")
//!         .add_conditional_edges_with_default(
//!             "Check PO Exists",
//!             Router::from_key("po_check", ["Yes", "No"]),
//!             [("Yes", "Validate PO data"), ("No", END)],
//!             END,
//!         )
//!         .build()?;
//!
//!     let state = PipelineState::new(vec![Document::new("po.pdf", b"%PDF-1.7".to_vec())]);
//!     let outcome = Executor::new(graph)
//!         .run_with_observer(&ctx, state, |result| println!("{} finished", result.node))
//!         .await?;
//!     println!("{}", serde_json::to_string_pretty(&outcome.state.to_value())?);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod exec_ctx;
pub mod executor;
pub mod fan_out;
pub mod graph;
pub mod llm_call;
pub mod node;
pub mod parsing;
pub mod preprocess;
pub mod prompt;
pub mod retry;
pub mod sink;
pub mod state;
pub mod tools;

pub use backend::{Backend, ConverseBackend, MockBackend, MockReply};
pub use client::{exchange, exchange_text, ExchangeOutcome, ExchangeRequest, LlmConfig};
pub use config::ProcessingConfig;
pub use document::{Document, DocumentKind};
pub use error::{PipelineError, Result};
pub use events::{Event, EventHandler, FnEventHandler};
pub use exec_ctx::{ExecCtx, ExecCtxBuilder};
pub use executor::{Executor, RunOutcome};
pub use fan_out::DocumentParseNode;
pub use graph::{GraphBuilder, PipelineGraph, Router, Target, END};
pub use llm_call::LlmCall;
pub use node::{BoxFut, FnNode, TaskNode, TaskResult};
pub use preprocess::{PreprocessLimits, Preprocessor};
pub use retry::{with_retry, BackoffConfig, JitterStrategy};
pub use sink::{JsonFileSink, MemorySink, ResultSink};
pub use state::{deep_merge, PipelineState, StateMap};
pub use tools::{Capability, CapabilityRegistry, FnCapability};
