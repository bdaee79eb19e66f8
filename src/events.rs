//! Event system for node lifecycle and streaming hooks.
//!
//! Provides an optional, non-intrusive way to observe a run. The executor
//! emits events when nodes start and finish, and streams each node's
//! update before it is merged. Implement [`EventHandler`] to receive them
//! for progress tracking or incremental rendering.

use std::sync::Arc;

/// Events emitted during a pipeline run.
#[derive(Debug, Clone)]
pub enum Event {
    /// A node has been scheduled and started.
    NodeStart {
        /// Node name.
        name: String,
        /// Stable type identifier (e.g. `"llm-call"`, `"document-parse"`).
        kind: &'static str,
    },
    /// A node produced its update. Emitted before the update is merged.
    NodeOutput {
        /// Node name.
        name: String,
        /// The partial state update as JSON.
        update: serde_json::Value,
    },
    /// A node has finished.
    NodeEnd {
        /// Node name.
        name: String,
        /// Whether the node returned without error.
        ok: bool,
    },
    /// A service call is being retried after a throttling failure.
    TransportRetry {
        /// Exchange label (usually the node or document name).
        name: String,
        /// Retry number (1-indexed).
        attempt: u32,
        /// Delay before this retry in milliseconds.
        delay_ms: u64,
        /// Error description.
        reason: String,
    },
    /// The service requested a local capability.
    ToolInvocation {
        /// Exchange label.
        name: String,
        /// Capability name.
        tool: String,
        /// Tool round (1-indexed).
        round: u32,
    },
    /// One document inside a fan-out node finished.
    DocumentDone {
        /// Fan-out node name.
        node: String,
        /// Document key in the node's output mapping.
        document: String,
        /// Whether the document produced a result rather than an error entry.
        ok: bool,
    },
}

/// Handler for pipeline events.
///
/// Entirely optional; runs work the same without one.
///
/// # Example
///
/// ```
/// use llm_docflow::events::{Event, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: Event) {
///         match event {
///             Event::NodeStart { name, .. } => println!("[start] {}", name),
///             Event::NodeEnd { name, ok } => println!("[end] {} ok={}", name, ok),
///             _ => {}
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    /// Called for every emitted event.
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use llm_docflow::events::{Event, FnEventHandler};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: Event| {
///     if let Event::DocumentDone { document, ok, .. } = event {
///         println!("{document}: {ok}");
///     }
/// }));
/// ```
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_emit_reaches_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: Option<Arc<dyn EventHandler>> = Some(Arc::new(FnEventHandler(move |e: Event| {
            if let Event::NodeEnd { name, .. } = e {
                sink.lock().unwrap().push(name);
            }
        })));

        emit(&handler, Event::NodeEnd { name: "checklist".into(), ok: true });
        emit(&None, Event::NodeEnd { name: "ignored".into(), ok: true });

        assert_eq!(*seen.lock().unwrap(), vec!["checklist".to_string()]);
    }
}
