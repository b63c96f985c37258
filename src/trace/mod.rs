use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Opaque span handle returned by [`TraceSink::start_span`].
pub type SpanId = u64;

/// Fire-and-forget tracing sink, invoked at every loop phase transition.
///
/// The signatures are deliberately infallible: a broken sink must never affect
/// control flow, so implementations swallow their own errors. Expensive sinks
/// should buffer internally rather than block the caller.
pub trait TraceSink: Send + Sync {
    fn start_span(&self, name: &str, metadata: Value) -> SpanId;
    fn end_span(&self, id: SpanId, outcome: &str);
}

/// Default sink that forwards spans to the `tracing` subscriber.
#[derive(Default)]
pub struct TracingSink {
    next_id: AtomicU64,
}

impl TraceSink for TracingSink {
    fn start_span(&self, name: &str, metadata: Value) -> SpanId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(span = id, meta = %metadata, "span start: {}", name);
        id
    }

    fn end_span(&self, id: SpanId, outcome: &str) {
        debug!(span = id, "span end: {}", outcome);
    }
}

/// Sink that discards everything.
pub struct NoopSink;

impl TraceSink for NoopSink {
    fn start_span(&self, _name: &str, _metadata: Value) -> SpanId {
        0
    }

    fn end_span(&self, _id: SpanId, _outcome: &str) {}
}
