//! Fire-and-forget failure notifications.
//!
//! The dispatcher reports surfaced failures to an [`EventSink`] so the
//! host app can forward them to its analytics/crash-reporting SDK. The
//! sink is best-effort: it must not block, and nothing it does can affect
//! the dispatcher's result.

use crate::request::EndpointGroup;

/// A dispatch failure surfaced to the caller.
#[derive(Debug, Clone)]
pub struct FailureEvent {
    /// Endpoint group of the failed request.
    pub group: EndpointGroup,
    /// Request method.
    pub method: &'static str,
    /// Request path.
    pub path: String,
    /// Rendered error.
    pub error: String,
    /// Number of attempts made, including the initial one.
    pub attempts: u32,
}

/// Receiver of fire-and-forget dispatch failure events.
///
/// Implementations must return promptly; spawn if delivery can block.
pub trait EventSink: Send + Sync {
    /// Called once per failure surfaced by the dispatcher.
    fn on_failure(&self, event: FailureEvent);
}

/// Sink that drops all events.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn on_failure(&self, _event: FailureEvent) {}
}

/// Sink that logs events through `tracing`.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_failure(&self, event: FailureEvent) {
        tracing::debug!(
            group = %event.group,
            method = event.method,
            path = %event.path,
            attempts = event.attempts,
            error = %event.error,
            "Dispatch failed"
        );
    }
}
