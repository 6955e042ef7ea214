//! Best-effort notification sink.
//!
//! Workflow correctness never depends on a notification landing; delivery
//! failures are swallowed by implementations.

use std::future::Future;

/// Receives named workflow events (`batch_start`, `batch_complete`) with a
/// JSON payload.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &str, payload: serde_json::Value) -> impl Future<Output = ()> + Send;
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    async fn notify(&self, _event: &str, _payload: serde_json::Value) {}
}

/// Emits every event through `tracing` at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn notify(&self, event: &str, payload: serde_json::Value) {
        tracing::info!(event, %payload, "workflow notification");
    }
}
