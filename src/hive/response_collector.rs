//! Synchronous-style completion bridge over the streaming event bus (C2).
//!
//! `AgentManager.handleUserMessage` needs to hand the caller a single
//! `await`-able future even though the underlying work happens as a stream
//! of [`AgentEvent`](crate::hive::event::AgentEvent)s. `ResponseCollector`
//! is that bridge: `begin` opens a slot keyed by a correlation id,
//! `add_chunk` accumulates streamed text against it, and `complete`/`fail`/
//! `cancel` resolve the future exactly once. This mirrors the teacher's use
//! of one-shot channel primitives for single-resolution async handoffs,
//! generalized from a single call site to a registry keyed by correlation id.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

/// The resolved value of a collected response.
#[derive(Debug, Clone)]
pub struct CollectedResponse {
    pub text: String,
}

/// Why a collected response never completed.
#[derive(Debug, Clone)]
pub enum CollectorError {
    /// `fail` was called with this message (typically a classified
    /// `HiveError` rendered to text by the caller).
    Failed(String),
    /// `cancel` was called, or the collector was dropped before resolving.
    Cancelled,
    /// No terminal event arrived within the configured timeout.
    TimedOut,
}

struct Slot {
    sender: Option<oneshot::Sender<Result<CollectedResponse, CollectorError>>>,
    buffer: String,
}

/// Registry of in-flight request/response correlations (C2).
///
/// Cloning shares the underlying registry (`Arc`-backed internally via the
/// `Mutex`-protected map living behind a single owned instance); callers
/// typically hold one `ResponseCollector` per `AgentManager` and pass
/// correlation ids around rather than cloning the collector itself.
pub struct ResponseCollector {
    slots: Mutex<HashMap<String, Slot>>,
    default_timeout: Duration,
}

impl ResponseCollector {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    /// Open a slot for `correlation_id` synchronously, before any concurrent
    /// work that might resolve it gets a chance to run. Splitting this out
    /// of [`begin`](Self::begin) lets a caller insert the slot and only
    /// *then* hand off the work that will eventually call `complete`/`fail`
    /// — awaiting `begin` directly would not insert the slot until it is
    /// first polled, which races a caller that schedules the producer
    /// before awaiting the collector.
    pub fn open(
        &self,
        correlation_id: impl Into<String>,
    ) -> oneshot::Receiver<Result<CollectedResponse, CollectorError>> {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().unwrap().insert(
            correlation_id.into(),
            Slot {
                sender: Some(tx),
                buffer: String::new(),
            },
        );
        rx
    }

    /// Await the receiver returned by [`open`](Self::open) for
    /// `correlation_id`, applying the timeout and cleaning up the slot on
    /// expiry.
    pub async fn wait(
        &self,
        correlation_id: impl Into<String>,
        rx: oneshot::Receiver<Result<CollectedResponse, CollectorError>>,
        custom_timeout: Option<Duration>,
    ) -> Result<CollectedResponse, CollectorError> {
        let correlation_id = correlation_id.into();
        let wait = custom_timeout.unwrap_or(self.default_timeout);
        match timeout(wait, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CollectorError::Cancelled),
            Err(_) => {
                self.slots.lock().unwrap().remove(&correlation_id);
                Err(CollectorError::TimedOut)
            }
        }
    }

    /// Open a slot for `correlation_id` and return a future that resolves
    /// when `complete`, `fail`, or `cancel` is called for it, or when
    /// `timeout` (or the collector's default) elapses first.
    pub async fn begin(
        &self,
        correlation_id: impl Into<String>,
        custom_timeout: Option<Duration>,
    ) -> Result<CollectedResponse, CollectorError> {
        let correlation_id = correlation_id.into();
        let rx = self.open(correlation_id.clone());
        self.wait(correlation_id, rx, custom_timeout).await
    }

    /// Append a streamed chunk to the accumulating buffer for
    /// `correlation_id`. A no-op if the slot has already resolved or does
    /// not exist (late chunks after completion are discarded).
    pub fn add_chunk(&self, correlation_id: &str, chunk: &str) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(correlation_id) {
            slot.buffer.push_str(chunk);
        }
    }

    /// Resolve `correlation_id` successfully with its accumulated buffer.
    /// Idempotent: a second call after resolution is a no-op.
    pub fn complete(&self, correlation_id: &str) {
        self.resolve(correlation_id, |buffer| Ok(CollectedResponse { text: buffer }));
    }

    /// Resolve `correlation_id` with an error. Idempotent.
    pub fn fail(&self, correlation_id: &str, message: impl Into<String>) {
        let message = message.into();
        self.resolve(correlation_id, move |_| Err(CollectorError::Failed(message)));
    }

    /// Resolve `correlation_id` as cancelled, discarding any buffered text.
    /// Idempotent.
    pub fn cancel(&self, correlation_id: &str) {
        self.resolve(correlation_id, |_| Err(CollectorError::Cancelled));
    }

    fn resolve(
        &self,
        correlation_id: &str,
        make_result: impl FnOnce(String) -> Result<CollectedResponse, CollectorError>,
    ) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(correlation_id) {
            if let Some(sender) = slot.sender.take() {
                let buffer = std::mem::take(&mut slot.buffer);
                let _ = sender.send(make_result(buffer));
            }
        }
        slots.remove(correlation_id);
    }
}

impl Default for ResponseCollector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn completes_with_accumulated_chunks() {
        let collector = Arc::new(ResponseCollector::new(Duration::from_secs(1)));
        let c2 = collector.clone();
        let handle = tokio::spawn(async move { c2.begin("req-1", None).await });

        tokio::task::yield_now().await;
        collector.add_chunk("req-1", "hello ");
        collector.add_chunk("req-1", "world");
        collector.complete("req-1");

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.text, "hello world");
    }

    #[tokio::test]
    async fn fail_surfaces_message() {
        let collector = Arc::new(ResponseCollector::new(Duration::from_secs(1)));
        let c2 = collector.clone();
        let handle = tokio::spawn(async move { c2.begin("req-2", None).await });

        tokio::task::yield_now().await;
        collector.fail("req-2", "boom");

        match handle.await.unwrap() {
            Err(CollectorError::Failed(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected result: {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn idempotent_after_resolution() {
        let collector = ResponseCollector::new(Duration::from_secs(1));
        collector.complete("nonexistent");
        collector.fail("nonexistent", "x");
        collector.cancel("nonexistent");
    }

    #[tokio::test]
    async fn times_out_without_completion() {
        let collector = ResponseCollector::new(Duration::from_millis(20));
        let result = collector.begin("req-3", None).await;
        assert!(matches!(result, Err(CollectorError::TimedOut)));
    }
}
