//! Remote store abstraction.
//!
//! The sync layer consumes two capabilities from the remote database: a
//! one-shot read and a continuous value-change subscription, both addressed
//! by a `/`-separated path. The write side (`write`, `adjust`) exists for the
//! domain stores that maintain counters and membership sets; the sync core
//! itself never writes.
//!
//! Implementations push events in per-path order and deliver the current
//! value first on attach, so a fresh subscriber always starts from known
//! state.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport failure surfaced by a remote store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The backend rejected or failed the operation.
    #[error("remote backend error: {0}")]
    Backend(String),

    /// The store has shut down and accepts no further operations.
    #[error("remote store closed")]
    Closed,
}

/// Handle for one continuous value subscription.
///
/// Events arrive in per-path order; deletions deliver `Value::Null`.
/// Dropping the handle cancels the subscription.
pub struct RemoteSubscription {
    id: u64,
    events: mpsc::UnboundedReceiver<Value>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl RemoteSubscription {
    /// Assemble a subscription from its parts. Backends call this.
    pub fn new(
        id: u64,
        events: mpsc::UnboundedReceiver<Value>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            id,
            events,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Subscription id, unique per backend instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next value event. `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Value> {
        self.events.recv().await
    }

    /// Stop delivery. Idempotent; dropping the handle has the same effect.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// The capabilities the sync layer needs from a remote database.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// One-shot read. `Ok(None)` means the node does not exist.
    async fn fetch_once(&self, path: &str) -> Result<Option<Value>, RemoteError>;

    /// Subscribe to continuous value changes at `path`. The current value,
    /// when one exists, is delivered before any change event.
    async fn subscribe(&self, path: &str) -> Result<RemoteSubscription, RemoteError>;

    /// Set (`Some`) or delete (`None`) the node at `path`.
    async fn write(&self, path: &str, value: Option<Value>) -> Result<(), RemoteError>;

    /// Atomically set (`true`) or clear (`false`) the boolean flag at
    /// `path`. Returns whether the stored state changed, so a caller can
    /// keep a counter in step with a membership set under concurrency.
    async fn set_flag(&self, path: &str, on: bool) -> Result<bool, RemoteError>;

    /// Atomically add `delta` to the numeric node at `path`, treating an
    /// absent or non-numeric node as 0. Returns the new value.
    async fn adjust(&self, path: &str, delta: i64) -> Result<i64, RemoteError>;
}

/// Join a root path and a node key.
pub fn join_path(root: &str, key: &str) -> String {
    if root.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", root, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("users", "u1"), "users/u1");
        assert_eq!(join_path("tasks/active", "o1/t1"), "tasks/active/o1/t1");
        assert_eq!(join_path("", "u1"), "u1");
    }

    #[tokio::test]
    async fn test_subscription_cancel_is_idempotent() {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = cancelled.clone();
        let mut sub = RemoteSubscription::new(7, rx, move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        assert_eq!(sub.id(), 7);

        tx.send(Value::from(1)).unwrap();
        assert_eq!(sub.next().await, Some(Value::from(1)));

        sub.cancel();
        sub.cancel();
        drop(sub);
        // One cancel callback total, across explicit calls and drop.
        assert_eq!(cancelled.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
