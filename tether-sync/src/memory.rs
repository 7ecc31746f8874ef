//! In-memory remote store with push fan-out.
//!
//! Holds a hierarchical JSON tree addressed by `/`-separated paths. A write
//! notifies every subscriber whose path lies on the written path — ancestors
//! and descendants alike — each with a fresh snapshot of its own node, which
//! is how a subscriber of `users/u1` sees a counter bump under
//! `users/u1/active_tasks`.
//!
//! Backs tests and benches, and serves as the reference implementation of
//! [`RemoteStore`] semantics for real transports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::remote::{RemoteError, RemoteStore, RemoteSubscription};

/// Counters for monitoring backend traffic.
#[derive(Debug, Clone, Default)]
pub struct RemoteStats {
    pub fetches: u64,
    pub writes: u64,
    pub adjusts: u64,
    pub subscribes: u64,
    pub events_delivered: u64,
    pub active_subscriptions: usize,
}

/// Atomic stats twin — lock-free on the notify path.
struct AtomicRemoteStats {
    fetches: AtomicU64,
    writes: AtomicU64,
    adjusts: AtomicU64,
    subscribes: AtomicU64,
    events_delivered: AtomicU64,
}

impl AtomicRemoteStats {
    fn new() -> Self {
        Self {
            fetches: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            adjusts: AtomicU64::new(0),
            subscribes: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
        }
    }
}

struct Subscriber {
    segments: Vec<String>,
    tx: mpsc::UnboundedSender<Value>,
}

struct MemoryState {
    tree: Value,
    subscribers: HashMap<u64, Subscriber>,
}

/// In-memory [`RemoteStore`] backend.
pub struct MemoryRemote {
    state: Arc<Mutex<MemoryState>>,
    next_sub_id: AtomicU64,
    fetch_latency: Option<Duration>,
    stats: Arc<AtomicRemoteStats>,
}

impl MemoryRemote {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                tree: Value::Object(Map::new()),
                subscribers: HashMap::new(),
            })),
            next_sub_id: AtomicU64::new(0),
            fetch_latency: None,
            stats: Arc::new(AtomicRemoteStats::new()),
        }
    }

    /// Create a backend whose one-shot reads take `latency` to resolve.
    /// Widens the in-flight window so tests can observe dedup and timeouts.
    pub fn with_latency(latency: Duration) -> Self {
        let mut remote = Self::new();
        remote.fetch_latency = Some(latency);
        remote
    }

    /// Number of live subscriptions on exactly `path`.
    pub fn subscriber_count(&self, path: &str) -> usize {
        let segments = split_path(path);
        let state = self.state.lock().unwrap();
        state
            .subscribers
            .values()
            .filter(|sub| sub.segments.len() == segments.len() && on_common_prefix(&segments, &sub.segments))
            .count()
    }

    /// Number of live subscriptions across all paths.
    pub fn total_subscribers(&self) -> usize {
        self.state.lock().unwrap().subscribers.len()
    }

    /// Traffic counters (lock-free snapshot plus subscription count).
    pub fn stats(&self) -> RemoteStats {
        let active = self.total_subscribers();
        RemoteStats {
            fetches: self.stats.fetches.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            adjusts: self.stats.adjusts.load(Ordering::Relaxed),
            subscribes: self.stats.subscribes.load(Ordering::Relaxed),
            events_delivered: self.stats.events_delivered.load(Ordering::Relaxed),
            active_subscriptions: active,
        }
    }

    fn apply_write(&self, path: &str, value: Option<Value>) {
        let segments = split_path(path);
        let mut state = self.state.lock().unwrap();
        match value {
            Some(value) => set_node(&mut state.tree, &segments, value),
            None => remove_node(&mut state.tree, &segments),
        }
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        notify(&mut state, &segments, &self.stats);
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch_once(&self, path: &str) -> Result<Option<Value>, RemoteError> {
        if let Some(latency) = self.fetch_latency {
            tokio::time::sleep(latency).await;
        }
        self.stats.fetches.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock().unwrap();
        Ok(node_at(&state.tree, split_path(path)).cloned())
    }

    async fn subscribe(&self, path: &str) -> Result<RemoteSubscription, RemoteError> {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let segments: Vec<String> = split_path(path).into_iter().map(str::to_string).collect();
        {
            let mut state = self.state.lock().unwrap();
            // Current value first, then every change.
            if let Some(current) = node_at(&state.tree, &segments) {
                let _ = tx.send(current.clone());
                self.stats.events_delivered.fetch_add(1, Ordering::Relaxed);
            }
            state.subscribers.insert(id, Subscriber { segments, tx });
        }
        self.stats.subscribes.fetch_add(1, Ordering::Relaxed);
        log::debug!("subscribed #{} to {}", id, path);

        let state_ref = self.state.clone();
        Ok(RemoteSubscription::new(id, rx, move || {
            if let Ok(mut state) = state_ref.lock() {
                state.subscribers.remove(&id);
            }
        }))
    }

    async fn write(&self, path: &str, value: Option<Value>) -> Result<(), RemoteError> {
        self.apply_write(path, value);
        Ok(())
    }

    async fn set_flag(&self, path: &str, on: bool) -> Result<bool, RemoteError> {
        let segments = split_path(path);
        let changed = {
            let mut state = self.state.lock().unwrap();
            let present = node_at(&state.tree, &segments)
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if present == on {
                false
            } else {
                if on {
                    set_node(&mut state.tree, &segments, Value::Bool(true));
                } else {
                    remove_node(&mut state.tree, &segments);
                }
                notify(&mut state, &segments, &self.stats);
                true
            }
        };
        if changed {
            self.stats.writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(changed)
    }

    async fn adjust(&self, path: &str, delta: i64) -> Result<i64, RemoteError> {
        let segments = split_path(path);
        let next = {
            let mut state = self.state.lock().unwrap();
            let current = node_at(&state.tree, &segments)
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let next = current + delta;
            set_node(&mut state.tree, &segments, Value::from(next));
            notify(&mut state, &segments, &self.stats);
            next
        };
        self.stats.adjusts.fetch_add(1, Ordering::Relaxed);
        Ok(next)
    }
}

// ───────────────────────────────────────────────────────────────────
// Tree plumbing
// ───────────────────────────────────────────────────────────────────

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

fn node_at<'a, I, S>(tree: &'a Value, segments: I) -> Option<&'a Value>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut node = tree;
    for segment in segments {
        node = node.as_object()?.get(segment.as_ref())?;
    }
    Some(node)
}

fn set_node(tree: &mut Value, segments: &[&str], value: Value) {
    match segments.split_first() {
        None => *tree = value,
        Some((head, rest)) => {
            if !tree.is_object() {
                *tree = Value::Object(Map::new());
            }
            if let Value::Object(map) = tree {
                let child = map.entry(head.to_string()).or_insert(Value::Null);
                set_node(child, rest, value);
            }
        }
    }
}

fn remove_node(tree: &mut Value, segments: &[&str]) {
    match segments.split_first() {
        None => *tree = Value::Object(Map::new()),
        Some((head, rest)) => {
            if let Value::Object(map) = tree {
                if rest.is_empty() {
                    map.remove(*head);
                } else if let Some(child) = map.get_mut(*head) {
                    remove_node(child, rest);
                    // Empty branches disappear rather than lingering as {}.
                    if child.as_object().map(Map::is_empty).unwrap_or(false) {
                        map.remove(*head);
                    }
                }
            }
        }
    }
}

/// True when one path is a prefix of the other (either direction).
fn on_common_prefix(written: &[&str], subscribed: &[String]) -> bool {
    let shorter = written.len().min(subscribed.len());
    written[..shorter]
        .iter()
        .zip(&subscribed[..shorter])
        .all(|(w, s)| *w == s.as_str())
}

fn notify(state: &mut MemoryState, written: &[&str], stats: &AtomicRemoteStats) {
    let mut dead: Vec<u64> = Vec::new();
    for (id, sub) in &state.subscribers {
        if !on_common_prefix(written, &sub.segments) {
            continue;
        }
        let snapshot = node_at(&state.tree, &sub.segments)
            .cloned()
            .unwrap_or(Value::Null);
        if sub.tx.send(snapshot).is_err() {
            dead.push(*id);
        } else {
            stats.events_delivered.fetch_add(1, Ordering::Relaxed);
        }
    }
    for id in dead {
        state.subscribers.remove(&id);
    }
}
