//! Live observation of a keyed set of entities.
//!
//! ```text
//!   set_keys ──► diff against tracked set
//!                  ├─ new key ────► spawn child observer
//!                  ├─ removed key ─► dispose child, drop its value
//!                  └─ kept key ───► untouched, no resubscribe
//!
//!   child delivery ──► update latest value ──► emit full sorted snapshot
//! ```
//!
//! Consumers always receive a complete snapshot, never a delta. Snapshots
//! are sorted by a settable comparator; ties keep the order entities first
//! appeared, and the sort is stable across emissions.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashSet;
use tokio::sync::mpsc;

use crate::entity::{Entity, EntityKey};
use crate::observer::EntityObserver;
use crate::remote::RemoteStore;

type Comparator<T> = Box<dyn Fn(&T, &T) -> Ordering + Send>;

struct CollectionState<T: Entity> {
    tracked: HashMap<EntityKey, EntityObserver>,
    last_value_by_key: HashMap<EntityKey, T>,
    /// Key order of the previous snapshot; the anchor for stable ties.
    order: Vec<EntityKey>,
    comparator: Comparator<T>,
    snapshot_tx: Option<mpsc::UnboundedSender<Vec<T>>>,
    disposed: bool,
}

/// Observes the entities named by a mutable key set and emits sorted
/// snapshots of their latest values.
pub struct CollectionObserver<T: Entity> {
    remote: Arc<dyn RemoteStore>,
    root: String,
    state: Arc<Mutex<CollectionState<T>>>,
    snapshot_rx: Option<mpsc::UnboundedReceiver<Vec<T>>>,
}

impl<T: Entity> CollectionObserver<T> {
    /// Create an observer over `root` with an initial sort order.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        root: impl Into<String>,
        comparator: impl Fn(&T, &T) -> Ordering + Send + 'static,
    ) -> Self {
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        Self {
            remote,
            root: root.into(),
            state: Arc::new(Mutex::new(CollectionState {
                tracked: HashMap::new(),
                last_value_by_key: HashMap::new(),
                order: Vec::new(),
                comparator: Box::new(comparator),
                snapshot_tx: Some(snapshot_tx),
                disposed: false,
            })),
            snapshot_rx: Some(snapshot_rx),
        }
    }

    /// Take the snapshot receiver. Returns `None` after the first call.
    pub fn take_snapshot_rx(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<T>>> {
        self.snapshot_rx.take()
    }

    /// Replace the tracked key set.
    ///
    /// Keys present in both sets keep their subscription and latest value.
    /// New keys are subscribed; their values join snapshots as they arrive.
    /// Removed keys are unsubscribed and leave the next snapshot, which is
    /// emitted immediately when a removal drops a value.
    pub fn set_keys(&self, keys: &[EntityKey]) {
        let wanted: FxHashSet<&str> = keys.iter().map(String::as_str).collect();
        let mut removed: Vec<EntityObserver> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return;
            }

            let stale: Vec<EntityKey> = state
                .tracked
                .keys()
                .filter(|key| !wanted.contains(key.as_str()))
                .cloned()
                .collect();
            let mut dropped_value = false;
            for key in &stale {
                if let Some(observer) = state.tracked.remove(key) {
                    removed.push(observer);
                }
                if state.last_value_by_key.remove(key).is_some() {
                    dropped_value = true;
                }
                state.order.retain(|k| k != key);
            }

            for key in keys {
                if state.tracked.contains_key(key) {
                    continue;
                }
                let shared = self.state.clone();
                let child_key = key.clone();
                let observer = EntityObserver::spawn(
                    self.remote.clone(),
                    &self.root,
                    key,
                    move |value: T| deliver(&shared, &child_key, value),
                );
                state.tracked.insert(key.clone(), observer);
            }

            if dropped_value {
                emit_locked(&mut state);
            }
        }
        // Child teardown waits until the state lock is released; a delivery
        // blocked on that lock must not deadlock against dispose.
        for observer in removed {
            observer.dispose();
        }
    }

    /// Replace the sort order and re-emit the current snapshot under it.
    pub fn set_comparator(&self, comparator: impl Fn(&T, &T) -> Ordering + Send + 'static) {
        let mut state = self.state.lock().unwrap();
        if state.disposed {
            return;
        }
        state.comparator = Box::new(comparator);
        if !state.last_value_by_key.is_empty() {
            emit_locked(&mut state);
        }
    }

    /// Latest value delivered for `key`, if any.
    pub fn value_of(&self, key: &str) -> Option<T> {
        self.state.lock().unwrap().last_value_by_key.get(key).cloned()
    }

    /// Currently tracked keys, sorted.
    pub fn tracked_keys(&self) -> Vec<EntityKey> {
        let state = self.state.lock().unwrap();
        let mut keys: Vec<EntityKey> = state.tracked.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Unsubscribe every key and close the snapshot channel. Idempotent.
    pub fn dispose(&self) {
        let removed: Vec<EntityObserver> = {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.last_value_by_key.clear();
            state.order.clear();
            state.snapshot_tx = None;
            state.tracked.drain().map(|(_, observer)| observer).collect()
        };
        for observer in removed {
            observer.dispose();
        }
        log::debug!("disposed collection over {}", self.root);
    }

    /// True once `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        self.state.lock().unwrap().disposed
    }
}

impl<T: Entity> Drop for CollectionObserver<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Child observer sink: record the value and emit a fresh snapshot.
fn deliver<T: Entity>(state: &Arc<Mutex<CollectionState<T>>>, key: &str, value: T) {
    let mut state = state.lock().unwrap();
    // A delivery can race its key's removal; late values are discarded.
    if state.disposed || !state.tracked.contains_key(key) {
        return;
    }
    if !state.last_value_by_key.contains_key(key) {
        state.order.push(key.to_string());
    }
    state.last_value_by_key.insert(key.to_string(), value);
    emit_locked(&mut state);
}

fn emit_locked<T: Entity>(state: &mut CollectionState<T>) {
    // Sort (tracked key, value) pairs together: the tracked key can be
    // longer than the entity's own key (`owner/id` vs `id`), and the order
    // list must keep addressing `last_value_by_key`.
    let mut entries: Vec<(EntityKey, T)> = state
        .order
        .iter()
        .filter_map(|key| {
            state
                .last_value_by_key
                .get(key)
                .map(|value| (key.clone(), value.clone()))
        })
        .collect();
    entries.sort_by(|(_, a), (_, b)| (state.comparator)(a, b));
    state.order = entries.iter().map(|(key, _)| key.clone()).collect();
    let values: Vec<T> = entries.into_iter().map(|(_, value)| value).collect();
    if let Some(tx) = &state.snapshot_tx {
        let _ = tx.send(values);
    }
}
