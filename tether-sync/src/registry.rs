//! Shared entity watching with token-based registration.
//!
//! Any number of watchers can follow the same key through one upstream
//! subscription. Each `watch` call mints an opaque token; `unwatch` with
//! that token is the only way a watcher leaves. When the last watcher of a
//! key leaves, the upstream subscription is torn down.
//!
//! A watcher that joins while a value is already known receives that value
//! immediately, then live updates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::entity::{Entity, EntityKey};
use crate::observer::EntityObserver;
use crate::remote::RemoteStore;

/// Opaque registration handle returned by [`ObserverRegistry::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchToken(u64);

struct KeyGroup<T> {
    observer: EntityObserver,
    subscribers: Vec<(WatchToken, mpsc::UnboundedSender<T>)>,
    last_value: Option<T>,
}

struct RegistryState<T> {
    groups: HashMap<EntityKey, KeyGroup<T>>,
    next_token: u64,
    disposed: bool,
}

/// Fans one subscription per key out to any number of watchers.
pub struct ObserverRegistry<T: Entity> {
    remote: Arc<dyn RemoteStore>,
    root: String,
    state: Arc<Mutex<RegistryState<T>>>,
}

impl<T: Entity> ObserverRegistry<T> {
    /// Create a registry over `root`.
    pub fn new(remote: Arc<dyn RemoteStore>, root: impl Into<String>) -> Self {
        Self {
            remote,
            root: root.into(),
            state: Arc::new(Mutex::new(RegistryState {
                groups: HashMap::new(),
                next_token: 0,
                disposed: false,
            })),
        }
    }

    /// Start watching `key`.
    ///
    /// The first watcher of a key opens the upstream subscription; later
    /// watchers share it and receive the latest known value right away.
    /// After [`dispose`](Self::dispose) the returned channel is closed.
    pub fn watch(&self, key: &str) -> (WatchToken, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        let token = WatchToken(state.next_token);
        state.next_token += 1;
        if state.disposed {
            return (token, rx);
        }

        match state.groups.get_mut(key) {
            Some(group) => {
                if let Some(value) = &group.last_value {
                    let _ = tx.send(value.clone());
                }
                group.subscribers.push((token, tx));
            }
            None => {
                let shared = self.state.clone();
                let group_key = key.to_string();
                let observer = EntityObserver::spawn(
                    self.remote.clone(),
                    &self.root,
                    key,
                    move |value: T| fan_out(&shared, &group_key, value),
                );
                state.groups.insert(
                    key.to_string(),
                    KeyGroup {
                        observer,
                        subscribers: vec![(token, tx)],
                        last_value: None,
                    },
                );
            }
        }
        (token, rx)
    }

    /// Remove the watcher registered under `token`.
    ///
    /// An unknown or already removed token is a no-op. The last watcher of
    /// a key takes the upstream subscription down with it.
    pub fn unwatch(&self, token: WatchToken) {
        let removed: Option<(EntityKey, EntityObserver)> = {
            let mut state = self.state.lock().unwrap();
            let mut emptied: Option<EntityKey> = None;
            for (key, group) in state.groups.iter_mut() {
                let before = group.subscribers.len();
                group.subscribers.retain(|(t, _)| *t != token);
                if group.subscribers.len() != before {
                    if group.subscribers.is_empty() {
                        emptied = Some(key.clone());
                    }
                    break;
                }
            }
            emptied.and_then(|key| {
                state
                    .groups
                    .remove(&key)
                    .map(|group| (key, group.observer))
            })
        };
        // Observer teardown happens outside the registry lock.
        if let Some((key, observer)) = removed {
            observer.dispose();
            log::debug!("last watcher left {}", key);
        }
    }

    /// Number of watchers currently registered on `key`.
    pub fn watcher_count(&self, key: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .groups
            .get(key)
            .map(|group| group.subscribers.len())
            .unwrap_or(0)
    }

    /// Number of keys with an open upstream subscription.
    pub fn group_count(&self) -> usize {
        self.state.lock().unwrap().groups.len()
    }

    /// Tear down every subscription and close all watcher channels.
    pub fn dispose(&self) {
        let removed: Vec<EntityObserver> = {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state
                .groups
                .drain()
                .map(|(_, group)| group.observer)
                .collect()
        };
        for observer in removed {
            observer.dispose();
        }
        log::debug!("disposed registry over {}", self.root);
    }

    /// True once `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        self.state.lock().unwrap().disposed
    }
}

impl<T: Entity> Drop for ObserverRegistry<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Shared observer sink: remember the value and send it to every watcher.
/// Watchers whose receiver is gone are pruned; the group itself stays until
/// its last token is unwatched.
fn fan_out<T: Entity>(state: &Arc<Mutex<RegistryState<T>>>, key: &str, value: T) {
    let mut state = state.lock().unwrap();
    if state.disposed {
        return;
    }
    if let Some(group) = state.groups.get_mut(key) {
        group.last_value = Some(value.clone());
        group
            .subscribers
            .retain(|(_, tx)| tx.send(value.clone()).is_ok());
    }
}
