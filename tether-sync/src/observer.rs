//! Push-based observation of one entity.
//!
//! An observer subscribes to a single path, decodes every event into the
//! entity type and hands the result to a sink callback. Payloads that fail
//! decoding are dropped and the subscription stays up. Disposal is
//! synchronous: once `dispose` returns, the sink will not run again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::entity::{Entity, EntityKey};
use crate::remote::{join_path, RemoteStore};

/// Handle to a live subscription on one entity.
///
/// Dropping the handle disposes it.
pub struct EntityObserver {
    key: EntityKey,
    path: String,
    disposed: Arc<AtomicBool>,
    delivery: Arc<Mutex<()>>,
    task: JoinHandle<()>,
}

impl EntityObserver {
    /// Subscribe to `root/key` and feed decoded values to `sink`.
    ///
    /// The first delivery is the entity's current value, if the path holds
    /// one. Later deliveries follow upstream changes in order.
    pub fn spawn<T, F>(remote: Arc<dyn RemoteStore>, root: &str, key: &str, sink: F) -> Self
    where
        T: Entity,
        F: Fn(T) + Send + 'static,
    {
        let key = key.to_string();
        let path = join_path(root, &key);
        let disposed = Arc::new(AtomicBool::new(false));
        let delivery = Arc::new(Mutex::new(()));

        let task = tokio::spawn(observe_loop(
            remote,
            key.clone(),
            path.clone(),
            disposed.clone(),
            delivery.clone(),
            sink,
        ));

        Self {
            key,
            path,
            disposed,
            delivery,
            task,
        }
    }

    /// Stop observing. Idempotent, and safe to call from any thread except
    /// from inside this observer's own sink.
    ///
    /// Waits out a delivery already in the sink; after return the sink will
    /// not be invoked again.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        // An in-flight delivery holds this lock until its sink call ends.
        // A sink that panicked leaves it poisoned; teardown proceeds anyway,
        // also when `dispose` runs from `Drop`.
        drop(
            self.delivery
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        self.task.abort();
        log::debug!("disposed observer of {}", self.path);
    }

    /// True once `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Key of the observed entity.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Full path of the observed entity.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for EntityObserver {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn observe_loop<T, F>(
    remote: Arc<dyn RemoteStore>,
    key: EntityKey,
    path: String,
    disposed: Arc<AtomicBool>,
    delivery: Arc<Mutex<()>>,
    sink: F,
) where
    T: Entity,
    F: Fn(T) + Send + 'static,
{
    let mut sub = match remote.subscribe(&path).await {
        Ok(sub) => sub,
        Err(err) => {
            log::warn!("subscribe to {} failed: {}", path, err);
            return;
        }
    };

    while let Some(raw) = sub.next().await {
        if disposed.load(Ordering::Acquire) {
            break;
        }
        if raw.is_null() {
            log::debug!("{} removed upstream", path);
            continue;
        }
        let value = match T::decode(&key, &raw) {
            Ok(value) => value,
            Err(err) => {
                log::warn!("dropping malformed payload at {}: {}", path, err);
                continue;
            }
        };
        {
            let _guard = delivery.lock().unwrap();
            // Re-checked under the lock so a disposer that holds it next
            // never races a late delivery.
            if disposed.load(Ordering::Acquire) {
                break;
            }
            sink(value);
        }
    }
}
