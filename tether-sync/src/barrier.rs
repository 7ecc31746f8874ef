//! Countdown barrier for fan-in joins.
//!
//! Constructed with an expected count, decremented once per completed branch,
//! released exactly once when the count reaches zero. An expected count of
//! zero releases at construction. Waiters that arrive after release proceed
//! immediately.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Cloneable handle to a shared countdown.
#[derive(Clone)]
pub struct Barrier {
    inner: Arc<BarrierInner>,
}

struct BarrierInner {
    remaining: Mutex<usize>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Barrier {
    /// Create a barrier expecting `expected` decrements.
    pub fn new(expected: usize) -> Self {
        let (done_tx, done_rx) = watch::channel(expected == 0);
        Self {
            inner: Arc::new(BarrierInner {
                remaining: Mutex::new(expected),
                done_tx,
                done_rx,
            }),
        }
    }

    /// Record one completed branch. The transition to zero releases every
    /// waiter, current and future. Decrementing past zero is a caller bug:
    /// fatal in debug builds, logged and ignored in release builds.
    pub fn decrement(&self) {
        let mut remaining = self.inner.remaining.lock().unwrap();
        debug_assert!(*remaining > 0, "barrier decremented past zero");
        if *remaining == 0 {
            log::warn!("barrier decremented past zero");
            return;
        }
        *remaining -= 1;
        if *remaining == 0 {
            let _ = self.inner.done_tx.send(true);
        }
    }

    /// Wait until the expected number of decrements has arrived.
    pub async fn wait(&self) {
        let mut rx = self.inner.done_rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Decrements still outstanding.
    pub fn remaining(&self) -> usize {
        *self.inner.remaining.lock().unwrap()
    }

    /// True once the barrier has released.
    pub fn is_released(&self) -> bool {
        *self.inner.done_rx.borrow()
    }
}
