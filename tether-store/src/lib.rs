//! # tether-store — Typed domain stores over tether-sync
//!
//! Binds the sync layer's caches, registries and collections to the three
//! record types of the product domain, and carries the bookkeeping writes
//! (counters, membership sets) that keep related records in step.
//!
//! ## Modules
//!
//! - [`record`] — User, Team and Task records and their decode rules
//! - [`users`] — Profile lookups, task counters, live watching
//! - [`teams`] — Team lookups and active-task membership
//! - [`tasks`] — Task lifecycle across the active and completed lists
//!
//! Stores are built at the composition root around one shared
//! [`RemoteStore`](tether_sync::RemoteStore) handle; nothing here is global.

pub mod record;
pub mod tasks;
pub mod teams;
pub mod users;

pub use record::{by_rank, now_ms, Task, TaskPriority, Team, User, UserStatus};
pub use tasks::{task_key, TaskDraft, TaskStore, ACTIVE_TASKS_ROOT, COMPLETED_TASKS_ROOT};
pub use teams::{TeamStore, TEAMS_ROOT};
pub use users::{UserStore, USERS_ROOT};

use thiserror::Error;

use tether_sync::{CacheError, RemoteError};

/// Store-level failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// A record could not be serialized for writing.
    #[error("encode failed: {0}")]
    Encode(String),
}
