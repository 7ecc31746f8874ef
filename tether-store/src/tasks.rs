//! Task lifecycle across the active and completed lists.
//!
//! A task lives under exactly one of two subtrees, keyed by owner then id:
//!
//! ```text
//!   tasks/active/<owner>/<id>
//!   tasks/completed/<owner>/<id>
//! ```
//!
//! Completing, reopening and reassigning move the node between locations,
//! and every move keeps the owner's counters and the team's active set in
//! step. Each location gets its own cache because the same `owner/id` key
//! means a different node in each subtree.

use std::sync::Arc;

use uuid::Uuid;

use tether_sync::{CacheConfig, CacheError, EntityCache, EntityObserver, RemoteStore};

use crate::record::{now_ms, Task, TaskPriority};
use crate::teams::TeamStore;
use crate::users::UserStore;
use crate::StoreError;

/// Subtree holding active tasks.
pub const ACTIVE_TASKS_ROOT: &str = "tasks/active";
/// Subtree holding completed tasks.
pub const COMPLETED_TASKS_ROOT: &str = "tasks/completed";

/// Cache key of a task, `owner/id`.
pub fn task_key(owner: &str, id: &str) -> String {
    format!("{}/{}", owner, id)
}

/// Fields chosen by the caller when creating a task.
#[derive(Debug, Clone, Default)]
pub struct TaskDraft {
    pub owner: String,
    pub author: String,
    pub team: String,
    pub title: String,
    pub content: String,
    pub priority: TaskPriority,
}

/// Cached access to tasks plus the writes that move them through their
/// lifecycle.
pub struct TaskStore {
    remote: Arc<dyn RemoteStore>,
    active: EntityCache<Task>,
    completed: EntityCache<Task>,
}

impl TaskStore {
    pub fn new(remote: Arc<dyn RemoteStore>, config: CacheConfig) -> Self {
        Self {
            active: EntityCache::new(remote.clone(), ACTIVE_TASKS_ROOT, config.clone()),
            completed: EntityCache::new(remote.clone(), COMPLETED_TASKS_ROOT, config),
            remote,
        }
    }

    /// Fetch a task wherever it currently lives.
    ///
    /// Checks one list first and falls back to the other, so callers that
    /// remember a task's last known state probe the likely location first.
    pub async fn try_get_task(
        &self,
        owner: &str,
        id: &str,
        start_with_active: bool,
    ) -> Result<Option<Task>, StoreError> {
        let key = task_key(owner, id);
        let (first, second) = if start_with_active {
            (&self.active, &self.completed)
        } else {
            (&self.completed, &self.active)
        };
        match first.get(&key).await {
            Ok(task) => Ok(Some(task)),
            Err(CacheError::NotFound(_)) => match second.get(&key).await {
                Ok(task) => Ok(Some(task)),
                Err(CacheError::NotFound(_)) => Ok(None),
                Err(err) => Err(err.into()),
            },
            Err(err) => Err(err.into()),
        }
    }

    /// Create an active task and record it on its owner and team.
    pub async fn create_task(
        &self,
        users: &UserStore,
        teams: &TeamStore,
        draft: TaskDraft,
    ) -> Result<Task, StoreError> {
        let task = Task {
            id: Uuid::new_v4().simple().to_string(),
            owner: draft.owner,
            author: draft.author,
            team: draft.team,
            title: draft.title,
            content: draft.content,
            priority: draft.priority,
            active: true,
            created_at: now_ms(),
            completed_at: None,
        };
        self.write_task(&task).await?;
        users.adjust_active_tasks(&task.owner, 1).await?;
        teams.add_active_task(&task.team, &task.combined_id()).await?;
        log::info!("created task {} in {}", task.combined_id(), task.team);
        Ok(task)
    }

    /// Persist edits to a task.
    ///
    /// `previous` carries the version being replaced; when the owner or team
    /// changed, the old node and the old bookkeeping are unwound before the
    /// new state lands. Activity changes go through
    /// [`set_task_active`](Self::set_task_active) instead.
    pub async fn save_task(
        &self,
        users: &UserStore,
        teams: &TeamStore,
        task: &Task,
        previous: Option<&Task>,
    ) -> Result<(), StoreError> {
        let owner_moved = previous.map(|prev| prev.owner != task.owner).unwrap_or(false);
        let team_moved = previous.map(|prev| prev.team != task.team).unwrap_or(false);

        if let Some(prev) = previous {
            if owner_moved {
                self.remove_raw(prev.active, &prev.owner, &prev.id).await?;
                self.invalidate(prev);
            }
            if prev.active && (owner_moved || team_moved) {
                teams
                    .remove_active_task(&prev.team, &prev.combined_id())
                    .await?;
            }
            if prev.active && owner_moved {
                users.adjust_active_tasks(&prev.owner, -1).await?;
            }
        }

        self.write_task(task).await?;

        if task.active && (owner_moved || team_moved) {
            teams.add_active_task(&task.team, &task.combined_id()).await?;
        }
        if task.active && owner_moved {
            users.adjust_active_tasks(&task.owner, 1).await?;
        }
        Ok(())
    }

    /// Complete or reopen a task, returning the stored version.
    ///
    /// No-op when the task is already in the requested state.
    pub async fn set_task_active(
        &self,
        users: &UserStore,
        teams: &TeamStore,
        task: &Task,
        active: bool,
    ) -> Result<Task, StoreError> {
        if task.active == active {
            return Ok(task.clone());
        }
        let mut updated = task.clone();
        updated.active = active;
        updated.completed_at = if active { None } else { Some(now_ms()) };

        // Destination before source removal, so the task never disappears
        // from both lists mid-move.
        self.write_task(&updated).await?;
        self.remove_raw(task.active, &task.owner, &task.id).await?;
        self.invalidate(task);

        if active {
            users.adjust_active_tasks(&updated.owner, 1).await?;
            users.adjust_completed_tasks(&updated.owner, -1).await?;
            teams
                .add_active_task(&updated.team, &updated.combined_id())
                .await?;
        } else {
            users.adjust_active_tasks(&updated.owner, -1).await?;
            users.adjust_completed_tasks(&updated.owner, 1).await?;
            teams
                .remove_active_task(&updated.team, &updated.combined_id())
                .await?;
        }
        log::info!(
            "task {} is now {}",
            updated.combined_id(),
            if active { "active" } else { "completed" }
        );
        Ok(updated)
    }

    /// Remove a task and unwind its bookkeeping.
    pub async fn delete_task(
        &self,
        users: &UserStore,
        teams: &TeamStore,
        task: &Task,
    ) -> Result<(), StoreError> {
        self.remove_raw(task.active, &task.owner, &task.id).await?;
        self.invalidate(task);
        if task.active {
            users.adjust_active_tasks(&task.owner, -1).await?;
            teams
                .remove_active_task(&task.team, &task.combined_id())
                .await?;
        }
        log::info!("deleted task {}", task.combined_id());
        Ok(())
    }

    /// Observe one task's node in its current list.
    pub fn watch_task(&self, task: &Task, sink: impl Fn(Task) + Send + 'static) -> EntityObserver {
        let root = if task.active {
            ACTIVE_TASKS_ROOT
        } else {
            COMPLETED_TASKS_ROOT
        };
        EntityObserver::spawn(
            self.remote.clone(),
            root,
            &task_key(&task.owner, &task.id),
            sink,
        )
    }

    async fn write_task(&self, task: &Task) -> Result<(), StoreError> {
        let root = if task.active {
            ACTIVE_TASKS_ROOT
        } else {
            COMPLETED_TASKS_ROOT
        };
        let path = format!("{}/{}", root, task_key(&task.owner, &task.id));
        let raw = serde_json::to_value(task).map_err(|err| StoreError::Encode(err.to_string()))?;
        self.remote.write(&path, Some(raw)).await?;
        self.invalidate(task);
        Ok(())
    }

    async fn remove_raw(&self, active: bool, owner: &str, id: &str) -> Result<(), StoreError> {
        let root = if active {
            ACTIVE_TASKS_ROOT
        } else {
            COMPLETED_TASKS_ROOT
        };
        let path = format!("{}/{}", root, task_key(owner, id));
        self.remote.write(&path, None).await?;
        Ok(())
    }

    /// Both caches keep a slot for the same `owner/id` key; moves and edits
    /// clear them together.
    fn invalidate(&self, task: &Task) {
        let key = task_key(&task.owner, &task.id);
        self.active.invalidate(&key);
        self.completed.invalidate(&key);
    }
}
