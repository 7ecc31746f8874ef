//! Domain records synchronized from the remote tree.
//!
//! Records decode leniently: absent optional fields fall back to defaults so
//! older payloads stay readable, and unknown enum strings map to a safe
//! variant. Only identity-critical fields reject the payload.
//!
//! Membership sets ride as maps of `id -> bool` rather than arrays, matching
//! how the remote tree patches individual keys without rewriting the whole
//! list.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_sync::{DecodeError, Entity};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn enabled_ids(map: &BTreeMap<String, bool>) -> Vec<String> {
    map.iter()
        .filter(|(_, on)| **on)
        .map(|(id, _)| id.clone())
        .collect()
}

// ───────────────────────────────────────────────────────────────────
// User
// ───────────────────────────────────────────────────────────────────

/// Availability advertised on a user's profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Free,
    Occupied,
    /// Fallback for absent or unrecognized status strings.
    #[default]
    #[serde(other)]
    Unavailable,
}

/// A member profile under `users/<uid>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(skip)]
    pub uid: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub status: UserStatus,
    #[serde(default)]
    pub active_tasks: i64,
    #[serde(default)]
    pub completed_tasks: i64,
    /// Followed user ids; `false` marks an unfollow that is not yet pruned.
    #[serde(default)]
    pub following: BTreeMap<String, bool>,
    #[serde(default)]
    pub team_ids: BTreeMap<String, bool>,
}

impl User {
    /// Display name, with the last name appended when present.
    pub fn full_name(&self) -> String {
        if self.last_name.is_empty() {
            self.first_name.clone()
        } else {
            format!("{} {}", self.first_name, self.last_name)
        }
    }

    /// Ids this user follows, sorted.
    pub fn following_ids(&self) -> Vec<String> {
        enabled_ids(&self.following)
    }

    /// Ids of teams this user belongs to, sorted.
    pub fn team_id_list(&self) -> Vec<String> {
        enabled_ids(&self.team_ids)
    }
}

impl Entity for User {
    fn key(&self) -> &str {
        &self.uid
    }

    fn decode(key: &str, raw: &Value) -> Result<Self, DecodeError> {
        let mut user: User = serde_json::from_value(raw.clone())?;
        if user.first_name.is_empty() {
            return Err(DecodeError::MissingField("first_name"));
        }
        user.uid = key.to_string();
        Ok(user)
    }
}

// ───────────────────────────────────────────────────────────────────
// Team
// ───────────────────────────────────────────────────────────────────

/// A team under `teams/<id>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Team {
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub member_ids: BTreeMap<String, bool>,
    #[serde(default)]
    pub active_tasks: i64,
    /// Combined ids (`owner^task`) of this team's active tasks.
    #[serde(default)]
    pub tasks: BTreeMap<String, bool>,
}

impl Team {
    /// Member uids, sorted.
    pub fn member_id_list(&self) -> Vec<String> {
        enabled_ids(&self.member_ids)
    }

    /// Combined ids of active tasks, sorted.
    pub fn task_combined_ids(&self) -> Vec<String> {
        enabled_ids(&self.tasks)
    }
}

impl Entity for Team {
    fn key(&self) -> &str {
        &self.id
    }

    fn decode(key: &str, raw: &Value) -> Result<Self, DecodeError> {
        let mut team: Team = serde_json::from_value(raw.clone())?;
        if team.name.is_empty() {
            return Err(DecodeError::MissingField("name"));
        }
        team.id = key.to_string();
        Ok(team)
    }
}

// ───────────────────────────────────────────────────────────────────
// Task
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
}

impl TaskPriority {
    /// Multiplier applied when ranking active tasks.
    pub fn weight(&self) -> i64 {
        match self {
            TaskPriority::Low => 1,
            TaskPriority::Medium => 2,
            TaskPriority::High => 3,
        }
    }
}

/// A task under `tasks/active/<owner>/<id>` or `tasks/completed/<owner>/<id>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub team: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub active: bool,
    /// Creation time, milliseconds since the epoch.
    #[serde(default)]
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

impl Task {
    /// Identity that stays unique across owners, `owner^id`.
    pub fn combined_id(&self) -> String {
        format!("{}^{}", self.owner, self.id)
    }

    /// Sort weight: lower ranks first.
    ///
    /// Active tasks surface recent work scaled by priority; completed tasks
    /// surface the most recently finished.
    pub fn rank(&self) -> i64 {
        if self.active {
            -(self.created_at * self.priority.weight())
        } else {
            -self.completed_at.unwrap_or(self.created_at)
        }
    }
}

/// Comparator for task lists, ascending by [`Task::rank`].
pub fn by_rank(a: &Task, b: &Task) -> Ordering {
    a.rank().cmp(&b.rank())
}

impl Entity for Task {
    fn key(&self) -> &str {
        &self.id
    }

    fn decode(key: &str, raw: &Value) -> Result<Self, DecodeError> {
        let mut task: Task = serde_json::from_value(raw.clone())?;
        if task.title.is_empty() {
            return Err(DecodeError::MissingField("title"));
        }
        // Task caches key by `owner/id`; the node key is the last segment.
        task.id = key.rsplit('/').next().unwrap_or(key).to_string();
        Ok(task)
    }
}
