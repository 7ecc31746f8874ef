//! Team store: cached reads, active-task membership, live watching.

use std::sync::Arc;

use tokio::sync::mpsc;

use tether_sync::{
    CacheConfig, CacheStats, EntityCache, EntityKey, ObserverRegistry, RemoteStore, WatchToken,
};

use crate::record::Team;
use crate::StoreError;

/// Subtree holding teams.
pub const TEAMS_ROOT: &str = "teams";

/// Cached, watchable access to teams.
pub struct TeamStore {
    remote: Arc<dyn RemoteStore>,
    cache: EntityCache<Team>,
    watchers: ObserverRegistry<Team>,
}

impl TeamStore {
    pub fn new(remote: Arc<dyn RemoteStore>, config: CacheConfig) -> Self {
        Self {
            cache: EntityCache::new(remote.clone(), TEAMS_ROOT, config),
            watchers: ObserverRegistry::new(remote.clone(), TEAMS_ROOT),
            remote,
        }
    }

    /// Fetch one team, served from cache when warm.
    pub async fn get_team(&self, id: &str) -> Result<Team, StoreError> {
        Ok(self.cache.get(id).await?)
    }

    /// Fetch a batch of teams. Unknown ids are omitted.
    pub async fn get_teams(&self, ids: &[EntityKey]) -> Result<Vec<Team>, StoreError> {
        Ok(self.cache.get_many(ids).await?)
    }

    /// Record a task as active on a team.
    ///
    /// The membership flag is set atomically and the counter moves only when
    /// the flag actually changed, so concurrent adds of the same id count
    /// once and adding a present id changes nothing.
    pub async fn add_active_task(&self, team_id: &str, combined_id: &str) -> Result<(), StoreError> {
        let path = format!("{}/{}/tasks/{}", TEAMS_ROOT, team_id, combined_id);
        if self.remote.set_flag(&path, true).await? {
            let counter = format!("{}/{}/active_tasks", TEAMS_ROOT, team_id);
            self.remote.adjust(&counter, 1).await?;
        }
        self.cache.invalidate(team_id);
        Ok(())
    }

    /// Remove a task from a team's active set. Unknown ids change nothing.
    pub async fn remove_active_task(
        &self,
        team_id: &str,
        combined_id: &str,
    ) -> Result<(), StoreError> {
        let path = format!("{}/{}/tasks/{}", TEAMS_ROOT, team_id, combined_id);
        if self.remote.set_flag(&path, false).await? {
            let counter = format!("{}/{}/active_tasks", TEAMS_ROOT, team_id);
            self.remote.adjust(&counter, -1).await?;
        }
        self.cache.invalidate(team_id);
        Ok(())
    }

    /// Follow live changes to one team.
    pub fn watch_team(&self, id: &str) -> (WatchToken, mpsc::UnboundedReceiver<Team>) {
        self.watchers.watch(id)
    }

    /// End a watch started with [`watch_team`](Self::watch_team).
    pub fn unwatch(&self, token: WatchToken) {
        self.watchers.unwatch(token)
    }

    /// Cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
