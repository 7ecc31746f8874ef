//! User profile store: cached reads, counter writes, live watching.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use tether_sync::{
    CacheConfig, CacheStats, EntityCache, EntityKey, ObserverRegistry, RemoteStore, WatchToken,
};

use crate::record::{Team, User};
use crate::teams::TeamStore;
use crate::StoreError;

/// Subtree holding user profiles.
pub const USERS_ROOT: &str = "users";

/// Cached, watchable access to user profiles.
pub struct UserStore {
    remote: Arc<dyn RemoteStore>,
    cache: EntityCache<User>,
    watchers: ObserverRegistry<User>,
}

impl UserStore {
    pub fn new(remote: Arc<dyn RemoteStore>, config: CacheConfig) -> Self {
        Self {
            cache: EntityCache::new(remote.clone(), USERS_ROOT, config),
            watchers: ObserverRegistry::new(remote.clone(), USERS_ROOT),
            remote,
        }
    }

    /// Fetch one profile, served from cache when warm.
    pub async fn get_user(&self, uid: &str) -> Result<User, StoreError> {
        Ok(self.cache.get(uid).await?)
    }

    /// Fetch a batch of profiles. Unknown uids are omitted.
    pub async fn get_users(&self, uids: &[EntityKey]) -> Result<Vec<User>, StoreError> {
        Ok(self.cache.get_many(uids).await?)
    }

    /// Fetch the distinct members across the given teams.
    pub async fn users_by_teams(&self, teams: &[Team]) -> Result<Vec<User>, StoreError> {
        let mut uids = BTreeSet::new();
        for team in teams {
            uids.extend(team.member_id_list());
        }
        let uids: Vec<EntityKey> = uids.into_iter().collect();
        self.get_users(&uids).await
    }

    /// Fetch the distinct members of the teams named by `team_ids`.
    pub async fn users_by_team_ids(
        &self,
        teams: &TeamStore,
        team_ids: &[EntityKey],
    ) -> Result<Vec<User>, StoreError> {
        if team_ids.is_empty() {
            return Ok(Vec::new());
        }
        let teams = teams.get_teams(team_ids).await?;
        self.users_by_teams(&teams).await
    }

    /// Bump a user's active-task counter and return the new value.
    pub async fn adjust_active_tasks(&self, uid: &str, delta: i64) -> Result<i64, StoreError> {
        let path = format!("{}/{}/active_tasks", USERS_ROOT, uid);
        let value = self.remote.adjust(&path, delta).await?;
        self.cache.invalidate(uid);
        Ok(value)
    }

    /// Bump a user's completed-task counter and return the new value.
    pub async fn adjust_completed_tasks(&self, uid: &str, delta: i64) -> Result<i64, StoreError> {
        let path = format!("{}/{}/completed_tasks", USERS_ROOT, uid);
        let value = self.remote.adjust(&path, delta).await?;
        self.cache.invalidate(uid);
        Ok(value)
    }

    /// Follow live changes to one profile.
    pub fn watch_user(&self, uid: &str) -> (WatchToken, mpsc::UnboundedReceiver<User>) {
        self.watchers.watch(uid)
    }

    /// End a watch started with [`watch_user`](Self::watch_user).
    pub fn unwatch(&self, token: WatchToken) {
        self.watchers.unwatch(token)
    }

    /// Cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use serde_json::json;
    use std::time::Duration;
    use tether_sync::MemoryRemote;
    use tokio::time::timeout;

    async fn seeded_remote() -> Arc<MemoryRemote> {
        let remote = Arc::new(MemoryRemote::new());
        remote
            .write("users/o1", Some(json!({"first_name": "Olie"})))
            .await
            .unwrap();
        remote
            .write("users/u2", Some(json!({"first_name": "Ada"})))
            .await
            .unwrap();
        remote
            .write("users/u3", Some(json!({"first_name": "Bo"})))
            .await
            .unwrap();
        remote
            .write(
                "teams/t1",
                Some(json!({"name": "Core", "member_ids": {"o1": true, "u2": true}})),
            )
            .await
            .unwrap();
        remote
            .write(
                "teams/t2",
                Some(json!({"name": "Infra", "member_ids": {"u2": true, "u3": true}})),
            )
            .await
            .unwrap();
        remote
    }

    #[tokio::test]
    async fn test_get_user_is_cached() {
        let remote = seeded_remote().await;
        let users = UserStore::new(remote.clone(), CacheConfig::default());

        assert_eq!(users.get_user("o1").await.unwrap().first_name, "Olie");
        assert_eq!(users.get_user("o1").await.unwrap().first_name, "Olie");
        assert_eq!(users.cache_stats().fetches, 1);
        assert_eq!(users.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_users_by_team_ids_dedupes_members() {
        let remote = seeded_remote().await;
        let users = UserStore::new(remote.clone(), CacheConfig::default());
        let teams = TeamStore::new(remote.clone(), CacheConfig::default());

        let members = users
            .users_by_team_ids(&teams, &["t1".to_string(), "t2".to_string()])
            .await
            .unwrap();

        // u2 sits in both teams but is fetched and returned once.
        let uids: Vec<&str> = members.iter().map(|u| u.uid.as_str()).collect();
        assert_eq!(uids, vec!["o1", "u2", "u3"]);
        assert_eq!(users.cache_stats().fetches, 3);
    }

    #[tokio::test]
    async fn test_users_by_empty_team_ids_resolves_immediately() {
        let remote = seeded_remote().await;
        let users = UserStore::new(remote.clone(), CacheConfig::default());
        let teams = TeamStore::new(remote, CacheConfig::default());

        let members = users
            .users_by_team_ids(&teams, &[])
            .now_or_never()
            .unwrap()
            .unwrap();
        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn test_adjust_counters_invalidate_cache() {
        let remote = seeded_remote().await;
        let users = UserStore::new(remote, CacheConfig::default());

        assert_eq!(users.get_user("o1").await.unwrap().active_tasks, 0);

        assert_eq!(users.adjust_active_tasks("o1", 2).await.unwrap(), 2);
        assert_eq!(users.adjust_completed_tasks("o1", 1).await.unwrap(), 1);

        // The next read refetches instead of serving the stale entry.
        let user = users.get_user("o1").await.unwrap();
        assert_eq!(user.active_tasks, 2);
        assert_eq!(user.completed_tasks, 1);
        assert_eq!(users.cache_stats().invalidations, 2);
    }

    #[tokio::test]
    async fn test_watch_user_delivers_until_unwatched() {
        let remote = seeded_remote().await;
        let users = UserStore::new(remote.clone(), CacheConfig::default());

        let (token, mut rx) = users.watch_user("o1");
        let first = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.first_name, "Olie");

        remote
            .write("users/o1", Some(json!({"first_name": "Olie", "status": "free"})))
            .await
            .unwrap();
        let second = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.status, crate::record::UserStatus::Free);

        users.unwatch(token);
        assert!(rx.recv().await.is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(remote.total_subscribers(), 0);
    }
}
