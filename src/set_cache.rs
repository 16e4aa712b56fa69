//! Membership sets in the shared cache store.
//!
//! A cold set is loaded from the durable store as a whole. Writers only patch populated sets, so a set is never
//! mistaken for complete. The followers set is capped: only the first `follower_cap` members are cached and anything
//! beyond that is answered by the durable store.

use std::sync::Arc;

use tracing::debug;
use tracing::instrument;

use crate::coalesce::Coalescer;
use crate::config::EngineConfig;
use crate::db::Repository;
use crate::error::Result;
use crate::store::CacheStore;
use crate::types::Relation;
use crate::value_cache::ReadRetry;
use crate::value_cache::TtlPolicy;

#[derive(Debug)]
pub struct SetCache {
    store:        Arc<dyn CacheStore>,
    repo:         Arc<Repository>,
    sets:         Coalescer<String, Vec<i64>>,
    follower_cap: usize,
    ttl:          TtlPolicy,
    retry:        ReadRetry,
}

impl SetCache {
    pub fn new(store: Arc<dyn CacheStore>, repo: Arc<Repository>, config: &EngineConfig) -> Self {
        Self {
            store,
            repo,
            sets: Coalescer::new(config.coalesce_grace()),
            follower_cap: config.follower_cap(),
            ttl: TtlPolicy::new(config.base_ttl(), config.ttl_jitter()),
            retry: ReadRetry::new(config.read_retries(), config.retry_backoff()),
        }
    }

    fn cap_of(&self, relation: Relation) -> Option<usize> {
        relation.is_capped().then_some(self.follower_cap)
    }

    async fn load(&self, relation: Relation, owner: i64) -> Result<Vec<i64>> {
        let key = relation.cache_key(owner);
        let store = self.store.clone();
        let repo = self.repo.clone();
        let ttl = self.ttl.next();
        let cap = self.cap_of(relation);
        let cache_key = key.clone();

        self.sets
            .load(key, move || async move {
                let members = match relation {
                    Relation::Favorites => repo.favorite_video_ids(owner).await?,
                    Relation::Follows => repo.follow_ids(owner).await?,
                    Relation::Followers => repo.follower_ids(owner, cap.map(|cap| cap as u64)).await?,
                    Relation::Friends => repo.friend_ids(owner).await?,
                };
                debug!("loaded {} members into {cache_key}", members.len());
                store.set_replace(&cache_key, members.clone(), ttl).await?;
                Ok(members)
            })
            .await
    }

    async fn durable_is_member(&self, relation: Relation, owner: i64, member: i64) -> Result<bool> {
        match relation {
            Relation::Favorites => self.repo.favorite_exists(owner, member).await,
            Relation::Follows => self.repo.follow_exists(owner, member).await,
            Relation::Followers => self.repo.follow_exists(member, owner).await,
            Relation::Friends => {
                Ok(self.repo.follow_exists(owner, member).await? && self.repo.follow_exists(member, owner).await?)
            }
        }
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn is_member(&self, relation: Relation, owner: i64, member: i64) -> Result<bool> {
        let key = relation.cache_key(owner);
        let key = key.as_str();
        self.retry
            .run(key, || async move {
                let cached = match self.store.set_is_member(key, member).await? {
                    Some(true) => return Ok(true),
                    Some(false) => match self.cap_of(relation) {
                        None => return Ok(false),
                        Some(_) => self.store.set_members(key).await?,
                    },
                    None => Some(self.load(relation, owner).await?),
                };

                let Some(members) = cached
                else {
                    // Expired between the two calls.
                    return self.durable_is_member(relation, owner, member).await;
                };
                if members.contains(&member) {
                    return Ok(true);
                }
                match self.cap_of(relation) {
                    // A full capped set is not the whole story.
                    Some(cap) if members.len() >= cap => self.durable_is_member(relation, owner, member).await,
                    _ => Ok(false),
                }
            })
            .await
    }

    /// Members of a set in ascending order, at most `limit` of them. A capped set answers from the durable store when
    /// more than the cap is asked for.
    #[instrument(level = "trace", skip(self))]
    pub async fn members(&self, relation: Relation, owner: i64, limit: Option<usize>) -> Result<Vec<i64>> {
        if relation == Relation::Followers && limit.map_or(true, |limit| limit > self.follower_cap) {
            return self.repo.follower_ids(owner, limit.map(|limit| limit as u64)).await;
        }

        let key = relation.cache_key(owner);
        let key = key.as_str();
        let mut members = self
            .retry
            .run(key, || async move {
                match self.store.set_members(key).await? {
                    Some(members) => Ok(members),
                    None => self.load(relation, owner).await,
                }
            })
            .await?;

        if let Some(limit) = limit {
            members.truncate(limit);
        }
        Ok(members)
    }

    /// Add a member to a populated set. Cold sets are left alone. Derived sets are dropped instead of patched.
    pub async fn add(&self, relation: Relation, owner: i64, member: i64) -> Result<()> {
        if relation == Relation::Friends {
            return self.invalidate(relation, owner).await;
        }
        let key = relation.cache_key(owner);
        self.store
            .set_add_if_exists(&key, member, self.cap_of(relation))
            .await?;
        self.sets.forget(&key);
        Ok(())
    }

    pub async fn remove(&self, relation: Relation, owner: i64, member: i64) -> Result<()> {
        if relation == Relation::Friends || relation.is_capped() {
            // A capped set losing a member no longer holds the first N; reload it instead.
            return self.invalidate(relation, owner).await;
        }
        let key = relation.cache_key(owner);
        self.store.set_remove(&key, member).await?;
        self.sets.forget(&key);
        Ok(())
    }

    pub async fn invalidate(&self, relation: Relation, owner: i64) -> Result<()> {
        let key = relation.cache_key(owner);
        self.store.delete(&key).await?;
        self.sets.forget(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::sqlite_repo;
    use crate::store::MemoryStore;

    fn config(cap: usize) -> EngineConfig {
        EngineConfig::builder().follower_cap(cap).build().unwrap()
    }

    #[tokio::test]
    async fn empty_sets_are_populated_not_cold() {
        let (_dir, repo) = sqlite_repo(None).await;
        let store = Arc::new(MemoryStore::default());
        let sets = SetCache::new(store.clone(), Arc::new(repo), &config(50));

        assert!(!sets.is_member(Relation::Favorites, 1, 200).await.unwrap());
        assert_eq!(store.set_members("reel:user:favorite:1").await.unwrap(), Some(vec![]));

        sets.add(Relation::Favorites, 1, 200).await.unwrap();
        assert!(sets.is_member(Relation::Favorites, 1, 200).await.unwrap());
        sets.remove(Relation::Favorites, 1, 200).await.unwrap();
        assert!(!sets.is_member(Relation::Favorites, 1, 200).await.unwrap());
    }

    #[tokio::test]
    async fn add_leaves_cold_sets_cold() {
        let (_dir, repo) = sqlite_repo(None).await;
        repo.insert_favorite(1, 1, 100).await.unwrap();
        let store = Arc::new(MemoryStore::default());
        let sets = SetCache::new(store.clone(), Arc::new(repo), &config(50));

        sets.add(Relation::Favorites, 1, 200).await.unwrap();
        assert_eq!(store.set_members("reel:user:favorite:1").await.unwrap(), None);
        assert_eq!(sets.members(Relation::Favorites, 1, None).await.unwrap(), vec![100]);
    }

    #[tokio::test]
    async fn capped_followers_fall_through() {
        let (_dir, repo) = sqlite_repo(None).await;
        for follower in 1..=5 {
            repo.insert_follow(100 + follower, follower, 99).await.unwrap();
        }
        let store = Arc::new(MemoryStore::default());
        let sets = SetCache::new(store.clone(), Arc::new(repo), &config(3));

        assert_eq!(sets.members(Relation::Followers, 99, Some(2)).await.unwrap(), vec![1, 2]);
        assert_eq!(store.set_members("reel:user:follower:99").await.unwrap(), Some(vec![1, 2, 3]));

        // Beyond the cap: durable store.
        assert_eq!(sets.members(Relation::Followers, 99, Some(10)).await.unwrap(), vec![1, 2, 3, 4, 5]);
        assert!(sets.is_member(Relation::Followers, 99, 5).await.unwrap());
        assert!(!sets.is_member(Relation::Followers, 99, 6).await.unwrap());

        // A full capped set doesn't grow.
        sets.add(Relation::Followers, 99, 0).await.unwrap();
        assert_eq!(store.set_members("reel:user:follower:99").await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn removal_is_not_undone_by_a_recent_load() {
        let (_dir, repo) = sqlite_repo(None).await;
        repo.insert_follow(1, 10, 99).await.unwrap();
        repo.insert_follow(2, 20, 99).await.unwrap();
        let repo = Arc::new(repo);
        let store = Arc::new(MemoryStore::default());
        let sets = SetCache::new(store.clone(), repo.clone(), &config(50));

        assert_eq!(sets.members(Relation::Followers, 99, Some(10)).await.unwrap(), vec![10, 20]);
        assert!(sets.is_member(Relation::Followers, 99, 10).await.unwrap());

        // Well within the grace window of the load above.
        repo.delete_follow(10, 99).await.unwrap();
        sets.remove(Relation::Followers, 99, 10).await.unwrap();
        assert!(!sets.is_member(Relation::Followers, 99, 10).await.unwrap());
        assert_eq!(sets.members(Relation::Followers, 99, Some(10)).await.unwrap(), vec![20]);

        repo.insert_follow(3, 10, 99).await.unwrap();
        sets.invalidate(Relation::Followers, 99).await.unwrap();
        assert!(sets.is_member(Relation::Followers, 99, 10).await.unwrap());
    }

    #[tokio::test]
    async fn friends_are_derived() {
        let (_dir, repo) = sqlite_repo(None).await;
        repo.insert_follow(1, 10, 20).await.unwrap();
        repo.insert_follow(2, 20, 10).await.unwrap();
        repo.insert_follow(3, 10, 30).await.unwrap();
        let store = Arc::new(MemoryStore::default());
        let sets = SetCache::new(store.clone(), Arc::new(repo), &config(50));

        assert_eq!(sets.members(Relation::Friends, 10, None).await.unwrap(), vec![20]);
        sets.add(Relation::Friends, 10, 30).await.unwrap();
        assert_eq!(store.set_members("reel:user:friend:10").await.unwrap(), None);
    }
}
