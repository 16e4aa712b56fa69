//! Change-data-capture reconciliation.
//!
//! Every row change committed to the durable store arrives here as a [`ChangeEvent`]. The reconciler moves cached
//! counters by the matching delta, patches membership sets and drops stale blobs. This is the only path through which
//! committed writes reach the caches.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use strum::Display;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use crate::db::entity::Video;
use crate::db::Repository;
use crate::error::Error;
use crate::error::Result;
use crate::existence::ExistenceIndex;
use crate::set_cache::SetCache;
use crate::types::info_key;
use crate::types::Counter;
use crate::types::EntityKind;
use crate::types::Relation;
use crate::value_cache::ValueCache;
use crate::wblog::Record;
use crate::wblog::RecordHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Table {
    Users,
    Videos,
    Favorites,
    Relations,
    Comments,
    /// Tables the caches don't care about.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// A row change. `after` is the row image as strings; for deletes it's the image of the removed row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table:     Table,
    pub operation: Operation,
    pub after:     BTreeMap<String, String>,
}

impl ChangeEvent {
    pub fn from_row<M: Serialize>(table: Table, operation: Operation, row: &M) -> Result<Self> {
        let serde_json::Value::Object(fields) = serde_json::to_value(row)?
        else {
            return Err(Error::MalformedChange(format!("{table} row is not a record")));
        };

        let after = fields
            .into_iter()
            .filter_map(|(name, value)| match value {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some((name, s)),
                other => Some((name, other.to_string())),
            })
            .collect();

        Ok(Self {
            table,
            operation,
            after,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn field(&self, name: &str) -> Result<&str> {
        self.after
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| Error::MalformedChange(format!("{} {} has no field {name}", self.table, self.operation)))
    }

    pub fn key(&self, name: &str) -> Result<i64> {
        let raw = self.field(name)?;
        raw.parse()
            .map_err(|_| Error::MalformedChange(format!("{}.{name} is not a key: {raw:?}", self.table)))
    }
}

#[derive(Debug)]
pub struct Reconciler {
    index:  Arc<ExistenceIndex>,
    values: Arc<ValueCache>,
    sets:   Arc<SetCache>,
    repo:   Arc<Repository>,
}

impl Reconciler {
    pub fn new(index: Arc<ExistenceIndex>, values: Arc<ValueCache>, sets: Arc<SetCache>, repo: Arc<Repository>) -> Self {
        Self {
            index,
            values,
            sets,
            repo,
        }
    }

    #[instrument(level = "trace", skip(self, event), fields(table = %event.table, operation = %event.operation))]
    pub async fn apply(&self, event: &ChangeEvent) -> Result<()> {
        use Operation::*;

        let delta = match event.operation {
            Insert => 1,
            Delete => -1,
            Update => 0,
        };

        match (event.table, event.operation) {
            (Table::Users, Insert) => {
                self.index.add(EntityKind::User, event.key("id")?);
                self.index.add_name(event.field("name")?);
            }
            (Table::Users, Update | Delete) => {
                self.values.invalidate(&info_key(EntityKind::User, event.key("id")?)).await?;
            }

            (Table::Videos, Insert) => {
                self.index.add(EntityKind::Video, event.key("id")?);
                self.values
                    .adjust_cached_counter(Counter::UserWorkCount, event.key("author_id")?, delta)
                    .await?;
            }
            (Table::Videos, Update) => {
                self.values.invalidate(&info_key(EntityKind::Video, event.key("id")?)).await?;
            }
            (Table::Videos, Delete) => {
                self.values
                    .adjust_cached_counter(Counter::UserWorkCount, event.key("author_id")?, delta)
                    .await?;
                self.values.invalidate(&info_key(EntityKind::Video, event.key("id")?)).await?;
            }

            (Table::Favorites, Insert | Delete) => {
                let user_id = event.key("user_id")?;
                let video_id = event.key("video_id")?;
                self.values
                    .adjust_cached_counter(Counter::VideoFavoriteCount, video_id, delta)
                    .await?;
                self.values
                    .adjust_cached_counter(Counter::UserFavoriteCount, user_id, delta)
                    .await?;
                match self.author_of(video_id).await? {
                    Some(author_id) => {
                        self.values
                            .adjust_cached_counter(Counter::UserTotalFavorited, author_id, delta)
                            .await?;
                    }
                    None => warn!("video {video_id} is gone, total favorited of its author is not adjusted"),
                }
                if delta > 0 {
                    self.sets.add(Relation::Favorites, user_id, video_id).await?;
                }
                else {
                    self.sets.remove(Relation::Favorites, user_id, video_id).await?;
                }
            }

            (Table::Relations, Insert | Delete) => {
                let follower_id = event.key("follower_id")?;
                let author_id = event.key("author_id")?;
                self.values
                    .adjust_cached_counter(Counter::UserFollowCount, follower_id, delta)
                    .await?;
                self.values
                    .adjust_cached_counter(Counter::UserFollowerCount, author_id, delta)
                    .await?;
                if delta > 0 {
                    self.sets.add(Relation::Follows, follower_id, author_id).await?;
                    self.sets.add(Relation::Followers, author_id, follower_id).await?;
                }
                else {
                    self.sets.remove(Relation::Follows, follower_id, author_id).await?;
                    self.sets.remove(Relation::Followers, author_id, follower_id).await?;
                }
                self.sets.invalidate(Relation::Friends, follower_id).await?;
                self.sets.invalidate(Relation::Friends, author_id).await?;
            }

            (Table::Comments, Insert | Delete) => {
                self.values
                    .adjust_cached_counter(Counter::VideoCommentCount, event.key("video_id")?, delta)
                    .await?;
            }

            (table, operation) => {
                trace!("nothing to reconcile for {operation} on {table}");
            }
        }

        Ok(())
    }

    async fn author_of(&self, video_id: i64) -> Result<Option<i64>> {
        let repo = self.repo.clone();
        let video: Option<Video> = self
            .values
            .get_or_load(&info_key(EntityKind::Video, video_id), move || {
                let repo = repo.clone();
                async move { repo.find_video(video_id).await }
            })
            .await?;
        Ok(video.map(|video| video.author_id))
    }
}

#[async_trait]
impl RecordHandler for Reconciler {
    async fn handle(&self, record: &Record) -> Result<()> {
        let event = ChangeEvent::decode(&record.payload)?;
        trace!("change event {} on {} parsed", event.operation, event.table);
        self.apply(&event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::entity::Favorite;
    use crate::db::tests::sqlite_repo;
    use crate::store::CacheStore;
    use crate::store::MemoryStore;

    #[test]
    fn row_images_are_strings() {
        let row = Favorite {
            id:       1,
            user_id:  100,
            video_id: 200,
        };
        let event = ChangeEvent::from_row(Table::Favorites, Operation::Insert, &row).unwrap();
        assert_eq!(event.field("video_id").unwrap(), "200");
        assert_eq!(event.key("user_id").unwrap(), 100);

        let decoded = ChangeEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn envelopes_from_other_producers() {
        let event = ChangeEvent::decode(
            br#"{"table":"videos","operation":"delete","after":{"id":"7","author_id":"x","title":"t"}}"#,
        )
        .unwrap();
        assert!(matches!(event.key("author_id"), Err(Error::MalformedChange(_))));
        assert!(matches!(event.field("missing"), Err(Error::MalformedChange(_))));

        let other = ChangeEvent::decode(br#"{"table":"sessions","operation":"insert","after":{}}"#).unwrap();
        assert_eq!(other.table, Table::Other);
        assert!(ChangeEvent::decode(b"not json").is_err());
    }

    #[tokio::test]
    async fn favorites_move_cached_counters_only() {
        let (_dir, repo) = sqlite_repo(None).await;
        repo.insert_video(200, 300, "clip").await.unwrap();
        let repo = Arc::new(repo);
        let config = EngineConfig::builder().build().unwrap();
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::default());
        let values = Arc::new(ValueCache::new(store.clone(), repo.clone(), &config));
        let sets = Arc::new(SetCache::new(store.clone(), repo.clone(), &config));
        let index = Arc::new(ExistenceIndex::new(1000, 0.001));
        let reconciler = Reconciler::new(index, values.clone(), sets, repo.clone());

        // Cached: favorite count of the video. Cold: everything else.
        store
            .set_counter_if_absent(&Counter::VideoFavoriteCount.cache_key(200), 5, config.base_ttl())
            .await
            .unwrap();
        store
            .set_replace(&Relation::Favorites.cache_key(100), vec![], config.base_ttl())
            .await
            .unwrap();

        let row = Favorite {
            id:       1,
            user_id:  100,
            video_id: 200,
        };
        let event = ChangeEvent::from_row(Table::Favorites, Operation::Insert, &row).unwrap();
        reconciler.apply(&event).await.unwrap();

        assert_eq!(store.get_counter(&Counter::VideoFavoriteCount.cache_key(200)).await.unwrap(), Some(6));
        assert_eq!(store.get_counter(&Counter::UserFavoriteCount.cache_key(100)).await.unwrap(), None);
        assert_eq!(store.get_counter(&Counter::UserTotalFavorited.cache_key(300)).await.unwrap(), None);
        assert_eq!(store.set_is_member(&Relation::Favorites.cache_key(100), 200).await.unwrap(), Some(true));

        let event = ChangeEvent::from_row(Table::Favorites, Operation::Delete, &row).unwrap();
        reconciler.apply(&event).await.unwrap();
        assert_eq!(store.get_counter(&Counter::VideoFavoriteCount.cache_key(200)).await.unwrap(), Some(5));
        assert_eq!(store.set_is_member(&Relation::Favorites.cache_key(100), 200).await.unwrap(), Some(false));
    }

    #[tokio::test]
    async fn new_users_are_indexed() {
        let (_dir, repo) = sqlite_repo(None).await;
        let repo = Arc::new(repo);
        let config = EngineConfig::builder().build().unwrap();
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::default());
        let index = Arc::new(ExistenceIndex::new(1000, 0.001));
        let reconciler = Reconciler::new(
            index.clone(),
            Arc::new(ValueCache::new(store.clone(), repo.clone(), &config)),
            Arc::new(SetCache::new(store, repo.clone(), &config)),
            repo,
        );

        let user = crate::db::entity::User {
            id:        42,
            name:      "zoe".into(),
            signature: String::new(),
        };
        let event = ChangeEvent::from_row(Table::Users, Operation::Insert, &user).unwrap();
        reconciler.apply(&event).await.unwrap();
        assert!(index.contains(EntityKind::User, 42));
        assert!(index.contains_name("zoe"));
    }
}
