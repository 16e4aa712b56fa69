//! The cache-consistency engine.
//!
//! Write path: existence check, synchronous conflict pre-check, intent published to the write-behind log, optimistic
//! set update. The log consumers apply intents to the durable store; the resulting change events are reconciled into
//! the caches. Read path: existence index, then cache with coalesced fallback to the durable store.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use parking_lot::Mutex;
use sea_orm::DatabaseConnection;
use serde::Deserialize;
use serde::Serialize;
use strum::IntoEnumIterator;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::cdc::Reconciler;
use crate::config::EngineConfig;
use crate::db::entity::Comment;
use crate::db::entity::User;
use crate::db::entity::Video;
use crate::db::Repository;
use crate::error::Conflict;
use crate::error::Error;
use crate::error::Result;
use crate::existence::ExistenceIndex;
use crate::id_gen::system_clock;
use crate::id_gen::ClockFn;
use crate::id_gen::IdGenerator;
use crate::set_cache::SetCache;
use crate::store::CacheStore;
use crate::types::info_key;
use crate::types::Action;
use crate::types::Counter;
use crate::types::EntityKind;
use crate::types::Relation;
use crate::value_cache::ValueCache;
use crate::wblog::Consumer;
use crate::wblog::Intent;
use crate::wblog::IntentApplier;
use crate::wblog::LogBroker;
use crate::wblog::RecordHandler;
use crate::wblog::Topic;

/// A user with its counters, as seen by `viewer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user:            User,
    pub follow_count:    i64,
    pub follower_count:  i64,
    pub total_favorited: i64,
    pub work_count:      i64,
    pub favorite_count:  i64,
    pub is_follow:       bool,
}

/// A video with its counters and author, as seen by `viewer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoProfile {
    pub video:          Video,
    pub author:         UserProfile,
    pub favorite_count: i64,
    pub comment_count:  i64,
    pub is_favorite:    bool,
}

#[derive(Debug)]
pub struct Engine {
    config:    EngineConfig,
    repo:      Arc<Repository>,
    broker:    Arc<dyn LogBroker>,
    index:     Arc<ExistenceIndex>,
    values:    Arc<ValueCache>,
    sets:      Arc<SetCache>,
    ids:       IdGenerator,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub async fn open(
        config: EngineConfig,
        db: DatabaseConnection,
        store: Arc<dyn CacheStore>,
        broker: Arc<dyn LogBroker>,
    ) -> Result<Self> {
        Self::open_with_clock(config, db, store, broker, Arc::new(system_clock)).await
    }

    /// Bring the durable schema up to date, seed the existence index, start the identifier generator past every
    /// persisted identifier and spawn the log consumers.
    #[instrument(level = "debug", skip_all, fields(node = config.node_id()))]
    pub async fn open_with_clock(
        config: EngineConfig,
        db: DatabaseConnection,
        store: Arc<dyn CacheStore>,
        broker: Arc<dyn LogBroker>,
        clock: ClockFn,
    ) -> Result<Self> {
        config.validate()?;

        let repo = Arc::new(Repository::with_change_log(db, broker.clone()));
        repo.migrate().await?;

        let index = Arc::new(ExistenceIndex::new(config.expected_items(), config.false_positive_rate()));
        let scanned_max = index.rebuild(&repo, config.scan_page_size()).await?;
        let last_issued = scanned_max.max(repo.max_issued_id().await?);

        let ids = IdGenerator::resume(
            config.node_id(),
            config.epoch_ms(),
            last_issued,
            config.clock_tolerance(),
            clock,
        )?;

        let values = Arc::new(ValueCache::new(store.clone(), repo.clone(), &config));
        let sets = Arc::new(SetCache::new(store, repo.clone(), &config));

        let engine = Self {
            config,
            repo,
            broker,
            index,
            values,
            sets,
            ids,
            consumers: Mutex::new(Vec::new()),
        };
        engine.start_consumers();

        info!("engine started, last issued id {last_issued}");
        Ok(engine)
    }

    fn start_consumers(&self) {
        let applier: Arc<dyn RecordHandler> = Arc::new(IntentApplier::new(self.repo.clone()));
        let reconciler: Arc<dyn RecordHandler> = Arc::new(Reconciler::new(
            self.index.clone(),
            self.values.clone(),
            self.sets.clone(),
            self.repo.clone(),
        ));

        let mut consumers = self.consumers.lock();
        for topic in Topic::iter() {
            let handler = match topic {
                Topic::ChangeLog => reconciler.clone(),
                _ => applier.clone(),
            };
            for partition in 0..self.broker.partitions() {
                consumers.push(
                    Consumer::new(
                        self.broker.clone(),
                        handler.clone(),
                        topic,
                        partition,
                        self.config.apply_retries(),
                        self.config.retry_backoff(),
                    )
                    .spawn(),
                );
            }
        }
        debug!("{} consumers started", consumers.len());
    }

    /// Stop the log consumers. Records they didn't commit are delivered again to the next engine.
    pub fn close(&self) {
        for consumer in self.consumers.lock().drain(..) {
            consumer.abort();
        }
    }

    /// Wait until every published record is committed.
    pub async fn quiesce(&self, timeout: Duration) -> Result<()> {
        let drained = tokio::time::timeout(timeout, async {
            loop {
                if self.broker.lag().await? == 0 {
                    return Ok::<_, Error>(());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        match drained {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Log(format!("log not drained within {timeout:?}"))),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    pub fn next_id(&self) -> i64 {
        self.ids.generate()
    }

    /// `false` is definitive. `true` for users and videos is confirmed by the durable store.
    #[instrument(level = "trace", skip(self))]
    pub async fn check_exists(&self, kind: EntityKind, key: i64) -> Result<bool> {
        match kind {
            EntityKind::User => {
                if !self.index.contains(kind, key) {
                    return Ok(false);
                }
                Ok(self.load_user(key).await?.is_some())
            }
            EntityKind::Video => {
                if !self.index.contains(kind, key) {
                    return Ok(false);
                }
                Ok(self.load_video(key).await?.is_some())
            }
            // Comments aren't indexed.
            EntityKind::Comment => Ok(self.repo.find_comment(key).await?.is_some()),
        }
    }

    async fn ensure_exists(&self, kind: EntityKind, key: i64) -> Result<()> {
        if self.check_exists(kind, key).await? {
            Ok(())
        }
        else {
            Err(Error::NotFound(kind, key))
        }
    }

    pub async fn get_counter(&self, counter: Counter, key: i64) -> Result<i64> {
        self.values.get_counter(counter, key).await
    }

    pub async fn adjust_counter(&self, counter: Counter, key: i64, delta: i64) -> Result<()> {
        self.values.adjust_counter(counter, key, delta).await?;
        Ok(())
    }

    pub async fn is_member(&self, relation: Relation, owner: i64, member: i64) -> Result<bool> {
        self.sets.is_member(relation, owner, member).await
    }

    pub async fn list_members(&self, relation: Relation, owner: i64, limit: Option<usize>) -> Result<Vec<i64>> {
        self.sets.members(relation, owner, limit).await
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn publish_intent(&self, intent: &Intent) -> Result<()> {
        self.broker
            .publish(intent.topic(), intent.routing_key(), intent.encode()?)
            .await
    }

    async fn load_user(&self, id: i64) -> Result<Option<User>> {
        let repo = self.repo.clone();
        self.values
            .get_or_load(&info_key(EntityKind::User, id), move || {
                let repo = repo.clone();
                async move { repo.find_user(id).await }
            })
            .await
    }

    async fn load_video(&self, id: i64) -> Result<Option<Video>> {
        let repo = self.repo.clone();
        self.values
            .get_or_load(&info_key(EntityKind::Video, id), move || {
                let repo = repo.clone();
                async move { repo.find_video(id).await }
            })
            .await
    }

    /// Registration writes through: the name must be claimed before the id is handed out.
    #[instrument(level = "debug", skip(self))]
    pub async fn register_user(&self, name: &str) -> Result<i64> {
        if self.index.contains_name(name) && self.repo.find_user_by_name(name).await?.is_some() {
            return Err(Conflict::UserExists.into());
        }

        let id = self.ids.generate();
        if !self.repo.insert_user(id, name).await? {
            return Err(Conflict::UserExists.into());
        }
        self.index.add(EntityKind::User, id);
        self.index.add_name(name);
        Ok(id)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn publish_video(&self, author_id: i64, title: &str) -> Result<i64> {
        self.ensure_exists(EntityKind::User, author_id).await?;

        let id = self.ids.generate();
        self.repo.insert_video(id, author_id, title).await?;
        self.index.add(EntityKind::Video, id);
        Ok(id)
    }

    pub async fn update_signature(&self, user_id: i64, signature: &str) -> Result<()> {
        self.ensure_exists(EntityKind::User, user_id).await?;
        if !self.repo.update_signature(user_id, signature).await? {
            return Err(Error::NotFound(EntityKind::User, user_id));
        }
        Ok(())
    }

    pub async fn user_info(&self, id: i64) -> Result<User> {
        if !self.index.contains(EntityKind::User, id) {
            return Err(Error::NotFound(EntityKind::User, id));
        }
        self.load_user(id).await?.ok_or(Error::NotFound(EntityKind::User, id))
    }

    pub async fn video_info(&self, id: i64) -> Result<Video> {
        if !self.index.contains(EntityKind::Video, id) {
            return Err(Error::NotFound(EntityKind::Video, id));
        }
        self.load_video(id).await?.ok_or(Error::NotFound(EntityKind::Video, id))
    }

    pub async fn user_profile(&self, viewer: Option<i64>, id: i64) -> Result<UserProfile> {
        let user = self.user_info(id).await?;
        let (follow_count, follower_count, total_favorited, work_count, favorite_count) = tokio::try_join!(
            self.get_counter(Counter::UserFollowCount, id),
            self.get_counter(Counter::UserFollowerCount, id),
            self.get_counter(Counter::UserTotalFavorited, id),
            self.get_counter(Counter::UserWorkCount, id),
            self.get_counter(Counter::UserFavoriteCount, id),
        )?;
        let is_follow = match viewer {
            Some(viewer) if viewer != id => self.is_member(Relation::Follows, viewer, id).await?,
            _ => false,
        };

        Ok(UserProfile {
            user,
            follow_count,
            follower_count,
            total_favorited,
            work_count,
            favorite_count,
            is_follow,
        })
    }

    pub async fn video_profile(&self, viewer: Option<i64>, id: i64) -> Result<VideoProfile> {
        let video = self.video_info(id).await?;
        let (author, favorite_count, comment_count) = tokio::try_join!(
            self.user_profile(viewer, video.author_id),
            self.get_counter(Counter::VideoFavoriteCount, id),
            self.get_counter(Counter::VideoCommentCount, id),
        )?;
        let is_favorite = match viewer {
            Some(viewer) => self.is_member(Relation::Favorites, viewer, id).await?,
            None => false,
        };

        Ok(VideoProfile {
            video,
            author,
            favorite_count,
            comment_count,
            is_favorite,
        })
    }

    // The write has been published; a failing cache patch is left to the change feed and the entry TTL.
    fn patched(result: Result<()>, what: &str) -> Result<()> {
        if let Err(err) = result {
            warn!("optimistic update of {what} failed: {err}");
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn favorite(&self, user_id: i64, video_id: i64, action: Action) -> Result<()> {
        self.ensure_exists(EntityKind::User, user_id).await?;
        self.ensure_exists(EntityKind::Video, video_id).await?;

        let favorited = self.is_member(Relation::Favorites, user_id, video_id).await?;
        match action {
            Action::Do if favorited => return Err(Conflict::AlreadyFavorited.into()),
            Action::Undo if !favorited => return Err(Conflict::NotFavorited.into()),
            _ => (),
        }

        self.publish_intent(&Intent::Favorite {
            favorite_id: self.ids.generate(),
            user_id,
            video_id,
            action,
        })
        .await?;

        let patch = match action {
            Action::Do => self.sets.add(Relation::Favorites, user_id, video_id).await,
            Action::Undo => self.sets.remove(Relation::Favorites, user_id, video_id).await,
        };
        Self::patched(patch, "favorites")
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn follow(&self, user_id: i64, target_id: i64, action: Action) -> Result<()> {
        if user_id == target_id {
            return Err(Conflict::SelfFollow.into());
        }
        self.ensure_exists(EntityKind::User, user_id).await?;
        self.ensure_exists(EntityKind::User, target_id).await?;

        let following = self.is_member(Relation::Follows, user_id, target_id).await?;
        match action {
            Action::Do if following => return Err(Conflict::AlreadyFollowing.into()),
            Action::Do => {
                if self.get_counter(Counter::UserFollowCount, user_id).await? >= self.config.follow_limit() {
                    return Err(Conflict::FollowLimitExceeded.into());
                }
            }
            Action::Undo if !following => return Err(Conflict::NotFollowing.into()),
            Action::Undo => (),
        }

        self.publish_intent(&Intent::Follow {
            relation_id: self.ids.generate(),
            follower_id: user_id,
            author_id: target_id,
            action,
        })
        .await?;

        let patch = async {
            match action {
                Action::Do => {
                    self.sets.add(Relation::Follows, user_id, target_id).await?;
                    self.sets.add(Relation::Followers, target_id, user_id).await?;
                }
                Action::Undo => {
                    self.sets.remove(Relation::Follows, user_id, target_id).await?;
                    self.sets.remove(Relation::Followers, target_id, user_id).await?;
                }
            }
            self.sets.invalidate(Relation::Friends, user_id).await?;
            self.sets.invalidate(Relation::Friends, target_id).await
        };
        Self::patched(patch.await, "follow relations")
    }

    /// Returns the identifier the comment will be stored under.
    #[instrument(level = "debug", skip(self, content))]
    pub async fn comment(&self, user_id: i64, video_id: i64, content: &str) -> Result<i64> {
        self.ensure_exists(EntityKind::User, user_id).await?;
        self.ensure_exists(EntityKind::Video, video_id).await?;

        let comment_id = self.ids.generate();
        self.publish_intent(&Intent::CreateComment {
            comment_id,
            user_id,
            video_id,
            content: content.to_owned(),
        })
        .await?;
        Ok(comment_id)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn delete_comment(&self, user_id: i64, comment_id: i64) -> Result<()> {
        let comment = self
            .repo
            .find_comment(comment_id)
            .await?
            .ok_or(Error::NotFound(EntityKind::Comment, comment_id))?;
        if comment.user_id != user_id {
            return Err(Conflict::NotCommentOwner.into());
        }

        self.publish_intent(&Intent::DeleteComment {
            comment_id,
            video_id: comment.video_id,
        })
        .await
    }

    // Members which vanished from the durable store are skipped.
    async fn users_of(&self, ids: Vec<i64>) -> Result<Vec<User>> {
        let users = try_join_all(ids.into_iter().map(|id| self.load_user(id))).await?;
        Ok(users.into_iter().flatten().collect())
    }

    pub async fn favorite_list(&self, user_id: i64) -> Result<Vec<Video>> {
        self.ensure_exists(EntityKind::User, user_id).await?;
        let ids = self.sets.members(Relation::Favorites, user_id, None).await?;
        let videos = try_join_all(ids.into_iter().map(|id| self.load_video(id))).await?;
        Ok(videos.into_iter().flatten().collect())
    }

    /// Videos of `author_id`, newest first.
    pub async fn publish_list(&self, author_id: i64) -> Result<Vec<Video>> {
        self.ensure_exists(EntityKind::User, author_id).await?;
        let ids = self.repo.video_ids_by_author(author_id).await?;
        let videos = try_join_all(ids.into_iter().map(|id| self.load_video(id))).await?;
        Ok(videos.into_iter().flatten().collect())
    }

    /// Comments on a video, newest first. Comments still in the write-behind log are not listed yet.
    pub async fn comment_list(&self, video_id: i64) -> Result<Vec<Comment>> {
        self.ensure_exists(EntityKind::Video, video_id).await?;
        self.repo.comments_of(video_id).await
    }

    pub async fn follow_list(&self, user_id: i64) -> Result<Vec<User>> {
        self.ensure_exists(EntityKind::User, user_id).await?;
        let ids = self.sets.members(Relation::Follows, user_id, None).await?;
        self.users_of(ids).await
    }

    /// Followers of a user; up to the cache cap unless `limit` asks for more.
    pub async fn follower_list(&self, user_id: i64, limit: Option<usize>) -> Result<Vec<User>> {
        self.ensure_exists(EntityKind::User, user_id).await?;
        let limit = limit.or(Some(self.config.follower_cap()));
        let ids = self.sets.members(Relation::Followers, user_id, limit).await?;
        self.users_of(ids).await
    }

    pub async fn friend_list(&self, user_id: i64) -> Result<Vec<User>> {
        self.ensure_exists(EntityKind::User, user_id).await?;
        let ids = self.sets.members(Relation::Friends, user_id, None).await?;
        self.users_of(ids).await
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}
