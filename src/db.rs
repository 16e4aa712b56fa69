//! The durable store.
//!
//! [`Repository`] owns the entity tables. Every row it actually creates, changes or removes is announced on the change
//! log topic, which is what the cache reconciler consumes. The event is staged in the transaction of the row change
//! and keyed by the entity acting on it, the same key its intent was routed by.

pub mod entity;
pub mod migrations;

use std::sync::Arc;

use sea_orm::sea_query::Expr;
use sea_orm::sea_query::OnConflict;
use sea_orm::sea_query::Query;
use sea_orm::ActiveValue::Set;
use sea_orm::ColumnTrait;
use sea_orm::ConnectionTrait;
use sea_orm::DatabaseConnection;
use sea_orm::DatabaseTransaction;
use sea_orm::DbBackend;
use sea_orm::EntityTrait;
use sea_orm::PaginatorTrait;
use sea_orm::QueryFilter;
use sea_orm::QueryOrder;
use sea_orm::QuerySelect;
use sea_orm::TransactionTrait;
use sea_orm_migration::MigratorTrait;
use serde::Serialize;
use tracing::debug;
use tracing::error;
use tracing::instrument;

use crate::cdc::ChangeEvent;
use crate::cdc::Operation;
use crate::cdc::Table;
use crate::error::Result;
use crate::types::Counter;
use crate::wblog::LogBroker;
use crate::wblog::Topic;

use self::entity::comment;
use self::entity::favorite;
use self::entity::follow;
use self::entity::user;
use self::entity::video;
use self::migrations::Migrator;

// A change event recorded inside a write transaction, announced once the transaction commits. `unsent` holds the
// payload when the broker couldn't take it inside the transaction.
struct StagedChange {
    table:     Table,
    operation: Operation,
    key:       i64,
    unsent:    Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct Repository {
    db:      DatabaseConnection,
    changes: Option<Arc<dyn LogBroker>>,
}

impl Repository {
    /// A repository that doesn't publish change events.
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db, changes: None }
    }

    pub fn with_change_log(db: DatabaseConnection, changes: Arc<dyn LogBroker>) -> Self {
        Self {
            db,
            changes: Some(changes),
        }
    }

    pub async fn connect(url: &str) -> Result<DatabaseConnection> {
        let db = sea_orm::Database::connect(url).await?;
        if db.get_database_backend() == DbBackend::Sqlite {
            db.execute_unprepared("PRAGMA journal_mode=WAL;").await?;
            db.execute_unprepared("PRAGMA synchronous=NORMAL;").await?;
        }
        Ok(db)
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn migrate(&self) -> Result<()> {
        Migrator::up(&self.db, None).await?;
        Ok(())
    }

    async fn stage<M: Serialize>(
        &self,
        txn: &DatabaseTransaction,
        table: Table,
        operation: Operation,
        key: i64,
        row: &M,
    ) -> Result<Option<StagedChange>> {
        let Some(changes) = &self.changes
        else {
            return Ok(None);
        };

        let payload = ChangeEvent::from_row(table, operation, row)?.encode()?;
        let unsent = changes.stage(txn, Topic::ChangeLog, key, payload).await?;
        Ok(Some(StagedChange {
            table,
            operation,
            key,
            unsent,
        }))
    }

    async fn commit(&self, txn: DatabaseTransaction, staged: Option<StagedChange>) -> Result<()> {
        txn.commit().await?;

        let (Some(changes), Some(staged)) = (&self.changes, staged)
        else {
            return Ok(());
        };
        match staged.unsent {
            None => changes.staged(Topic::ChangeLog, staged.key),
            Some(payload) => {
                if let Err(err) = changes.publish(Topic::ChangeLog, staged.key, payload).await {
                    // The row is committed already; caches catch up when the entries expire.
                    error!(
                        "change event {} on {} #{} is lost: {err}",
                        staged.operation, staged.table, staged.key
                    );
                }
            }
        }
        Ok(())
    }

    pub async fn find_user(&self, id: i64) -> Result<Option<user::Model>> {
        Ok(user::Entity::find_by_id(id).one(&self.db).await?)
    }

    pub async fn find_user_by_name(&self, name: &str) -> Result<Option<user::Model>> {
        Ok(user::Entity::find()
            .filter(user::Column::Name.eq(name))
            .one(&self.db)
            .await?)
    }

    pub async fn find_video(&self, id: i64) -> Result<Option<video::Model>> {
        Ok(video::Entity::find_by_id(id).one(&self.db).await?)
    }

    pub async fn find_comment(&self, id: i64) -> Result<Option<comment::Model>> {
        Ok(comment::Entity::find_by_id(id).one(&self.db).await?)
    }

    /// Returns `false` if either the id or the name is taken.
    #[instrument(level = "trace", skip(self))]
    pub async fn insert_user(&self, id: i64, name: &str) -> Result<bool> {
        let model = user::Model {
            id,
            name: name.to_owned(),
            signature: String::new(),
        };

        let txn = self.db.begin().await?;
        let rows = user::Entity::insert(user::ActiveModel {
            id:        Set(model.id),
            name:      Set(model.name.clone()),
            signature: Set(model.signature.clone()),
        })
        .on_conflict(OnConflict::new().do_nothing().to_owned())
        .exec_without_returning(&txn)
        .await?;

        let staged = if rows == 1 {
            self.stage(&txn, Table::Users, Operation::Insert, id, &model).await?
        }
        else {
            None
        };
        self.commit(txn, staged).await?;
        Ok(rows == 1)
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn insert_video(&self, id: i64, author_id: i64, title: &str) -> Result<bool> {
        let model = video::Model {
            id,
            author_id,
            title: title.to_owned(),
        };

        let txn = self.db.begin().await?;
        let rows = video::Entity::insert(video::ActiveModel {
            id:        Set(id),
            author_id: Set(author_id),
            title:     Set(model.title.clone()),
        })
        .on_conflict(OnConflict::new().do_nothing().to_owned())
        .exec_without_returning(&txn)
        .await?;

        let staged = if rows == 1 {
            self.stage(&txn, Table::Videos, Operation::Insert, id, &model).await?
        }
        else {
            None
        };
        self.commit(txn, staged).await?;
        Ok(rows == 1)
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn update_signature(&self, id: i64, signature: &str) -> Result<bool> {
        let txn = self.db.begin().await?;
        let updated = user::Entity::update_many()
            .col_expr(user::Column::Signature, Expr::value(signature))
            .filter(user::Column::Id.eq(id))
            .exec(&txn)
            .await?
            .rows_affected;

        if updated == 0 {
            return Ok(false);
        }
        let staged = match user::Entity::find_by_id(id).one(&txn).await? {
            Some(model) => self.stage(&txn, Table::Users, Operation::Update, id, &model).await?,
            None => None,
        };
        self.commit(txn, staged).await?;
        Ok(true)
    }

    /// Conflicting inserts are ignored: `false` means the favorite, or a row with the same id, exists already.
    #[instrument(level = "trace", skip(self))]
    pub async fn insert_favorite(&self, id: i64, user_id: i64, video_id: i64) -> Result<bool> {
        let txn = self.db.begin().await?;
        let rows = favorite::Entity::insert(favorite::ActiveModel {
            id:       Set(id),
            user_id:  Set(user_id),
            video_id: Set(video_id),
        })
        .on_conflict(OnConflict::new().do_nothing().to_owned())
        .exec_without_returning(&txn)
        .await?;

        let staged = if rows == 1 {
            let model = favorite::Model { id, user_id, video_id };
            self.stage(&txn, Table::Favorites, Operation::Insert, user_id, &model)
                .await?
        }
        else {
            debug!("favorite of video {video_id} by {user_id} exists");
            None
        };
        self.commit(txn, staged).await?;
        Ok(rows == 1)
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn delete_favorite(&self, user_id: i64, video_id: i64) -> Result<bool> {
        let Some(model) = favorite::Entity::find()
            .filter(favorite::Column::UserId.eq(user_id))
            .filter(favorite::Column::VideoId.eq(video_id))
            .one(&self.db)
            .await?
        else {
            return Ok(false);
        };

        let txn = self.db.begin().await?;
        let rows = favorite::Entity::delete_by_id(model.id).exec(&txn).await?.rows_affected;
        let staged = if rows == 1 {
            self.stage(&txn, Table::Favorites, Operation::Delete, user_id, &model)
                .await?
        }
        else {
            None
        };
        self.commit(txn, staged).await?;
        Ok(rows == 1)
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn insert_follow(&self, id: i64, follower_id: i64, author_id: i64) -> Result<bool> {
        let txn = self.db.begin().await?;
        let rows = follow::Entity::insert(follow::ActiveModel {
            id:          Set(id),
            follower_id: Set(follower_id),
            author_id:   Set(author_id),
        })
        .on_conflict(OnConflict::new().do_nothing().to_owned())
        .exec_without_returning(&txn)
        .await?;

        let staged = if rows == 1 {
            let model = follow::Model {
                id,
                follower_id,
                author_id,
            };
            self.stage(&txn, Table::Relations, Operation::Insert, follower_id, &model)
                .await?
        }
        else {
            None
        };
        self.commit(txn, staged).await?;
        Ok(rows == 1)
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn delete_follow(&self, follower_id: i64, author_id: i64) -> Result<bool> {
        let Some(model) = follow::Entity::find()
            .filter(follow::Column::FollowerId.eq(follower_id))
            .filter(follow::Column::AuthorId.eq(author_id))
            .one(&self.db)
            .await?
        else {
            return Ok(false);
        };

        let txn = self.db.begin().await?;
        let rows = follow::Entity::delete_by_id(model.id).exec(&txn).await?.rows_affected;
        let staged = if rows == 1 {
            self.stage(&txn, Table::Relations, Operation::Delete, follower_id, &model)
                .await?
        }
        else {
            None
        };
        self.commit(txn, staged).await?;
        Ok(rows == 1)
    }

    #[instrument(level = "trace", skip(self, content))]
    pub async fn insert_comment(&self, id: i64, user_id: i64, video_id: i64, content: &str) -> Result<bool> {
        let model = comment::Model {
            id,
            user_id,
            video_id,
            content: content.to_owned(),
        };

        let txn = self.db.begin().await?;
        let rows = comment::Entity::insert(comment::ActiveModel {
            id:       Set(id),
            user_id:  Set(user_id),
            video_id: Set(video_id),
            content:  Set(model.content.clone()),
        })
        .on_conflict(OnConflict::new().do_nothing().to_owned())
        .exec_without_returning(&txn)
        .await?;

        let staged = if rows == 1 {
            self.stage(&txn, Table::Comments, Operation::Insert, video_id, &model)
                .await?
        }
        else {
            None
        };
        self.commit(txn, staged).await?;
        Ok(rows == 1)
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn delete_comment(&self, id: i64) -> Result<bool> {
        let Some(model) = self.find_comment(id).await?
        else {
            return Ok(false);
        };

        let txn = self.db.begin().await?;
        let rows = comment::Entity::delete_by_id(id).exec(&txn).await?.rows_affected;
        let staged = if rows == 1 {
            self.stage(&txn, Table::Comments, Operation::Delete, model.video_id, &model)
                .await?
        }
        else {
            None
        };
        self.commit(txn, staged).await?;
        Ok(rows == 1)
    }

    pub async fn favorite_exists(&self, user_id: i64, video_id: i64) -> Result<bool> {
        let count = favorite::Entity::find()
            .filter(favorite::Column::UserId.eq(user_id))
            .filter(favorite::Column::VideoId.eq(video_id))
            .count(&self.db)
            .await?;
        Ok(count > 0)
    }

    pub async fn follow_exists(&self, follower_id: i64, author_id: i64) -> Result<bool> {
        let count = follow::Entity::find()
            .filter(follow::Column::FollowerId.eq(follower_id))
            .filter(follow::Column::AuthorId.eq(author_id))
            .count(&self.db)
            .await?;
        Ok(count > 0)
    }

    pub async fn favorite_video_ids(&self, user_id: i64) -> Result<Vec<i64>> {
        Ok(favorite::Entity::find()
            .filter(favorite::Column::UserId.eq(user_id))
            .select_only()
            .column(favorite::Column::VideoId)
            .order_by_asc(favorite::Column::VideoId)
            .into_tuple::<i64>()
            .all(&self.db)
            .await?)
    }

    /// Videos of `author_id`, newest first.
    pub async fn video_ids_by_author(&self, author_id: i64) -> Result<Vec<i64>> {
        Ok(video::Entity::find()
            .filter(video::Column::AuthorId.eq(author_id))
            .select_only()
            .column(video::Column::Id)
            .order_by_desc(video::Column::Id)
            .into_tuple::<i64>()
            .all(&self.db)
            .await?)
    }

    /// Comments on `video_id`, newest first.
    pub async fn comments_of(&self, video_id: i64) -> Result<Vec<comment::Model>> {
        Ok(comment::Entity::find()
            .filter(comment::Column::VideoId.eq(video_id))
            .order_by_desc(comment::Column::Id)
            .all(&self.db)
            .await?)
    }

    /// Users followed by `follower_id`.
    pub async fn follow_ids(&self, follower_id: i64) -> Result<Vec<i64>> {
        Ok(follow::Entity::find()
            .filter(follow::Column::FollowerId.eq(follower_id))
            .select_only()
            .column(follow::Column::AuthorId)
            .order_by_asc(follow::Column::AuthorId)
            .into_tuple::<i64>()
            .all(&self.db)
            .await?)
    }

    /// Followers of `author_id` in ascending order, the first `limit` of them if given.
    pub async fn follower_ids(&self, author_id: i64, limit: Option<u64>) -> Result<Vec<i64>> {
        Ok(follow::Entity::find()
            .filter(follow::Column::AuthorId.eq(author_id))
            .select_only()
            .column(follow::Column::FollowerId)
            .order_by_asc(follow::Column::FollowerId)
            .limit(limit)
            .into_tuple::<i64>()
            .all(&self.db)
            .await?)
    }

    /// Users followed by `user_id` which follow it back.
    pub async fn friend_ids(&self, user_id: i64) -> Result<Vec<i64>> {
        let followers = Query::select()
            .column(follow::Column::FollowerId)
            .from(follow::Entity)
            .and_where(follow::Column::AuthorId.eq(user_id))
            .to_owned();

        Ok(follow::Entity::find()
            .filter(follow::Column::FollowerId.eq(user_id))
            .filter(follow::Column::AuthorId.in_subquery(followers))
            .select_only()
            .column(follow::Column::AuthorId)
            .order_by_asc(follow::Column::AuthorId)
            .into_tuple::<i64>()
            .all(&self.db)
            .await?)
    }

    /// Authoritative value of a counter.
    #[instrument(level = "trace", skip(self))]
    pub async fn count(&self, counter: Counter, key: i64) -> Result<i64> {
        let db = &self.db;
        let count = match counter {
            Counter::UserFavoriteCount => {
                favorite::Entity::find()
                    .filter(favorite::Column::UserId.eq(key))
                    .count(db)
                    .await?
            }
            Counter::UserTotalFavorited => {
                favorite::Entity::find()
                    .inner_join(video::Entity)
                    .filter(video::Column::AuthorId.eq(key))
                    .count(db)
                    .await?
            }
            Counter::UserFollowCount => {
                follow::Entity::find()
                    .filter(follow::Column::FollowerId.eq(key))
                    .count(db)
                    .await?
            }
            Counter::UserFollowerCount => {
                follow::Entity::find()
                    .filter(follow::Column::AuthorId.eq(key))
                    .count(db)
                    .await?
            }
            Counter::UserWorkCount => video::Entity::find().filter(video::Column::AuthorId.eq(key)).count(db).await?,
            Counter::VideoFavoriteCount => {
                favorite::Entity::find()
                    .filter(favorite::Column::VideoId.eq(key))
                    .count(db)
                    .await?
            }
            Counter::VideoCommentCount => {
                comment::Entity::find()
                    .filter(comment::Column::VideoId.eq(key))
                    .count(db)
                    .await?
            }
        };
        Ok(count as i64)
    }

    /// A page of `(id, name)` pairs of users with ids above `after`.
    pub async fn user_keys_page(&self, after: i64, limit: u64) -> Result<Vec<(i64, String)>> {
        Ok(user::Entity::find()
            .filter(user::Column::Id.gt(after))
            .select_only()
            .column(user::Column::Id)
            .column(user::Column::Name)
            .order_by_asc(user::Column::Id)
            .limit(limit)
            .into_tuple::<(i64, String)>()
            .all(&self.db)
            .await?)
    }

    pub async fn video_ids_page(&self, after: i64, limit: u64) -> Result<Vec<i64>> {
        Ok(video::Entity::find()
            .filter(video::Column::Id.gt(after))
            .select_only()
            .column(video::Column::Id)
            .order_by_asc(video::Column::Id)
            .limit(limit)
            .into_tuple::<i64>()
            .all(&self.db)
            .await?)
    }

    async fn max_id_of<E: EntityTrait>(&self, column: E::Column) -> Result<i64> {
        let max = E::find()
            .select_only()
            .column_as(column.max(), "max_id")
            .into_tuple::<Option<i64>>()
            .one(&self.db)
            .await?;
        Ok(max.flatten().unwrap_or(0))
    }

    /// The highest identifier stored in any table.
    pub async fn max_issued_id(&self) -> Result<i64> {
        Ok([
            self.max_id_of::<user::Entity>(user::Column::Id).await?,
            self.max_id_of::<video::Entity>(video::Column::Id).await?,
            self.max_id_of::<favorite::Entity>(favorite::Column::Id).await?,
            self.max_id_of::<follow::Entity>(follow::Column::Id).await?,
            self.max_id_of::<comment::Entity>(comment::Column::Id).await?,
        ]
        .into_iter()
        .max()
        .unwrap_or(0))
    }
}
