//! Write-behind log kept in the `log_records` table of the durable store.
//!
//! Records survive restarts: whatever a consumer didn't commit is fetched again by the next engine. Because the table
//! lives next to the entity tables, change events are staged in the same transaction as the row change they describe.
//! Consumers in this process are woken on publish; records written by other processes are picked up by polling.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::ActiveValue::NotSet;
use sea_orm::ActiveValue::Set;
use sea_orm::ColumnTrait;
use sea_orm::ConnectionTrait;
use sea_orm::DatabaseConnection;
use sea_orm::DatabaseTransaction;
use sea_orm::EntityTrait;
use sea_orm::PaginatorTrait;
use sea_orm::QueryFilter;
use sea_orm::QueryOrder;
use strum::IntoEnumIterator;
use tokio::sync::watch;
use tracing::instrument;
use tracing::trace;

use super::LogBroker;
use super::Record;
use super::Topic;
use crate::db::entity::log_record;
use crate::error::Error;
use crate::error::Result;

/// Durable [`LogBroker`]. Must share the database of the [`Repository`](crate::db::Repository) it is paired with.
#[derive(Debug)]
pub struct OutboxLog {
    db:            DatabaseConnection,
    partitions:    usize,
    poll_interval: Duration,
    wakers:        HashMap<(Topic, usize), watch::Sender<u64>>,
}

impl OutboxLog {
    pub fn new(db: DatabaseConnection, partitions: usize) -> Self {
        let partitions = partitions.max(1);
        let wakers = Topic::iter()
            .flat_map(|topic| (0..partitions).map(move |p| ((topic, p), watch::Sender::new(0))))
            .collect();
        Self {
            db,
            partitions,
            poll_interval: Duration::from_millis(50),
            wakers,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn waker(&self, topic: Topic, partition: usize) -> Result<&watch::Sender<u64>> {
        self.wakers
            .get(&(topic, partition))
            .ok_or_else(|| Error::Log(format!("no partition {partition} in topic {topic}")))
    }

    async fn insert<C: ConnectionTrait>(&self, conn: &C, topic: Topic, key: i64, payload: Vec<u8>) -> Result<()> {
        let topic_name: &'static str = topic.into();
        log_record::Entity::insert(log_record::ActiveModel {
            id:        NotSet,
            topic:     Set(topic_name.to_owned()),
            partition: Set(self.partition_of(key) as i32),
            key:       Set(key),
            payload:   Set(payload),
        })
        .exec_without_returning(conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LogBroker for OutboxLog {
    fn partitions(&self) -> usize {
        self.partitions
    }

    #[instrument(level = "trace", skip(self, payload))]
    async fn publish(&self, topic: Topic, key: i64, payload: Vec<u8>) -> Result<()> {
        self.insert(&self.db, topic, key, payload).await?;
        self.staged(topic, key);
        Ok(())
    }

    async fn stage(
        &self,
        txn: &DatabaseTransaction,
        topic: Topic,
        key: i64,
        payload: Vec<u8>,
    ) -> Result<Option<Vec<u8>>> {
        self.insert(txn, topic, key, payload).await?;
        Ok(None)
    }

    fn staged(&self, topic: Topic, key: i64) {
        if let Ok(waker) = self.waker(topic, self.partition_of(key)) {
            waker.send_modify(|published| *published += 1);
        }
    }

    async fn fetch(&self, topic: Topic, partition: usize) -> Result<Record> {
        let mut woken = self.waker(topic, partition)?.subscribe();
        let topic_name: &'static str = topic.into();

        loop {
            let oldest = log_record::Entity::find()
                .filter(log_record::Column::Topic.eq(topic_name))
                .filter(log_record::Column::Partition.eq(partition as i32))
                .order_by_asc(log_record::Column::Id)
                .one(&self.db)
                .await?;

            if let Some(row) = oldest {
                trace!("fetched {topic}/{partition}@{}", row.id);
                return Ok(Record {
                    topic,
                    partition,
                    offset: row.id as u64,
                    key: row.key,
                    payload: row.payload,
                });
            }

            // Timing out is the polling path for records published by other processes.
            let _ = tokio::time::timeout(self.poll_interval, woken.changed()).await;
        }
    }

    /// Removes the record at `offset` only. Its partition's consumer commits every record it fetches, so nothing older
    /// is pending unless another transaction committed it late, and then it must still be delivered.
    async fn commit(&self, topic: Topic, partition: usize, offset: u64) -> Result<()> {
        self.waker(topic, partition)?;
        let topic_name: &'static str = topic.into();
        log_record::Entity::delete_many()
            .filter(log_record::Column::Id.eq(offset as i64))
            .filter(log_record::Column::Topic.eq(topic_name))
            .filter(log_record::Column::Partition.eq(partition as i32))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn lag(&self) -> Result<u64> {
        Ok(log_record::Entity::find().count(&self.db).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sea_orm::TransactionTrait;

    use super::*;
    use crate::db::tests::sqlite_repo;

    #[tokio::test]
    async fn records_outlive_the_broker() {
        let (_dir, repo) = sqlite_repo(None).await;
        let log = OutboxLog::new(repo.connection().clone(), 4);
        log.publish(Topic::Favorite, 100, b"first".to_vec()).await.unwrap();
        log.publish(Topic::Favorite, 100, b"second".to_vec()).await.unwrap();
        let partition = log.partition_of(100);

        let first = log.fetch(Topic::Favorite, partition).await.unwrap();
        assert_eq!(first.payload, b"first");
        assert_eq!(first.key, 100);
        log.commit(Topic::Favorite, partition, first.offset).await.unwrap();
        drop(log);

        let log = OutboxLog::new(repo.connection().clone(), 4);
        assert_eq!(log.lag().await.unwrap(), 1);
        let second = log.fetch(Topic::Favorite, partition).await.unwrap();
        assert_eq!(second.payload, b"second");
        assert!(second.offset > first.offset);
        log.commit(Topic::Favorite, partition, second.offset).await.unwrap();
        assert_eq!(log.lag().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn staged_records_follow_their_transaction() {
        let (_dir, repo) = sqlite_repo(None).await;
        let log = OutboxLog::new(repo.connection().clone(), 2);

        let txn = repo.connection().begin().await.unwrap();
        assert_eq!(log.stage(&txn, Topic::ChangeLog, 7, b"gone".to_vec()).await.unwrap(), None);
        txn.rollback().await.unwrap();
        assert_eq!(log.lag().await.unwrap(), 0);

        let txn = repo.connection().begin().await.unwrap();
        log.stage(&txn, Topic::ChangeLog, 7, b"kept".to_vec()).await.unwrap();
        txn.commit().await.unwrap();
        log.staged(Topic::ChangeLog, 7);
        assert_eq!(log.lag().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fetch_is_woken_by_publish() {
        let (_dir, repo) = sqlite_repo(None).await;
        let log = Arc::new(OutboxLog::new(repo.connection().clone(), 1).with_poll_interval(Duration::from_secs(30)));
        let fetcher = {
            let log = log.clone();
            tokio::spawn(async move { log.fetch(Topic::Comment, 0).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!fetcher.is_finished());

        log.publish(Topic::Comment, 3, b"c".to_vec()).await.unwrap();
        let record = tokio::time::timeout(Duration::from_secs(5), fetcher)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(record.key, 3);
    }
}
