use std::collections::HashMap;
use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use strum::IntoEnumIterator;
use tokio::sync::watch;
use tracing::instrument;
use tracing::trace;

use super::LogBroker;
use super::Record;
use super::Topic;
use crate::error::Error;
use crate::error::Result;

#[derive(Debug, Default)]
struct PartitionState {
    // Records not yet committed. `base` is the offset of the first one.
    records:   VecDeque<(i64, Vec<u8>)>,
    base:      u64,
    committed: u64,
}

impl PartitionState {
    fn end(&self) -> u64 {
        self.base + self.records.len() as u64
    }
}

#[derive(Debug)]
struct PartitionLog {
    state:     Mutex<PartitionState>,
    // Offset past the last published record.
    published: watch::Sender<u64>,
}

impl PartitionLog {
    fn new() -> Self {
        Self {
            state:     Mutex::new(PartitionState::default()),
            published: watch::Sender::new(0),
        }
    }
}

/// In-process [`LogBroker`]. Committed records are dropped.
#[derive(Debug)]
pub struct MemoryLog {
    partitions: usize,
    logs:       HashMap<(Topic, usize), PartitionLog>,
}

impl MemoryLog {
    pub fn new(partitions: usize) -> Self {
        let partitions = partitions.max(1);
        let logs = Topic::iter()
            .flat_map(|topic| (0..partitions).map(move |p| ((topic, p), PartitionLog::new())))
            .collect();
        Self { partitions, logs }
    }

    fn log(&self, topic: Topic, partition: usize) -> Result<&PartitionLog> {
        self.logs
            .get(&(topic, partition))
            .ok_or_else(|| Error::Log(format!("no partition {partition} in topic {topic}")))
    }
}

#[async_trait]
impl LogBroker for MemoryLog {
    fn partitions(&self) -> usize {
        self.partitions
    }

    #[instrument(level = "trace", skip(self, payload))]
    async fn publish(&self, topic: Topic, key: i64, payload: Vec<u8>) -> Result<()> {
        let log = self.log(topic, self.partition_of(key))?;
        let mut state = log.state.lock();
        state.records.push_back((key, payload));
        // Sent under the lock so the high-water mark never goes backwards.
        log.published.send_replace(state.end());
        Ok(())
    }

    async fn fetch(&self, topic: Topic, partition: usize) -> Result<Record> {
        let log = self.log(topic, partition)?;
        let mut published = log.published.subscribe();

        loop {
            let next = log.state.lock().committed;
            published
                .wait_for(|end| *end > next)
                .await
                .map_err(|_| Error::Log(format!("{topic}/{partition} is closed")))?;

            let state = log.state.lock();
            if state.committed != next {
                // Committed while we were waiting; start over.
                continue;
            }
            if let Some((key, payload)) = state.records.get((next - state.base) as usize) {
                trace!("fetched {topic}/{partition}@{next}");
                return Ok(Record {
                    topic,
                    partition,
                    offset: next,
                    key: *key,
                    payload: payload.clone(),
                });
            }
        }
    }

    async fn commit(&self, topic: Topic, partition: usize, offset: u64) -> Result<()> {
        let log = self.log(topic, partition)?;
        let mut state = log.state.lock();
        if offset >= state.end() {
            return Err(Error::Log(format!(
                "cannot commit {topic}/{partition}@{offset}, end is {}",
                state.end()
            )));
        }
        let committed = state.committed.max(offset + 1);
        while state.base < committed {
            state.records.pop_front();
            state.base += 1;
        }
        state.committed = committed;
        Ok(())
    }

    async fn lag(&self) -> Result<u64> {
        Ok(self
            .logs
            .values()
            .map(|log| {
                let state = log.state.lock();
                state.end() - state.committed
            })
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn uncommitted_records_are_redelivered() {
        let log = MemoryLog::new(4);
        log.publish(Topic::Favorite, 5, b"a".to_vec()).await.unwrap();
        log.publish(Topic::Favorite, 5, b"b".to_vec()).await.unwrap();
        let partition = log.partition_of(5);

        let first = log.fetch(Topic::Favorite, partition).await.unwrap();
        let again = log.fetch(Topic::Favorite, partition).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(first.payload, b"a");
        assert_eq!(log.lag().await.unwrap(), 2);

        log.commit(Topic::Favorite, partition, first.offset).await.unwrap();
        let second = log.fetch(Topic::Favorite, partition).await.unwrap();
        assert_eq!(second.payload, b"b");
        assert_eq!(second.offset, 1);
        log.commit(Topic::Favorite, partition, second.offset).await.unwrap();
        assert_eq!(log.lag().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fetch_waits_for_publish() {
        let log = Arc::new(MemoryLog::new(1));
        let fetcher = {
            let log = log.clone();
            tokio::spawn(async move { log.fetch(Topic::Comment, 0).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!fetcher.is_finished());

        log.publish(Topic::Comment, 1, b"c".to_vec()).await.unwrap();
        let record = tokio::time::timeout(Duration::from_secs(1), fetcher)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(record.key, 1);
    }

    #[tokio::test]
    async fn commit_beyond_the_end_fails() {
        let log = MemoryLog::new(3);
        assert!(log.commit(Topic::Relation, 0, 0).await.is_err());
    }
}
