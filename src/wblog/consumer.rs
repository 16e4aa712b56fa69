use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::instrument;
use tracing::warn;

use super::LogBroker;
use super::Record;
use super::Topic;
use crate::error::Result;

#[async_trait]
pub trait RecordHandler: Send + Sync + 'static {
    async fn handle(&self, record: &Record) -> Result<()>;
}

/// The consumer of a single topic partition: fetch, handle, commit.
pub struct Consumer {
    broker:    Arc<dyn LogBroker>,
    handler:   Arc<dyn RecordHandler>,
    topic:     Topic,
    partition: usize,
    retries:   u32,
    backoff:   Duration,
}

impl Consumer {
    pub fn new(
        broker: Arc<dyn LogBroker>,
        handler: Arc<dyn RecordHandler>,
        topic: Topic,
        partition: usize,
        retries: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            broker,
            handler,
            topic,
            partition,
            retries,
            backoff,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        debug!("consumer {}/{} started", self.topic, self.partition);
        loop {
            let record = match self.broker.fetch(self.topic, self.partition).await {
                Ok(record) => record,
                Err(err) => {
                    warn!("fetch from {}/{} failed: {err}", self.topic, self.partition);
                    tokio::time::sleep(self.backoff).await;
                    continue;
                }
            };

            self.apply(&record).await;

            if let Err(err) = self.broker.commit(self.topic, self.partition, record.offset).await {
                // Not fatal: the record is fetched and applied again.
                warn!("commit of {}/{}@{} failed: {err}", self.topic, self.partition, record.offset);
                tokio::time::sleep(self.backoff).await;
            }
        }
    }

    #[instrument(level = "trace", skip(self, record), fields(topic = %record.topic, partition = record.partition, offset = record.offset))]
    async fn apply(&self, record: &Record) {
        let mut attempt = 0;
        loop {
            match self.handler.handle(record).await {
                Ok(()) => return,
                Err(err) if err.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!("attempt {attempt} to apply record {} failed: {err}", record.offset);
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(err) => {
                    error!(
                        "dropping record {}/{}@{} (key {}): {err}",
                        record.topic, record.partition, record.offset, record.key
                    );
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::error::Error;
    use crate::wblog::MemoryLog;

    // Fails the first `failures` attempts of every record, then succeeds and keeps the payloads.
    struct Flaky {
        failures:  usize,
        attempts:  AtomicUsize,
        permanent: bool,
        seen:      parking_lot::Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl RecordHandler for Flaky {
        async fn handle(&self, record: &Record) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.permanent {
                return Err(Error::MalformedChange("nope".into()));
            }
            if attempt < self.failures {
                return Err(Error::Store("unavailable".into()));
            }
            self.seen.lock().push(record.payload.clone());
            Ok(())
        }
    }

    async fn drain(log: &MemoryLog) {
        for _ in 0..100 {
            if log.lag().await.unwrap() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("log was not drained");
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let log = Arc::new(MemoryLog::new(1));
        let handler = Arc::new(Flaky {
            failures:  2,
            attempts:  AtomicUsize::new(0),
            permanent: false,
            seen:      Default::default(),
        });
        let task = Consumer::new(log.clone(), handler.clone(), Topic::Favorite, 0, 3, Duration::from_millis(1)).spawn();

        log.publish(Topic::Favorite, 1, b"one".to_vec()).await.unwrap();
        log.publish(Topic::Favorite, 1, b"two".to_vec()).await.unwrap();
        drain(&log).await;
        task.abort();

        assert_eq!(handler.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(*handler.seen.lock(), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn permanent_failures_are_skipped() {
        let log = Arc::new(MemoryLog::new(1));
        let handler = Arc::new(Flaky {
            failures:  0,
            attempts:  AtomicUsize::new(0),
            permanent: true,
            seen:      Default::default(),
        });
        let task = Consumer::new(log.clone(), handler.clone(), Topic::ChangeLog, 0, 3, Duration::from_millis(1)).spawn();

        log.publish(Topic::ChangeLog, 1, b"bad".to_vec()).await.unwrap();
        drain(&log).await;
        task.abort();

        assert_eq!(handler.attempts.load(Ordering::SeqCst), 1);
        assert!(handler.seen.lock().is_empty());
    }
}
