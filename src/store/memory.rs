use std::collections::BTreeSet;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use moka::future::Cache;
use moka::ops::compute::CompResult;
use moka::ops::compute::Op;
use tracing::instrument;

use super::CacheStore;
use crate::error::Error;
use crate::error::Result;

#[derive(Debug, Clone)]
enum StoredValue {
    Blob(Vec<u8>),
    Counter(i64),
    Set(BTreeSet<i64>),
}

impl StoredValue {
    fn type_name(&self) -> &'static str {
        match self {
            StoredValue::Blob(_) => "blob",
            StoredValue::Counter(_) => "counter",
            StoredValue::Set(_) => "set",
        }
    }
}

#[derive(Debug, Clone)]
struct StoredItem {
    value:    StoredValue,
    deadline: Instant,
}

impl StoredItem {
    fn new(value: StoredValue, ttl: Duration) -> Self {
        Self {
            value,
            deadline: Instant::now() + ttl,
        }
    }
}

// Each item expires at its own deadline. Updates keep the deadline so that an increment doesn't extend a counter's
// life.
struct ItemExpiration;

impl moka::Expiry<String, StoredItem> for ItemExpiration {
    fn expire_after_create(&self, _key: &String, value: &StoredItem, current_time: Instant) -> Option<Duration> {
        Some(value.deadline.saturating_duration_since(current_time))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredItem,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.deadline.saturating_duration_since(current_time))
    }
}

fn wrong_type(key: &str, expected: &str, found: &StoredValue) -> Error {
    Error::Store(format!(
        "key {key} holds a {}, not a {expected}",
        found.type_name()
    ))
}

fn bump(key: &str, mut item: StoredItem, delta: i64) -> Result<Op<StoredItem>> {
    let StoredValue::Counter(v) = &mut item.value
    else {
        return Err(wrong_type(key, "counter", &item.value));
    };
    *v = v
        .checked_add(delta)
        .ok_or_else(|| Error::Store(format!("counter {key} overflows adding {delta}")))?;
    Ok(Op::Put(item))
}

/// In-process [`CacheStore`] on top of a [`moka`] cache. Atomicity of counter and set mutations comes from moka's
/// per-entry compute.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    cache: Cache<String, StoredItem>,
}

impl MemoryStore {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .name("reelcache")
                .max_capacity(max_capacity)
                .expire_after(ItemExpiration)
                .build(),
        }
    }

    async fn item(&self, key: &str) -> Option<StoredItem> {
        self.cache.get(key).await
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(1_000_000)
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.item(key).await {
            None => Ok(None),
            Some(StoredItem {
                value: StoredValue::Blob(bytes),
                ..
            }) => Ok(Some(bytes)),
            Some(item) => Err(wrong_type(key, "blob", &item.value)),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.cache
            .insert(key.to_owned(), StoredItem::new(StoredValue::Blob(value), ttl))
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.cache.remove(key).await.is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.cache.contains_key(key))
    }

    async fn get_counter(&self, key: &str) -> Result<Option<i64>> {
        match self.item(key).await {
            None => Ok(None),
            Some(StoredItem {
                value: StoredValue::Counter(v),
                ..
            }) => Ok(Some(v)),
            Some(item) => Err(wrong_type(key, "counter", &item.value)),
        }
    }

    #[instrument(level = "trace", skip(self))]
    async fn set_counter_if_absent(&self, key: &str, value: i64, ttl: Duration) -> Result<i64> {
        let result = self
            .cache
            .entry(key.to_owned())
            .and_compute_with(|entry| async move {
                match entry {
                    Some(_) => Op::Nop,
                    None => Op::Put(StoredItem::new(StoredValue::Counter(value), ttl)),
                }
            })
            .await;

        match result {
            CompResult::Inserted(entry) | CompResult::Unchanged(entry) | CompResult::ReplacedWith(entry) => {
                match entry.into_value().value {
                    StoredValue::Counter(v) => Ok(v),
                    other => Err(wrong_type(key, "counter", &other)),
                }
            }
            CompResult::Removed(_) | CompResult::StillNone(_) => {
                Err(Error::Store(format!("counter {key} vanished while being set")))
            }
        }
    }

    #[instrument(level = "trace", skip(self))]
    async fn incr_by_if_exists(&self, key: &str, delta: i64) -> Result<Option<i64>> {
        let result = self
            .cache
            .entry(key.to_owned())
            .and_try_compute_with(|entry| async move {
                match entry {
                    Some(entry) => bump(key, entry.into_value(), delta),
                    None => Ok(Op::Nop),
                }
            })
            .await?;

        Ok(match result {
            CompResult::ReplacedWith(entry) => match entry.into_value().value {
                StoredValue::Counter(v) => Some(v),
                _ => None,
            },
            _ => None,
        })
    }

    #[instrument(level = "trace", skip(self))]
    async fn incr_by_or_init(&self, key: &str, base: i64, delta: i64, ttl: Duration) -> Result<i64> {
        let result = self
            .cache
            .entry(key.to_owned())
            .and_try_compute_with(|entry| async move {
                match entry {
                    Some(entry) => bump(key, entry.into_value(), delta),
                    None => {
                        let value = base
                            .checked_add(delta)
                            .ok_or_else(|| Error::Store(format!("counter {key} overflows adding {delta}")))?;
                        Ok(Op::Put(StoredItem::new(StoredValue::Counter(value), ttl)))
                    }
                }
            })
            .await?;

        match result {
            CompResult::Inserted(entry) | CompResult::ReplacedWith(entry) => match entry.into_value().value {
                StoredValue::Counter(v) => Ok(v),
                other => Err(wrong_type(key, "counter", &other)),
            },
            _ => Err(Error::Store(format!("counter {key} was not updated"))),
        }
    }

    async fn set_replace(&self, key: &str, members: Vec<i64>, ttl: Duration) -> Result<()> {
        let set = members.into_iter().collect();
        self.cache
            .insert(key.to_owned(), StoredItem::new(StoredValue::Set(set), ttl))
            .await;
        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    async fn set_add_if_exists(&self, key: &str, member: i64, cap: Option<usize>) -> Result<bool> {
        let result = self
            .cache
            .entry(key.to_owned())
            .and_try_compute_with(|entry| async move {
                let Some(entry) = entry
                else {
                    return Ok(Op::Nop);
                };
                let mut item = entry.into_value();
                let StoredValue::Set(set) = &mut item.value
                else {
                    return Err(wrong_type(key, "set", &item.value));
                };
                if set.contains(&member) || cap.is_some_and(|cap| set.len() >= cap) {
                    return Ok(Op::Nop);
                }
                set.insert(member);
                Ok(Op::Put(item))
            })
            .await?;

        Ok(match result {
            CompResult::ReplacedWith(_) => true,
            CompResult::Unchanged(entry) => match entry.value().value {
                StoredValue::Set(ref set) => set.contains(&member),
                _ => false,
            },
            _ => false,
        })
    }

    #[instrument(level = "trace", skip(self))]
    async fn set_remove(&self, key: &str, member: i64) -> Result<bool> {
        let result = self
            .cache
            .entry(key.to_owned())
            .and_try_compute_with(|entry| async move {
                let Some(entry) = entry
                else {
                    return Ok(Op::Nop);
                };
                let mut item = entry.into_value();
                let StoredValue::Set(set) = &mut item.value
                else {
                    return Err(wrong_type(key, "set", &item.value));
                };
                if !set.remove(&member) {
                    return Ok(Op::Nop);
                }
                Ok(Op::Put(item))
            })
            .await?;

        Ok(matches!(result, CompResult::ReplacedWith(_)))
    }

    async fn set_is_member(&self, key: &str, member: i64) -> Result<Option<bool>> {
        match self.item(key).await {
            None => Ok(None),
            Some(StoredItem {
                value: StoredValue::Set(set),
                ..
            }) => Ok(Some(set.contains(&member))),
            Some(item) => Err(wrong_type(key, "set", &item.value)),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Option<Vec<i64>>> {
        match self.item(key).await {
            None => Ok(None),
            Some(StoredItem {
                value: StoredValue::Set(set),
                ..
            }) => Ok(Some(set.into_iter().collect())),
            Some(item) => Err(wrong_type(key, "set", &item.value)),
        }
    }
}
