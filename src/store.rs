//! Port to the shared cache store.
//!
//! The engine never assumes the store is local: every operation may fail transiently and every read may observe a
//! concurrent writer. Counter and set mutations are expected to be atomic on the store side.

pub mod memory;

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

#[doc(inline)]
pub use memory::MemoryStore;

#[async_trait]
pub trait CacheStore: Debug + Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn get_counter(&self, key: &str) -> Result<Option<i64>>;

    /// Store `value` unless the counter is already cached. Returns the counter value after the call, which is the
    /// existing one if another writer got there first.
    async fn set_counter_if_absent(&self, key: &str, value: i64, ttl: Duration) -> Result<i64>;

    /// Increment a cached counter. `None` if the counter is not cached; nothing is created then.
    async fn incr_by_if_exists(&self, key: &str, delta: i64) -> Result<Option<i64>>;

    /// Increment a cached counter or, if it's cold, initialize it with `base + delta`.
    async fn incr_by_or_init(&self, key: &str, base: i64, delta: i64, ttl: Duration) -> Result<i64>;

    /// Replace a whole set. An empty `members` makes a populated empty set.
    async fn set_replace(&self, key: &str, members: Vec<i64>, ttl: Duration) -> Result<()>;

    /// Add `member` to a populated set. A cold set is left cold. With `cap`, a set already holding `cap` members is
    /// not grown. Returns `true` if the member is in the set after the call.
    async fn set_add_if_exists(&self, key: &str, member: i64, cap: Option<usize>) -> Result<bool>;

    /// Returns `true` if the member was removed.
    async fn set_remove(&self, key: &str, member: i64) -> Result<bool>;

    /// `None` if the set is cold.
    async fn set_is_member(&self, key: &str, member: i64) -> Result<Option<bool>>;

    /// `None` if the set is cold. Members are returned in ascending order.
    async fn set_members(&self, key: &str) -> Result<Option<Vec<i64>>>;
}
