//! # reelcache
//!
//! Cache-consistency engine for a social short-video backend: users, videos, favorites, follow relations and comments
//! live in a relational store, while reads are served from a shared key-value cache.
//!
//! # The Basics
//!
//! The engine keeps the cache honest without making writers wait for the database:
//!
//! - An existence index (a Bloom filter over user and video keys) rejects lookups of things that were never created,
//!   so a stream of random keys never reaches the durable store.
//! - Cache misses are coalesced: concurrent callers of the same cold key share one load.
//! - Counter entries get a jittered TTL so that entries populated together don't expire together.
//! - Favorite, follow and comment writes are validated against the cache, then published as intents to a partitioned
//!   write-behind log. Consumers apply them to the durable store idempotently.
//! - Every committed row change produces a change event; the reconciler moves cached counters and patches membership
//!   sets. Counters are only ever incremented or decremented, never overwritten, so reordered deltas still converge.
//!
//! # Backends
//!
//! The cache store, the log broker and the relational database are seams: [`CacheStore`] and [`LogBroker`] are traits
//! with in-process implementations ([`MemoryStore`], [`MemoryLog`]); the database is anything SeaORM connects to. The
//! `sqlite` feature is on by default, `pg` and `mysql` are available.
//!
//! [`OutboxLog`] is the durable broker: records live in a table of the same database, change events are written in
//! the transaction of the row change they describe, and whatever wasn't consumed before a restart is delivered to the
//! next engine.
//!
//! # Entry Point
//!
//! ```no_run
//! # async fn run() -> reelcache::Result<()> {
//! use std::sync::Arc;
//!
//! use reelcache::prelude::*;
//!
//! let config = EngineConfig::builder()
//!     .log_partitions(4)
//!     .build()
//!     .map_err(|err| Error::Config(err.to_string()))?;
//! let db = Repository::connect("sqlite:///tmp/reel.db?mode=rwc").await?;
//! let engine = Engine::open(
//!     config,
//!     db,
//!     Arc::new(MemoryStore::default()),
//!     Arc::new(MemoryLog::new(4)),
//! )
//! .await?;
//!
//! let author = engine.register_user("ann").await?;
//! let video = engine.publish_video(author, "first clip").await?;
//! engine.favorite(author, video, Action::Do).await?;
//! # Ok(())
//! # }
//! ```

pub mod cdc;
pub mod coalesce;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod existence;
pub mod id_gen;
pub mod set_cache;
pub mod store;
#[cfg(feature = "tracing")]
pub mod telemetry;
pub mod types;
pub mod value_cache;
pub mod wblog;

#[doc(inline)]
pub use config::EngineArgs;
#[doc(inline)]
pub use config::EngineConfig;
#[doc(inline)]
pub use engine::Engine;
#[doc(inline)]
pub use engine::UserProfile;
#[doc(inline)]
pub use engine::VideoProfile;
#[doc(inline)]
pub use error::Conflict;
#[doc(inline)]
pub use error::Error;
#[doc(inline)]
pub use error::Result;
#[doc(inline)]
pub use store::CacheStore;
#[doc(inline)]
pub use store::MemoryStore;
#[doc(inline)]
pub use wblog::Intent;
#[doc(inline)]
pub use wblog::LogBroker;
#[doc(inline)]
pub use wblog::MemoryLog;
#[doc(inline)]
pub use wblog::OutboxLog;

pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::db::Repository;
    pub use crate::engine::Engine;
    pub use crate::error::Conflict;
    pub use crate::error::Error;
    pub use crate::store::CacheStore;
    pub use crate::store::MemoryStore;
    pub use crate::types::*;
    pub use crate::wblog::LogBroker;
    pub use crate::wblog::MemoryLog;
    pub use crate::wblog::OutboxLog;
}
