//! Engine configuration.
//!
//! [`EngineConfig`] is what the engine consumes. [`EngineArgs`] is a command line / environment front end for it; the
//! embedding service may use it or build the config directly.

use std::time::Duration;

use fieldx::fxstruct;
use garde::Validate;

use crate::error::Error;
use crate::error::Result;

/// 2023-01-01T00:00:00Z, the default identifier epoch.
pub const DEFAULT_EPOCH_MS: i64 = 1_672_531_200_000;

#[fxstruct(no_new, builder, get(copy))]
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Node tag embedded into every generated identifier. Must be unique across running nodes.
    #[fieldx(default(1))]
    node_id: u16,

    /// Identifier epoch, milliseconds since the Unix epoch.
    #[fieldx(default(DEFAULT_EPOCH_MS))]
    epoch_ms: i64,

    /// How far the wall clock may lag behind the last persisted identifier before startup is refused.
    #[fieldx(default(Duration::from_millis(50)))]
    clock_tolerance: Duration,

    /// Expected number of elements in the existence index.
    #[fieldx(default(100_000))]
    expected_items: u64,

    #[fieldx(default(0.001))]
    false_positive_rate: f64,

    /// Page size of the startup scan that seeds the existence index.
    #[fieldx(default(500))]
    scan_page_size: u64,

    /// How long a completed load keeps absorbing callers of the same key.
    #[fieldx(default(Duration::from_millis(100)))]
    coalesce_grace: Duration,

    #[fieldx(default(Duration::from_secs(3600)))]
    base_ttl: Duration,

    /// Upper bound of the random addition to `base_ttl`.
    #[fieldx(default(Duration::from_secs(30 * 60)))]
    ttl_jitter: Duration,

    /// Number of followers cached per user.
    #[fieldx(default(50))]
    follower_cap: usize,

    /// Maximum number of users one user may follow.
    #[fieldx(default(10_000))]
    follow_limit: i64,

    /// Partitions per write-behind topic.
    #[fieldx(default(8))]
    log_partitions: usize,

    #[fieldx(default(3))]
    read_retries: u32,

    #[fieldx(default(3))]
    apply_retries: u32,

    #[fieldx(default(Duration::from_millis(20)))]
    retry_backoff: Duration,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.node_id() > crate::id_gen::MAX_NODE_ID {
            return Err(Error::Config(format!(
                "node id {} is out of range 0..={}",
                self.node_id(),
                crate::id_gen::MAX_NODE_ID
            )));
        }
        if !(self.false_positive_rate() > 0.0 && self.false_positive_rate() < 1.0) {
            return Err(Error::Config(format!(
                "false positive rate {} must be within (0, 1)",
                self.false_positive_rate()
            )));
        }
        if self.log_partitions() == 0 || self.scan_page_size() == 0 || self.expected_items() == 0 {
            return Err(Error::Config(
                "partitions, scan page size and expected items must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, clap::Parser, Validate)]
#[fxstruct(no_new, get(copy))]
#[clap(about, version, name = "reelcache")]
pub struct EngineArgs {
    /// Node tag for identifier generation (0..=1023).
    #[clap(long, env = "REELCACHE_NODE_ID", default_value_t = 1)]
    #[garde(range(max = 1023))]
    node_id: u16,

    /// Identifier epoch in milliseconds since the Unix epoch.
    #[clap(long, env = "REELCACHE_EPOCH_MS", default_value_t = DEFAULT_EPOCH_MS)]
    #[garde(range(min = 0))]
    epoch_ms: i64,

    /// Tolerated clock lag at startup, milliseconds.
    #[clap(long, env = "REELCACHE_CLOCK_TOLERANCE_MS", default_value_t = 50)]
    #[garde(skip)]
    clock_tolerance_ms: u64,

    /// Expected number of users and videos for existence index sizing.
    #[clap(long, env = "REELCACHE_EXPECTED_ITEMS", default_value_t = 100_000)]
    #[garde(range(min = 1))]
    expected_items: u64,

    /// Target false positive rate of the existence index.
    #[clap(long, env = "REELCACHE_FALSE_POSITIVE_RATE", default_value_t = 0.001)]
    #[garde(range(min = 0.000001, max = 0.5))]
    false_positive_rate: f64,

    #[clap(long, env = "REELCACHE_SCAN_PAGE_SIZE", default_value_t = 500)]
    #[garde(range(min = 1))]
    scan_page_size: u64,

    /// Grace window of coalesced loads, milliseconds.
    #[clap(long, env = "REELCACHE_COALESCE_GRACE_MS", default_value_t = 100)]
    #[garde(range(max = 1000))]
    coalesce_grace_ms: u64,

    /// Base cache TTL, seconds.
    #[clap(long, env = "REELCACHE_BASE_TTL", default_value_t = 3600)]
    #[garde(range(min = 1))]
    base_ttl: u64,

    /// Maximum TTL jitter, seconds.
    #[clap(long, env = "REELCACHE_TTL_JITTER", default_value_t = 1800)]
    #[garde(skip)]
    ttl_jitter: u64,

    #[clap(long, env = "REELCACHE_FOLLOWER_CAP", default_value_t = 50)]
    #[garde(range(min = 1))]
    follower_cap: usize,

    #[clap(long, env = "REELCACHE_FOLLOW_LIMIT", default_value_t = 10_000)]
    #[garde(range(min = 1))]
    follow_limit: i64,

    #[clap(long, env = "REELCACHE_LOG_PARTITIONS", default_value_t = 8)]
    #[garde(range(min = 1, max = 1024))]
    log_partitions: usize,

    #[clap(long, env = "REELCACHE_READ_RETRIES", default_value_t = 3)]
    #[garde(skip)]
    read_retries: u32,

    #[clap(long, env = "REELCACHE_APPLY_RETRIES", default_value_t = 3)]
    #[garde(skip)]
    apply_retries: u32,

    /// Pause between retries, milliseconds.
    #[clap(long, env = "REELCACHE_RETRY_BACKOFF_MS", default_value_t = 20)]
    #[garde(skip)]
    retry_backoff_ms: u64,
}

impl EngineArgs {
    pub fn to_config(&self) -> Result<EngineConfig> {
        self.validate().map_err(|err| Error::Config(err.to_string()))?;

        let config = EngineConfig::builder()
            .node_id(self.node_id())
            .epoch_ms(self.epoch_ms())
            .clock_tolerance(Duration::from_millis(self.clock_tolerance_ms()))
            .expected_items(self.expected_items())
            .false_positive_rate(self.false_positive_rate())
            .scan_page_size(self.scan_page_size())
            .coalesce_grace(Duration::from_millis(self.coalesce_grace_ms()))
            .base_ttl(Duration::from_secs(self.base_ttl()))
            .ttl_jitter(Duration::from_secs(self.ttl_jitter()))
            .follower_cap(self.follower_cap())
            .follow_limit(self.follow_limit())
            .log_partitions(self.log_partitions())
            .read_retries(self.read_retries())
            .apply_retries(self.apply_retries())
            .retry_backoff(Duration::from_millis(self.retry_backoff_ms()))
            .build()
            .map_err(|err| Error::Config(err.to_string()))?;

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::builder().build().unwrap();
        assert_eq!(config.follower_cap(), 50);
        assert_eq!(config.follow_limit(), 10_000);
        assert_eq!(config.ttl_jitter(), Duration::from_secs(1800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn cli_parsing() {
        let args = EngineArgs::try_parse_from(["reelcache", "--node-id", "7", "--follower-cap", "20"]).unwrap();
        let config = args.to_config().unwrap();
        assert_eq!(config.node_id(), 7);
        assert_eq!(config.follower_cap(), 20);
        assert_eq!(config.coalesce_grace(), Duration::from_millis(100));
    }

    #[test]
    fn out_of_range_node_is_rejected() {
        let args = EngineArgs::try_parse_from(["reelcache", "--node-id", "4096"]).unwrap();
        assert!(matches!(args.to_config(), Err(Error::Config(_))));
    }
}
