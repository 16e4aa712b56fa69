//! Probabilistic existence index.
//!
//! A bloom filter over `(kind, key)` pairs and user names. It only ever grows: a negative answer is definitive, a
//! positive one must be confirmed by the durable store where correctness matters.

use std::collections::hash_map::RandomState;
use std::f64::consts::LN_2;
use std::hash::BuildHasher;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tracing::debug;
use tracing::instrument;

use crate::db::Repository;
use crate::error::Result;
use crate::types::EntityKind;

pub struct BloomFilter {
    bits:    Vec<AtomicU64>,
    nbits:   u64,
    hashes:  u32,
    first:   RandomState,
    second:  RandomState,
    inserts: AtomicU64,
}

impl BloomFilter {
    /// Size the filter for `expected` elements at false positive rate `fp_rate`.
    pub fn with_estimates(expected: u64, fp_rate: f64) -> Self {
        let n = expected.max(1) as f64;
        let nbits = ((-n * fp_rate.ln()) / (LN_2 * LN_2)).ceil().max(64.0) as u64;
        let hashes = ((nbits as f64 / n) * LN_2).round().max(1.0) as u32;
        let words = nbits.div_ceil(64) as usize;

        Self {
            bits: (0..words).map(|_| AtomicU64::new(0)).collect(),
            nbits,
            hashes,
            first: RandomState::new(),
            second: RandomState::new(),
            inserts: AtomicU64::new(0),
        }
    }

    // Kirsch-Mitzenmacher: k indexes derived from two independent hashes.
    fn positions<'a>(&'a self, item: &[u8]) -> impl Iterator<Item = u64> + 'a {
        let h1 = self.first.hash_one(item);
        let h2 = self.second.hash_one(item) | 1;
        (0..self.hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.nbits)
    }

    pub fn add(&self, item: &[u8]) {
        for pos in self.positions(item) {
            self.bits[(pos / 64) as usize].fetch_or(1 << (pos % 64), Ordering::Relaxed);
        }
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn test(&self, item: &[u8]) -> bool {
        self.positions(item)
            .all(|pos| self.bits[(pos / 64) as usize].load(Ordering::Relaxed) & (1 << (pos % 64)) != 0)
    }

    pub fn bit_count(&self) -> u64 {
        self.nbits
    }

    pub fn hash_count(&self) -> u32 {
        self.hashes
    }

    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("bits", &self.nbits)
            .field("hashes", &self.hashes)
            .field("inserts", &self.inserts())
            .finish()
    }
}

/// Existence index of users and videos.
#[derive(Debug)]
pub struct ExistenceIndex {
    filter: BloomFilter,
}

impl ExistenceIndex {
    pub fn new(expected: u64, fp_rate: f64) -> Self {
        Self {
            filter: BloomFilter::with_estimates(expected, fp_rate),
        }
    }

    fn entity_bytes(kind: EntityKind, key: i64) -> Vec<u8> {
        let tag: &'static str = kind.into();
        let mut bytes = Vec::with_capacity(tag.len() + 9);
        bytes.extend_from_slice(tag.as_bytes());
        bytes.push(b':');
        bytes.extend_from_slice(&key.to_be_bytes());
        bytes
    }

    fn name_bytes(name: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(name.len() + 5);
        bytes.extend_from_slice(b"name:");
        bytes.extend_from_slice(name.as_bytes());
        bytes
    }

    pub fn add(&self, kind: EntityKind, key: i64) {
        self.filter.add(&Self::entity_bytes(kind, key));
    }

    pub fn contains(&self, kind: EntityKind, key: i64) -> bool {
        self.filter.test(&Self::entity_bytes(kind, key))
    }

    pub fn add_name(&self, name: &str) {
        self.filter.add(&Self::name_bytes(name));
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.filter.test(&Self::name_bytes(name))
    }

    /// Seed the index with every user and video in the durable store, page by page. Returns the highest identifier
    /// seen, zero for an empty store.
    #[instrument(level = "debug", skip(self, repo))]
    pub async fn rebuild(&self, repo: &Repository, page_size: u64) -> Result<i64> {
        let mut max_id = 0;

        let mut after = 0;
        loop {
            let page = repo.user_keys_page(after, page_size).await?;
            let Some((last, _)) = page.last()
            else {
                break;
            };
            after = *last;
            for (id, name) in &page {
                self.add(EntityKind::User, *id);
                self.add_name(name);
            }
            max_id = max_id.max(after);
            if (page.len() as u64) < page_size {
                break;
            }
        }

        let mut after = 0;
        loop {
            let page = repo.video_ids_page(after, page_size).await?;
            let Some(last) = page.last()
            else {
                break;
            };
            after = *last;
            for id in &page {
                self.add(EntityKind::Video, *id);
            }
            max_id = max_id.max(after);
            if (page.len() as u64) < page_size {
                break;
            }
        }

        debug!("existence index seeded with {} keys, max id {max_id}", self.filter.inserts());
        Ok(max_id)
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;
    use crate::db::tests::sqlite_repo;

    #[test]
    fn sizing() {
        let filter = BloomFilter::with_estimates(100_000, 0.001);
        // ~14.4 bits and 10 hashes per element at 0.1%.
        assert!(filter.bit_count() > 1_400_000 && filter.bit_count() < 1_500_000);
        assert_eq!(filter.hash_count(), 10);
    }

    #[test]
    fn no_false_negatives_and_bounded_false_positives() {
        let index = ExistenceIndex::new(100_000, 0.001);
        let mut rng = rand::rng();

        let inserted: Vec<i64> = (0..100_000).map(|_| rng.random_range(1..i64::MAX / 2)).collect();
        for key in &inserted {
            index.add(EntityKind::Video, *key);
        }
        assert!(inserted.iter().all(|key| index.contains(EntityKind::Video, *key)));

        // Keys from a disjoint range.
        let samples = 100_000;
        let false_positives = (0..samples)
            .map(|_| rng.random_range(i64::MAX / 2..i64::MAX))
            .filter(|key| index.contains(EntityKind::Video, *key))
            .count();
        let rate = false_positives as f64 / samples as f64;
        assert!(rate < 0.003, "false positive rate {rate} is out of bounds");
    }

    #[test]
    fn kinds_and_names_are_separate() {
        let index = ExistenceIndex::new(1_000, 0.001);
        index.add(EntityKind::User, 42);
        index.add_name("alice");
        assert!(index.contains(EntityKind::User, 42));
        assert!(!index.contains(EntityKind::Video, 42));
        assert!(index.contains_name("alice"));
        assert!(!index.contains_name("bob"));
    }

    #[tokio::test]
    async fn rebuild_walks_every_page() {
        let (_dir, repo) = sqlite_repo(None).await;
        // Eight users fill exactly two pages of four; nine videos spill into a third.
        let users: Vec<i64> = (1..=8).map(|n| n * 1_000 + 7).collect();
        for id in &users {
            repo.insert_user(*id, &format!("user{id}")).await.unwrap();
        }
        let videos: Vec<i64> = (1..=9).map(|n| n * 100 + 3).collect();
        for id in &videos {
            repo.insert_video(*id, users[0], "clip").await.unwrap();
        }

        let index = ExistenceIndex::new(1_000, 0.001);
        assert_eq!(index.rebuild(&repo, 4).await.unwrap(), 8_007);
        assert!(users.iter().all(|id| index.contains(EntityKind::User, *id)));
        assert!(users.iter().all(|id| index.contains_name(&format!("user{id}"))));
        assert!(videos.iter().all(|id| index.contains(EntityKind::Video, *id)));

        // The highest id may belong to a video.
        repo.insert_video(50_001, users[0], "late").await.unwrap();
        let index = ExistenceIndex::new(1_000, 0.001);
        assert_eq!(index.rebuild(&repo, 4).await.unwrap(), 50_001);
        assert!(index.contains(EntityKind::Video, 50_001));
    }

    #[tokio::test]
    async fn rebuild_of_an_empty_store() {
        let (_dir, repo) = sqlite_repo(None).await;
        let index = ExistenceIndex::new(1_000, 0.001);
        assert_eq!(index.rebuild(&repo, 4).await.unwrap(), 0);
        assert!(!index.contains(EntityKind::User, 1));
    }
}
