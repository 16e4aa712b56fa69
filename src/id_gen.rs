//! Time-ordered, node-tagged identifiers.
//!
//! Layout of a generated `i64`, most significant bit first:
//!
//! | bits | content |
//! | ---- | ------- |
//! | 1    | always zero |
//! | 41   | milliseconds since the configured epoch |
//! | 10   | node tag |
//! | 12   | per-millisecond sequence |

use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const TIMESTAMP_SHIFT: u32 = NODE_BITS + SEQUENCE_BITS;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

pub const MAX_NODE_ID: u16 = (1 << NODE_BITS) - 1;

pub type ClockFn = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy)]
struct State {
    last_ms:  i64,
    sequence: i64,
}

pub struct IdGenerator {
    node_id:  i64,
    epoch_ms: i64,
    clock:    ClockFn,
    state:    Mutex<State>,
}

impl IdGenerator {
    pub fn new(node_id: u16, epoch_ms: i64) -> Result<Self> {
        Self::with_clock(node_id, epoch_ms, Arc::new(system_clock))
    }

    pub fn with_clock(node_id: u16, epoch_ms: i64, clock: ClockFn) -> Result<Self> {
        if node_id > MAX_NODE_ID {
            return Err(Error::Config(format!("node id {node_id} exceeds {MAX_NODE_ID}")));
        }

        let now = clock();
        if now < epoch_ms {
            return Err(Error::ClockRollback(Duration::from_millis((epoch_ms - now) as u64)));
        }

        Ok(Self {
            node_id: node_id as i64,
            epoch_ms,
            clock,
            state: Mutex::new(State {
                last_ms:  now - epoch_ms,
                sequence: -1,
            }),
        })
    }

    /// Start a generator after a restart. `last_issued` is the highest identifier known to be persisted; if the clock
    /// is behind its timestamp by more than `tolerance` the generator refuses to start.
    pub fn resume(node_id: u16, epoch_ms: i64, last_issued: i64, tolerance: Duration, clock: ClockFn) -> Result<Self> {
        let generator = Self::with_clock(node_id, epoch_ms, clock)?;

        let issued_ms = Self::timestamp_of(last_issued);
        let mut state = generator.state.lock();
        let lag = issued_ms - state.last_ms;
        if lag > tolerance.as_millis() as i64 {
            return Err(Error::ClockRollback(Duration::from_millis(lag as u64)));
        }
        if lag >= 0 {
            // Within tolerance: continue past the last issued millisecond instead of reusing it.
            state.last_ms = issued_ms + 1;
            state.sequence = -1;
        }
        drop(state);

        Ok(generator)
    }

    pub fn generate(&self) -> i64 {
        let now = (self.clock)() - self.epoch_ms;
        let mut state = self.state.lock();

        if now > state.last_ms {
            state.last_ms = now;
            state.sequence = 0;
        }
        else {
            if now < state.last_ms {
                warn!(
                    "clock is {}ms behind the last issued identifier, continuing from it",
                    state.last_ms - now
                );
            }
            state.sequence += 1;
            if state.sequence > SEQUENCE_MASK {
                // Sequence exhausted within this millisecond: borrow the next one.
                state.last_ms += 1;
                state.sequence = 0;
            }
        }

        (state.last_ms << TIMESTAMP_SHIFT) | (self.node_id << SEQUENCE_BITS) | state.sequence
    }

    /// Milliseconds since the epoch encoded in `id`.
    pub fn timestamp_of(id: i64) -> i64 {
        id >> TIMESTAMP_SHIFT
    }

    pub fn node_of(id: i64) -> u16 {
        ((id >> SEQUENCE_BITS) & MAX_NODE_ID as i64) as u16
    }
}

impl std::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator")
            .field("node_id", &self.node_id)
            .field("epoch_ms", &self.epoch_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicI64;
    use std::sync::atomic::Ordering;

    use super::*;

    fn fixed_clock(at: Arc<AtomicI64>) -> ClockFn {
        Arc::new(move || at.load(Ordering::SeqCst))
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let generator = IdGenerator::new(3, crate::config::DEFAULT_EPOCH_MS).unwrap();
        let mut last = 0;
        let mut seen = HashSet::new();
        for _ in 0..20_000 {
            let id = generator.generate();
            assert!(id > last);
            assert!(seen.insert(id));
            assert_eq!(IdGenerator::node_of(id), 3);
            last = id;
        }
    }

    #[test]
    fn sequence_overflow_borrows_next_millisecond() {
        let clock = Arc::new(AtomicI64::new(10_000));
        let generator = IdGenerator::with_clock(1, 0, fixed_clock(clock)).unwrap();
        let ids: Vec<i64> = (0..5000).map(|_| generator.generate()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(IdGenerator::timestamp_of(ids[0]), 10_000);
        assert_eq!(IdGenerator::timestamp_of(ids[4999]), 10_001);
    }

    #[test]
    fn runtime_rollback_keeps_monotonicity() {
        let clock = Arc::new(AtomicI64::new(50_000));
        let generator = IdGenerator::with_clock(2, 0, fixed_clock(clock.clone())).unwrap();
        let before = generator.generate();
        clock.store(49_000, Ordering::SeqCst);
        let after = generator.generate();
        assert!(after > before);
    }

    #[test]
    fn startup_refuses_rolled_back_clock() {
        let clock = Arc::new(AtomicI64::new(100));
        assert!(matches!(
            IdGenerator::with_clock(1, 1_000, fixed_clock(clock.clone())),
            Err(Error::ClockRollback(_))
        ));

        let last_issued = 5_000i64 << TIMESTAMP_SHIFT;
        let tolerance = Duration::from_millis(10);
        clock.store(4_000, Ordering::SeqCst);
        assert!(matches!(
            IdGenerator::resume(1, 0, last_issued, tolerance, fixed_clock(clock.clone())),
            Err(Error::ClockRollback(_))
        ));

        clock.store(4_995, Ordering::SeqCst);
        let generator = IdGenerator::resume(1, 0, last_issued, tolerance, fixed_clock(clock)).unwrap();
        assert!(generator.generate() > last_issued);
    }
}
