//! Snowflake-style distributed ID generation.
//!
//! Layout: 41-bit millisecond timestamp (relative to [`EPOCH_MS`]), 10-bit
//! node ID, 12-bit per-millisecond sequence. A single node therefore mints
//! strictly increasing, collision-free 64-bit IDs under arbitrary concurrent
//! callers; cross-node uniqueness relies on operators assigning distinct
//! node IDs.

use crate::error::BisubError;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Epoch the 41-bit timestamp counts from (2010-11-04T01:42:54.657Z).
pub const EPOCH_MS: i64 = 1_288_834_974_657;

const NODE_BITS: u8 = 10;
const SEQ_BITS: u8 = 12;
const MAX_NODE: u16 = (1 << NODE_BITS) - 1;
const SEQ_MASK: i64 = (1 << SEQ_BITS) - 1;
const TIMESTAMP_SHIFT: u8 = NODE_BITS + SEQ_BITS;

/// Decoded timestamps further in the future than this are rejected by
/// [`SnowflakeGenerator::validate`].
const FUTURE_GRACE_SECS: i64 = 60;

#[derive(Debug)]
struct GeneratorState {
    last_ms: i64,
    sequence: i64,
}

/// A single generator node. Explicitly constructed and passed by reference;
/// there is no process-global instance.
#[derive(Debug)]
pub struct SnowflakeGenerator {
    node_id: u16,
    state: Mutex<GeneratorState>,
}

impl SnowflakeGenerator {
    pub fn new(node_id: u16) -> Result<Self, BisubError> {
        if node_id > MAX_NODE {
            return Err(BisubError::InvalidId(format!(
                "node id {node_id} out of range 0..={MAX_NODE}"
            )));
        }
        Ok(Self {
            node_id,
            state: Mutex::new(GeneratorState {
                last_ms: 0,
                sequence: 0,
            }),
        })
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// Mints the next ID. Within one millisecond the sequence increments;
    /// on exhaustion the call spins until the clock advances.
    pub fn generate(&self) -> i64 {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut now = current_ms();
        // A clock step backwards must not hand out smaller IDs; hold the
        // line at the last observed millisecond.
        if now < state.last_ms {
            now = state.last_ms;
        }

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQ_MASK;
            if state.sequence == 0 {
                while now <= state.last_ms {
                    now = current_ms();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        ((now - EPOCH_MS) << TIMESTAMP_SHIFT) | (i64::from(self.node_id) << SEQ_BITS) | state.sequence
    }

    /// Recovers the generation time encoded in `id`.
    pub fn parse_timestamp(id: i64) -> DateTime<Utc> {
        let ms = (id >> TIMESTAMP_SHIFT) + EPOCH_MS;
        Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
    }

    /// Rejects non-positive IDs and IDs whose decoded timestamp lies more
    /// than a short grace period in the future.
    pub fn validate(id: i64) -> Result<(), BisubError> {
        if id <= 0 {
            return Err(BisubError::InvalidId(format!("non-positive ID: {id}")));
        }
        let ts = Self::parse_timestamp(id);
        if ts > Utc::now() + chrono::Duration::seconds(FUTURE_GRACE_SECS) {
            return Err(BisubError::InvalidId(format!(
                "timestamp is in the future: {ts}"
            )));
        }
        Ok(())
    }
}

fn current_ms() -> i64 {
    // Pre-epoch system clocks are not supported; saturate at zero.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Bounded buffer of pre-generated IDs.
///
/// `get` never blocks: it pops a buffered ID when one is available and falls
/// back to synchronous generation otherwise. After a successful pop a
/// detached task tops the buffer back up to half capacity; the refill mutex
/// keeps concurrent refills from over-filling.
pub struct IdPool {
    generator: Arc<SnowflakeGenerator>,
    buffer: Arc<Mutex<VecDeque<i64>>>,
    refill_guard: Arc<tokio::sync::Mutex<()>>,
    capacity: usize,
}

impl IdPool {
    pub fn new(generator: Arc<SnowflakeGenerator>, capacity: usize) -> Self {
        let mut initial = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            initial.push_back(generator.generate());
        }
        Self {
            generator,
            buffer: Arc::new(Mutex::new(initial)),
            refill_guard: Arc::new(tokio::sync::Mutex::new(())),
            capacity,
        }
    }

    /// Pops a pre-generated ID, or generates one inline when the pool is
    /// drained. Never waits on the refill task.
    pub fn get(&self) -> i64 {
        let popped = self
            .buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();

        match popped {
            Some(id) => {
                self.spawn_refill();
                id
            }
            None => {
                debug!("ID pool empty, generating inline");
                self.generator.generate()
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    fn spawn_refill(&self) {
        let generator = Arc::clone(&self.generator);
        let buffer = Arc::clone(&self.buffer);
        let guard = Arc::clone(&self.refill_guard);
        let target = self.capacity / 2;

        tokio::spawn(async move {
            // One in-flight refill at a time; later requests queue behind
            // the mutex and find the buffer already topped up.
            let _held = guard.lock().await;
            loop {
                let mut buf = buffer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if buf.len() >= target {
                    break;
                }
                buf.push_back(generator.generate());
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn ids_are_strictly_increasing() {
        let node = SnowflakeGenerator::new(1).unwrap();
        let mut last = 0;
        for _ in 0..10_000 {
            let id = node.generate();
            assert!(id > last, "expected {id} > {last}");
            last = id;
        }
    }

    #[test]
    fn parse_timestamp_round_trips() {
        let node = SnowflakeGenerator::new(42).unwrap();
        let before = Utc::now();
        let id = node.generate();
        let decoded = SnowflakeGenerator::parse_timestamp(id);
        let delta = (decoded - before).num_milliseconds().abs();
        assert!(delta < 1000, "decoded timestamp off by {delta}ms");
    }

    #[test]
    fn concurrent_callers_never_collide() {
        let node = Arc::new(SnowflakeGenerator::new(7).unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let node = Arc::clone(&node);
            handles.push(std::thread::spawn(move || {
                (0..2_000).map(|_| node.generate()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 8 * 2_000);
    }

    #[test]
    fn node_id_out_of_range_is_rejected() {
        assert!(SnowflakeGenerator::new(1023).is_ok());
        let err = SnowflakeGenerator::new(1024).unwrap_err();
        assert!(matches!(err, BisubError::InvalidId(_)));
    }

    #[test]
    fn validate_rejects_forged_ids() {
        assert!(matches!(
            SnowflakeGenerator::validate(0),
            Err(BisubError::InvalidId(_))
        ));
        assert!(matches!(
            SnowflakeGenerator::validate(-5),
            Err(BisubError::InvalidId(_))
        ));

        let node = SnowflakeGenerator::new(3).unwrap();
        assert!(SnowflakeGenerator::validate(node.generate()).is_ok());

        // Timestamp two hours ahead of the wall clock.
        let future_ms = super::current_ms() - EPOCH_MS + 2 * 3600 * 1000;
        let forged = future_ms << TIMESTAMP_SHIFT;
        assert!(SnowflakeGenerator::validate(forged).is_err());
    }

    #[tokio::test]
    async fn pool_pops_then_falls_back_to_inline_generation() {
        let node = Arc::new(SnowflakeGenerator::new(9).unwrap());
        let pool = IdPool::new(Arc::clone(&node), 4);
        assert_eq!(pool.buffered(), 4);

        let mut ids: Vec<i64> = (0..16).map(|_| pool.get()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16, "pool and inline IDs must all be distinct");
    }

    #[tokio::test]
    async fn refill_tops_up_to_half_capacity() {
        let node = Arc::new(SnowflakeGenerator::new(11).unwrap());
        let pool = IdPool::new(Arc::clone(&node), 8);

        while pool.buffered() > 0 {
            pool.get();
        }
        // Let the detached refill run.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if pool.buffered() >= 4 {
                break;
            }
        }
        assert!(pool.buffered() >= 4, "refill should reach half capacity");
        assert!(pool.buffered() <= 8);
    }
}
