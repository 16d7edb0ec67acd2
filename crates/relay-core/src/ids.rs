//! Snowflake-style request id generation.
//!
//! Layout (most significant first): 41 bits of milliseconds since
//! [`EPOCH_MILLIS`], 10 bits of worker id, 12 bits of per-millisecond sequence.
//! Ids from one generator are strictly increasing, even when the wall clock
//! steps backwards.

use parking_lot::Mutex;

use crate::header::now_millis;

/// 2024-01-01T00:00:00Z.
pub const EPOCH_MILLIS: i64 = 1_704_067_200_000;

const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_WORKER: u16 = (1 << WORKER_BITS) - 1;
const SEQUENCE_MASK: u16 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug, Default)]
struct State {
    last_millis: i64,
    sequence: u16,
}

/// Thread-safe request id generator.
#[derive(Debug)]
pub struct RequestIdGenerator {
    worker_id: u16,
    state: Mutex<State>,
}

impl RequestIdGenerator {
    /// Generator for `worker_id`; values above 1023 are masked.
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: worker_id & MAX_WORKER,
            state: Mutex::new(State::default()),
        }
    }

    /// Next id.
    pub fn next_id(&self) -> u64 {
        self.next_at(now_millis() - EPOCH_MILLIS)
    }

    fn next_at(&self, elapsed: i64) -> u64 {
        let mut state = self.state.lock();
        let mut millis = elapsed.max(state.last_millis);
        if millis == state.last_millis {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted for this millisecond; borrow the next one.
                millis += 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_millis = millis;

        let millis = u64::try_from(millis).unwrap_or(0);
        (millis << (WORKER_BITS + SEQUENCE_BITS))
            | (u64::from(self.worker_id) << SEQUENCE_BITS)
            | u64::from(state.sequence)
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let generator = RequestIdGenerator::new(3);
        let mut last = 0;
        for _ in 0..10_000 {
            let id = generator.next_id();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn clock_going_backwards_keeps_order() {
        let generator = RequestIdGenerator::new(1);
        let a = generator.next_at(5_000);
        let b = generator.next_at(4_000);
        assert!(b > a);
    }

    #[test]
    fn sequence_overflow_borrows_next_millisecond() {
        let generator = RequestIdGenerator::new(0);
        let mut last = generator.next_at(100);
        for _ in 0..=SEQUENCE_MASK {
            let id = generator.next_at(100);
            assert!(id > last);
            last = id;
        }
        assert_eq!(last >> (WORKER_BITS + SEQUENCE_BITS), 101);
    }

    #[test]
    fn worker_id_embedded() {
        let generator = RequestIdGenerator::new(0x3FF);
        let id = generator.next_at(1);
        assert_eq!((id >> SEQUENCE_BITS) & u64::from(MAX_WORKER), 0x3FF);
    }

    #[test]
    fn worker_id_masked() {
        let generator = RequestIdGenerator::new(0xFFFF);
        assert_eq!(generator.worker_id, MAX_WORKER);
    }
}
