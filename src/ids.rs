//! Snowflake-style user ids.
//!
//! ```text
//! | 1 bit: zero | 41 bits: ms since 2024-01-01 | 12 bits: worker | 10 bits: sequence |
//! ```
//!
//! The top bit is always clear so ids fit a Postgres `BIGINT` as positive values.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use thiserror::Error;

/// 2024-01-01 00:00:00 UTC in ms since the Unix epoch.
const EPOCH_MS: u64 = 1_704_067_200_000;

const TIMESTAMP_BITS: u32 = 41;
const WORKER_BITS: u32 = 12;
const SEQUENCE_BITS: u32 = 10;

const TIMESTAMP_MASK: u64 = (1 << TIMESTAMP_BITS) - 1;
pub const WORKER_MASK: u64 = (1 << WORKER_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug, Error)]
pub enum IdError {
    #[error("system clock is before Unix epoch")]
    SystemClock,
    #[error("system clock moved backwards by {0} ms")]
    ClockMovedBackwards(u64),
}

/// Source of globally unique user ids.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> Result<i64, IdError>;
}

struct FlakeState {
    last_timestamp: u64,
    sequence: u64,
}

pub struct Snowflake {
    worker: u64,
    state: Mutex<FlakeState>,
}

impl Snowflake {
    pub fn new(worker: u16) -> Self {
        Self {
            worker: u64::from(worker) & WORKER_MASK,
            state: Mutex::new(FlakeState {
                last_timestamp: 0,
                sequence: 0,
            }),
        }
    }

    /// Worker id from OS entropy mixed with the PID, for processes that were
    /// not assigned one explicitly.
    pub fn from_entropy() -> Self {
        let pid = u64::from(std::process::id());
        let worker = (rand::random::<u64>() ^ pid) & WORKER_MASK;
        Self::new(worker as u16)
    }

    pub fn worker(&self) -> u16 {
        self.worker as u16
    }

    fn now_ms() -> Result<u64, IdError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| IdError::SystemClock)?
            .as_millis() as u64;
        Ok(now.saturating_sub(EPOCH_MS) & TIMESTAMP_MASK)
    }

    fn compose(&self, timestamp: u64, sequence: u64) -> i64 {
        ((timestamp << (WORKER_BITS + SEQUENCE_BITS)) | (self.worker << SEQUENCE_BITS) | sequence)
            as i64
    }
}

impl IdGenerator for Snowflake {
    fn next_id(&self) -> Result<i64, IdError> {
        loop {
            let timestamp = Self::now_ms()?;
            let mut state = self.state.lock();

            if timestamp > state.last_timestamp {
                state.last_timestamp = timestamp;
                state.sequence = 0;
                return Ok(self.compose(timestamp, 0));
            }

            // Same millisecond, or the clock stepped back: stay on the last
            // timestamp so ids remain monotonic.
            if state.sequence < SEQUENCE_MASK {
                state.sequence += 1;
                return Ok(self.compose(state.last_timestamp, state.sequence));
            }

            // Sequence exhausted. Only the rest of the current millisecond is
            // waited out; callers run on async workers.
            if timestamp < state.last_timestamp {
                return Err(IdError::ClockMovedBackwards(state.last_timestamp - timestamp));
            }
            drop(state);
            std::thread::yield_now();
        }
    }
}
