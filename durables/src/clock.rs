//! The injectable time provider the spec keeps external (§4.8, §4.13):
//! whole-second Unix timestamps for time-window buffers, and a millisecond
//! tick counter for the cancellation source's request/delay/expiration
//! arithmetic. One trait serves both call sites; the unit is a convention of
//! the caller, same spirit as [`crate::codec::ValueCodec`] being injected
//! rather than hard-wired.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Whole-second Unix timestamp. Monotonicity is not required.
    fn now_seconds(&self) -> i64;
    /// Millisecond tick counter used by the cancellation source.
    fn now_ticks(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_seconds(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn now_ticks(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
