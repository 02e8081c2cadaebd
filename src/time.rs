//! Monotonic-millisecond time helpers.
//!
//! The timer wheel (§4.2) keys wake-ups by absolute monotonic milliseconds
//! rather than `Instant` directly so that heap entries are `Copy`/`Ord`
//! without dragging `Instant`'s platform-specific representation through
//! the public API.

use std::time::{Duration, Instant};

/// A monotonic timestamp in milliseconds, relative to an arbitrary process
/// epoch (the first call to [`Clock::now`]).
pub type MillisTime = u64;

/// Process-wide monotonic clock anchor.
pub struct Clock {
    origin: Instant,
}

impl Clock {
    const fn new(origin: Instant) -> Self {
        Clock { origin }
    }

    pub fn now(&self) -> MillisTime {
        self.origin.elapsed().as_millis() as MillisTime
    }

    pub fn deadline_in(&self, d: Duration) -> MillisTime {
        self.now().saturating_add(d.as_millis() as MillisTime)
    }
}

thread_local! {
    // Each thread gets its own anchor; timestamps are only ever compared
    // within a single event loop (thread), so this is sound and avoids a
    // process-wide OnceLock.
    static CLOCK: Clock = Clock::new(Instant::now());
}

/// Current monotonic time in milliseconds, anchored per-thread.
pub fn now_ms() -> MillisTime {
    CLOCK.with(|c| c.now())
}

/// Monotonic deadline `d` from now, in milliseconds.
pub fn deadline_ms(d: Duration) -> MillisTime {
    CLOCK.with(|c| c.deadline_in(d))
}
