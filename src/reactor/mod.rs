//! The reactor half of a loop: the kernel poller and the timer wheel. The
//! cross-thread posting table lives in [`crate::group`] instead, because it
//! is the cross-thread entry point and is naturally owned by the same `Arc`
//! the event-loop group hands out.

pub mod poller;
pub mod timer;

pub use poller::{IoDirection, Poller};
pub use timer::{TimerId, TimerWheel};
