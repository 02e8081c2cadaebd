//! Coroutine-aware synchronization primitives: a FIFO mutex and a condition
//! variable built on top of it.
//!
//! Both primitives are intra-loop only (`Rc`, not `Send`): these are
//! coroutine synchronization, and coroutines sharing a `Lock` or `Condition`
//! are, by construction, all running on the one loop that created it.
//! Coordinating across loops is the dispatcher's job, not the lock's.

mod condition;
mod lock;

pub use condition::Condition;
pub use lock::{Lock, LockGuard};
