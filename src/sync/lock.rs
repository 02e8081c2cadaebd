//! FIFO mutex: at most one holder at a time, waiters served in arrival
//! order over a wait queue.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

pub(crate) struct LockCore {
    locked: bool,
    waiters: VecDeque<Waker>,
}

/// A mutex for coroutines on the same loop. Unlike `std::sync::Mutex`,
/// `acquire` suspends the calling coroutine rather than blocking the OS
/// thread, and waiters are released strictly in FIFO order, so no waiter is
/// starved indefinitely while others keep acquiring and releasing.
#[derive(Clone)]
pub struct Lock {
    core: Rc<RefCell<LockCore>>,
}

impl Default for Lock {
    fn default() -> Self {
        Lock::new()
    }
}

impl Lock {
    pub fn new() -> Self {
        Lock {
            core: Rc::new(RefCell::new(LockCore {
                locked: false,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Rewraps an already-held lock's core, used by [`super::Condition::wait`]
    /// to reacquire the same lock after being notified.
    pub(crate) fn from_core(core: Rc<RefCell<LockCore>>) -> Self {
        Lock { core }
    }

    /// Suspends until the lock is held by this coroutine, returning a guard
    /// that releases it on drop.
    pub fn acquire(&self) -> Acquire {
        Acquire {
            core: self.core.clone(),
            queued: false,
        }
    }

    /// Acquires without suspending if the lock is free; otherwise returns
    /// `None` immediately without joining the wait queue.
    pub fn try_acquire(&self) -> Option<LockGuard> {
        let mut c = self.core.borrow_mut();
        if c.locked {
            None
        } else {
            c.locked = true;
            Some(LockGuard { core: self.core.clone() })
        }
    }

    pub fn is_locked(&self) -> bool {
        self.core.borrow().locked
    }
}

/// Future returned by [`Lock::acquire`].
pub struct Acquire {
    core: Rc<RefCell<LockCore>>,
    queued: bool,
}

impl Future for Acquire {
    type Output = LockGuard;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<LockGuard> {
        let this = self.get_mut();
        let mut c = this.core.borrow_mut();
        // A fresh caller may only take the fast path when no one is already
        // queued — otherwise it would jump ahead of them. A waiter already
        // in the queue was only woken because it reached the front (see
        // `LockGuard::drop`), so once `queued`, an unlocked mutex is always
        // ours regardless of who else has since joined the back of the line.
        if !c.locked && (this.queued || c.waiters.is_empty()) {
            c.locked = true;
            return Poll::Ready(LockGuard { core: this.core.clone() });
        }
        if !this.queued {
            c.waiters.push_back(cx.waker().clone());
            this.queued = true;
        }
        Poll::Pending
    }
}

/// RAII guard: the lock is held for as long as this value lives. Dropping it
/// releases the lock and wakes the next FIFO waiter, if any.
pub struct LockGuard {
    pub(crate) core: Rc<RefCell<LockCore>>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let next = {
            let mut c = self.core.borrow_mut();
            c.locked = false;
            c.waiters.pop_front()
        };
        if let Some(waker) = next {
            waker.wake();
        }
    }
}
