//! Condition variable built on [`Lock`]: a queue of waiters plus
//! `notify_one`/`notify_all`, each waiter tagged so a genuine notify can be
//! told apart from a spurious re-poll.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use super::lock::LockGuard;
use crate::cancellation::CancellationToken;
use crate::error::Error;

struct Waiter {
    waker: Waker,
    signaled: Rc<Cell<bool>>,
}

/// A condition variable for coroutines sharing a [`Lock`] on the same loop.
#[derive(Clone, Default)]
pub struct Condition {
    waiters: Rc<RefCell<VecDeque<Waiter>>>,
}

impl Condition {
    pub fn new() -> Self {
        Condition {
            waiters: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Releases `guard`, suspends until notified, then re-acquires the same
    /// lock before resolving — the usual condvar protocol, so the caller
    /// never observes the lock unheld after `wait` returns.
    pub async fn wait(&self, guard: LockGuard) -> LockGuard {
        let lock_core = guard.core.clone();
        drop(guard);
        self.signal().await;
        super::lock::Lock::from_core(lock_core).acquire().await
    }

    /// Like [`Condition::wait`], but gives up and reports `timed_out` if
    /// `dur` elapses with no notification. Either way the lock is
    /// re-acquired before this returns, so the caller always gets it back
    /// held, exactly as a plain `wait` would.
    pub async fn wait_for(&self, guard: LockGuard, dur: Duration) -> (LockGuard, Result<(), Error>) {
        let lock_core = guard.core.clone();
        drop(guard);
        let outcome = crate::cancellation::timeout(dur, self.signal()).await;
        let guard = super::lock::Lock::from_core(lock_core).acquire().await;
        (guard, outcome)
    }

    /// Like [`Condition::wait`], but gives up and reports `canceled` if
    /// `token` fires first. The lock is re-acquired before this returns
    /// regardless of which side won the race.
    pub async fn wait_cancelable(&self, guard: LockGuard, token: CancellationToken) -> (LockGuard, Result<(), Error>) {
        let lock_core = guard.core.clone();
        drop(guard);
        let outcome = crate::cancellation::with_cancellation(token, self.signal()).await;
        let guard = super::lock::Lock::from_core(lock_core).acquire().await;
        (guard, outcome)
    }

    fn signal(&self) -> WaitSignal {
        WaitSignal {
            waiters: self.waiters.clone(),
            signaled: Rc::new(Cell::new(false)),
            queued: false,
        }
    }

    /// Wakes the longest-waiting coroutine, if any.
    pub fn notify_one(&self) {
        if let Some(w) = self.waiters.borrow_mut().pop_front() {
            w.signaled.set(true);
            w.waker.wake();
        }
    }

    /// Wakes every currently-waiting coroutine.
    pub fn notify_all(&self) {
        let drained: Vec<Waiter> = self.waiters.borrow_mut().drain(..).collect();
        for w in drained {
            w.signaled.set(true);
            w.waker.wake();
        }
    }

    pub fn waiting_count(&self) -> usize {
        self.waiters.borrow().len()
    }
}

struct WaitSignal {
    waiters: Rc<RefCell<VecDeque<Waiter>>>,
    signaled: Rc<Cell<bool>>,
    queued: bool,
}

impl Future for WaitSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.signaled.get() {
            return Poll::Ready(());
        }
        if !self.queued {
            self.waiters.borrow_mut().push_back(Waiter {
                waker: cx.waker().clone(),
                signaled: self.signaled.clone(),
            });
            self.queued = true;
        }
        Poll::Pending
    }
}

impl Drop for WaitSignal {
    fn drop(&mut self) {
        // A signal dropped before it fired (the coroutine holding it was
        // itself dropped, or lost a `timeout`/`with_cancellation` race) must
        // pull its entry out of the queue — otherwise a later `notify_one`
        // wakes a `Waker` nobody is polling anymore instead of a real
        // waiter, silently swallowing that notification.
        if self.queued && !self.signaled.get() {
            self.waiters
                .borrow_mut()
                .retain(|w| !Rc::ptr_eq(&w.signaled, &self.signaled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Lock;

    #[test]
    fn notify_one_wakes_a_single_waker() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use std::task::{RawWaker, RawWakerVTable};

        fn noop_raw() -> RawWaker {
            fn clone(_: *const ()) -> RawWaker {
                noop_raw()
            }
            fn noop(_: *const ()) {}
            static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        let _ = AtomicUsize::new(0);
        let _ = Arc::new(());

        let cond = Condition::new();
        assert_eq!(cond.waiting_count(), 0);
        let waker = unsafe { Waker::from_raw(noop_raw()) };
        cond.waiters.borrow_mut().push_back(Waiter {
            waker,
            signaled: Rc::new(Cell::new(false)),
        });
        assert_eq!(cond.waiting_count(), 1);
        cond.notify_one();
        assert_eq!(cond.waiting_count(), 0);
    }

    #[test]
    fn lock_is_reusable_after_condition_wait_setup() {
        let lock = Lock::new();
        let guard = lock.try_acquire().unwrap();
        drop(guard);
        assert!(!lock.is_locked());
    }

    /// A notify delivered before the deadline resolves `wait_for` early with
    /// `Ok`, and the lock is held again by the time it returns.
    #[test]
    fn wait_for_resolves_early_when_notified_before_the_deadline() {
        use crate::config::Config;
        use crate::event_loop::EventLoop;
        use std::time::Duration;

        let (timed_out, held_after) = EventLoop::run_new(Config::new(), async {
            let lock = Lock::new();
            let cond = Condition::new();

            let notifier_cond = cond.clone();
            let notifier = crate::task::spawn(async move {
                while notifier_cond.waiting_count() == 0 {
                    crate::task::yield_now().await;
                }
                notifier_cond.notify_one();
            });

            let guard = lock.acquire().await;
            let (guard, outcome) = cond.wait_for(guard, Duration::from_millis(500)).await;
            notifier.await.unwrap();
            let held_after = lock.is_locked();
            drop(guard);
            (outcome.is_err(), held_after)
        });
        assert!(!timed_out);
        assert!(held_after);
    }

    /// A `wait_for` that times out must remove its own queue entry so a
    /// later `notify_one` reaches a real waiter instead of the timed-out one.
    #[test]
    fn timed_out_wait_does_not_swallow_a_later_notify() {
        use crate::config::Config;
        use crate::event_loop::EventLoop;
        use std::time::Duration;

        let woken = Rc::new(Cell::new(false));
        EventLoop::run_new(Config::new(), {
            let woken = woken.clone();
            async move {
                let lock = Lock::new();
                let cond = Condition::new();

                let guard = lock.acquire().await;
                let (guard, outcome) = cond.wait_for(guard, Duration::from_millis(5)).await;
                assert!(outcome.is_err());
                drop(guard);

                let lock2 = lock.clone();
                let cond2 = cond.clone();
                let woken2 = woken.clone();
                let h = crate::task::spawn(async move {
                    let guard = lock2.acquire().await;
                    let _guard = cond2.wait(guard).await;
                    woken2.set(true);
                });
                crate::task::yield_now().await;
                crate::task::yield_now().await;
                cond.notify_one();
                h.await.unwrap();
            }
        });
        assert!(woken.get());
    }
}
