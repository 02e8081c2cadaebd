//! Cancellation tokens and timeouts, unified behind one combinator that
//! enforces a single "exactly one trigger wins" suspension invariant: a
//! mutex-guarded list of registrations reachable across threads, racing an
//! inner future against a timer and/or a cancellation signal resolved with
//! a CAS rather than pointer juggling.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::error::Error;
use crate::group::{self, LoopId};
use crate::reactor::TimerId;
use crate::task;

type Trigger = Box<dyn FnOnce() + Send>;

struct CancellationTokenCore {
    canceled: AtomicBool,
    next_id: AtomicU64,
    waiters: Mutex<Vec<(u64, Trigger)>>,
}

impl CancellationTokenCore {
    fn new() -> Self {
        CancellationTokenCore {
            canceled: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Registers `trigger` to run exactly once, either immediately (if
    /// already canceled) or the next time `cancel()` runs. Returns `None`
    /// when it ran immediately, else an id usable with `unregister`.
    fn register(&self, trigger: Trigger) -> Option<u64> {
        if self.canceled.load(Ordering::SeqCst) {
            trigger();
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut waiters = self.waiters.lock();
        if self.canceled.load(Ordering::SeqCst) {
            drop(waiters);
            trigger();
            return None;
        }
        waiters.push((id, trigger));
        Some(id)
    }

    fn unregister(&self, id: u64) {
        self.waiters.lock().retain(|(i, _)| *i != id);
    }

    fn cancel(&self) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return; // already canceled; TriggerCancel runs at most once
        }
        let triggers: Vec<Trigger> = self.waiters.lock().drain(..).map(|(_, t)| t).collect();
        for t in triggers {
            t();
        }
    }
}

/// A cooperative cancellation signal, shareable across coroutines and
/// threads. Cancelling is idempotent and wakes every suspension currently
/// racing against this token, wherever its loop lives.
#[derive(Clone)]
pub struct CancellationToken {
    core: Arc<CancellationTokenCore>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        CancellationToken::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken {
            core: Arc::new(CancellationTokenCore::new()),
        }
    }

    pub fn cancel(&self) {
        self.core.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.core.canceled.load(Ordering::SeqCst)
    }
}

const ARMED: u8 = 0;
const WON_BY_INNER: u8 = 1;
const WON_BY_CANCEL: u8 = 2;
const WON_BY_TIMEOUT: u8 = 3;

/// Races an inner future against an optional [`CancellationToken`] and/or
/// timeout. Exactly one of "inner completed", "canceled", "timed out" wins;
/// the losers' side effects (a still-pending inner future, an unfired timer)
/// are torn down rather than left to fire later.
pub struct Cancelable<T> {
    inner: Pin<Box<dyn Future<Output = T>>>,
    state: Arc<AtomicU8>,
    token: Option<CancellationToken>,
    token_registration: Option<u64>,
    timeout: Option<Duration>,
    timer: Option<TimerId>,
    loop_id: Option<LoopId>,
    armed: bool,
}

impl<T: 'static> Cancelable<T> {
    pub fn new(inner: impl Future<Output = T> + 'static) -> Self {
        Cancelable {
            inner: Box::pin(inner),
            state: Arc::new(AtomicU8::new(ARMED)),
            token: None,
            token_registration: None,
            timeout: None,
            timer: None,
            loop_id: None,
            armed: false,
        }
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }
}

impl<T: 'static> Future for Cancelable<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match this.state.load(Ordering::SeqCst) {
            WON_BY_CANCEL => return Poll::Ready(Err(Error::canceled())),
            WON_BY_TIMEOUT => return Poll::Ready(Err(Error::timed_out())),
            _ => {}
        }

        if !this.armed {
            this.armed = true;
            let loop_id = task::current_loop_id();
            this.loop_id = Some(loop_id);

            if let Some(token) = &this.token {
                let state = this.state.clone();
                let waker = cx.waker().clone();
                let trigger: Trigger = Box::new(move || {
                    let _ = group::post_to(
                        loop_id,
                        Box::new(move || {
                            if state
                                .compare_exchange(ARMED, WON_BY_CANCEL, Ordering::SeqCst, Ordering::SeqCst)
                                .is_ok()
                            {
                                waker.wake();
                            }
                        }),
                    );
                });
                this.token_registration = token.core.register(trigger);
            }

            if let Some(dur) = this.timeout {
                let state = this.state.clone();
                let waker = cx.waker().clone();
                let timer_waker = task::make_trigger_waker(move || {
                    if state
                        .compare_exchange(ARMED, WON_BY_TIMEOUT, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        waker.wake_by_ref();
                    }
                });
                let deadline = crate::time::deadline_ms(dur);
                this.timer = Some(task::arm_timer_on_current_loop(deadline, timer_waker));
            }
        }

        match this.inner.as_mut().poll(cx) {
            Poll::Ready(value) => {
                if this
                    .state
                    .compare_exchange(ARMED, WON_BY_INNER, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    if let Some(id) = this.timer.take() {
                        id.invalidate();
                    }
                    if let (Some(token), Some(id)) = (&this.token, this.token_registration.take()) {
                        token.core.unregister(id);
                    }
                    Poll::Ready(Ok(value))
                } else {
                    // the race was already decided against us; report that
                    // outcome instead of the value we just (too late) produced
                    match this.state.load(Ordering::SeqCst) {
                        WON_BY_CANCEL => Poll::Ready(Err(Error::canceled())),
                        WON_BY_TIMEOUT => Poll::Ready(Err(Error::timed_out())),
                        _ => unreachable!("no other state can precede a lost CAS"),
                    }
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Suspends `fut` with a deadline; resolves to `Err(timed_out)` if `dur`
/// elapses first.
pub async fn timeout<T: 'static>(dur: Duration, fut: impl Future<Output = T> + 'static) -> Result<T, Error> {
    Cancelable::new(fut).with_timeout(dur).await
}

/// Suspends `fut`, aborting early with `Err(canceled)` if `token` fires.
pub async fn with_cancellation<T: 'static>(
    token: CancellationToken,
    fut: impl Future<Output = T> + 'static,
) -> Result<T, Error> {
    Cancelable::new(fut).with_token(token).await
}
