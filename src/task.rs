//! Task/awaiter core: spawning, joining, and the scheduler glue that lets a
//! `Future` park itself on the loop's ready queue.
//!
//! A coroutine is a heap-allocated, boxed `Future` that knows how to resume
//! itself and stores its result until a joiner collects it; the loop's ready
//! queue holds plain `Waker`s rather than stack-switching contexts, since
//! this runtime represents a coroutine as a language-native async task
//! rather than a stack-switched frame.

use std::cell::RefCell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use crate::error::{Error, ErrorKind};
use crate::event_loop::{self, EventLoop};
use crate::group::LoopId;

/// A boxed, type-erased coroutine frame: anything pollable to `()`, since a
/// task's return value is collected separately through its `JoinState`.
type BoxedFrame = Pin<Box<dyn Future<Output = ()>>>;

struct JoinState<T> {
    result: RefCell<Option<std::thread::Result<T>>>,
    waker: RefCell<Option<Waker>>,
}

/// Handle to a spawned task's eventual result. Awaiting it suspends the
/// calling coroutine until the spawned one completes.
pub struct JoinHandle<T> {
    state: Rc<JoinState<T>>,
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.state.result.borrow_mut();
        if let Some(result) = slot.take() {
            return Poll::Ready(match result {
                Ok(v) => Ok(v),
                Err(_) => Err(Error::new(ErrorKind::InvalidState, "spawned task panicked")),
            });
        }
        *self.state.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// A waker that, when woken, reschedules its task onto the owning loop's
/// ready queue. Carries a `LoopId` (not an `Rc` to the loop itself) so that
/// the waker remains `Send + Sync` and can be handed to, e.g., a blocking-
/// executor worker thread; waking from that thread routes back through
/// [`crate::group::LoopShared::post`] rather than touching the loop's
/// thread-local state directly.
struct TaskWaker {
    loop_id: LoopId,
    task_id: usize,
}

thread_local! {
    static CURRENT_LOOP: RefCell<Option<Rc<RefCell<EventLoop>>>> = RefCell::new(None);
}

/// Installs `lp` as the loop driving this thread for the duration of `f`.
/// Used by [`EventLoop::run_new`] so that `spawn` calls made from inside a
/// running coroutine know which loop's ready queue to push onto.
pub(crate) fn with_current_loop<R>(lp: &Rc<RefCell<EventLoop>>, f: impl FnOnce() -> R) -> R {
    CURRENT_LOOP.with(|cell| *cell.borrow_mut() = Some(lp.clone()));
    let result = f();
    CURRENT_LOOP.with(|cell| *cell.borrow_mut() = None);
    result
}

pub(crate) fn current_loop() -> Rc<RefCell<EventLoop>> {
    CURRENT_LOOP.with(|cell| {
        cell.borrow()
            .clone()
            .expect("coro_rt API used outside of a running event loop")
    })
}

/// If this thread's current loop is `loop_id`, runs `f` against it and
/// returns true. Otherwise a no-op returning false, leaving the caller to
/// fall back to a cross-thread post.
pub(crate) fn try_with_loop(loop_id: LoopId, f: impl FnOnce(&mut EventLoop)) -> bool {
    let lp = CURRENT_LOOP.with(|cell| cell.borrow().clone());
    match lp {
        Some(lp) if lp.borrow().id() == loop_id => {
            f(&mut lp.borrow_mut());
            true
        }
        _ => false,
    }
}

/// `Wake` impl used for a task's `std::task::Waker`; a woken task is
/// rescheduled by posting its id back onto the owning loop's ready queue via
/// `event_loop::wake_task`, which is a direct push when called from the
/// loop's own thread and a `LoopShared::post` hand-off otherwise.
impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        event_loop::wake_task(self.loop_id, self.task_id);
    }
    fn wake_by_ref(self: &Arc<Self>) {
        event_loop::wake_task(self.loop_id, self.task_id);
    }
}

pub(crate) fn make_waker(loop_id: LoopId, task_id: usize) -> Waker {
    Waker::from(Arc::new(TaskWaker { loop_id, task_id }))
}

/// Returns the id of the loop currently driving this thread.
pub(crate) fn current_loop_id() -> LoopId {
    current_loop().borrow().id()
}

/// Arms a one-shot timer on the current loop's timer wheel.
pub(crate) fn arm_timer_on_current_loop(
    deadline: crate::time::MillisTime,
    waker: Waker,
) -> crate::reactor::TimerId {
    current_loop().borrow_mut().arm_timer(deadline, waker)
}

/// Builds a `Waker` that runs an arbitrary callback instead of rescheduling
/// a task, used by [`crate::cancellation::Cancelable`] to hook the timer
/// wheel and cancellation-token registrations into its own CAS-guarded race
/// resolution rather than the normal task-resume path.
pub(crate) fn make_trigger_waker<F: Fn() + Send + Sync + 'static>(f: F) -> Waker {
    struct FnWake<F>(F);
    impl<F: Fn() + Send + Sync + 'static> Wake for FnWake<F> {
        fn wake(self: Arc<Self>) {
            (self.0)();
        }
        fn wake_by_ref(self: &Arc<Self>) {
            (self.0)();
        }
    }
    Waker::from(Arc::new(FnWake(f)))
}

/// Spawns `future` as a new coroutine on the current loop, returning a
/// handle that can be awaited for its result. Panics inside `future` are
/// caught (when `Config::catch_panics` is set) and surfaced as an
/// `invalid_state` error to the joiner rather than unwinding the loop.
pub fn spawn<F, T>(future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + 'static,
    T: 'static,
{
    let state = Rc::new(JoinState {
        result: RefCell::new(None),
        waker: RefCell::new(None),
    });
    let state_for_frame = state.clone();
    let catch_panics = current_loop().borrow().catch_panics();

    let frame: BoxedFrame = Box::pin(async move {
        let result = if catch_panics {
            AssertUnwindSafe(future).catch_unwind().await
        } else {
            Ok(future.await)
        };
        *state_for_frame.result.borrow_mut() = Some(result);
        if let Some(w) = state_for_frame.waker.borrow_mut().take() {
            w.wake();
        }
    });

    current_loop().borrow_mut().spawn_frame(frame);
    JoinHandle { state }
}

/// Extension trait providing `catch_unwind` for an arbitrary future, used by
/// `spawn` to convert a panicking coroutine into a reported failure rather
/// than an aborted thread.
trait CatchUnwindExt: Future + Sized {
    fn catch_unwind(self) -> CatchUnwind<Self> {
        CatchUnwind { inner: self }
    }
}
impl<F: Future> CatchUnwindExt for F {}

struct CatchUnwind<F> {
    inner: F,
}

impl<F: Future> Future for CatchUnwind<F> {
    type Output = std::thread::Result<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: `inner` is only ever moved by `Pin` projection here; we
        // never move out of `self` ourselves.
        let inner = unsafe { self.map_unchecked_mut(|s| &mut s.inner) };
        panic::catch_unwind(AssertUnwindSafe(|| inner.poll(cx))).map_or_else(
            |payload| Poll::Ready(Err(payload)),
            |poll| poll.map(Ok),
        )
    }
}

/// Suspends the calling coroutine until the loop has processed at least one
/// more tick, without otherwise waiting on anything.
pub async fn yield_now() {
    struct YieldOnce(bool);
    impl Future for YieldOnce {
        type Output = ();
        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 {
                Poll::Ready(())
            } else {
                self.0 = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
    YieldOnce(false).await
}

/// Suspends the calling coroutine until `dur` has elapsed, scheduled on the
/// owning loop's timer wheel.
pub async fn sleep_for(dur: std::time::Duration) {
    struct Sleep {
        deadline: crate::time::MillisTime,
        armed: Option<crate::reactor::TimerId>,
    }
    impl Future for Sleep {
        type Output = ();
        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if crate::time::now_ms() >= self.deadline {
                return Poll::Ready(());
            }
            if self.armed.is_none() {
                let id = current_loop()
                    .borrow_mut()
                    .arm_timer(self.deadline, cx.waker().clone());
                self.armed = Some(id);
            }
            Poll::Pending
        }
    }
    impl Drop for Sleep {
        fn drop(&mut self) {
            if let Some(id) = &self.armed {
                id.invalidate();
            }
        }
    }
    Sleep {
        deadline: crate::time::deadline_ms(dur),
        armed: None,
    }
    .await
}
