//! The blocking-work executor: a fixed-size OS thread pool that lets a
//! coroutine run CPU-bound or blocking work without stalling its loop.
//!
//! A classic condvar-guarded job queue with N worker threads. Completion is
//! reported by simply waking the `Waker` captured at the first poll of the
//! returned future — [`crate::task::TaskWaker`]'s own `Wake` impl already
//! knows how to route a wake-up from an arbitrary thread back to the
//! originating loop via [`crate::group`], so the worker thread needs no
//! special-cased "post to loop" path of its own.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::task::{Context, Poll, Waker};

use crate::error::{Error, ErrorKind};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    queue: Mutex<VecDeque<Job>>,
    cvar: Condvar,
    stopped: Mutex<bool>,
}

/// A fixed-size pool of OS threads dedicated to blocking work.
pub struct BlockingExecutor {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl BlockingExecutor {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(VecDeque::new()),
            cvar: Condvar::new(),
            stopped: Mutex::new(false),
        });
        let workers = (0..size)
            .map(|n| {
                let inner = inner.clone();
                std::thread::Builder::new()
                    .name(format!("coro-rt-blocking-{n}"))
                    .spawn(move || worker_loop(inner))
                    .expect("failed to spawn blocking-executor worker thread")
            })
            .collect();
        BlockingExecutor {
            inner,
            workers: Mutex::new(workers),
        }
    }

    fn is_stopped(&self) -> bool {
        *self.inner.stopped.lock().unwrap()
    }

    fn enqueue(&self, job: Job) -> Result<(), Error> {
        if self.is_stopped() {
            return Err(Error::thread_pool_stopped());
        }
        self.inner.queue.lock().unwrap().push_back(job);
        self.inner.cvar.notify_one();
        Ok(())
    }

    /// Submits `f` to run on a worker thread, returning a future that
    /// resolves once it completes (or with `thread_pool_stopped` if the
    /// pool had already shut down, or `invalid_state` if `f` panicked).
    pub fn submit<F, T>(&self, f: F) -> Execute<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::new(Mutex::new(Slot {
            done: false,
            result: None,
            waker: None,
        }));
        let slot_for_job = slot.clone();
        let submitted = self.enqueue(Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f));
            let mut s = slot_for_job.lock().unwrap();
            s.done = true;
            s.result = Some(result);
            let waker = s.waker.take();
            drop(s);
            if let Some(w) = waker {
                w.wake();
            }
        }));
        Execute {
            slot,
            submit_error: submitted.err(),
        }
    }

    pub fn shutdown(&self) {
        *self.inner.stopped.lock().unwrap() = true;
        self.inner.cvar.notify_all();
        let mut workers = self.workers.lock().unwrap();
        for w in workers.drain(..) {
            let _ = w.join();
        }
    }
}

impl Drop for BlockingExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        let job = {
            let mut queue = inner.queue.lock().unwrap();
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                if *inner.stopped.lock().unwrap() {
                    break None;
                }
                queue = inner.cvar.wait(queue).unwrap();
            }
        };
        match job {
            Some(job) => job(),
            None => return,
        }
    }
}

struct Slot<T> {
    done: bool,
    result: Option<std::thread::Result<T>>,
    waker: Option<Waker>,
}

/// Future returned by [`BlockingExecutor::submit`] / [`execute`].
pub struct Execute<T> {
    slot: Arc<Mutex<Slot<T>>>,
    submit_error: Option<Error>,
}

impl<T> Future for Execute<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(e) = self.submit_error.clone() {
            return Poll::Ready(Err(e));
        }
        let mut s = self.slot.lock().unwrap();
        if s.done {
            return Poll::Ready(match s.result.take().unwrap() {
                Ok(v) => Ok(v),
                Err(_) => Err(Error::new(ErrorKind::InvalidState, "blocking job panicked")),
            });
        }
        s.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

static POOL: OnceLock<BlockingExecutor> = OnceLock::new();

/// Sizes the process-wide blocking executor from the first loop's `Config`
/// to start up. Later calls (e.g. a second loop on another thread with a
/// different pool size) are no-ops; the pool is shared process-wide.
pub(crate) fn ensure_configured(size: usize) {
    if POOL.set(BlockingExecutor::new(size)).is_err() {
        log::debug!("blocking executor already configured; ignoring later pool-size request");
    }
}

fn global() -> &'static BlockingExecutor {
    POOL.get_or_init(|| BlockingExecutor::new(num_cpus::get()))
}

/// Runs `f` on the process-wide blocking executor, suspending the calling
/// coroutine until it finishes.
pub async fn execute<F, T>(f: F) -> Result<T, Error>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    global().submit(f).await
}

/// Namespacing handle for [`execute`], for callers who prefer a method call
/// to the free function.
pub struct Executor;

impl Executor {
    pub async fn execute<F, T>(f: F) -> Result<T, Error>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        execute(f).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_runs_job_and_reports_result() {
        let pool = BlockingExecutor::new(2);
        let out = futures_block_on(pool.submit(|| 2 + 2));
        assert_eq!(out.unwrap(), 4);
    }

    #[test]
    fn shutdown_then_submit_reports_thread_pool_stopped() {
        let pool = BlockingExecutor::new(1);
        pool.shutdown();
        let out = futures_block_on(pool.submit(|| 1));
        assert_eq!(out.unwrap_err().kind(), ErrorKind::ThreadPoolStopped);
    }

    /// Minimal single-future executor for unit tests that don't need a full
    /// event loop: spins on `poll` with a no-op waker until `Ready`.
    fn futures_block_on<T>(mut fut: impl Future<Output = T> + Unpin) -> T {
        use std::task::{RawWaker, RawWakerVTable};
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        fn noop(_: *const ()) {}
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
        let waker = unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) };
        let mut cx = Context::from_waker(&waker);
        loop {
            if let Poll::Ready(v) = Pin::new(&mut fut).poll(&mut cx) {
                return v;
            }
            std::thread::yield_now();
        }
    }
}
