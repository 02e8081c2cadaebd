//! The event loop: one per thread, driving its own poller, timer wheel, and
//! ready queue through a seven-step tick: compute a timeout, poll, drain
//! cross-thread-posted work, fire due timers, resume ready coroutines in
//! FIFO order, then clean up finished frames — never interleaving "resume"
//! with "destroy" so that a coroutine dropping another coroutine's frame
//! can't invalidate state the loop is still iterating over.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use slab::Slab;

use crate::config::Config;
use crate::group::{self, LoopId, LoopShared};
use crate::reactor::{Poller, TimerId, TimerWheel};
use crate::task;
use std::sync::Arc;

type BoxedFrame = Pin<Box<dyn Future<Output = ()>>>;

struct TaskSlot {
    frame: Option<BoxedFrame>,
}

/// One per OS thread that calls [`EventLoop::run_new`]. Everything here is
/// `Rc`/non-`Send`; the only cross-thread-reachable state is the
/// [`LoopShared`] handed out through [`crate::group`].
pub struct EventLoop {
    id: LoopId,
    shared: Arc<LoopShared>,
    poller: Poller,
    timer: TimerWheel,
    tasks: Slab<TaskSlot>,
    ready: VecDeque<usize>,
    scheduled: HashSet<usize>,
    cleanup: Vec<usize>,
    config: Config,
}

impl EventLoop {
    fn new(config: Config) -> Result<Rc<RefCell<EventLoop>>, crate::error::Error> {
        let poller = Poller::new(config.poller_events_capacity)?;
        let waker = mio::Waker::new(poller.registry(), crate::reactor::poller::WAKER_TOKEN)
            .map_err(|e| crate::error::Error::from_io(crate::error::ErrorKind::IoFailure, e))?;
        let shared = group::register(waker);
        let id = shared.id();
        Ok(Rc::new(RefCell::new(EventLoop {
            id,
            shared,
            poller,
            timer: TimerWheel::new(),
            tasks: Slab::new(),
            ready: VecDeque::new(),
            scheduled: HashSet::new(),
            cleanup: Vec::new(),
            config,
        })))
    }

    pub(crate) fn id(&self) -> LoopId {
        self.id
    }

    pub fn catch_panics(&self) -> bool {
        self.config.catch_panics
    }

    /// Inserts a new coroutine frame and schedules it for its first poll.
    pub(crate) fn spawn_frame(&mut self, frame: BoxedFrame) -> usize {
        let id = self.tasks.insert(TaskSlot { frame: Some(frame) });
        log::trace!("loop {:?}: spawned task {id}", self.id);
        self.schedule(id);
        id
    }

    /// Marks `task_id` ready to run on the next resume phase. Idempotent:
    /// a task already queued is not queued twice, which avoids redundant
    /// polls when multiple wakers fire before the next tick.
    pub(crate) fn schedule(&mut self, task_id: usize) {
        if self.scheduled.insert(task_id) {
            self.ready.push_back(task_id);
        }
    }

    pub(crate) fn arm_timer(&mut self, deadline: crate::time::MillisTime, waker: std::task::Waker) -> TimerId {
        self.timer.schedule(deadline, waker)
    }

    pub(crate) fn poller_mut(&mut self) -> &mut Poller {
        &mut self.poller
    }

    fn next_timeout(&mut self) -> Option<Duration> {
        if !self.ready.is_empty() {
            return Some(Duration::ZERO);
        }
        self.timer.peek_deadline().map(|deadline| {
            let now = crate::time::now_ms();
            if deadline <= now {
                Duration::ZERO
            } else {
                Duration::from_millis(deadline - now)
            }
        })
    }

    /// One iteration of the seven-step tick.
    fn tick(&mut self) -> Result<(), crate::error::Error> {
        let timeout = self.next_timeout();
        self.poller.trim()?;
        self.poller.wait(timeout)?;

        let mut jobs = Vec::new();
        self.shared.drain_into(&mut jobs);
        for job in jobs {
            job();
        }

        self.timer.fire_due(crate::time::now_ms());

        let batch: VecDeque<usize> = std::mem::take(&mut self.ready);
        for task_id in batch {
            self.scheduled.remove(&task_id);
            self.poll_task(task_id);
        }

        for task_id in self.cleanup.drain(..) {
            self.tasks.try_remove(task_id);
        }

        Ok(())
    }

    fn poll_task(&mut self, task_id: usize) {
        let mut frame = match self.tasks.get_mut(task_id).and_then(|slot| slot.frame.take()) {
            Some(f) => f,
            None => return, // already finished/removed; a stale wake-up
        };
        log::trace!("loop {:?}: resuming task {task_id}", self.id);
        let waker = task::make_waker(self.id, task_id);
        let mut cx = Context::from_waker(&waker);
        match frame.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                log::trace!("loop {:?}: task {task_id} finished", self.id);
                self.cleanup.push(task_id);
            }
            Poll::Pending => {
                if let Some(slot) = self.tasks.get_mut(task_id) {
                    slot.frame = Some(frame);
                }
            }
        }
    }

    /// Builds a fresh loop on the current thread, spawns `future` as its
    /// root task, and ticks until it resolves.
    pub fn run_new<F>(config: Config, future: F) -> F::Output
    where
        F: Future + 'static,
    {
        let lp = EventLoop::new(config).expect("failed to create event loop");
        let output: Rc<RefCell<Option<F::Output>>> = Rc::new(RefCell::new(None));
        let output_for_frame = output.clone();

        let result = task::with_current_loop(&lp, || {
            let frame: BoxedFrame = Box::pin(async move {
                let v = future.await;
                *output_for_frame.borrow_mut() = Some(v);
            });
            lp.borrow_mut().spawn_frame(frame);

            loop {
                if output.borrow().is_some() {
                    break;
                }
                if let Err(e) = lp.borrow_mut().tick() {
                    log::error!("event loop tick failed: {e}");
                    break;
                }
            }
        });
        let _ = result;

        let id = lp.borrow().id();
        group::deregister(id);

        Rc::try_unwrap(output)
            .unwrap_or_else(|_| panic!("root task still referenced after completion"))
            .into_inner()
            .expect("root future did not produce a value")
    }
}

/// Reschedules `task_id` on the loop identified by `loop_id`. If called from
/// that loop's own thread (the common case: a same-thread I/O or timer
/// wake-up), this is a direct, lock-free push onto its ready queue. If
/// called from elsewhere (a blocking-executor worker, a cross-thread
/// dispatcher, another loop), it posts through [`crate::group`], which wakes
/// the target out of `Poller::wait` so the job is drained on its next tick.
pub(crate) fn wake_task(loop_id: LoopId, task_id: usize) {
    let handled_locally = task::try_with_loop(loop_id, |lp| lp.schedule(task_id));
    if handled_locally {
        return;
    }
    let _ = group::post_to(
        loop_id,
        Box::new(move || {
            task::try_with_loop(loop_id, |lp| lp.schedule(task_id));
        }),
    );
}
