//! The event-loop group: the only two pieces of this crate that are touched
//! from more than one thread during normal operation, a process-wide,
//! mutex-guarded `loop id -> loop` registry so that any thread holding a
//! `LoopId` can look up a loop and post to it under a single lock, without
//! ever touching the target loop's thread-local-only state (the poller, the
//! timer wheel, the ready queue). A cross-thread post is realized as one
//! closure pushed onto a loop's [`crossbeam_queue::SegQueue`] inbox,
//! followed by a wake on its `mio::Waker`. The event loop drains that queue
//! on each tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use parking_lot::Mutex;

use crossbeam_queue::SegQueue;

use crate::error::{Error, ErrorKind};

/// Identifies one event loop for the lifetime of the process.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopId(u64);

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

impl LoopId {
    fn next() -> Self {
        LoopId(NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A thunk posted to a loop from another thread. Run on the loop's own
/// thread during the next tick's inbox drain, so it may touch thread-local
/// loop state (arm a waker, push onto the ready queue) without synchronization.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The subset of a loop's state that is safe to reach from other threads:
/// a lock-free inbox of jobs and a `mio::Waker` to kick the target loop out
/// of `Poller::wait` once a job has been queued. Everything else about an
/// `EventLoop` (the poller, the timer wheel, the ready queue, task slab)
/// stays thread-local.
pub struct LoopShared {
    id: LoopId,
    inbox: SegQueue<Job>,
    waker: mio::Waker,
}

impl LoopShared {
    pub fn id(&self) -> LoopId {
        self.id
    }

    /// Post a job to this loop's thread and wake it out of `wait` if it is
    /// currently blocked in the kernel. This is the crate's one cross-thread
    /// write path; everything else (locks, condvars, cancellation, the
    /// dispatcher, the blocking executor) is built on top of it.
    pub fn post(&self, job: Job) -> Result<(), Error> {
        self.inbox.push(job);
        log::trace!("loop {:?}: job posted from another thread", self.id);
        self.waker
            .wake()
            .map_err(|e| Error::from_io(ErrorKind::IoFailure, e))
    }

    pub(crate) fn drain_into(&self, out: &mut Vec<Job>) {
        while let Some(job) = self.inbox.pop() {
            out.push(job);
        }
    }
}

/// Process-wide registry of live loops. A loop registers itself on
/// creation and deregisters on drop; any thread holding a [`LoopId`] can
/// reach another loop through here without knowing anything about that
/// loop's internals.
struct Group {
    loops: Mutex<HashMap<LoopId, Arc<LoopShared>>>,
}

static GROUP: OnceLock<Group> = OnceLock::new();

fn group() -> &'static Group {
    GROUP.get_or_init(|| Group {
        loops: Mutex::new(HashMap::new()),
    })
}

/// Registers a newly-created loop's cross-thread-reachable half and returns
/// both the `Arc` the loop itself should keep and the id other threads will
/// use to find it.
pub(crate) fn register(waker: mio::Waker) -> Arc<LoopShared> {
    let id = LoopId::next();
    let shared = Arc::new(LoopShared {
        id,
        inbox: SegQueue::new(),
        waker,
    });
    group().loops.lock().insert(id, shared.clone());
    shared
}

pub(crate) fn deregister(id: LoopId) {
    group().loops.lock().remove(&id);
}

/// Looks up a loop by id and posts a job to it in one locked step. Returns
/// `invalid_state` if the loop has already shut down and deregistered.
pub fn post_to(id: LoopId, job: Job) -> Result<(), Error> {
    let shared = {
        let loops = group().loops.lock();
        loops.get(&id).cloned()
    };
    match shared {
        Some(shared) => shared.post(job),
        None => Err(Error::invalid_state(format!(
            "event loop {id:?} is no longer registered"
        ))),
    }
}

/// Snapshot of every currently-registered loop id, used by the dispatcher
/// to round-robin across all loops in the process.
pub fn all_loop_ids() -> Vec<LoopId> {
    group().loops.lock().keys().copied().collect()
}

impl std::fmt::Debug for LoopId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LoopId({})", self.0)
    }
}
