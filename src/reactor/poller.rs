//! The kernel readiness poller.
//!
//! A direct-indexed array of per-descriptor `[read_queue, write_queue]`
//! below `MAX_FD_IN_ARRAY` descriptors, a `HashMap` tail for the rest, a set
//! of descriptors touched since the last trim, and a previous-interest
//! cache consulted only by `trim()` so that a tick emits the minimum number
//! of `EPOLL_CTL_*`-equivalent syscalls. `mio::Poll` supplies the portable
//! (epoll/kqueue) readiness primitive; we still do our own queueing on top
//! of it because `mio::Poll` alone gives no way to track "two readers queued
//! on the same fd" or to batch state transitions across a tick.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::task::Waker;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::{Error, ErrorKind};

const MAX_FD_IN_ARRAY: usize = 1024;

/// Read or write readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoDirection {
    Read,
    Write,
}

/// One waiter queued on a (descriptor, direction) pair.
struct IoWaiter {
    waker: Waker,
    /// Set to true by `Poller::interrupt` when this waiter is displaced by
    /// an `arm(.., replace = true)` call rather than becoming ready normally.
    interrupted: std::rc::Rc<std::cell::Cell<bool>>,
}

#[derive(Default)]
struct FdQueues {
    read: VecDeque<IoWaiter>,
    write: VecDeque<IoWaiter>,
}

impl FdQueues {
    fn queue(&mut self, dir: IoDirection) -> &mut VecDeque<IoWaiter> {
        match dir {
            IoDirection::Read => &mut self.read,
            IoDirection::Write => &mut self.write,
        }
    }

    fn interest(&self) -> Option<Interest> {
        match (!self.read.is_empty(), !self.write.is_empty()) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty()
    }
}

/// Handle returned by `arm`, used to `invalidate` (cancel) a still-queued
/// waiter before it becomes ready — e.g. when a timeout/cancel wins the race
/// against I/O readiness.
pub struct IoWaiterHandle {
    fd: RawFd,
    dir: IoDirection,
    interrupted: std::rc::Rc<std::cell::Cell<bool>>,
}

impl IoWaiterHandle {
    pub fn invalidate(&self) {
        self.interrupted.set(true);
    }
}

/// Readiness-based, edge-triggered poller.
pub struct Poller {
    poll: Poll,
    events_buf: Events,

    array: Vec<FdQueues>,
    tail: HashMap<RawFd, FdQueues>,

    /// Descriptors touched since the last `trim()`.
    dirty: HashSet<RawFd>,
    /// Kernel-known interest as of the last trim, used to emit the minimal
    /// ADD/MOD/DEL transition.
    prev_interest: HashMap<RawFd, Interest>,
}

impl Poller {
    pub fn new(events_capacity: usize) -> Result<Self, Error> {
        let poll = Poll::new().map_err(|e| Error::from_io(ErrorKind::IoFailure, e))?;
        Ok(Poller {
            poll,
            events_buf: Events::with_capacity(events_capacity),
            array: (0..MAX_FD_IN_ARRAY).map(|_| FdQueues::default()).collect(),
            tail: HashMap::new(),
            dirty: HashSet::new(),
            prev_interest: HashMap::new(),
        })
    }

    /// Used by the loop to register its cross-thread wake-up descriptor
    /// (the `mio::Waker` eventfd) with a reserved token.
    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    fn queues_mut(&mut self, fd: RawFd) -> &mut FdQueues {
        if (fd as usize) < MAX_FD_IN_ARRAY {
            &mut self.array[fd as usize]
        } else {
            self.tail.entry(fd).or_default()
        }
    }

    fn queues(&self, fd: RawFd) -> Option<&FdQueues> {
        if (fd as usize) < MAX_FD_IN_ARRAY {
            Some(&self.array[fd as usize])
        } else {
            self.tail.get(&fd)
        }
    }

    /// arm(event, replace?): queue a waiter for `(fd, dir)`. If `replace` is
    /// true and a waiter already exists, it is popped and marked
    /// interrupted (its future will observe an I/O failure on next poll)
    /// before the new one takes its place.
    pub fn arm(&mut self, fd: RawFd, dir: IoDirection, waker: Waker, replace: bool) -> IoWaiterHandle {
        self.dirty.insert(fd);
        let interrupted = std::rc::Rc::new(std::cell::Cell::new(false));
        let q = self.queues_mut(fd);
        let queue = q.queue(dir);
        if replace {
            if let Some(old) = queue.pop_front() {
                old.interrupted.set(true);
                old.waker.wake();
            }
        }
        queue.push_back(IoWaiter {
            waker,
            interrupted: interrupted.clone(),
        });
        IoWaiterHandle { fd, dir, interrupted }
    }

    /// Removes a still-queued (not yet popped) waiter, e.g. because its
    /// coroutine was canceled before becoming ready. No-op if it already
    /// fired (popped by `wait`).
    pub fn cancel_waiter(&mut self, handle: &IoWaiterHandle) {
        handle.invalidate();
        if let Some(q) = self.queues_opt_mut(handle.fd) {
            let queue = q.queue(handle.dir);
            queue.retain(|w| !std::rc::Rc::ptr_eq(&w.interrupted, &handle.interrupted));
            self.dirty.insert(handle.fd);
        }
    }

    fn queues_opt_mut(&mut self, fd: RawFd) -> Option<&mut FdQueues> {
        if (fd as usize) < MAX_FD_IN_ARRAY {
            Some(&mut self.array[fd as usize])
        } else {
            self.tail.get_mut(&fd)
        }
    }

    /// wait(max_timeout): block in the kernel. Pops one ready waiter per
    /// (fd, direction) pair reported and wakes it.
    pub fn wait(&mut self, max_timeout: Option<Duration>) -> Result<(), Error> {
        match self.poll.poll(&mut self.events_buf, max_timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(Error::from_io(ErrorKind::IoFailure, e)),
        }

        let events: Vec<(RawFd, bool, bool)> = self
            .events_buf
            .iter()
            .map(|ev| (ev.token().0 as RawFd, ev.is_readable(), ev.is_writable()))
            .collect();

        let mut to_wake = Vec::new();
        for (fd, readable, writable) in events {
            if fd == WAKER_TOKEN_FD {
                continue; // the cross-thread wake-up descriptor, handled separately
            }
            let mut matched = false;
            if readable {
                if let Some(w) = self.pop_ready(fd, IoDirection::Read) {
                    to_wake.push(w);
                }
                matched = true;
            }
            if writable {
                if let Some(w) = self.pop_ready(fd, IoDirection::Write) {
                    to_wake.push(w);
                }
                matched = true;
            }
            if !matched {
                return Err(Error::new(
                    ErrorKind::IoFailure,
                    format!("unattributable readiness on fd {fd}"),
                ));
            }
        }

        for w in to_wake {
            w.wake();
        }
        Ok(())
    }

    fn pop_ready(&mut self, fd: RawFd, dir: IoDirection) -> Option<Waker> {
        self.dirty.insert(fd);
        let q = self.queues_mut(fd);
        let queue = q.queue(dir);
        while let Some(w) = queue.pop_front() {
            if !w.interrupted.get() {
                return Some(w.waker);
            }
            // already canceled; drop silently and try the next one
        }
        None
    }

    fn existing_interest(&self, fd: RawFd) -> Option<Interest> {
        self.queues(fd).and_then(|q| q.interest())
    }

    /// trim(): reconcile kernel interest with queue-derived interest,
    /// emitting exactly one ADD/MOD/DEL per touched descriptor.
    pub fn trim(&mut self) -> Result<(), Error> {
        let dirty: Vec<RawFd> = self.dirty.drain().collect();
        for fd in dirty {
            let cur = self.existing_interest(fd);
            let prev = self.prev_interest.get(&fd).copied();
            if cur == prev {
                continue;
            }
            let mut source = SourceFd(&fd);
            let token = Token(fd as usize);
            let result = match (prev, cur) {
                (None, Some(interest)) => self.poll.registry().register(&mut source, token, interest),
                (Some(_), Some(interest)) => self.poll.registry().reregister(&mut source, token, interest),
                (Some(_), None) => self.poll.registry().deregister(&mut source),
                (None, None) => Ok(()),
            };
            result.map_err(|e| Error::from_io(ErrorKind::IoFailure, e))?;
            log::trace!("poller: fd {fd} interest {prev:?} -> {cur:?}");

            // clean up bookkeeping for descriptors that are fully idle again
            if (fd as usize) >= MAX_FD_IN_ARRAY {
                if let Some(q) = self.tail.get(&fd) {
                    if q.is_empty() {
                        self.tail.remove(&fd);
                    }
                }
            }

            match cur {
                Some(i) => {
                    self.prev_interest.insert(fd, i);
                }
                None => {
                    self.prev_interest.remove(&fd);
                }
            }
        }
        Ok(())
    }

    pub fn total_armed(&self) -> usize {
        let array_count: usize = self
            .array
            .iter()
            .map(|q| q.read.len() + q.write.len())
            .sum();
        let tail_count: usize = self.tail.values().map(|q| q.read.len() + q.write.len()).sum();
        array_count + tail_count
    }
}

/// Reserved token value used to recognize the cross-thread wake-up
/// descriptor in `wait`'s readiness batch; real fds are always `>= 0` and
/// this sentinel is outside the representable range of a `RawFd` cast back
/// from `Token`, so it can never collide with a real descriptor's token.
pub(crate) const WAKER_TOKEN_FD: RawFd = RawFd::MAX;
pub(crate) const WAKER_TOKEN: Token = Token(WAKER_TOKEN_FD as usize);
