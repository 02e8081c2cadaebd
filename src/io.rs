//! Descriptor-ownership wrapper used to await I/O readiness.
//!
//! A bare `RawFd` carries no ownership, and tying ownership to the event
//! record itself makes a descriptor's lifetime hostage to whichever
//! coroutine happens to be waiting on it. Here ownership always belongs to
//! the caller's `Io<T>` wrapper; the reactor only ever borrows the raw
//! descriptor for the duration of one `arm`/`wait` cycle. Socket/TLS/
//! protocol types built on top of `Io<T>` are out of scope for this crate —
//! this is the primitive they would be built from.

use std::future::Future;
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::Error;
use crate::reactor::poller::IoWaiterHandle;
use crate::reactor::IoDirection;
use crate::task;

/// Wraps any `AsRawFd` type (a `std::net::TcpStream`, a `std::fs::File`
/// opened `O_NONBLOCK`, a pipe end, …) with the ability to wait for
/// read/write readiness through this crate's reactor.
pub struct Io<T: AsRawFd> {
    inner: T,
}

impl<T: AsRawFd> Io<T> {
    pub fn new(inner: T) -> Self {
        Io { inner }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Suspends until the descriptor is readable.
    pub fn readable(&self) -> Ready<'_, T> {
        Ready {
            io: self,
            dir: IoDirection::Read,
            handle: None,
            fired: false,
        }
    }

    /// Suspends until the descriptor is writable.
    pub fn writable(&self) -> Ready<'_, T> {
        Ready {
            io: self,
            dir: IoDirection::Write,
            handle: None,
            fired: false,
        }
    }
}

/// Future returned by [`Io::readable`] / [`Io::writable`].
pub struct Ready<'a, T: AsRawFd> {
    io: &'a Io<T>,
    dir: IoDirection,
    handle: Option<IoWaiterHandle>,
    fired: bool,
}

impl<'a, T: AsRawFd> Future for Ready<'a, T> {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        if self.fired {
            return Poll::Ready(Ok(()));
        }
        if self.handle.is_none() {
            let fd: RawFd = self.io.inner.as_raw_fd();
            let handle = task::current_loop()
                .borrow_mut()
                .poller_mut()
                .arm(fd, self.dir, cx.waker().clone(), false);
            self.handle = Some(handle);
            return Poll::Pending;
        }
        // Being polled again with a handle already armed means the waker
        // fired: the poller already popped us off its queue as ready.
        self.fired = true;
        Poll::Ready(Ok(()))
    }
}

impl<'a, T: AsRawFd> Drop for Ready<'a, T> {
    fn drop(&mut self) {
        if !self.fired {
            if let Some(handle) = &self.handle {
                task::current_loop().borrow_mut().poller_mut().cancel_waiter(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::event_loop::EventLoop;
    use std::os::unix::net::UnixStream;

    #[test]
    fn writable_resolves_immediately_for_a_fresh_socketpair() {
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let out = EventLoop::run_new(Config::new(), async move {
            let io = Io::new(a);
            io.writable().await
        });
        assert!(out.is_ok());
    }
}
