//! Cross-thread dispatcher: hands values from any thread to a registered
//! consumer coroutine, either round-robin (implicit) or by id (explicit).
//! Each consumer gets its own [`crossbeam_queue::SegQueue`] rather than one
//! queue shared behind a producer token, since Rust's ownership makes a
//! dedicated per-consumer queue both simpler and enough — this dispatcher
//! does not implement work-stealing between consumers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use std::task::Waker;

use crossbeam_queue::SegQueue;

use crate::error::Error;

/// Identifies one registered consumer for the lifetime of its [`Dispatcher`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(u64);

struct ConsumerRecord<T> {
    id: ConsumerId,
    queue: Arc<SegQueue<T>>,
    waker_slot: Arc<Mutex<Option<Waker>>>,
}

struct DispatcherInner<T> {
    consumers: Mutex<Vec<ConsumerRecord<T>>>,
    next_id: AtomicU64,
    round_robin: AtomicUsize,
}

/// A many-producer, many-consumer hand-off point reachable from any thread,
/// usable as a plain value rather than only as a process-wide singleton.
pub struct Dispatcher<T> {
    inner: Arc<DispatcherInner<T>>,
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Dispatcher { inner: self.inner.clone() }
    }
}

impl<T: Send + 'static> Default for Dispatcher<T> {
    fn default() -> Self {
        Dispatcher::new()
    }
}

impl<T: Send + 'static> Dispatcher<T> {
    pub fn new() -> Self {
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                consumers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                round_robin: AtomicUsize::new(0),
            }),
        }
    }

    /// Registers the calling coroutine as a consumer, returning a handle it
    /// can `recv().await` from. Deregisters automatically when the handle
    /// is dropped.
    pub fn register_consumer(&self) -> Consumer<T> {
        let id = ConsumerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let queue = Arc::new(SegQueue::new());
        let waker_slot = Arc::new(Mutex::new(None));
        self.inner.consumers.lock().push(ConsumerRecord {
            id,
            queue: queue.clone(),
            waker_slot: waker_slot.clone(),
        });
        Consumer {
            id,
            dispatcher: self.inner.clone(),
            queue,
            waker_slot,
        }
    }

    pub fn deregister_consumer(&self, id: ConsumerId) {
        self.inner.consumers.lock().retain(|c| c.id != id);
    }

    /// Hands `value` to one registered consumer, chosen round-robin among
    /// those currently registered. `resource_exhausted` if there are none.
    pub fn dispatch(&self, value: T) -> Result<(), Error> {
        let consumers = self.inner.consumers.lock();
        if consumers.is_empty() {
            return Err(Error::resource_exhausted("dispatcher has no registered consumers"));
        }
        let idx = self.inner.round_robin.fetch_add(1, Ordering::Relaxed) % consumers.len();
        deliver(&consumers[idx], value);
        Ok(())
    }

    /// Hands `value` directly to the consumer identified by `id`, bypassing
    /// round-robin selection. `invalid_state` if that consumer is no longer
    /// registered.
    pub fn dispatch_to(&self, id: ConsumerId, value: T) -> Result<(), Error> {
        let consumers = self.inner.consumers.lock();
        match consumers.iter().find(|c| c.id == id) {
            Some(record) => {
                deliver(record, value);
                Ok(())
            }
            None => Err(Error::invalid_state(format!("no consumer registered with {id:?}"))),
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.consumers.lock().len()
    }
}

fn deliver<T>(record: &ConsumerRecord<T>, value: T) {
    record.queue.push(value);
    if let Some(waker) = record.waker_slot.lock().take() {
        waker.wake();
    }
}

/// A registered consumer's receive half. Dropping it deregisters
/// automatically, so an abandoned consumer stops receiving work instead of
/// silently accumulating it.
pub struct Consumer<T> {
    id: ConsumerId,
    dispatcher: Arc<DispatcherInner<T>>,
    queue: Arc<SegQueue<T>>,
    waker_slot: Arc<Mutex<Option<Waker>>>,
}

impl<T> Consumer<T> {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Suspends until a value has been dispatched to this consumer.
    pub async fn recv(&self) -> T {
        Recv { consumer: self }.await
    }
}

impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.dispatcher.consumers.lock().retain(|c| c.id != self.id);
    }
}

struct Recv<'a, T> {
    consumer: &'a Consumer<T>,
}

impl<'a, T> std::future::Future for Recv<'a, T> {
    type Output = T;

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<T> {
        if let Some(v) = self.consumer.queue.pop() {
            return std::task::Poll::Ready(v);
        }
        *self.consumer.waker_slot.lock() = Some(cx.waker().clone());
        // a value may have been pushed between the pop above and storing
        // the waker; check once more so we never miss a wake-up.
        if let Some(v) = self.consumer.queue.pop() {
            return std::task::Poll::Ready(v);
        }
        std::task::Poll::Pending
    }
}

impl std::fmt::Debug for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConsumerId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_with_no_consumers_is_resource_exhausted() {
        let d: Dispatcher<u32> = Dispatcher::new();
        assert_eq!(d.dispatch(1).unwrap_err().kind(), crate::error::ErrorKind::ResourceExhausted);
    }

    #[test]
    fn round_robin_spreads_across_consumers() {
        let d: Dispatcher<u32> = Dispatcher::new();
        let c0 = d.register_consumer();
        let c1 = d.register_consumer();
        d.dispatch(10).unwrap();
        d.dispatch(20).unwrap();
        assert_eq!(c0.queue.pop(), Some(10));
        assert_eq!(c1.queue.pop(), Some(20));
    }

    #[test]
    fn dispatch_to_targets_a_specific_consumer() {
        let d: Dispatcher<u32> = Dispatcher::new();
        let c0 = d.register_consumer();
        let c1 = d.register_consumer();
        d.dispatch_to(c1.id(), 99).unwrap();
        assert!(c0.queue.pop().is_none());
        assert_eq!(c1.queue.pop(), Some(99));
    }
}
