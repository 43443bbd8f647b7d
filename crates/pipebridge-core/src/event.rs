//! Reusable completion events for asynchronous operations on one handle.
//!
//! A pending operation borrows an [`Event`] from the handle's [`EventPool`],
//! registers it with the OS primitive as its waker, and waits on it. Events
//! are recycled instead of being created per operation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::Wake;

use tokio::sync::Notify;

/// Auto-reset waitable token signaled when a pending operation can progress.
#[derive(Debug, Default)]
pub struct Event {
    signaled: AtomicBool,
    notify: Notify,
}

impl Event {
    fn new() -> Self {
        Self::default()
    }

    /// Signal the event, waking the waiter if there is one.
    pub fn set(&self) {
        self.signaled.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Return the event to the unsignaled state.
    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Wait until the event is signaled, consuming the signal.
    pub async fn wait(&self) {
        loop {
            if self.signaled.swap(false, Ordering::AcqRel) {
                return;
            }
            self.notify.notified().await;
        }
    }
}

impl Wake for Event {
    fn wake(self: Arc<Self>) {
        self.set();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.set();
    }
}

/// Free list of events scoped to one handle.
#[derive(Debug, Default)]
pub struct EventPool {
    free: Mutex<FreeList>,
    created: AtomicUsize,
}

#[derive(Debug, Default)]
struct FreeList {
    events: Vec<Arc<Event>>,
    closed: bool,
}

impl EventPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FreeList> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Borrow an unsignaled event, creating one if the free list is empty.
    ///
    /// The returned guard releases the event when dropped, so an operation
    /// cancelled mid-wait still gives its event back.
    pub fn acquire(&self) -> PooledEvent<'_> {
        let reused = self.lock().events.pop();
        let event = reused.unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            Arc::new(Event::new())
        });
        PooledEvent { pool: self, event }
    }

    /// Reset an event and put it back on the free list.
    pub fn release(&self, event: Arc<Event>) {
        event.reset();
        let mut free = self.lock();
        if !free.closed {
            free.events.push(event);
        }
    }

    /// Drop every pooled event and stop pooling. Returns how many events
    /// were released; a second call releases nothing.
    pub fn close(&self) -> usize {
        let mut free = self.lock();
        free.closed = true;
        let released = free.events.len();
        free.events.clear();
        released
    }

    /// Number of events ever created by this pool.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Number of events currently waiting on the free list.
    pub fn idle(&self) -> usize {
        self.lock().events.len()
    }
}

/// An event borrowed from an [`EventPool`] for the duration of one operation.
#[derive(Debug)]
pub struct PooledEvent<'a> {
    pool: &'a EventPool,
    event: Arc<Event>,
}

impl PooledEvent<'_> {
    pub const fn event(&self) -> &Arc<Event> {
        &self.event
    }
}

impl Drop for PooledEvent<'_> {
    fn drop(&mut self) {
        self.pool.release(Arc::clone(&self.event));
    }
}
