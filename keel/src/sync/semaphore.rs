//! Counting semaphore.

use super::{SpinLock, next_wait_list_id, pop_highest, tids};
use crate::thread::{self, Current, Link, ParkHandle, Tid};
use std::collections::VecDeque;

struct Inner {
    value: usize,
    waiters: VecDeque<ParkHandle>,
}

/// Counting semaphore.
///
/// A semaphore maintains a number of permits. [`Semaphore::down`] takes one,
/// blocking while none is available; [`Semaphore::up`] returns one and wakes
/// the highest-priority waiter. A semaphore created with zero permits signals
/// an event, which is how [`JoinHandle::join`] waits for a thread to exit.
///
/// [`JoinHandle::join`]: crate::thread::JoinHandle::join
pub struct Semaphore {
    id: u64,
    inner: SpinLock<Inner>,
}

impl Semaphore {
    /// Creates a new semaphore with `permits` available permits.
    pub fn new(permits: usize) -> Self {
        Self {
            id: next_wait_list_id(),
            inner: SpinLock::new(Inner {
                value: permits,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Waits until a permit becomes available and then acquires it.
    pub fn down(&self) {
        loop {
            let mut inner = self.inner.lock();
            if inner.value > 0 {
                inner.value -= 1;
                inner.unlock();
                return;
            }
            Current::park_with(Link::WaitList(self.id), move |handle| {
                inner.waiters.push_back(handle);
                inner.unlock();
            });
        }
    }

    /// Acquires a permit without blocking.
    ///
    /// Returns false if none is available.
    pub fn try_down(&self) -> bool {
        let mut inner = self.inner.lock();
        let acquired = inner.value > 0;
        if acquired {
            inner.value -= 1;
        }
        inner.unlock();
        acquired
    }

    /// Releases a permit.
    ///
    /// The woken thread runs immediately if its priority is higher than the
    /// caller's.
    pub fn up(&self) {
        let mut inner = self.inner.lock();
        inner.value += 1;
        let waiter = pop_highest(&mut inner.waiters);
        inner.unlock();
        if let Some(waiter) = waiter {
            waiter.unpark();
        }
        thread::preempt_check();
    }

    /// Number of available permits.
    pub fn value(&self) -> usize {
        let inner = self.inner.lock();
        let value = inner.value;
        inner.unlock();
        value
    }

    /// Identifiers of the threads blocked on this semaphore.
    pub fn waiting_threads(&self) -> Vec<Tid> {
        let inner = self.inner.lock();
        let result = tids(&inner.waiters);
        inner.unlock();
        result
    }

    /// The identifier carried by [`Link::WaitList`] of the waiters.
    pub fn wait_list(&self) -> u64 {
        self.id
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl core::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Semaphore")
            .field("id", &self.id)
            .field("value", &self.value())
            .finish()
    }
}
