//! Mutex.
//!
//! A mutex allows only one thread at a time to access the protected data.
//! Unlike [`SpinLock`], a thread that finds the mutex held is blocked and put
//! on the mutex's wait list instead of spinning. This makes it the right lock
//! for data that is held across long operations, such as a process's file
//! descriptor table while a file is read.

use super::{SpinLock, WouldBlock, next_wait_list_id, pop_highest, tids};
use crate::thread::{self, Current, Link, ParkHandle, Tid};
use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};
use std::collections::VecDeque;

struct State {
    locked: bool,
    waiters: VecDeque<ParkHandle>,
}

/// A mutual exclusion primitive useful for protecting shared data
///
/// This mutex will block threads waiting for the lock to become available.
/// The data can only be accessed through the guards returned from [`lock`]
/// and [`try_lock`], which guarantees that the data is only ever accessed
/// when the mutex is locked.
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
pub struct Mutex<T> {
    id: u64,
    state: SpinLock<State>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    pub fn new(t: T) -> Mutex<T> {
        Mutex {
            id: next_wait_list_id(),
            state: SpinLock::new(State {
                locked: false,
                waiters: VecDeque::new(),
            }),
            data: UnsafeCell::new(t),
        }
    }

    /// Acquires a mutex, blocking the current thread until it is able to do
    /// so.
    ///
    /// Locking a mutex the calling thread already holds never returns.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            let mut state = self.state.lock();
            if !state.locked {
                state.locked = true;
                state.unlock();
                return MutexGuard {
                    lock: self,
                    _not_send: PhantomData,
                };
            }
            Current::park_with(Link::WaitList(self.id), move |handle| {
                state.waiters.push_back(handle);
                state.unlock();
            });
        }
    }

    /// Attempts to acquire this lock.
    ///
    /// # Errors
    ///
    /// If the mutex could not be acquired because it is already locked, then
    /// this call will return the [`WouldBlock`] error.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, WouldBlock> {
        let mut state = self.state.lock();
        let acquired = !state.locked;
        state.locked = true;
        state.unlock();
        if acquired {
            Ok(MutexGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            Err(WouldBlock)
        }
    }

    /// Identifiers of the threads blocked on this mutex.
    pub fn waiting_threads(&self) -> Vec<Tid> {
        let state = self.state.lock();
        let result = tids(&state.waiters);
        state.unlock();
        result
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.locked = false;
        let waiter = pop_highest(&mut state.waiters);
        state.unlock();
        if let Some(waiter) = waiter {
            waiter.unpark();
            thread::preempt_check();
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Mutex<T> {
        Mutex::new(Default::default())
    }
}

/// An implementation of a "scoped lock" of a mutex. When this structure
/// is dropped (falls out of scope) without unlocking, the panic occurs.
///
/// The lock must be explicitly unlocked by [`unlock`] method. A guard dropped
/// while the thread unwinds (for example on [`Current::exit`]) releases the
/// mutex.
///
/// [`unlock`]: MutexGuard::unlock
pub struct MutexGuard<'a, T: 'a> {
    lock: &'a Mutex<T>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: Sync> Sync for MutexGuard<'_, T> {}

impl<T> MutexGuard<'_, T> {
    /// Releases the underlying [`Mutex`] and wakes the highest-priority
    /// waiter.
    pub fn unlock(self) {
        self.lock.release();
        core::mem::forget(self);
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.lock.release();
            return;
        }
        panic!("`.unlock()` must be explicitly called for MutexGuard.");
    }
}
