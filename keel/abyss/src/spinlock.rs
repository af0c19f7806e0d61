//! Interrupt-disabling spinlock.

use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// The lock could not be acquired at this time because the operation would
/// otherwise block.
#[derive(Debug)]
pub struct WouldBlock;

/// A mutual exclusion primitive useful for protecting shared data
///
/// Acquiring the lock disables interrupts on the current context, so the
/// holder cannot be preempted until it releases the lock. The data can only be
/// accessed through the guards returned from [`lock`] and [`try_lock`].
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
///
/// # Examples
///
/// ```
/// use abyss::spinlock::SpinLock;
///
/// let data = SpinLock::new(0);
/// let mut guard = data.lock();
/// *guard += 1;
/// // the lock must be "explicitly" unlocked before `guard` goes out of scope.
/// guard.unlock();
/// ```
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            data: UnsafeCell::new(t),
            locked: AtomicBool::new(false),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires a spinlock, blocking the current thread until it is able to do
    /// so.
    ///
    /// When the guard goes out of scope without [`SpinLockGuard::unlock`],
    /// panic occurs.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let guard = loop {
            let guard = crate::interrupt::InterruptGuard::new();

            if !self.locked.swap(true, Ordering::Acquire) {
                break guard;
            }

            drop(guard);
            core::hint::spin_loop();
        };

        SpinLockGuard {
            caller: core::panic::Location::caller(),
            lock: self,
            guard: Some(guard),
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire this lock.
    ///
    /// # Errors
    ///
    /// If the spinlock could not be acquired because it is already locked, then
    /// this call will return the [`WouldBlock`] error.
    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        let guard = crate::interrupt::InterruptGuard::new();
        if !self.locked.swap(true, Ordering::Acquire) {
            Ok(SpinLockGuard {
                guard: Some(guard),
                caller: core::panic::Location::caller(),
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            Err(WouldBlock)
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

/// An implementation of a "scoped lock" of a spinlock. When this structure
/// is dropped (falls out of scope) without unlock, panic occurs.
///
/// The lock must be explicitly unlocked by [`unlock`] method. The only
/// exception is unwinding: a guard dropped while the context is already
/// panicking releases the lock silently.
///
/// [`unlock`]: Self::unlock
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    caller: &'static core::panic::Location<'static>,
    lock: &'a SpinLock<T>,
    guard: Option<crate::interrupt::InterruptGuard>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the underlying [`SpinLock`].
    pub fn unlock(mut self) {
        self.release();
        core::mem::forget(self);
    }

    fn release(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        self.guard.take();
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.release();
            return;
        }
        panic!(
            "`.unlock()` must be explicitly called before dropping SpinLockGuard.
The lock is held at {:?}.",
            self.caller
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::InterruptGuard;

    #[test]
    fn lock_disables_interrupts_until_unlock() {
        let lock = SpinLock::new(1);
        let mut guard = lock.lock();
        *guard += 1;
        assert!(InterruptGuard::is_guarded());
        guard.unlock();
        assert!(!InterruptGuard::is_guarded());
        assert_eq!(lock.into_inner(), 2);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_err());
        guard.unlock();
        let guard = lock.try_lock().expect("lock should be free");
        guard.unlock();
    }

    #[test]
    #[should_panic(expected = "must be explicitly called")]
    fn dropping_guard_without_unlock_panics() {
        let lock = SpinLock::new(0);
        let _guard = lock.lock();
    }

    #[test]
    fn unwinding_releases_the_lock() {
        let lock = SpinLock::new(0);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = lock.lock();
            panic!("boom");
        }));
        assert!(result.is_err());
        let guard = lock.try_lock().expect("lock must be released by unwinding");
        guard.unlock();
    }
}
