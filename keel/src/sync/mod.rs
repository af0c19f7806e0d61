//! Synchronization primitives.
//!
//! | Primitive     | Blocks Thread? | Typical Use Case                                   |
//! |---------------|----------------|----------------------------------------------------|
//! | [`SpinLock`]  | No (busy wait) | Short critical sections such as the ready queue    |
//! | [`Mutex`]     | Yes            | Exclusive access to shared data, e.g. a file table |
//! | [`Semaphore`] | Yes            | Counting permits, signaling events such as exit    |
//!
//! A blocking primitive parks its waiters with [`Current::park_with`] and
//! keeps their [`ParkHandle`]s on its own wait list. Every wait list has a
//! unique identifier so that a thread's [`Link`] names the exact list holding
//! it. On release the waiter with the highest priority is woken first.
//!
//! [`Current::park_with`]: crate::thread::Current::park_with
//! [`ParkHandle`]: crate::thread::ParkHandle
//! [`Link`]: crate::thread::Link
pub mod mutex;
pub mod semaphore;

pub use abyss::spinlock::{SpinLock, SpinLockGuard, WouldBlock};
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;

use crate::thread::{ParkHandle, Tid};
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
};

static NEXT_WAIT_LIST: AtomicU64 = AtomicU64::new(1);

fn next_wait_list_id() -> u64 {
    NEXT_WAIT_LIST.fetch_add(1, Ordering::Relaxed)
}

/// Removes the first waiter of the highest priority.
fn pop_highest(waiters: &mut VecDeque<ParkHandle>) -> Option<ParkHandle> {
    let mut best: Option<(usize, i32)> = None;
    for (idx, handle) in waiters.iter().enumerate() {
        let priority = handle.thread().priority();
        if best.is_none_or(|(_, p)| priority > p) {
            best = Some((idx, priority));
        }
    }
    best.and_then(|(idx, _)| waiters.remove(idx))
}

fn tids(waiters: &VecDeque<ParkHandle>) -> Vec<Tid> {
    waiters.iter().map(|handle| handle.thread().tid).collect()
}
