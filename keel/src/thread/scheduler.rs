//! Thread scheduler

use super::{Link, PRI_MAX, PRI_MIN, Thread, Tid, fixed_point::FixedPoint};
use crate::sync::SpinLock;
use std::{collections::VecDeque, sync::Arc};

/// Number of ticks a thread may run before it is preempted in favor of a
/// thread of equal priority.
pub const TIME_SLICE: u32 = 4;

/// What the scheduler sees on a timer interrupt.
pub struct TickContext<'a> {
    /// Ticks since boot, including this one.
    pub ticks: i64,
    /// The interrupted thread.
    pub current: &'a Arc<Thread>,
    /// Whether the interrupted thread is the idle thread.
    pub is_idle: bool,
    /// Ticks consumed by `current` since it was switched in.
    pub slice: u32,
    /// Every live thread except the idle thread.
    pub threads: &'a [Arc<Thread>],
}

/// A trait for a thread scheduler.
///
/// The [`Scheduler`] trait defines the common functionality expected from a
/// thread scheduler. The kernel consults the scheduler to determine the next
/// thread with [`Scheduler::next_to_run`], and to decide whether the running
/// thread yields with [`Scheduler::timer_tick`].
///
/// The idle thread is never handed to the scheduler.
pub trait Scheduler: Send + Sync {
    /// Pop the next thread to run.
    ///
    /// Returns `None` if no thread is ready.
    fn next_to_run(&self) -> Option<Arc<Thread>>;

    /// Push a ready thread `th` into the scheduling queue.
    fn push_to_queue(&self, th: Arc<Thread>);

    /// Called on every timer interrupt.
    ///
    /// Returns `true` if the running thread must yield.
    fn timer_tick(&self, cx: &TickContext<'_>) -> bool;

    /// The highest priority among ready threads.
    fn highest_priority(&self) -> Option<i32>;

    /// Identifiers of the ready threads, in queue order.
    fn queued(&self) -> Vec<Tid>;

    /// Initializes the scheduling state of a new thread.
    fn init_thread(&self, _th: &Thread, _parent: Option<&Thread>) {}

    /// Changes the base priority of `th`.
    fn set_priority(&self, th: &Thread, priority: i32) {
        th.store_priority(priority.clamp(PRI_MIN, PRI_MAX));
    }

    /// Changes the niceness of `th`.
    fn set_nice(&self, th: &Thread, nice: i32) {
        th.store_nice(nice);
    }

    /// System load average.
    fn load_avg(&self) -> FixedPoint {
        FixedPoint::ZERO
    }
}

/// The ready queue shared by both scheduling policies.
///
/// Threads are kept in arrival order; [`ReadyQueue::pop_highest`] takes the
/// first thread of the highest priority, which gives round-robin among
/// threads of equal priority.
#[derive(Default)]
pub struct ReadyQueue {
    inner: SpinLock<VecDeque<Arc<Thread>>>,
}

impl ReadyQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(VecDeque::new()),
        }
    }

    /// Appends `th` at the tail.
    pub fn push(&self, th: Arc<Thread>) {
        th.enter(Link::ReadyQueue);
        let mut queue = self.inner.lock();
        queue.push_back(th);
        queue.unlock();
    }

    /// Removes the oldest thread of the highest priority.
    pub fn pop_highest(&self) -> Option<Arc<Thread>> {
        let mut queue = self.inner.lock();
        let mut best: Option<(usize, i32)> = None;
        for (idx, th) in queue.iter().enumerate() {
            let priority = th.priority();
            if best.is_none_or(|(_, p)| priority > p) {
                best = Some((idx, priority));
            }
        }
        let th = best.and_then(|(idx, _)| queue.remove(idx));
        queue.unlock();
        if let Some(th) = th.as_ref() {
            th.leave(Link::ReadyQueue);
        }
        th
    }

    /// The highest priority in the queue.
    pub fn highest_priority(&self) -> Option<i32> {
        let queue = self.inner.lock();
        let result = queue.iter().map(|th| th.priority()).max();
        queue.unlock();
        result
    }

    /// Number of queued threads.
    pub fn len(&self) -> usize {
        let queue = self.inner.lock();
        let len = queue.len();
        queue.unlock();
        len
    }

    /// Returns true if no thread is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identifiers of the queued threads.
    pub fn tids(&self) -> Vec<Tid> {
        let queue = self.inner.lock();
        let tids = queue.iter().map(|th| th.tid).collect();
        queue.unlock();
        tids
    }
}
