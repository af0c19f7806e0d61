//! Strict priority scheduling with round-robin among equal priorities.
//!
//! The highest-priority ready thread always runs. A thread that used up its
//! [`TIME_SLICE`] goes back to the tail of the ready queue, so threads of the
//! same priority take turns.

use super::{
    Thread,
    Tid,
    scheduler::{ReadyQueue, Scheduler, TIME_SLICE, TickContext},
};
use std::sync::Arc;

/// A round robin scheduler.
#[derive(Default)]
pub struct RoundRobin {
    run_queue: ReadyQueue,
}

impl RoundRobin {
    /// Create a new [`RoundRobin`] scheduler.
    pub fn new() -> Self {
        Self {
            run_queue: ReadyQueue::new(),
        }
    }
}

impl Scheduler for RoundRobin {
    fn next_to_run(&self) -> Option<Arc<Thread>> {
        self.run_queue.pop_highest()
    }

    fn push_to_queue(&self, th: Arc<Thread>) {
        self.run_queue.push(th);
    }

    fn timer_tick(&self, cx: &TickContext<'_>) -> bool {
        !cx.is_idle && cx.slice >= TIME_SLICE
    }

    fn highest_priority(&self) -> Option<i32> {
        self.run_queue.highest_priority()
    }

    fn queued(&self) -> Vec<Tid> {
        self.run_queue.tids()
    }
}
